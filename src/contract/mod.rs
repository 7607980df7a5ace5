//! Contract descriptors, handles and deployment.

mod factory;
mod handle;
mod registry;

pub use factory::ContractFactory;
pub use handle::ContractHandle;
pub use registry::{ContractDescriptor, ContractDescriptorRegistry, DescriptorSource, RequiredInterface};
