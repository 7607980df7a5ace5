//! Contract type registry.
//!
//! Maps a type name to the interface descriptor of that contract. Descriptors are
//! loaded lazily on first use and shared by every handle of that type.

use alloy::dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy::hex;
use alloy::json_abi::{Event, Function, JsonAbi};
use alloy::primitives::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::ContractsConfig;
use crate::error::EscrowError;

/// Where a descriptor is read from.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorSource {
    File(PathBuf),
    Inline(serde_json::Value),
}

/// Methods and events a descriptor must declare to be accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredInterface {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

impl RequiredInterface {
    pub fn new<M, E>(methods: M, events: E) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
            events: events.into_iter().map(Into::into).collect(),
        }
    }
}

/// Immutable interface description of one contract type.
#[derive(Debug)]
pub struct ContractDescriptor {
    type_name: String,
    abi: JsonAbi,
    bytecode: Option<Bytes>,
}

impl ContractDescriptor {
    /// Parse a bare ABI array or an artifact object carrying `abi` and `bytecode`.
    ///
    /// `bytecode` may be a hex string or a `{ "object": "0x..." }` object.
    pub fn from_json(type_name: &str, value: serde_json::Value) -> Result<Self, EscrowError> {
        let (abi_value, bytecode) = match value {
            serde_json::Value::Array(_) => (value, None),
            serde_json::Value::Object(mut object) => {
                let abi = object
                    .remove("abi")
                    .ok_or_else(|| EscrowError::load(type_name, "artifact has no `abi` field"))?;
                let bytecode = match object.remove("bytecode") {
                    Some(serde_json::Value::String(code)) => Some(code),
                    Some(serde_json::Value::Object(mut nested)) => match nested.remove("object") {
                        Some(serde_json::Value::String(code)) => Some(code),
                        _ => None,
                    },
                    _ => None,
                };
                (abi, bytecode)
            }
            _ => return Err(EscrowError::load(type_name, "expected an ABI array or artifact object")),
        };

        let abi: JsonAbi =
            serde_json::from_value(abi_value).map_err(|e| EscrowError::load(type_name, e))?;
        let bytecode = match bytecode {
            Some(code) => {
                let raw = hex::decode(code.trim()).map_err(|e| EscrowError::load(type_name, e))?;
                (!raw.is_empty()).then(|| Bytes::from(raw))
            }
            None => None,
        };

        Ok(Self {
            type_name: type_name.to_string(),
            abi,
            bytecode,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn abi(&self) -> &JsonAbi {
        &self.abi
    }

    pub fn bytecode(&self) -> Option<&Bytes> {
        self.bytecode.as_ref()
    }

    /// Method signatures, e.g. `release()`.
    pub fn methods(&self) -> Vec<String> {
        self.abi.functions().map(|f| f.signature()).collect()
    }

    /// Event signatures, e.g. `FundsReleased(address,uint256)`.
    pub fn events(&self) -> Vec<String> {
        self.abi.events().map(|e| e.signature()).collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.function(name).is_some()
    }

    /// First declared overload of `name`.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.abi.function(name).and_then(|overloads| overloads.first())
    }

    pub fn event(&self, name: &str) -> Option<&Event> {
        self.abi.event(name).and_then(|overloads| overloads.first())
    }

    pub fn encode_call(&self, method: &str, args: &[DynSolValue]) -> Result<Bytes, EscrowError> {
        let function = self
            .function(method)
            .ok_or_else(|| EscrowError::invalid(method, "method not declared by descriptor"))?;
        function
            .abi_encode_input(args)
            .map(Bytes::from)
            .map_err(|e| EscrowError::invalid(method, e.to_string()))
    }

    /// Creation bytecode followed by the ABI-encoded constructor arguments.
    pub fn encode_deployment(&self, args: &[DynSolValue]) -> Result<Bytes, EscrowError> {
        let bytecode = self
            .bytecode
            .as_ref()
            .ok_or_else(|| EscrowError::load(&self.type_name, "descriptor has no creation bytecode"))?;
        let encoded_args = match self.abi.constructor() {
            Some(constructor) => constructor
                .abi_encode_input(args)
                .map_err(|e| EscrowError::invalid("constructor", e.to_string()))?,
            None if args.is_empty() => Vec::new(),
            None => {
                return Err(EscrowError::invalid(
                    "constructor",
                    "descriptor declares no constructor arguments",
                ));
            }
        };
        let mut data = bytecode.to_vec();
        data.extend_from_slice(&encoded_args);
        Ok(data.into())
    }

    pub fn decode_output(&self, method: &str, data: &[u8]) -> Result<Vec<DynSolValue>, EscrowError> {
        let function = self
            .function(method)
            .ok_or_else(|| EscrowError::invalid(method, "method not declared by descriptor"))?;
        function
            .abi_decode_output(data)
            .map_err(|e| EscrowError::invalid(method, format!("undecodable output: {e}")))
    }

    fn check_interface(&self, required: &RequiredInterface) -> Result<(), EscrowError> {
        if let Some(missing) = required.methods.iter().find(|m| !self.has_method(m)) {
            return Err(EscrowError::load(
                &self.type_name,
                format!("required method `{missing}` is not declared"),
            ));
        }
        if let Some(missing) = required.events.iter().find(|e| self.event(e).is_none()) {
            return Err(EscrowError::load(
                &self.type_name,
                format!("required event `{missing}` is not declared"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Registration {
    source: DescriptorSource,
    required: RequiredInterface,
    loaded: OnceCell<Arc<ContractDescriptor>>,
}

#[derive(Debug, Default)]
pub struct ContractDescriptorRegistry {
    entries: DashMap<String, Arc<Registration>>,
}

impl ContractDescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every type declared in configuration.
    pub fn from_config(contracts: &ContractsConfig) -> Result<Self, EscrowError> {
        let registry = Self::new();
        for (type_name, entry) in &contracts.0 {
            registry.register(
                type_name,
                DescriptorSource::File(entry.descriptor_path.clone()),
                RequiredInterface::new(
                    entry.required_methods.iter().cloned(),
                    entry.required_events.iter().cloned(),
                ),
            )?;
        }
        Ok(registry)
    }

    /// Register a loader for `type_name`.
    ///
    /// Registering the same source and interface again is a no-op; anything else for an
    /// existing type fails with [`EscrowError::UnknownType`].
    pub fn register(
        &self,
        type_name: &str,
        source: DescriptorSource,
        required: RequiredInterface,
    ) -> Result<(), EscrowError> {
        match self.entries.entry(type_name.to_string()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.source == source && existing.required == required {
                    Ok(())
                } else {
                    tracing::warn!(type_name, "rejecting conflicting descriptor registration");
                    Err(EscrowError::UnknownType(type_name.to_string()))
                }
            }
            Entry::Vacant(slot) => {
                tracing::debug!(type_name, ?source, "registered contract type");
                slot.insert(Arc::new(Registration {
                    source,
                    required,
                    loaded: OnceCell::new(),
                }));
                Ok(())
            }
        }
    }

    /// Descriptor for `type_name`, loading it on first use.
    pub async fn resolve(&self, type_name: &str) -> Result<Arc<ContractDescriptor>, EscrowError> {
        // Clone the Arc so the map shard is not held across the load.
        let registration = self
            .entries
            .get(type_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EscrowError::DescriptorNotFound(type_name.to_string()))?;

        registration
            .loaded
            .get_or_try_init(|| load(type_name, &registration.source, &registration.required))
            .await
            .cloned()
    }
}

async fn load(
    type_name: &str,
    source: &DescriptorSource,
    required: &RequiredInterface,
) -> Result<Arc<ContractDescriptor>, EscrowError> {
    let value = match source {
        DescriptorSource::File(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| EscrowError::load(type_name, format!("{}: {e}", path.display())))?;
            serde_json::from_str(&raw).map_err(|e| EscrowError::load(type_name, e))?
        }
        DescriptorSource::Inline(value) => value.clone(),
    };
    let descriptor = ContractDescriptor::from_json(type_name, value)?;
    descriptor.check_interface(required)?;
    tracing::info!(
        type_name,
        methods = descriptor.methods().len(),
        events = descriptor.events().len(),
        has_bytecode = descriptor.bytecode.is_some(),
        "loaded contract descriptor"
    );
    Ok(Arc::new(descriptor))
}
