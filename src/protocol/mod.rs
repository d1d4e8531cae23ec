//! Wire records exchanged with the executor living in the target process.
//!
//! A request is a [`ProtocolInfo`], a response a [`ReturnInfo`]. Both are plain `serde` records so
//! that any transport able to carry JSON can carry them (see [`crate::operate::stream`]).
//!
//! [`FriendlyConnector`] is the only thing the controller needs from the other side: an identity
//! and a synchronous `send_and_receive`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::TransportError, operation::OperationTypeInfo};

mod exception;

pub use exception::{ExceptionInfo, InformationError};

/// Operation names every executor is expected to understand.
pub mod names {
    /// Instance equality.
    pub const EQUALS: &str = "Equals";
    /// Instance hash code.
    pub const GET_HASH_CODE: &str = "GetHashCode";
    /// Instance string form.
    pub const TO_STRING: &str = "ToString";
    /// Root object type, owner of [`REFERENCE_EQUALS`].
    pub const OBJECT_TYPE: &str = "System.Object";
    /// Static reference identity check.
    pub const REFERENCE_EQUALS: &str = "ReferenceEquals";
}

/// Opaque token identifying one variable slot in the variable pool of one target process.
///
/// Only the executor creates them. A handle is meaningless for any other connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarAddress(u64);

impl VarAddress {
    /// Wraps a raw slot number. Meant for executors.
    pub fn new(core: u64) -> Self {
        Self(core)
    }

    /// Returns the raw slot number.
    pub fn core(self) -> u64 {
        self.0
    }
}

/// Request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Declares a variable, optionally initialized from the single argument.
    VarInitialize,
    /// Declares a variable holding a newly constructed instance.
    VarNew,
    /// Releases a variable.
    BinOff,
    /// Reads the value of a variable.
    GetValue,
    /// Overwrites the value of a variable.
    SetValue,
    /// Snapshots the elements of an iterable variable.
    GetElements,
    /// Invokes a named member.
    Operation,
    /// Cheap emptiness check, used while polling asynchronous calls.
    IsEmptyVar,
    /// Allocates the result slot of an asynchronous call.
    AsyncResultVarInitialize,
    /// Invokes a named member without waiting for its completion.
    AsyncOperation,
}

/// Argument or return payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Plain value, copied across the boundary.
    Value(Value),
    /// Reference to a variable of the target process.
    Var(VarAddress),
    /// Several references, as returned by [`ProtocolType::GetElements`].
    Vars(Vec<VarAddress>),
}

impl Payload {
    /// The JSON null value.
    pub fn null() -> Self {
        Payload::Value(Value::Null)
    }
}

/// Request record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub protocol_type: ProtocolType,
    pub operation_type_info: Option<OperationTypeInfo>,
    /// Target variable of instance requests.
    pub var_address: Option<VarAddress>,
    /// Target type of static and construction requests, empty otherwise.
    pub type_full_name: String,
    pub operation: String,
    pub arguments: Vec<Payload>,
}

/// Response record: either a returned payload or a sanitized exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnInfo {
    Return(Payload),
    Exception(ExceptionInfo),
}

impl ReturnInfo {
    /// Returns a plain value.
    pub fn value(value: impl Into<Value>) -> Self {
        ReturnInfo::Return(Payload::Value(value.into()))
    }

    /// Returns a new variable.
    pub fn var(address: VarAddress) -> Self {
        ReturnInfo::Return(Payload::Var(address))
    }

    /// Returns nothing, as `void` members do.
    pub fn null() -> Self {
        ReturnInfo::Return(Payload::null())
    }

    /// Raises a failure.
    pub fn exception(info: ExceptionInfo) -> Self {
        ReturnInfo::Exception(info)
    }
}

/// Equality token telling which variable pool a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(u64);

impl Identity {
    /// Returns an identity never returned before in this process.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Identity(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Boundary interface to the executor of one target process.
pub trait FriendlyConnector: Send + Sync {
    /// Identity of the variable pool this connector talks to.
    fn identity(&self) -> Identity;

    /// Sends one request and blocks until its response arrives.
    fn send_and_receive(&self, info: ProtocolInfo) -> Result<ReturnInfo, TransportError>;
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_identity_is_unique() {
        let a = Identity::unique();
        let b = Identity::unique();
        assert_ne!(a, b);
        assert_ne!(b, Identity::unique());
    }

    #[test]
    fn test_return_info_wire_shape() {
        let ret = ReturnInfo::var(VarAddress::new(7));
        assert_eq!(
            serde_json::to_value(&ret).unwrap(),
            json!({ "return": { "kind": "var", "data": 7 } })
        );

        let ret = ReturnInfo::exception(ExceptionInfo::information("nope"));
        let decoded: ReturnInfo = serde_json::from_value(serde_json::to_value(&ret).unwrap()).unwrap();
        assert_eq!(decoded, ret);
    }

    #[test]
    fn test_protocol_type_names() {
        assert_eq!(
            serde_json::to_value(ProtocolType::AsyncResultVarInitialize).unwrap(),
            json!("AsyncResultVarInitialize")
        );
    }
}
