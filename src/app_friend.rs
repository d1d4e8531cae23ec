//! Connection to one target process.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;

use crate::{
    app_var::AppVar,
    error::{Error, Result, TokenKind},
    operation::{self, Arg, FriendlyOperation, OperationTypeInfo, Positional, Talker},
    protocol::{names, FriendlyConnector, Identity, ProtocolType},
};

/// Entry point to the address space of one target process.
///
/// Cloning is cheap and yields the same connection. Besides declaring variables and reaching
/// static operations, it carries extension state: values keyed by string, shared by every user of
/// the connection and living as long as it does.
#[derive(Clone)]
pub struct AppFriend {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Box<dyn FriendlyConnector>,
    extensions: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl AppFriend {
    /// Creates a connection talking through `connector`.
    pub fn new(connector: impl FriendlyConnector + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                extensions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Identity of the variable pool of the target process.
    pub fn identity(&self) -> Identity {
        self.inner.connector.identity()
    }

    pub(crate) fn connector(&self) -> &dyn FriendlyConnector {
        self.inner.connector.as_ref()
    }

    /// Declares an empty variable.
    pub fn declare_null(&self) -> Result<AppVar> {
        self.declare(Arg::null())
    }

    /// Declares a variable initialized from `value`.
    ///
    /// Plain values are copied; a variable (or owner) is forwarded by handle, so both variables
    /// then reference the same remote object.
    pub fn declare<'v>(&self, value: impl Into<Arg<'v>>) -> Result<AppVar> {
        let args = [value.into()];
        let resolved = operation::resolve(&args)?;
        resolved.reject_tokens()?;
        self.send_var(ProtocolType::VarInitialize, None, "", &resolved.positional)
    }

    /// Declares a variable holding a copy of `value`.
    pub fn declare_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<AppVar> {
        self.declare(Arg::serialize(value)?)
    }

    /// Declares a variable holding a new instance of `type_full_name`.
    ///
    /// `args` may contain an [`OperationTypeInfo`] selecting the constructor. Construction cannot
    /// be asynchronous.
    pub fn construct(&self, type_full_name: &str, args: &[Arg<'_>]) -> Result<AppVar> {
        if type_full_name.is_empty() {
            return Err(Error::EmptyName("type full name"));
        }
        let resolved = operation::resolve(args)?;
        if resolved.async_token.is_some() {
            return Err(Error::AsyncConstruction);
        }
        self.send_var(
            ProtocolType::VarNew,
            resolved.type_info,
            type_full_name,
            &resolved.positional,
        )
    }

    /// Same as [`construct`](Self::construct) with an explicit constructor selection.
    pub fn construct_with(
        &self,
        new_info: &NewInfo<'_>,
        type_info: &OperationTypeInfo,
    ) -> Result<AppVar> {
        let resolved = operation::resolve(&new_info.arguments)?;
        if resolved.async_token.is_some() {
            return Err(Error::AsyncConstruction);
        }
        if resolved.type_info.is_some() {
            return Err(Error::DuplicateArgument(TokenKind::OperationTypeInfo));
        }
        self.send_var(
            ProtocolType::VarNew,
            Some(type_info),
            &new_info.type_full_name,
            &resolved.positional,
        )
    }

    /// Static operation named `Namespace.Type.Operation`.
    pub fn static_operation(&self, full_name: &str) -> Result<FriendlyOperation<'_>> {
        match full_name.rsplit_once('.') {
            Some((type_full_name, operation))
                if !type_full_name.is_empty() && !operation.is_empty() =>
            {
                Ok(self.static_operation_of(type_full_name, operation))
            }
            _ => Err(Error::InvalidStaticOperation(full_name.to_owned())),
        }
    }

    /// Static operation `operation` of `type_full_name`.
    pub fn static_operation_of(
        &self,
        type_full_name: impl Into<String>,
        operation: impl Into<String>,
    ) -> FriendlyOperation<'_> {
        FriendlyOperation::new(
            Talker::Static {
                app: self,
                type_full_name: type_full_name.into(),
            },
            operation,
        )
    }

    /// Whether both variables reference the very same remote object.
    pub fn reference_equals(&self, lhs: &AppVar, rhs: &AppVar) -> Result<bool> {
        self.static_operation_of(names::OBJECT_TYPE, names::REFERENCE_EQUALS)
            .call(&[lhs.into(), rhs.into()])?
            .value()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn add_extension<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.extensions().insert(key.into(), Arc::new(value));
    }

    /// Value stored under `key`, if any and of type `T`.
    pub fn try_get_extension<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.extensions().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    fn extensions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Any + Send + Sync>>> {
        self.inner
            .extensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send_var(
        &self,
        protocol_type: ProtocolType,
        type_info: Option<&OperationTypeInfo>,
        type_full_name: &str,
        args: &[Positional<'_>],
    ) -> Result<AppVar> {
        let payload = operation::dispatch(
            self,
            protocol_type,
            type_info,
            None,
            type_full_name,
            "",
            args,
        )?;
        operation::into_var(self, payload)
    }
}

impl fmt::Debug for AppFriend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppFriend")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// Type and constructor arguments of an instance to create.
#[derive(Debug)]
pub struct NewInfo<'a> {
    type_full_name: String,
    arguments: Vec<Arg<'a>>,
}

impl<'a> NewInfo<'a> {
    /// Describes an instance of `type_full_name` built from `arguments`.
    pub fn new(type_full_name: impl Into<String>, arguments: Vec<Arg<'a>>) -> Self {
        Self {
            type_full_name: type_full_name.into(),
            arguments,
        }
    }

    /// Full name of the type to instantiate.
    pub fn type_full_name(&self) -> &str {
        &self.type_full_name
    }

    /// Constructor arguments.
    pub fn arguments(&self) -> &[Arg<'a>] {
        &self.arguments
    }
}
