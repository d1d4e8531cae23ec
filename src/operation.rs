//! Operation dispatch.
//!
//! Every call, be it an instance, static or asynchronous one, ends up in [`dispatch`]: out-of-band
//! tokens are extracted from the argument list first (see [`resolve`]), the remaining arguments
//! are marshaled (variables become handles), the request is sent and the response unwrapped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    app_friend::AppFriend,
    app_var::{AppVar, AppVarOwner},
    asynchronous::{Async, Binding},
    error::{Error, FriendlyOperationException, Result, TokenKind},
    protocol::{Payload, ProtocolInfo, ProtocolType, ReturnInfo, VarAddress},
};

/// Explicit overload selection: declaring type and parameter types.
///
/// Needed when the arguments alone cannot select an overload, or to reach an operation shadowed
/// in a derived type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationTypeInfo {
    target: String,
    arguments: Vec<String>,
}

impl OperationTypeInfo {
    pub fn new<I, S>(target: impl Into<String>, arguments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target = target.into();
        if target.is_empty() {
            return Err(Error::InvalidTypeInfo("the target type name is empty"));
        }
        let arguments: Vec<String> = arguments.into_iter().map(Into::into).collect();
        if arguments.iter().any(String::is_empty) {
            return Err(Error::InvalidTypeInfo("an argument type name is empty"));
        }
        Ok(Self { target, arguments })
    }

    /// Full name of the type declaring the operation.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Full names of the parameter types.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

/// Argument of a remote call.
#[derive(Debug)]
pub enum Arg<'a> {
    /// Plain value, copied to the target process.
    Value(Value),
    /// Remote variable, passed by handle.
    Var(&'a AppVar),
    /// Unrealized type reference. Always rejected as an argument.
    TypeRef(String),
    /// Makes the call asynchronous.
    Async(&'a Async),
    /// Selects the overload.
    TypeInfo(OperationTypeInfo),
}

impl<'a> Arg<'a> {
    /// Serializes any value into a plain argument.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Arg::Value(serde_json::to_value(value)?))
    }

    /// The null value.
    pub fn null() -> Self {
        Arg::Value(Value::Null)
    }

    /// Passes the variable held by `owner`.
    pub fn owner<O: AppVarOwner + ?Sized>(owner: &'a O) -> Self {
        Arg::Var(owner.app_var())
    }

    fn token_kind(&self) -> Option<TokenKind> {
        match self {
            Arg::Async(_) => Some(TokenKind::Async),
            Arg::TypeInfo(_) => Some(TokenKind::OperationTypeInfo),
            _ => None,
        }
    }
}

macro_rules! impl_value_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg<'_> {
                fn from(value: $ty) -> Self {
                    Arg::Value(Value::from(value))
                }
            }
        )*
    };
}

impl_value_arg!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String, Value);

impl From<&str> for Arg<'_> {
    fn from(value: &str) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<()> for Arg<'_> {
    fn from((): ()) -> Self {
        Arg::null()
    }
}

impl<'a> From<&'a AppVar> for Arg<'a> {
    fn from(value: &'a AppVar) -> Self {
        Arg::Var(value)
    }
}

impl<'a> From<&'a Async> for Arg<'a> {
    fn from(value: &'a Async) -> Self {
        Arg::Async(value)
    }
}

impl From<OperationTypeInfo> for Arg<'_> {
    fn from(value: OperationTypeInfo) -> Self {
        Arg::TypeInfo(value)
    }
}

impl From<&OperationTypeInfo> for Arg<'_> {
    fn from(value: &OperationTypeInfo) -> Self {
        Arg::TypeInfo(value.clone())
    }
}

/// Builds a `Vec<Arg>` converting each expression with `Arg::from`.
///
/// ```ignore
/// let sum = calculator.operation("Add").call(&args![1, 2, &other])?;
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::operation::Arg<'_>>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::operation::Arg::from($arg)),+]
    };
}

/// Argument left once tokens are extracted.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Positional<'r> {
    Value(&'r Value),
    Var(&'r AppVar),
    TypeRef(&'r str),
}

#[derive(Debug)]
pub(crate) struct Resolved<'r> {
    pub(crate) async_token: Option<&'r Async>,
    pub(crate) type_info: Option<&'r OperationTypeInfo>,
    pub(crate) positional: Vec<Positional<'r>>,
}

impl Resolved<'_> {
    /// Fails if any token was found, for calls that take none.
    pub(crate) fn reject_tokens(&self) -> Result<()> {
        if self.async_token.is_some() {
            return Err(Error::UnexpectedToken(TokenKind::Async));
        }
        if self.type_info.is_some() {
            return Err(Error::UnexpectedToken(TokenKind::OperationTypeInfo));
        }
        Ok(())
    }
}

/// Extracts at most one [`Async`] and one [`OperationTypeInfo`] from anywhere in `args`.
pub(crate) fn resolve<'r>(args: &'r [Arg<'_>]) -> Result<Resolved<'r>> {
    let mut resolved = Resolved {
        async_token: None,
        type_info: None,
        positional: Vec::with_capacity(args.len()),
    };
    for arg in args {
        match arg {
            Arg::Async(token) => {
                if resolved.async_token.replace(*token).is_some() {
                    return Err(Error::DuplicateArgument(TokenKind::Async));
                }
            }
            Arg::TypeInfo(type_info) => {
                if resolved.type_info.replace(type_info).is_some() {
                    return Err(Error::DuplicateArgument(TokenKind::OperationTypeInfo));
                }
            }
            Arg::Value(value) => resolved.positional.push(Positional::Value(value)),
            Arg::Var(var) => resolved.positional.push(Positional::Var(*var)),
            Arg::TypeRef(name) => resolved.positional.push(Positional::TypeRef(name)),
        }
    }
    Ok(resolved)
}

/// Number of arguments which are neither an [`Async`] nor an [`OperationTypeInfo`].
pub(crate) fn positional_len(args: &[Arg<'_>]) -> usize {
    args.iter().filter(|arg| arg.token_kind().is_none()).count()
}

/// Keeps the first of two optional tokens, failing if both are set.
fn single<'r, T: ?Sized>(
    first: Option<&'r T>,
    second: Option<&'r T>,
    kind: TokenKind,
) -> Result<Option<&'r T>> {
    match (first, second) {
        (Some(_), Some(_)) => Err(Error::DuplicateArgument(kind)),
        (first, second) => Ok(first.or(second)),
    }
}

fn marshal(app: &AppFriend, arg: Positional<'_>, index: usize) -> Result<Payload> {
    match arg {
        Positional::Value(value) => Ok(Payload::Value(value.clone())),
        Positional::Var(var) => {
            if var.app().identity() != app.identity() {
                return Err(Error::DifferentConnection { index });
            }
            var.payload()
        }
        Positional::TypeRef(name) => Err(Error::TypeReferenceArgument {
            index,
            type_name: name.to_owned(),
        }),
    }
}

/// Marshals every positional argument, numbering them from 1 in errors.
pub(crate) fn marshal_all(app: &AppFriend, args: &[Positional<'_>]) -> Result<Vec<Payload>> {
    args.iter()
        .enumerate()
        .map(|(i, arg)| marshal(app, *arg, i + 1))
        .collect()
}

/// Builds, sends and unwraps one request.
///
/// Every argument stays borrowed until the response is back, so none of them can be released
/// while the call is outstanding.
pub(crate) fn dispatch(
    app: &AppFriend,
    protocol_type: ProtocolType,
    type_info: Option<&OperationTypeInfo>,
    var_address: Option<VarAddress>,
    type_full_name: &str,
    operation: &str,
    args: &[Positional<'_>],
) -> Result<Payload> {
    let arguments = marshal_all(app, args)?;
    send(
        app,
        protocol_type,
        type_info,
        var_address,
        type_full_name,
        operation,
        arguments,
    )
}

/// Sends already marshaled arguments and unwraps the response.
pub(crate) fn send(
    app: &AppFriend,
    protocol_type: ProtocolType,
    type_info: Option<&OperationTypeInfo>,
    var_address: Option<VarAddress>,
    type_full_name: &str,
    operation: &str,
    arguments: Vec<Payload>,
) -> Result<Payload> {
    tracing::trace!(?protocol_type, operation, type_full_name, "sending request");

    let info = ProtocolInfo {
        protocol_type,
        operation_type_info: type_info.cloned(),
        var_address,
        type_full_name: type_full_name.to_owned(),
        operation: operation.to_owned(),
        arguments,
    };
    match app.connector().send_and_receive(info)? {
        ReturnInfo::Return(payload) => Ok(payload),
        ReturnInfo::Exception(info) => Err(FriendlyOperationException::new(info).into()),
    }
}

pub(crate) fn into_var(app: &AppFriend, payload: Payload) -> Result<AppVar> {
    match payload {
        Payload::Var(address) => Ok(AppVar::new(app.clone(), address)),
        _ => Err(Error::UnexpectedResponse("a variable handle")),
    }
}

/// Result of an operation: a handle, or a returned value (null for `void` members).
pub(crate) fn into_result(app: &AppFriend, payload: Payload) -> Result<AppVar> {
    match payload {
        Payload::Var(address) => Ok(AppVar::new(app.clone(), address)),
        Payload::Value(value) => Ok(AppVar::returned(app.clone(), value)),
        Payload::Vars(_) => Err(Error::UnexpectedResponse("a variable handle or a value")),
    }
}

pub(crate) fn into_value(payload: Payload) -> Result<Value> {
    match payload {
        Payload::Value(value) => Ok(value),
        _ => Err(Error::UnexpectedResponse("a plain value")),
    }
}

/// Object an operation is invoked on: a variable, or a type for static operations.
#[derive(Debug, Clone)]
pub(crate) enum Talker<'a> {
    Var(&'a AppVar),
    Static {
        app: &'a AppFriend,
        type_full_name: String,
    },
}

impl<'a> Talker<'a> {
    pub(crate) fn app(&self) -> &'a AppFriend {
        match *self {
            Talker::Var(var) => var.app(),
            Talker::Static { app, .. } => app,
        }
    }

    /// Handle of the target variable, or name of the target type.
    pub(crate) fn target(&self) -> Result<(Option<VarAddress>, &str)> {
        match self {
            Talker::Var(var) => Ok((Some(var.address()?), "")),
            Talker::Static { type_full_name, .. } => Ok((None, type_full_name)),
        }
    }

    pub(crate) fn send(
        &self,
        protocol_type: ProtocolType,
        type_info: Option<&OperationTypeInfo>,
        operation: &str,
        args: &[Positional<'_>],
    ) -> Result<Payload> {
        let (var_address, type_full_name) = self.target()?;
        dispatch(
            self.app(),
            protocol_type,
            type_info,
            var_address,
            type_full_name,
            operation,
            args,
        )
    }

    pub(crate) fn send_marshaled(
        &self,
        protocol_type: ProtocolType,
        type_info: Option<&OperationTypeInfo>,
        operation: &str,
        arguments: Vec<Payload>,
    ) -> Result<Payload> {
        let (var_address, type_full_name) = self.target()?;
        send(
            self.app(),
            protocol_type,
            type_info,
            var_address,
            type_full_name,
            operation,
            arguments,
        )
    }

    pub(crate) fn call(
        &self,
        type_info: Option<&OperationTypeInfo>,
        operation: &str,
        args: &[Positional<'_>],
    ) -> Result<AppVar> {
        let payload = self.send(ProtocolType::Operation, type_info, operation, args)?;
        into_result(self.app(), payload)
    }
}

/// Named operation bound to a variable or a type, ready to be called.
#[derive(Debug)]
pub struct FriendlyOperation<'a> {
    talker: Talker<'a>,
    name: String,
    type_info: Option<OperationTypeInfo>,
    async_token: Option<&'a Async>,
}

impl<'a> FriendlyOperation<'a> {
    pub(crate) fn new(talker: Talker<'a>, name: impl Into<String>) -> Self {
        Self {
            talker,
            name: name.into(),
            type_info: None,
            async_token: None,
        }
    }

    /// Selects the overload explicitly.
    pub fn with_type_info(mut self, type_info: OperationTypeInfo) -> Self {
        self.type_info = Some(type_info);
        self
    }

    /// Binds `token` to this operation: the next [`call`](Self::call) returns without waiting.
    ///
    /// Fails if the token is already bound or completed.
    pub fn with_async(mut self, token: &'a Async) -> Result<Self> {
        token.bind()?;
        self.async_token = Some(token);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the operation.
    ///
    /// `args` may contain one [`Async`] and one [`OperationTypeInfo`] anywhere. The returned
    /// variable holds the result; for asynchronous calls its content is undefined until the token
    /// completes. Usage errors leave the token as it was.
    pub fn call(&self, args: &[Arg<'_>]) -> Result<AppVar> {
        let resolved = resolve(args)?;
        let type_info = single(
            self.type_info.as_ref(),
            resolved.type_info,
            TokenKind::OperationTypeInfo,
        )?;
        match (self.async_token, resolved.async_token) {
            (Some(_), Some(_)) => Err(Error::DuplicateArgument(TokenKind::Async)),
            (Some(token), None) => token.invoke(
                Binding::Builder,
                &self.talker,
                type_info,
                &self.name,
                &resolved.positional,
            ),
            (None, Some(token)) => token.invoke(
                Binding::Arguments,
                &self.talker,
                type_info,
                &self.name,
                &resolved.positional,
            ),
            (None, None) => self.talker.call(type_info, &self.name, &resolved.positional),
        }
    }
}
