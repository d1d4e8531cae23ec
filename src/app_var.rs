//! Controller-side handles to variables of the target process.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    app_friend::AppFriend,
    error::{Error, Result, TransportError},
    operation::{self, Arg, FriendlyOperation, Talker},
    protocol::{names, Payload, ProtocolInfo, ProtocolType, ReturnInfo, VarAddress},
};

/// Exclusive reference to one variable of the target process.
///
/// The executor keeps the referenced object alive until the variable is released, either
/// explicitly with [`release`](AppVar::release) or when the `AppVar` is dropped. Any use after
/// release fails with [`Error::Released`] before anything is sent.
///
/// Equality, hashing and string conversion are those of the remote object
/// ([`equals`](AppVar::equals), [`hash_code`](AppVar::hash_code),
/// [`to_remote_string`](AppVar::to_remote_string)). Use [`AppFriend::reference_equals`] for
/// identity.
///
/// An operation whose result is not a handle (a null from a `void` member, or a plain value)
/// yields a variable holding that value on this side. It reads like any other variable, is passed
/// by value as an argument, and fails with [`Error::NoHandle`] for anything needing a handle.
pub struct AppVar {
    app: AppFriend,
    held: Held,
    released: AtomicBool,
}

#[derive(Debug)]
enum Held {
    Handle(VarAddress),
    Value(Value),
}

impl AppVar {
    pub(crate) fn new(app: AppFriend, address: VarAddress) -> Self {
        Self::holding(app, Held::Handle(address))
    }

    pub(crate) fn returned(app: AppFriend, value: Value) -> Self {
        Self::holding(app, Held::Value(value))
    }

    fn holding(app: AppFriend, held: Held) -> Self {
        Self {
            app,
            held,
            released: AtomicBool::new(false),
        }
    }

    /// The connection this variable belongs to.
    pub fn app(&self) -> &AppFriend {
        &self.app
    }

    /// The handle, unless released.
    pub fn address(&self) -> Result<VarAddress> {
        match self.held()? {
            Held::Handle(address) => Ok(*address),
            Held::Value(_) => Err(Error::NoHandle),
        }
    }

    /// Whether the variable references a remote object rather than holding a returned value.
    pub fn has_handle(&self) -> bool {
        matches!(self.held, Held::Handle(_))
    }

    /// Whether [`release`](Self::release) already ran.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn held(&self) -> Result<&Held> {
        if self.is_released() {
            return Err(Error::Released);
        }
        Ok(&self.held)
    }

    /// What a call sends for this variable: its handle, or its returned value.
    pub(crate) fn payload(&self) -> Result<Payload> {
        match self.held()? {
            Held::Handle(address) => Ok(Payload::Var(*address)),
            Held::Value(value) => Ok(Payload::Value(value.clone())),
        }
    }

    /// Member (method, property, field) of the remote object.
    pub fn operation(&self, name: impl Into<String>) -> FriendlyOperation<'_> {
        FriendlyOperation::new(Talker::Var(self), name)
    }

    /// Calls `name` with no argument: property or field read, or parameterless method.
    pub fn get(&self, name: &str) -> Result<AppVar> {
        self.operation(name).call(&[])
    }

    /// Calls `name` with `value` as sole argument: property or field write.
    pub fn set<'v>(&self, name: &str, value: impl Into<Arg<'v>>) -> Result<()> {
        self.operation(name).call(&[value.into()]).map(drop)
    }

    /// Copies the remote value back.
    ///
    /// Fails if the remote object cannot be marshaled by value.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.raw_value()?)?)
    }

    /// Copies the remote value back as JSON.
    pub fn raw_value(&self) -> Result<Value> {
        if let Held::Value(value) = self.held()? {
            return Ok(value.clone());
        }
        let payload = self.talker().send(ProtocolType::GetValue, None, "", &[])?;
        operation::into_value(payload)
    }

    /// Overwrites the remote value with a copy of `value`, or with the object of another variable.
    pub fn set_value<'v>(&self, value: impl Into<Arg<'v>>) -> Result<()> {
        let args = [value.into()];
        let resolved = operation::resolve(&args)?;
        resolved.reject_tokens()?;
        self.talker()
            .send(ProtocolType::SetValue, None, "", &resolved.positional)
            .map(drop)
    }

    /// Whether the variable is empty. Cheap.
    pub fn is_null(&self) -> Result<bool> {
        if let Held::Value(value) = self.held()? {
            return Ok(value.is_null());
        }
        let payload = self.talker().send(ProtocolType::IsEmptyVar, None, "", &[])?;
        match operation::into_value(payload)? {
            Value::Bool(empty) => Ok(empty),
            _ => Err(Error::UnexpectedResponse("a boolean")),
        }
    }

    /// Snapshots the elements of an iterable remote object, one variable per element.
    pub fn elements(&self) -> Result<Vec<AppVar>> {
        match self.talker().send(ProtocolType::GetElements, None, "", &[])? {
            Payload::Vars(addresses) => Ok(addresses
                .into_iter()
                .map(|address| AppVar::new(self.app.clone(), address))
                .collect()),
            _ => Err(Error::UnexpectedResponse("a list of variable handles")),
        }
    }

    /// Remote `Equals`.
    pub fn equals<'v>(&self, other: impl Into<Arg<'v>>) -> Result<bool> {
        self.operation(names::EQUALS).call(&[other.into()])?.value()
    }

    /// Remote `GetHashCode`.
    pub fn hash_code(&self) -> Result<i64> {
        self.get(names::GET_HASH_CODE)?.value()
    }

    /// Remote `ToString`.
    pub fn to_remote_string(&self) -> Result<String> {
        self.get(names::TO_STRING)?.value()
    }

    /// Releases the remote variable.
    ///
    /// Only the first call sends anything. Failures are logged, never returned: the target process
    /// may already be gone.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Held::Handle(address) = self.held else {
            return;
        };

        let info = ProtocolInfo {
            protocol_type: ProtocolType::BinOff,
            operation_type_info: None,
            var_address: Some(address),
            type_full_name: String::new(),
            operation: String::new(),
            arguments: Vec::new(),
        };
        match self.app.connector().send_and_receive(info) {
            Ok(ReturnInfo::Return(_)) => {}
            Ok(ReturnInfo::Exception(exception)) => {
                tracing::debug!(address = ?address, message = %exception.message, "release refused");
            }
            Err(TransportError::Disconnected) => {
                tracing::debug!(address = ?address, "release skipped, connection closed");
            }
            Err(err) => {
                tracing::warn!(address = ?address, "release failed: {err}");
            }
        }
    }

    fn talker(&self) -> Talker<'_> {
        Talker::Var(self)
    }
}

impl Drop for AppVar {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for AppVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppVar")
            .field("app", &self.app)
            .field("held", &self.held)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Capability of holding exactly one [`AppVar`].
///
/// Anything implementing it can be passed where a variable is expected, see [`Arg::owner`].
pub trait AppVarOwner {
    fn app_var(&self) -> &AppVar;
}

impl AppVarOwner for AppVar {
    fn app_var(&self) -> &AppVar {
        self
    }
}

/// Minimal [`AppVarOwner`].
#[derive(Debug)]
pub struct ExplicitAppVar {
    app_var: AppVar,
}

impl ExplicitAppVar {
    pub fn new(app_var: AppVar) -> Self {
        Self { app_var }
    }

    pub fn into_app_var(self) -> AppVar {
        self.app_var
    }
}

impl AppVarOwner for ExplicitAppVar {
    fn app_var(&self) -> &AppVar {
        &self.app_var
    }
}

impl From<AppVar> for ExplicitAppVar {
    fn from(app_var: AppVar) -> Self {
        Self::new(app_var)
    }
}

impl<'a> From<&'a ExplicitAppVar> for Arg<'a> {
    fn from(owner: &'a ExplicitAppVar) -> Self {
        Arg::owner(owner)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{sync::Barrier, thread};

    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::{
        app_friend::tests::counting_app,
        args,
        operate::local::{LocalExecutor, TypeDef},
    };

    #[test]
    fn test_declare_and_read_back() {
        let app = LocalExecutor::new().app();
        let var = app.declare_value(&42).unwrap();
        assert_eq!(var.value::<i32>().unwrap(), 42);
        assert!(!var.is_null().unwrap());
    }

    #[test]
    fn test_declared_copy_is_independent() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let app = LocalExecutor::new().app();
        let mut point = Point { x: 1, y: 2 };
        let var = app.declare_value(&point).unwrap();
        point.x = 10;
        var.set("y", 20).unwrap();
        assert_eq!(var.value::<Point>().unwrap(), Point { x: 1, y: 20 });
        assert_eq!(point, Point { x: 10, y: 2 });
    }

    #[test]
    fn test_set_value() {
        let app = LocalExecutor::new().app();
        let var = app.declare_null().unwrap();
        assert!(var.is_null().unwrap());
        var.set_value("text").unwrap();
        assert_eq!(var.value::<String>().unwrap(), "text");

        let other = app.declare_value(&7).unwrap();
        var.set_value(&other).unwrap();
        assert_eq!(var.value::<i32>().unwrap(), 7);

        let token = crate::asynchronous::Async::new();
        assert_matches!(var.set_value(&token), Err(Error::UnexpectedToken(_)));
    }

    #[test]
    fn test_released_var_is_unusable() {
        let (app, sent) = counting_app();
        let var = app.declare_value(&1).unwrap();
        var.release();
        let after_release = sent.get();

        assert!(var.is_released());
        assert_matches!(var.value::<i32>(), Err(Error::Released));
        assert_matches!(var.is_null(), Err(Error::Released));
        assert_matches!(var.get("Length"), Err(Error::Released));
        assert_matches!(var.elements(), Err(Error::Released));

        var.release();
        drop(var);
        assert_eq!(sent.get(), after_release);
    }

    #[test]
    fn test_concurrent_release_sends_once() {
        let (app, sent) = counting_app();
        let var = app.declare_value(&1).unwrap();
        let before = sent.get();

        let barrier = Barrier::new(8);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    var.release();
                });
            }
        });
        drop(var);
        assert_eq!(sent.get(), before + 1);
    }

    #[test]
    fn test_released_var_as_argument() {
        let app = LocalExecutor::new().app();
        let target = app.declare_value(&json!({ "a": 1 })).unwrap();
        let arg = app.declare_value(&2).unwrap();
        arg.release();
        assert_matches!(target.set("a", &arg), Err(Error::Released));
    }

    #[test]
    fn test_release_is_best_effort() {
        let executor = LocalExecutor::new();
        let app = executor.app();
        let var = app.declare_value(&1).unwrap();
        // Released behind our back: the second release attempt fails remotely and is ignored.
        executor.clear();
        var.release();
        assert!(var.is_released());
    }

    #[test]
    fn test_operations_and_fields() {
        let app = LocalExecutor::new().app();
        let var = app.declare_value(&json!({ "name": "sensor", "tags": [1, 2, 3] })).unwrap();
        assert_eq!(var.get("name").unwrap().value::<String>().unwrap(), "sensor");
        var.set("name", "friendly").unwrap();
        assert_eq!(
            var.operation("name").call(&args![]).unwrap().value::<String>().unwrap(),
            "friendly"
        );
        assert_eq!(var.get("tags").unwrap().get("Length").unwrap().value::<usize>().unwrap(), 3);
    }

    #[test]
    fn test_remote_failure_is_raised() {
        let executor = LocalExecutor::new();
        executor.register_type(
            TypeDef::new("Demo.Failing")
                .constructor(|_| Ok(json!({})))
                .operation("Fail", |_, _| Err("disk on fire".into())),
        );
        let app = executor.app();
        let var = app.construct("Demo.Failing", &[]).unwrap();

        let err = var.get("Fail").unwrap_err();
        assert_matches!(&err, Error::Remote(exception) if exception.message() == "disk on fire");
        assert_matches!(
            &err,
            Error::Remote(exception) if exception.info().source.as_deref() == Some("Demo.Failing.Fail")
        );

        let err = var.get("Missing").unwrap_err();
        assert_matches!(
            err,
            Error::Remote(exception) if exception.info().is_information()
                && exception.message() == "operation `Missing` not found"
        );
    }

    #[test]
    fn test_elements_snapshot() {
        let app = LocalExecutor::new().app();
        let list = app.declare_value(&vec!["a", "b"]).unwrap();
        let elements = list.elements().unwrap();
        list.set_value(json!(["c"])).unwrap();

        let values: Vec<String> = elements.iter().map(|e| e.value().unwrap()).collect();
        assert_eq!(values, ["a", "b"]);

        let number = app.declare_value(&1).unwrap();
        assert_matches!(number.elements(), Err(Error::Remote(_)));
    }

    #[test]
    fn test_delegated_equality() {
        let app = LocalExecutor::new().app();
        let a = app.declare_value(&"same").unwrap();
        let b = app.declare_value(&"same").unwrap();
        assert!(a.equals(&b).unwrap());
        assert!(a.equals("same").unwrap());
        assert!(!a.equals(3).unwrap());
        assert_eq!(a.hash_code().unwrap(), b.hash_code().unwrap());
        assert_eq!(a.to_remote_string().unwrap(), "same");
        assert!(!app.reference_equals(&a, &b).unwrap());
    }

    #[test]
    fn test_owner_is_passed_by_handle() {
        let app = LocalExecutor::new().app();
        let target = app.declare_value(&json!({ "inner": null })).unwrap();
        let owner = ExplicitAppVar::new(app.declare_value(&5).unwrap());
        target.set("inner", &owner).unwrap();
        assert_eq!(target.get("inner").unwrap().value::<i32>().unwrap(), 5);
        assert_eq!(owner.into_app_var().value::<i32>().unwrap(), 5);
    }
}
