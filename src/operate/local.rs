//! In-process executor.
//!
//! [`LocalExecutor`] keeps a variable pool of JSON values. Registered [`TypeDef`]s provide
//! constructors, static operations and instance operations. A few operations are understood on
//! any value:
//!
//! * `Equals`, `GetHashCode` and `ToString`,
//! * `Length` and `Count` on arrays and strings,
//! * field read (no argument) and write (one argument) on objects,
//! * indexers `[]`, `[,]`... on arrays (by position) and objects (by key),
//! * the static `System.Object.ReferenceEquals`.
//!
//! Asynchronous operations run on a thread of their own, which deposits the serialized
//! [`ReturnInfo`] into the result slot once done.

use std::{
    backtrace::{Backtrace, BacktraceStatus},
    collections::HashMap,
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    thread,
};

use serde_json::Value;

use super::Executor;
use crate::{
    app_friend::AppFriend,
    error::TransportError,
    operation::OperationTypeInfo,
    protocol::{
        names, ExceptionInfo, FriendlyConnector, Identity, InformationError, Payload,
        ProtocolInfo, ProtocolType, ReturnInfo, VarAddress,
    },
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a registered operation.
pub type OperationResult = Result<Value, BoxError>;

/// Element count of arrays and strings.
pub const LENGTH: &str = "Length";
/// Alias of [`LENGTH`].
pub const COUNT: &str = "Count";

type Function = Arc<dyn Fn(&[Value]) -> OperationResult + Send + Sync>;
type Method = Arc<dyn Fn(&mut Value, &[Value]) -> OperationResult + Send + Sync>;

/// Operations of one type, registered with [`LocalExecutor::register_type`].
pub struct TypeDef {
    full_name: String,
    constructor: Option<Function>,
    static_operations: HashMap<String, Function>,
    operations: HashMap<String, Method>,
}

impl TypeDef {
    /// Creates an empty definition for `full_name`.
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            constructor: None,
            static_operations: HashMap::new(),
            operations: HashMap::new(),
        }
    }

    /// Full name the type is registered under.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Builds the initial value of new instances from the constructor arguments.
    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> OperationResult + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(f));
        self
    }

    /// Operation called on the type rather than on an instance.
    pub fn static_operation<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> OperationResult + Send + Sync + 'static,
    {
        self.static_operations.insert(name.into(), Arc::new(f));
        self
    }

    /// Instance operation, called with the locked instance value.
    pub fn operation<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Value, &[Value]) -> OperationResult + Send + Sync + 'static,
    {
        self.operations.insert(name.into(), Arc::new(f));
        self
    }
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDef")
            .field("full_name", &self.full_name)
            .field("constructor", &self.constructor.is_some())
            .field("static_operations", &self.static_operations.keys())
            .field("operations", &self.operations.keys())
            .finish()
    }
}

type Object = Arc<Mutex<Value>>;

fn lock(object: &Object) -> MutexGuard<'_, Value> {
    object.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Slot {
    object: Object,
    type_name: Option<String>,
}

impl Slot {
    fn new(value: Value, type_name: Option<String>) -> Self {
        Self {
            object: Arc::new(Mutex::new(value)),
            type_name,
        }
    }
}

#[derive(Default)]
struct Slots {
    last: u64,
    entries: HashMap<VarAddress, Slot>,
}

enum Operand {
    Value(Value),
    Object(Object),
}

fn values(operands: &[Operand]) -> Vec<Value> {
    operands
        .iter()
        .map(|operand| match operand {
            Operand::Value(value) => value.clone(),
            Operand::Object(object) => lock(object).clone(),
        })
        .collect()
}

enum Failure {
    Information(InformationError),
    Raised { source: String, error: BoxError },
}

impl Failure {
    fn information(message: impl Into<String>) -> Self {
        Failure::Information(InformationError::new(message))
    }

    fn not_found(operation: &str) -> Self {
        Self::information(format!("operation `{operation}` not found"))
    }

    fn raised(source: impl Into<String>) -> impl FnOnce(BoxError) -> Self {
        let source = source.into();
        move |error| Failure::Raised { source, error }
    }

    fn into_exception_info(self) -> ExceptionInfo {
        match self {
            Failure::Information(information) => ExceptionInfo::from_error(&information),
            Failure::Raised { source, error } => {
                if error.is::<InformationError>() {
                    return ExceptionInfo::from_error(&*error);
                }
                tracing::debug!(source = %source, "operation failed: {error}");
                let info = ExceptionInfo::from_error(&*error).with_source(source);
                let backtrace = Backtrace::capture();
                if backtrace.status() == BacktraceStatus::Captured {
                    info.with_stack_trace(backtrace.to_string())
                } else {
                    info
                }
            }
        }
    }
}

enum CallTarget {
    Instance(Slot),
    Static(String),
}

/// Operation call with its target and arguments resolved.
struct Call {
    target: CallTarget,
    operation: String,
    type_info: Option<OperationTypeInfo>,
    operands: Vec<Operand>,
}

impl Call {
    fn run(self, pool: &Pool) -> Result<Value, Failure> {
        let Call {
            target,
            operation,
            type_info,
            operands,
        } = self;

        if let Some(type_info) = &type_info {
            let expected = type_info.arguments().len();
            if expected != operands.len() {
                return Err(Failure::information(format!(
                    "`{}.{operation}` takes {expected} arguments, {} given",
                    type_info.target(),
                    operands.len()
                )));
            }
        }

        match target {
            CallTarget::Static(type_name) => {
                if type_name == names::OBJECT_TYPE && operation == names::REFERENCE_EQUALS {
                    return reference_equals(&operands);
                }
                let type_name = type_info.map_or(type_name, |info| info.target().to_owned());
                let type_def = pool.type_def(&type_name)?;
                let function = type_def
                    .static_operations
                    .get(&operation)
                    .ok_or_else(|| Failure::not_found(&operation))?;
                function(&values(&operands))
                    .map_err(Failure::raised(format!("{type_name}.{operation}")))
            }
            CallTarget::Instance(slot) => {
                let args = values(&operands);
                let type_name = type_info
                    .map(|info| info.target().to_owned())
                    .or(slot.type_name);
                if let Some(type_name) = type_name {
                    let type_def = pool.type_def(&type_name)?;
                    if let Some(method) = type_def.operations.get(&operation) {
                        let mut object = lock(&slot.object);
                        return method(&mut *object, &args)
                            .map_err(Failure::raised(format!("{type_name}.{operation}")));
                    }
                }
                let mut object = lock(&slot.object);
                builtin(&mut *object, &operation, &args)
            }
        }
    }
}

fn reference_equals(operands: &[Operand]) -> Result<Value, Failure> {
    match operands {
        [Operand::Object(a), Operand::Object(b)] => Ok(Value::Bool(Arc::ptr_eq(a, b))),
        [_, _] => Ok(Value::Bool(false)),
        _ => Err(Failure::information(format!(
            "`{}` takes 2 arguments",
            names::REFERENCE_EQUALS
        ))),
    }
}

fn builtin(object: &mut Value, operation: &str, args: &[Value]) -> Result<Value, Failure> {
    match (operation, args) {
        (names::EQUALS, [other]) => return Ok(Value::Bool(*object == *other)),
        (names::GET_HASH_CODE, []) => return Ok(Value::from(hash_code(object))),
        (names::TO_STRING, []) => {
            return Ok(Value::String(match object {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }))
        }
        (LENGTH | COUNT, []) => match object {
            Value::Array(items) => return Ok(Value::from(items.len())),
            Value::String(s) => return Ok(Value::from(s.chars().count())),
            _ => {}
        },
        _ => {}
    }

    if let Some(count) = index_arity(operation) {
        return index(object, operation, count, args);
    }

    if let Value::Object(fields) = object {
        match args {
            [] => {
                if let Some(value) = fields.get(operation) {
                    return Ok(value.clone());
                }
            }
            [value] => {
                fields.insert(operation.to_owned(), value.clone());
                return Ok(Value::Null);
            }
            _ => {}
        }
    }

    Err(Failure::not_found(operation))
}

fn hash_code(value: &Value) -> i64 {
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish() as i64
}

/// Number of indices taken by an indexer name such as `[,]`.
fn index_arity(operation: &str) -> Option<usize> {
    let commas = operation.strip_prefix('[')?.strip_suffix(']')?;
    commas
        .chars()
        .all(|c| c == ',')
        .then(|| commas.len() + 1)
}

fn index(object: &mut Value, operation: &str, count: usize, args: &[Value]) -> Result<Value, Failure> {
    let (indices, value) = if args.len() == count {
        (args, None)
    } else if args.len() == count + 1 {
        (&args[..count], Some(&args[count]))
    } else {
        return Err(Failure::information(format!(
            "`{operation}` takes {count} indices"
        )));
    };
    let Some((last, path)) = indices.split_last() else {
        return Err(Failure::information(format!(
            "`{operation}` takes {count} indices"
        )));
    };

    let mut current = object;
    for index in path {
        current = element_mut(current, index)?;
    }
    match value {
        None => Ok(element_mut(current, last)?.clone()),
        Some(value) => {
            set_element(current, last, value.clone())?;
            Ok(Value::Null)
        }
    }
}

fn element_mut<'v>(container: &'v mut Value, index: &Value) -> Result<&'v mut Value, Failure> {
    match (container, index) {
        (Value::Array(items), Value::Number(n)) => {
            let len = items.len();
            match n
                .as_u64()
                .and_then(|i| usize::try_from(i).ok())
                .filter(|&i| i < len)
            {
                Some(i) => Ok(&mut items[i]),
                None => Err(Failure::information(format!("index {n} is out of range"))),
            }
        }
        (Value::Object(fields), Value::String(key)) => fields
            .get_mut(key)
            .ok_or_else(|| Failure::information(format!("key `{key}` not found"))),
        _ => Err(Failure::information(format!(
            "the value cannot be indexed by {index}"
        ))),
    }
}

fn set_element(container: &mut Value, index: &Value, value: Value) -> Result<(), Failure> {
    match (container, index) {
        (Value::Object(fields), Value::String(key)) => {
            fields.insert(key.clone(), value);
            Ok(())
        }
        (container, index) => {
            *element_mut(container, index)? = value;
            Ok(())
        }
    }
}

struct Pool {
    identity: Identity,
    slots: Mutex<Slots>,
    types: RwLock<HashMap<String, Arc<TypeDef>>>,
}

impl Pool {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn declare(&self, slot: Slot) -> VarAddress {
        let mut slots = self.slots();
        slots.last += 1;
        let address = VarAddress::new(slots.last);
        slots.entries.insert(address, slot);
        address
    }

    fn slot(&self, address: VarAddress) -> Result<Slot, Failure> {
        self.slots()
            .entries
            .get(&address)
            .cloned()
            .ok_or_else(|| Failure::information(format!("variable {} not found", address.core())))
    }

    fn type_def(&self, full_name: &str) -> Result<Arc<TypeDef>, Failure> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(full_name)
            .cloned()
            .ok_or_else(|| Failure::information(format!("type `{full_name}` not found")))
    }

    fn operands(&self, arguments: Vec<Payload>) -> Result<Vec<Operand>, Failure> {
        arguments
            .into_iter()
            .map(|argument| match argument {
                Payload::Value(value) => Ok(Operand::Value(value)),
                Payload::Var(address) => Ok(Operand::Object(self.slot(address)?.object)),
                Payload::Vars(_) => Err(Failure::information(
                    "variable lists are not accepted as arguments",
                )),
            })
            .collect()
    }

    /// Slot described by the only argument of a declaration or assignment, if any.
    fn argument_slot(&self, arguments: Vec<Payload>) -> Result<Option<Slot>, Failure> {
        let mut arguments = arguments.into_iter();
        let slot = match arguments.next() {
            None => None,
            Some(Payload::Value(value)) => Some(Slot::new(value, None)),
            Some(Payload::Var(address)) => Some(self.slot(address)?),
            Some(Payload::Vars(_)) => {
                return Err(Failure::information(
                    "variable lists are not accepted as arguments",
                ))
            }
        };
        if arguments.next().is_some() {
            return Err(Failure::information("expected at most one argument"));
        }
        Ok(slot)
    }

    fn target(var_address: Option<VarAddress>) -> Result<VarAddress, Failure> {
        var_address.ok_or_else(|| Failure::information("the request has no target variable"))
    }

    fn call(
        &self,
        var_address: Option<VarAddress>,
        type_full_name: String,
        operation: String,
        type_info: Option<OperationTypeInfo>,
        arguments: Vec<Payload>,
    ) -> Result<Call, Failure> {
        let target = match var_address {
            Some(address) => CallTarget::Instance(self.slot(address)?),
            None if !type_full_name.is_empty() => {
                let effective = type_info
                    .as_ref()
                    .map_or(type_full_name.as_str(), OperationTypeInfo::target);
                if effective != names::OBJECT_TYPE {
                    self.type_def(effective)?;
                }
                CallTarget::Static(type_full_name)
            }
            None => {
                return Err(Failure::information(
                    "the request has neither a target variable nor a type",
                ))
            }
        };
        Ok(Call {
            target,
            operation,
            type_info,
            operands: self.operands(arguments)?,
        })
    }

    fn handle(self: &Arc<Self>, info: ProtocolInfo) -> Result<Payload, Failure> {
        let ProtocolInfo {
            protocol_type,
            operation_type_info,
            var_address,
            type_full_name,
            operation,
            arguments,
        } = info;

        match protocol_type {
            ProtocolType::VarInitialize => {
                let slot = self
                    .argument_slot(arguments)?
                    .unwrap_or_else(|| Slot::new(Value::Null, None));
                Ok(Payload::Var(self.declare(slot)))
            }
            ProtocolType::VarNew => {
                let type_def = self.type_def(&type_full_name)?;
                let constructor = type_def.constructor.as_ref().ok_or_else(|| {
                    Failure::information(format!("type `{type_full_name}` has no constructor"))
                })?;
                let args = values(&self.operands(arguments)?);
                if let Some(type_info) = &operation_type_info {
                    if type_info.arguments().len() != args.len() {
                        return Err(Failure::information(format!(
                            "no constructor of `{type_full_name}` takes {} arguments",
                            args.len()
                        )));
                    }
                }
                let value = constructor(&args).map_err(Failure::raised(type_full_name.clone()))?;
                Ok(Payload::Var(self.declare(Slot::new(value, Some(type_full_name)))))
            }
            ProtocolType::BinOff => {
                let address = Self::target(var_address)?;
                match self.slots().entries.remove(&address) {
                    Some(_) => Ok(Payload::null()),
                    None => Err(Failure::information(format!(
                        "variable {} not found",
                        address.core()
                    ))),
                }
            }
            ProtocolType::GetValue => {
                let slot = self.slot(Self::target(var_address)?)?;
                let value = lock(&slot.object).clone();
                Ok(Payload::Value(value))
            }
            ProtocolType::SetValue => {
                let address = Self::target(var_address)?;
                let source = self
                    .argument_slot(arguments)?
                    .ok_or_else(|| Failure::information("expected one argument"))?;
                match self.slots().entries.get_mut(&address) {
                    Some(slot) => {
                        *slot = source;
                        Ok(Payload::null())
                    }
                    None => Err(Failure::information(format!(
                        "variable {} not found",
                        address.core()
                    ))),
                }
            }
            ProtocolType::GetElements => {
                let address = Self::target(var_address)?;
                let slot = self.slot(address)?;
                let value = lock(&slot.object).clone();
                match value {
                    Value::Array(items) => Ok(Payload::Vars(
                        items
                            .into_iter()
                            .map(|item| self.declare(Slot::new(item, None)))
                            .collect(),
                    )),
                    _ => Err(Failure::information(format!(
                        "variable {} is not iterable",
                        address.core()
                    ))),
                }
            }
            ProtocolType::Operation => {
                let call = self.call(
                    var_address,
                    type_full_name,
                    operation,
                    operation_type_info,
                    arguments,
                )?;
                let value = call.run(self)?;
                Ok(Payload::Var(self.declare(Slot::new(value, None))))
            }
            ProtocolType::IsEmptyVar => {
                let slot = self.slot(Self::target(var_address)?)?;
                let empty = lock(&slot.object).is_null();
                Ok(Payload::Value(Value::Bool(empty)))
            }
            ProtocolType::AsyncResultVarInitialize => {
                Ok(Payload::Var(self.declare(Slot::new(Value::Null, None))))
            }
            ProtocolType::AsyncOperation => {
                let mut arguments = arguments.into_iter();
                let result_slot = match arguments.next() {
                    Some(Payload::Var(address)) => self.slot(address)?.object,
                    _ => return Err(Failure::information("the result slot is missing")),
                };
                let call = self.call(
                    var_address,
                    type_full_name,
                    operation,
                    operation_type_info,
                    arguments.collect(),
                )?;

                let placeholder = Slot::new(Value::Null, None);
                let result = Arc::clone(&placeholder.object);
                let address = self.declare(placeholder);

                let pool = Arc::clone(self);
                thread::Builder::new()
                    .name("teleproxy-async".to_owned())
                    .spawn(move || {
                        let response = match call.run(&pool) {
                            Ok(value) => {
                                *lock(&result) = value;
                                ReturnInfo::null()
                            }
                            Err(failure) => ReturnInfo::Exception(failure.into_exception_info()),
                        };
                        match serde_json::to_value(&response) {
                            Ok(response) => *lock(&result_slot) = response,
                            Err(err) => tracing::warn!("unable to deposit async response: {err}"),
                        }
                    })
                    .map_err(|err| Failure::Raised {
                        source: format!("{protocol_type:?}"),
                        error: err.into(),
                    })?;

                Ok(Payload::Var(address))
            }
        }
    }
}

/// Reference executor running requests in the current process.
///
/// Clones share the same variable pool and types.
#[derive(Clone)]
pub struct LocalExecutor {
    pool: Arc<Pool>,
}

impl LocalExecutor {
    /// Creates an executor with an empty variable pool and no registered type.
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Pool {
                identity: Identity::unique(),
                slots: Mutex::new(Slots::default()),
                types: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Identity of the variable pool.
    pub fn identity(&self) -> Identity {
        self.pool.identity
    }

    /// Registers `type_def`, replacing any type with the same full name.
    pub fn register_type(&self, type_def: TypeDef) {
        self.pool
            .types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_def.full_name.clone(), Arc::new(type_def));
    }

    /// Number of live variables.
    pub fn variable_count(&self) -> usize {
        self.pool.slots().entries.len()
    }

    /// Drops every variable.
    pub fn clear(&self) {
        self.pool.slots().entries.clear();
    }

    /// Connector sharing the variable pool of this executor.
    pub fn connector(&self) -> LocalConnector {
        LocalConnector {
            executor: self.clone(),
        }
    }

    /// New connection to this executor.
    pub fn app(&self) -> AppFriend {
        AppFriend::new(self.connector())
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for LocalExecutor {
    fn execute(&self, info: ProtocolInfo) -> ReturnInfo {
        match self.pool.handle(info) {
            Ok(payload) => ReturnInfo::Return(payload),
            Err(failure) => ReturnInfo::Exception(failure.into_exception_info()),
        }
    }
}

impl fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("identity", &self.pool.identity)
            .field("variables", &self.variable_count())
            .finish_non_exhaustive()
    }
}

/// [`FriendlyConnector`] calling a [`LocalExecutor`] directly.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    executor: LocalExecutor,
}

impl FriendlyConnector for LocalConnector {
    fn identity(&self) -> Identity {
        self.executor.identity()
    }

    fn send_and_receive(&self, info: ProtocolInfo) -> Result<ReturnInfo, TransportError> {
        Ok(self.executor.execute(info))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn request(protocol_type: ProtocolType) -> ProtocolInfo {
        ProtocolInfo {
            protocol_type,
            operation_type_info: None,
            var_address: None,
            type_full_name: String::new(),
            operation: String::new(),
            arguments: Vec::new(),
        }
    }

    fn declare(executor: &LocalExecutor, value: Value) -> VarAddress {
        let info = ProtocolInfo {
            arguments: vec![Payload::Value(value)],
            ..request(ProtocolType::VarInitialize)
        };
        assert_matches!(executor.execute(info), ReturnInfo::Return(Payload::Var(address)) => address)
    }

    fn read(executor: &LocalExecutor, address: VarAddress) -> Value {
        let info = ProtocolInfo {
            var_address: Some(address),
            ..request(ProtocolType::GetValue)
        };
        assert_matches!(executor.execute(info), ReturnInfo::Return(Payload::Value(value)) => value)
    }

    fn exception(response: ReturnInfo) -> ExceptionInfo {
        assert_matches!(response, ReturnInfo::Exception(info) => info)
    }

    #[test]
    fn test_release() {
        let executor = LocalExecutor::new();
        let address = declare(&executor, json!(1));
        assert_eq!(executor.variable_count(), 1);

        let bin_off = ProtocolInfo {
            var_address: Some(address),
            ..request(ProtocolType::BinOff)
        };
        assert_eq!(executor.execute(bin_off.clone()), ReturnInfo::null());
        assert_eq!(executor.variable_count(), 0);

        let info = exception(executor.execute(bin_off));
        assert!(info.is_information());
        assert_eq!(info.message, format!("variable {} not found", address.core()));
    }

    #[test]
    fn test_dropped_var_is_released() {
        let executor = LocalExecutor::new();
        let app = executor.app();
        let var = app.declare_value(&"x").unwrap();
        let copy = app.declare(&var).unwrap();
        assert_eq!(executor.variable_count(), 2);
        drop(var);
        assert_eq!(executor.variable_count(), 1);
        assert_eq!(copy.value::<String>().unwrap(), "x");
    }

    #[test]
    fn test_declaration_takes_one_argument() {
        let executor = LocalExecutor::new();
        let info = ProtocolInfo {
            arguments: vec![Payload::Value(json!(1)), Payload::Value(json!(2))],
            ..request(ProtocolType::VarInitialize)
        };
        assert_eq!(
            exception(executor.execute(info)).message,
            "expected at most one argument"
        );
    }

    #[test]
    fn test_is_empty_var() {
        let executor = LocalExecutor::new();
        let address = declare(&executor, Value::Null);
        let info = ProtocolInfo {
            var_address: Some(address),
            ..request(ProtocolType::IsEmptyVar)
        };
        assert_eq!(executor.execute(info), ReturnInfo::value(true));
    }

    #[test]
    fn test_builtins() {
        let executor = LocalExecutor::new();
        let app = executor.app();
        let text = app.declare_value(&"héllo").unwrap();
        assert_eq!(text.get(LENGTH).unwrap().value::<usize>().unwrap(), 5);
        assert_eq!(text.to_remote_string().unwrap(), "héllo");

        let number = app.declare_value(&12).unwrap();
        assert_eq!(number.to_remote_string().unwrap(), "12");
        assert_matches!(number.get(COUNT), Err(crate::error::Error::Remote(_)));

        let list = app.declare_value(&[1, 2, 3]).unwrap();
        assert_eq!(list.get(COUNT).unwrap().value::<usize>().unwrap(), 3);
    }

    #[test]
    fn test_overload_selection_checks_arity() {
        let executor = LocalExecutor::new();
        executor.register_type(
            TypeDef::new("Demo.Math").static_operation("Abs", |args| match args {
                [Value::Number(n)] => Ok(json!(n.as_i64().unwrap_or_default().abs())),
                _ => Err("expected one number".into()),
            }),
        );
        let app = executor.app();

        let info = OperationTypeInfo::new("Demo.Math", ["System.Int64"]).unwrap();
        let abs = app
            .static_operation("Demo.Math.Abs")
            .unwrap()
            .with_type_info(info.clone())
            .call(&crate::args![-3])
            .unwrap();
        assert_eq!(abs.value::<i64>().unwrap(), 3);

        let err = app
            .static_operation("Demo.Math.Abs")
            .unwrap()
            .call(&crate::args![&info, -3, 4])
            .unwrap_err();
        assert_matches!(
            err,
            crate::error::Error::Remote(exception)
                if exception.message() == "`Demo.Math.Abs` takes 1 arguments, 2 given"
        );
    }

    #[test]
    fn test_information_error_from_operation() {
        let executor = LocalExecutor::new();
        executor.register_type(
            TypeDef::new("Demo.Busy")
                .static_operation("Try", |_| Err(InformationError::new("busy, retry later").into())),
        );
        let info = ProtocolInfo {
            type_full_name: "Demo.Busy".to_owned(),
            operation: "Try".to_owned(),
            ..request(ProtocolType::Operation)
        };
        let info = exception(executor.execute(info));
        assert_eq!(info, ExceptionInfo::information("busy, retry later"));
    }

    #[test]
    fn test_async_response_is_deposited() {
        let executor = LocalExecutor::new();
        executor.register_type(
            TypeDef::new("Demo.Slow").static_operation("Nap", |_| {
                std::thread::sleep(Duration::from_millis(5));
                Ok(json!("rested"))
            }),
        );
        let slot = assert_matches!(
            executor.execute(request(ProtocolType::AsyncResultVarInitialize)),
            ReturnInfo::Return(Payload::Var(address)) => address
        );
        let info = ProtocolInfo {
            type_full_name: "Demo.Slow".to_owned(),
            operation: "Nap".to_owned(),
            arguments: vec![Payload::Var(slot)],
            ..request(ProtocolType::AsyncOperation)
        };
        let result = assert_matches!(
            executor.execute(info),
            ReturnInfo::Return(Payload::Var(address)) => address
        );

        while read(&executor, slot).is_null() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let response: ReturnInfo = serde_json::from_value(read(&executor, slot)).unwrap();
        assert_eq!(response, ReturnInfo::null());
        assert_eq!(read(&executor, result), json!("rested"));
    }

    #[test]
    fn test_async_requires_result_slot() {
        let executor = LocalExecutor::new();
        let info = ProtocolInfo {
            type_full_name: "Demo.Slow".to_owned(),
            operation: "Nap".to_owned(),
            ..request(ProtocolType::AsyncOperation)
        };
        assert_eq!(
            exception(executor.execute(info)).message,
            "the result slot is missing"
        );
    }

    #[test]
    fn test_index_arity() {
        assert_eq!(index_arity("[]"), Some(1));
        assert_eq!(index_arity("[,,]"), Some(3));
        assert_eq!(index_arity("[x]"), None);
        assert_eq!(index_arity("Length"), None);
    }

    #[test]
    fn test_clear() {
        let executor = LocalExecutor::new();
        declare(&executor, json!(1));
        declare(&executor, json!(2));
        executor.clear();
        assert_eq!(executor.variable_count(), 0);
    }
}
