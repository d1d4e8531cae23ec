//! Name-based accessors layered on the operation protocol.
//!
//! Nothing here adds protocol behavior: every accessor is one [`FriendlyOperation`] call.
//!
//! [`FriendlyOperation`]: crate::operation::FriendlyOperation

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    app_friend::AppFriend,
    app_var::{AppVar, AppVarOwner},
    error::Result,
    operation::{positional_len, Arg},
};

/// Name of the indexer taking `count` indices: `[]`, `[,]`, `[,,]`...
pub fn index_operation(count: usize) -> String {
    format!("[{}]", ",".repeat(count.saturating_sub(1)))
}

/// [`AppVar`] with member and index accessors returning further `DynamicAppVar`s.
#[derive(Debug)]
pub struct DynamicAppVar {
    var: AppVar,
}

impl DynamicAppVar {
    pub fn new(var: AppVar) -> Self {
        Self { var }
    }

    pub fn into_app_var(self) -> AppVar {
        self.var
    }

    /// Property or field read.
    pub fn get(&self, name: &str) -> Result<DynamicAppVar> {
        self.var.get(name).map(Self::new)
    }

    /// Property or field write.
    pub fn set<'v>(&self, name: &str, value: impl Into<Arg<'v>>) -> Result<()> {
        self.var.set(name, value)
    }

    /// Method call.
    pub fn call(&self, name: &str, args: &[Arg<'_>]) -> Result<DynamicAppVar> {
        self.var.operation(name).call(args).map(Self::new)
    }

    /// Indexer read.
    pub fn index(&self, indices: &[Arg<'_>]) -> Result<DynamicAppVar> {
        let name = index_operation(positional_len(indices));
        self.call(&name, indices)
    }

    /// Indexer write: the indices followed by the new value.
    pub fn set_index<'v>(&self, mut indices: Vec<Arg<'v>>, value: impl Into<Arg<'v>>) -> Result<()> {
        let name = index_operation(positional_len(&indices));
        indices.push(value.into());
        self.var.operation(name).call(&indices).map(drop)
    }

    pub fn elements(&self) -> Result<Vec<DynamicAppVar>> {
        Ok(self.var.elements()?.into_iter().map(Self::new).collect())
    }

    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        self.var.value()
    }
}

impl AppVarOwner for DynamicAppVar {
    fn app_var(&self) -> &AppVar {
        &self.var
    }
}

impl From<AppVar> for DynamicAppVar {
    fn from(var: AppVar) -> Self {
        Self::new(var)
    }
}

impl<'a> From<&'a DynamicAppVar> for Arg<'a> {
    fn from(var: &'a DynamicAppVar) -> Self {
        Arg::owner(var)
    }
}

/// Type of the target process, reached by full name.
///
/// Passing an `AppType` as an argument is an error: it is a reference to a type, not a value.
#[derive(Debug, Clone)]
pub struct AppType {
    app: AppFriend,
    full_name: String,
}

impl AppType {
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Static property or field read.
    pub fn get(&self, name: &str) -> Result<DynamicAppVar> {
        self.call(name, &[])
    }

    /// Static property or field write.
    pub fn set<'v>(&self, name: &str, value: impl Into<Arg<'v>>) -> Result<()> {
        self.call(name, &[value.into()]).map(drop)
    }

    /// Static method call.
    pub fn call(&self, name: &str, args: &[Arg<'_>]) -> Result<DynamicAppVar> {
        self.app
            .static_operation_of(self.full_name.as_str(), name)
            .call(args)
            .map(DynamicAppVar::new)
    }

    /// New instance of this type.
    pub fn construct(&self, args: &[Arg<'_>]) -> Result<DynamicAppVar> {
        self.app
            .construct(&self.full_name, args)
            .map(DynamicAppVar::new)
    }

    /// Nested type or namespace member `name`.
    pub fn nested(&self, name: &str) -> AppType {
        AppType {
            app: self.app.clone(),
            full_name: format!("{}.{name}", self.full_name),
        }
    }
}

impl<'a> From<&'a AppType> for Arg<'a> {
    fn from(app_type: &'a AppType) -> Self {
        Arg::TypeRef(app_type.full_name.clone())
    }
}

impl AppFriend {
    /// Type named `full_name`; nothing is sent until it is used.
    pub fn type_of(&self, full_name: impl Into<String>) -> AppType {
        AppType {
            app: self.clone(),
            full_name: full_name.into(),
        }
    }

    /// Declares a copy of `value`.
    pub fn copy<T: Serialize + ?Sized>(&self, value: &T) -> Result<DynamicAppVar> {
        self.declare_value(value).map(DynamicAppVar::new)
    }

    /// Declares an empty variable.
    pub fn null(&self) -> Result<DynamicAppVar> {
        self.declare_null().map(DynamicAppVar::new)
    }
}
