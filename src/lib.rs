//! Teleproxy lets a controller create, inspect, mutate and invoke operations on objects living in
//! another, already running, process.
//!
//! The controller never sees those objects: it holds [`AppVar`]s, handles to variables of the
//! target process, and every operation on them becomes a request sent to an executor running in
//! the target process.
//!
//! ## Connection
//!
//! An [`AppFriend`] is the connection to one target process. It declares variables (by copy or by
//! construction), reaches static operations by name, and carries extension state shared by every
//! user of the connection.
//!
//! ## Operations
//!
//! [`AppVar::operation`] and [`AppFriend::static_operation`] return a [`FriendlyOperation`], ready
//! to be called with a list of [`Arg`]s (see the [`args!`] macro). An [`OperationTypeInfo`] selects
//! an overload explicitly, an [`Async`] token makes the call return before it completes.
//!
//! ## Boundary
//!
//! The controller only needs a [`FriendlyConnector`]. The [`operate`] module provides the other
//! side: an in-process [`LocalExecutor`](operate::local::LocalExecutor) and a framed JSON
//! transport over byte streams.
//!
//! ## Example
//!
//! See the demos in the Git repository.
//!
//! * The server demo serves a local executor over TCP, with a couple of registered types.
//! * The client demo connects, declares and constructs variables, and calls operations
//!   synchronously and asynchronously.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod app_friend;
pub mod app_var;
pub mod asynchronous;
pub mod dynamic;
pub mod error;
pub mod operate;
pub mod operation;
pub mod protocol;

pub use app_friend::{AppFriend, NewInfo};
pub use app_var::{AppVar, AppVarOwner, ExplicitAppVar};
pub use asynchronous::Async;
pub use dynamic::{AppType, DynamicAppVar};
pub use error::{Error, FriendlyOperationException, Result, TransportError};
pub use operation::{Arg, FriendlyOperation, OperationTypeInfo};
pub use protocol::FriendlyConnector;
