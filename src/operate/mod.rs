//! Sub-module where the target side of the boundary is located.
//!
//! [`Executor`] is what runs requests inside the target process. [`local`] provides an in-process
//! executor, and [`stream`] carries requests and responses over byte streams such as TCP
//! connections.

use std::sync::Arc;

use crate::protocol::{ProtocolInfo, ReturnInfo};

pub mod local;
pub mod stream;

/// Executes requests inside the target process.
///
/// Failures never escape as Rust errors: they are sanitized into
/// [`ReturnInfo::Exception`](crate::protocol::ReturnInfo::Exception).
pub trait Executor: Send + Sync {
    fn execute(&self, info: ProtocolInfo) -> ReturnInfo;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, info: ProtocolInfo) -> ReturnInfo {
        (**self).execute(info)
    }
}
