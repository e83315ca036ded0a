//! Local and remote dispatch engines.
//!
//! Both services share the same per-connection model: a read task feeds a
//! bounded queue, a single dispatch task drains it in arrival order, and a
//! handler fault is contained at the invocation boundary.

use std::any::Any;

pub use handler_service::HandlerService;
pub use registry::{
    HandlerRegistry, LocalHandler, RemoteRegistry, SysHandler, UserHandler,
};
pub use remote_service::RemoteService;

mod handler_service;
mod registry;
mod remote_service;

/// Renders a recovered panic payload for the log, covering the common
/// `&str` and `String` panics.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
