//! Dispatch: the mediator (single-handler command/query routing) and the
//! event bus (multi-handler pub/sub), plus the terminal pipeline step
//! that invokes them.

pub mod dispatcher;
pub mod handler;
pub mod registry;

pub use dispatcher::{DispatchProcessor, Dispatcher, EventDispatchMode};
pub use handler::{FnHandler, MessageHandler};
pub use registry::HandlerRegistry;
