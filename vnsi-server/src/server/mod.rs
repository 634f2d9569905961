//! Client-facing server: listener, per-connection sessions and the opcode handlers.

pub mod context;
pub mod handlers;
mod io;
pub mod listener;
pub mod registry;
pub mod session;
pub mod status;
pub mod writer;

pub use context::{ServerContext, SessionSettings};
pub use listener::{Server, ServerConfig};
