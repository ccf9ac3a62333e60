//! Shared types for all Weft crates: error taxonomy, the module/persona
//! data model, the WebSocket frame protocol, streaming primitives, and
//! server configuration.

pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod module;
pub mod state;
pub mod stream;

pub use error::{Error, Result};
