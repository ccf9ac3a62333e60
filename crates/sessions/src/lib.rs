//! Chat-session cancellation: the per-turn token state machine and the
//! process-wide registry that tracks live tokens.

pub mod registry;
pub mod token;

pub use registry::SessionRegistry;
pub use token::{CancellationToken, TokenState};
