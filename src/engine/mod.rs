//! Scheduler loop actor: command messages, the clone-able handle, and the
//! engine task itself.

pub mod core;
pub mod handle;
pub mod messages;

pub use self::core::Engine;
pub use handle::EngineHandle;
pub use messages::{EngineCommand, EngineError};
