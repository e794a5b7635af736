//! Shared Types

pub mod format;
pub mod frame;
pub mod session;

pub use format::*;
pub use frame::*;
pub use session::*;
