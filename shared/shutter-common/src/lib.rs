//! Shutter Common Library
//!
//! Frame, format and session types shared by the capture core, its device
//! backends and the command-line driver.

pub mod types;

pub use types::*;
