//! Capture Session State

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a capture session.
///
/// `Idle → Negotiating → Previewing → Restarting → Idle`, and any state may
/// move to the terminal `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Device open, no reader.
    #[default]
    Idle,
    /// Matching a requested format and starting a reader.
    Negotiating,
    /// A reader is active and delivering frames.
    Previewing,
    /// Tearing down the active reader.
    Restarting,
    /// Session released its device. Terminal.
    Disposed,
}

impl SessionState {
    /// Whether no further transitions are possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disposed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Previewing => "previewing",
            Self::Restarting => "restarting",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}
