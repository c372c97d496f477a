// src/consent/state.rs
//! Tri-state tracking consent

use serde::{Deserialize, Serialize};
use std::fmt;

/// User consent for data collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    /// Not decided yet; data is kept aside until the user decides
    Pending,

    /// Data may be uploaded
    Granted,

    /// Data must never leave the device and is not kept
    NotGranted,
}

impl ConsentState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConsentState::Pending => 0,
            ConsentState::Granted => 1,
            ConsentState::NotGranted => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsentState::Granted,
            2 => ConsentState::NotGranted,
            _ => ConsentState::Pending,
        }
    }
}

impl Default for ConsentState {
    fn default() -> Self {
        ConsentState::Pending
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsentState::Pending => "pending",
            ConsentState::Granted => "granted",
            ConsentState::NotGranted => "not_granted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_encoding() {
        for state in [ConsentState::Pending, ConsentState::Granted, ConsentState::NotGranted] {
            assert_eq!(ConsentState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_serde_names() {
        let state: ConsentState = serde_json::from_str("\"not_granted\"").unwrap();
        assert_eq!(state, ConsentState::NotGranted);
        assert_eq!(state.to_string(), "not_granted");
    }
}
