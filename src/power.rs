//! Power state mapping.
//!
//! The hypervisor reports a VM's `EnabledState` as a numeric code and
//! accepts the same family of codes in state-change requests. This module
//! keeps one canonical table for both directions:
//!
//! | native code | reported as  | requested as |
//! |-------------|--------------|--------------|
//! | 2           | Running      | Enabled      |
//! | 3           | Halted       | Disabled     |
//! | 10          | Unrecognized | Reboot       |
//! | 11          | Unrecognized | Reset        |
//! | 32768       | Paused       | Paused       |
//! | 32769       | Suspended    | Suspended    |
//!
//! Any other reported code maps to [`PowerState::Unrecognized`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Native `EnabledState` code for a running VM.
pub const ENABLED: u16 = 2;
/// Native `EnabledState` code for a VM that is off.
pub const DISABLED: u16 = 3;
pub const REBOOT: u16 = 10;
pub const RESET: u16 = 11;
pub const PAUSED: u16 = 32768;
pub const SUSPENDED: u16 = 32769;

/// Abstract power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    /// Off and not using any resources.
    Halted,
    Running,
    /// Resources allocated but vCPUs are not running.
    Paused,
    /// State saved to disk; disks remain in use.
    Suspended,
    /// The host reported a code outside the table.
    Unrecognized,
}

impl PowerState {
    /// Map a reported native code. Never fails.
    pub fn from_native(code: u16) -> Self {
        match code {
            ENABLED => PowerState::Running,
            DISABLED => PowerState::Halted,
            PAUSED => PowerState::Paused,
            SUSPENDED => PowerState::Suspended,
            _ => PowerState::Unrecognized,
        }
    }

    /// The native code the host reports for this state.
    pub fn native_code(self) -> Option<u16> {
        match self {
            PowerState::Running => Some(ENABLED),
            PowerState::Halted => Some(DISABLED),
            PowerState::Paused => Some(PAUSED),
            PowerState::Suspended => Some(SUSPENDED),
            PowerState::Unrecognized => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::Halted => "Halted",
            PowerState::Running => "Running",
            PowerState::Paused => "Paused",
            PowerState::Suspended => "Suspended",
            PowerState::Unrecognized => "Unrecognized",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestedState {
    Enabled,
    Disabled,
    Reboot,
    Reset,
    Paused,
    Suspended,
}

impl RequestedState {
    pub const ALL: [RequestedState; 6] = [
        RequestedState::Enabled,
        RequestedState::Disabled,
        RequestedState::Reboot,
        RequestedState::Reset,
        RequestedState::Paused,
        RequestedState::Suspended,
    ];

    /// Native code submitted to the host.
    pub fn code(self) -> u16 {
        match self {
            RequestedState::Enabled => ENABLED,
            RequestedState::Disabled => DISABLED,
            RequestedState::Reboot => REBOOT,
            RequestedState::Reset => RESET,
            RequestedState::Paused => PAUSED,
            RequestedState::Suspended => SUSPENDED,
        }
    }

    /// Parse a native request code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }

    /// State the VM ends up in once the request completes.
    pub fn target(self) -> PowerState {
        match self {
            RequestedState::Enabled | RequestedState::Reboot | RequestedState::Reset => {
                PowerState::Running
            }
            RequestedState::Disabled => PowerState::Halted,
            RequestedState::Paused => PowerState::Paused,
            RequestedState::Suspended => PowerState::Suspended,
        }
    }
}

impl fmt::Display for RequestedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestedState::Enabled => "Enabled",
            RequestedState::Disabled => "Disabled",
            RequestedState::Reboot => "Reboot",
            RequestedState::Reset => "Reset",
            RequestedState::Paused => "Paused",
            RequestedState::Suspended => "Suspended",
        };
        f.write_str(s)
    }
}
