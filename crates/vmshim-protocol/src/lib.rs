//! Protocol types for orchestrator ↔ vmshim communication.
//!
//! The orchestrator names a command (for example `StartCommand`) and sends
//! its payload as a JSON object. vmshim decodes it into a [`Command`], runs
//! it against the local hypervisor and replies with an [`Answer`].
//!
//! The set of commands is closed: [`Command::decode`] rejects any name it
//! does not know instead of looking handlers up at runtime.

mod answer;
mod command;
mod vm;
mod volume;

pub use answer::{Answer, HostStatsEntry, VmStatsEntry};
pub use command::{
    CheckNetworkCommand, CheckVirtualMachineCommand, Command, CreateCommand, DecodeError,
    DestroyCommand, GetHostStatsCommand, GetVmStatsCommand, PhysicalNetworkInfo, ReadyCommand,
    RebootCommand, StartCommand, StopCommand,
};
pub use vm::{DiskSpec, DiskType, InvalidVlan, NicSpec, VmSpec, BYTES_PER_MIB};
pub use volume::{DiskCharacteristics, StoragePool, Volume};

/// Protocol version reported by `ReadyCommand`.
pub const PROTOCOL_VERSION: u32 = 1;
