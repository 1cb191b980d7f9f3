//! Banked two-level memory mapping core for multi-CPU emulation.
//!
//! A [`MemorySystem`] owns every backing store, element map and handler
//! table of one machine. CPU cores call its dispatch entry points on every
//! access; drivers describe the machine with [`MachineConfig`] and rebind
//! banks at runtime.

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
#[cfg(test)]
use tempfile as _;

/// Error taxonomy for setup and runtime configuration calls.
pub mod error;
pub use error::{MemoryError, Result, MAX_CPU};

/// Address-bus geometry and the standard presets.
pub mod bus;
pub use bus::{
    Alignment, BusConfig, DataWidth, Endian, UnmappedPolicy, BUS_16, BUS_16_BEW, BUS_16_LEW, BUS_20,
    BUS_21, BUS_24, BUS_29, BUS_32, SPARSE_BUS_BITS, SUB_BLOCK_BITS,
};

/// Backing-store registry and external memory planning.
pub mod store;
pub use store::{
    plan_external_blocks, swap_word_lanes, BackingStore, ExternalExtent, MemoryPointer, StoreId,
    StoreKind, StoreRegistry,
};

/// Handler ids, range kinds and device callbacks.
pub mod handler;
pub use handler::{
    check_bank, combine_word, read_callback, read_device, write_callback, write_device, Direction,
    HandlerId, ReadCallback, ReadHandler, ReadKind, SlotUsage, WriteCallback, WriteHandler,
    WriteKind, BANK_MAX, HARD_MAX,
};

/// Two-level element maps and their shared block arena.
pub mod element;
pub use element::{ElementArena, ElementMap, ELE_MAX, SUB_BLOCK_CELLS};

/// Declarative machine description.
pub mod machine;
pub use machine::{CpuConfig, MachineConfig, ReadRange, WriteRange};

/// The memory system and per-CPU context switching.
pub mod system;
pub use system::{LabeledRange, MemorySystem};

/// Range installation and bank rebinding.
pub mod install;
pub use install::FunctionCallback;

/// Byte, word and dword dispatch for the active CPU.
mod dispatch;

/// Opcode fetch windows and the opcode base.
pub mod opcode;
pub use opcode::{OpbaseAction, OpbaseOverride, OpcodeBaseOutcome, OpcodeWindow};

/// I/O port tables.
pub mod port;
pub use port::{PortEntry, PortReadKind, PortTable, PortWriteKind};

/// Memory-map listing.
pub mod dump;
pub use dump::{CpuMap, MapSpan, MemoryMapDump};
