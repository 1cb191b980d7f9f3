//! Setup and runtime error taxonomy for the memory core.

use thiserror::Error;

use crate::handler::Direction;

/// Maximum number of CPUs one [`crate::MemorySystem`] can map.
pub const MAX_CPU: usize = 8;

/// Failures reported by machine setup and runtime install operations.
///
/// Access-time anomalies (unmapped reads, ROM writes) never surface here; they
/// degrade to the configured policy and are logged instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The machine declared no CPUs.
    #[error("machine declares no cpus")]
    NoCpus,
    /// The machine declared more CPUs than the core supports.
    #[error("machine declares {count} cpus, at most {max} are supported")]
    TooManyCpus {
        /// Declared CPU count.
        count: usize,
        /// Supported maximum.
        max: usize,
    },
    /// A bus description cannot be decoded by the element map.
    #[error("cpu #{cpu}: invalid bus geometry: {reason}")]
    InvalidGeometry {
        /// CPU whose bus is invalid.
        cpu: usize,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// Every handler id below the hard maximum is taken.
    #[error("{direction} memory hardware pattern over: all {capacity} handler slots are in use")]
    HandlerSlotsExhausted {
        /// Table that ran out of slots.
        direction: Direction,
        /// Total slot capacity of that table.
        capacity: usize,
    },
    /// The sub-table arena cannot hold another block.
    #[error("{direction} memory element size over: arena holds {capacity} blocks")]
    ElementArenaExhausted {
        /// Map family that ran out of blocks.
        direction: Direction,
        /// Arena capacity in blocks.
        capacity: usize,
    },
    /// An external memory block could not be allocated.
    #[error("cpu #{cpu}: cannot allocate external memory {start:08x}-{end:08x}")]
    ExternalAllocation {
        /// Owning CPU.
        cpu: usize,
        /// First address of the block.
        start: u32,
        /// Last address of the block.
        end: u32,
    },
    /// Bank numbers run from 1 to 16.
    #[error("bank {0} is outside 1..=16")]
    InvalidBank(u8),
    /// The CPU index is not part of the machine.
    #[error("cpu #{0} is not part of this machine")]
    InvalidCpu(usize),
    /// The store id does not name a registered backing store.
    #[error("store {0} is not registered")]
    UnknownStore(usize),
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, MemoryError>;
