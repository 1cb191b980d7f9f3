//! Driver-declared machine description consumed by [`crate::MemorySystem::new`].

use crate::bus::BusConfig;
use crate::error::{MemoryError, Result, MAX_CPU};
use crate::handler::{ReadKind, WriteKind};
use crate::port::{PortEntry, PortReadKind, PortWriteKind};

/// A declared memory read range.
#[derive(Debug, Clone)]
pub struct ReadRange {
    /// First address.
    pub start: u32,
    /// Last address.
    pub end: u32,
    /// Backing of the range.
    pub kind: ReadKind,
}

/// A declared memory write range.
#[derive(Debug, Clone)]
pub struct WriteRange {
    /// First address.
    pub start: u32,
    /// Last address.
    pub end: u32,
    /// Backing of the range.
    pub kind: WriteKind,
    /// Name under which the resolved base and size are published.
    pub label: Option<String>,
}

/// Everything one CPU contributes to the memory system.
///
/// Ranges keep declaration order; when they overlap, the earlier
/// declaration wins.
#[derive(Debug, Clone)]
pub struct CpuConfig {
    /// Bus geometry of the CPU.
    pub bus: BusConfig,
    /// Region image backing RAM and ROM ranges.
    pub region: Vec<u8>,
    /// Memory read ranges.
    pub reads: Vec<ReadRange>,
    /// Memory write ranges.
    pub writes: Vec<WriteRange>,
    /// Port read ranges.
    pub port_reads: Vec<PortEntry<PortReadKind>>,
    /// Port write ranges.
    pub port_writes: Vec<PortEntry<PortWriteKind>>,
}

impl CpuConfig {
    /// Starts a CPU with no ranges.
    #[must_use]
    pub const fn new(bus: BusConfig, region: Vec<u8>) -> Self {
        Self {
            bus,
            region,
            reads: Vec::new(),
            writes: Vec::new(),
            port_reads: Vec::new(),
            port_writes: Vec::new(),
        }
    }

    /// Declares a memory read range.
    #[must_use]
    pub fn read(mut self, start: u32, end: u32, kind: ReadKind) -> Self {
        self.reads.push(ReadRange { start, end, kind });
        self
    }

    /// Declares a memory write range.
    #[must_use]
    pub fn write(mut self, start: u32, end: u32, kind: WriteKind) -> Self {
        self.writes.push(WriteRange {
            start,
            end,
            kind,
            label: None,
        });
        self
    }

    /// Declares a memory write range whose base is published as `label`.
    #[must_use]
    pub fn labeled_write(
        mut self,
        start: u32,
        end: u32,
        kind: WriteKind,
        label: impl Into<String>,
    ) -> Self {
        self.writes.push(WriteRange {
            start,
            end,
            kind,
            label: Some(label.into()),
        });
        self
    }

    /// Declares a port read range.
    #[must_use]
    pub fn port_read(mut self, start: u32, end: u32, kind: PortReadKind) -> Self {
        self.port_reads.push(PortEntry { start, end, kind });
        self
    }

    /// Declares a port write range.
    #[must_use]
    pub fn port_write(mut self, start: u32, end: u32, kind: PortWriteKind) -> Self {
        self.port_writes.push(PortEntry { start, end, kind });
        self
    }

    /// Every declared memory range as inclusive `(start, end)` pairs.
    #[must_use]
    pub fn memory_extents(&self) -> Vec<(u32, u32)> {
        self.reads
            .iter()
            .map(|range| (range.start, range.end))
            .chain(self.writes.iter().map(|range| (range.start, range.end)))
            .collect()
    }
}

/// All CPUs of a machine, in CPU index order.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    /// Per-CPU declarations.
    pub cpus: Vec<CpuConfig>,
}

impl MachineConfig {
    /// Starts an empty machine.
    #[must_use]
    pub const fn new() -> Self {
        Self { cpus: Vec::new() }
    }

    /// Appends the next CPU.
    #[must_use]
    pub fn cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpus.push(cpu);
        self
    }

    /// Checks CPU count and bus geometry.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NoCpus`], [`MemoryError::TooManyCpus`] or the
    /// first [`MemoryError::InvalidGeometry`].
    pub fn validate(&self) -> Result<()> {
        if self.cpus.is_empty() {
            return Err(MemoryError::NoCpus);
        }
        if self.cpus.len() > MAX_CPU {
            return Err(MemoryError::TooManyCpus {
                count: self.cpus.len(),
                max: MAX_CPU,
            });
        }
        self.cpus
            .iter()
            .enumerate()
            .try_for_each(|(index, cpu)| cpu.bus.validate(index))
    }
}
