//! Ordered I/O port tables, independent of the element maps.

use std::fmt;

use log::warn;

use crate::error::{MemoryError, Result};
use crate::handler::{ReadCallback, WriteCallback};
use crate::system::MemorySystem;

/// What a port read range is backed by.
#[derive(Clone)]
pub enum PortReadKind {
    /// Reads return zero.
    Nop,
    /// A device callback.
    Handler(ReadCallback),
}

/// What a port write range is backed by.
#[derive(Clone)]
pub enum PortWriteKind {
    /// Writes are dropped.
    Nop,
    /// A device callback.
    Handler(WriteCallback),
}

impl fmt::Debug for PortReadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => f.write_str("Nop"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

impl fmt::Debug for PortWriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => f.write_str("Nop"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// One inclusive port range.
#[derive(Debug, Clone)]
pub struct PortEntry<K> {
    /// First port.
    pub start: u32,
    /// Last port.
    pub end: u32,
    /// Backing of the range.
    pub kind: K,
}

impl<K> PortEntry<K> {
    /// Returns `true` when `port` is inside the range.
    #[must_use]
    pub const fn contains(&self, port: u32) -> bool {
        self.start <= port && port <= self.end
    }
}

/// Port ranges searched front to back; the first match wins.
#[derive(Debug, Clone)]
pub struct PortTable<K> {
    entries: Vec<PortEntry<K>>,
}

impl<K> Default for PortTable<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K> PortTable<K> {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds a range, ahead of every existing one when `at_front` is set.
    pub fn install(&mut self, entry: PortEntry<K>, at_front: bool) {
        if at_front {
            self.entries.insert(0, entry);
        } else {
            self.entries.push(entry);
        }
    }

    /// First range containing `port`.
    #[must_use]
    pub fn find(&self, port: u32) -> Option<&PortEntry<K>> {
        self.entries.iter().find(|entry| entry.contains(port))
    }

    /// Ranges in search order.
    #[must_use]
    pub fn entries(&self) -> &[PortEntry<K>] {
        &self.entries
    }
}

impl MemorySystem {
    /// Reads `port` of the active CPU.
    ///
    /// The port number is masked to the CPU's port width. Unmatched ports
    /// read zero and are logged.
    pub fn read_port(&mut self, port: u32) -> u32 {
        let cpu = self.active.cpu;
        let port = port & self.active.port_mask;
        let kind = self
            .cpus
            .get(cpu)
            .and_then(|memory| memory.port_reads.find(port))
            .map(|entry| (entry.start, entry.kind.clone()));
        match kind {
            Some((_, PortReadKind::Nop)) => 0,
            Some((start, PortReadKind::Handler(callback))) => {
                let Ok(mut handler) = callback.try_borrow_mut() else {
                    warn!("cpu #{cpu}: port {port:04x} handler re-entered, reading 0");
                    return 0;
                };
                handler.read(port - start)
            }
            None => {
                warn!(
                    "cpu #{cpu} pc {:08x}: warning - read unmapped I/O port {port:02x}",
                    self.active.opcode.last_pc
                );
                0
            }
        }
    }

    /// Writes `value` to `port` of the active CPU.
    pub fn write_port(&mut self, port: u32, value: u32) {
        let cpu = self.active.cpu;
        let port = port & self.active.port_mask;
        let kind = self
            .cpus
            .get(cpu)
            .and_then(|memory| memory.port_writes.find(port))
            .map(|entry| (entry.start, entry.kind.clone()));
        match kind {
            Some((_, PortWriteKind::Nop)) => {}
            Some((start, PortWriteKind::Handler(callback))) => {
                let Ok(mut handler) = callback.try_borrow_mut() else {
                    warn!("cpu #{cpu}: port {port:04x} handler re-entered, write dropped");
                    return;
                };
                handler.write(port - start, value);
            }
            None => warn!(
                "cpu #{cpu} pc {:08x}: warning - write {value:02x} to unmapped I/O port {port:02x}",
                self.active.opcode.last_pc
            ),
        }
    }

    /// Adds a port read range to `cpu`.
    ///
    /// With `at_front` the range shadows every existing range it overlaps.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn install_port_read_handler(
        &mut self,
        cpu: usize,
        start: u32,
        end: u32,
        kind: PortReadKind,
        at_front: bool,
    ) -> Result<()> {
        let memory = self.cpus.get_mut(cpu).ok_or(MemoryError::InvalidCpu(cpu))?;
        memory
            .port_reads
            .install(PortEntry { start, end, kind }, at_front);
        Ok(())
    }

    /// Adds a port write range to `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn install_port_write_handler(
        &mut self,
        cpu: usize,
        start: u32,
        end: u32,
        kind: PortWriteKind,
        at_front: bool,
    ) -> Result<()> {
        let memory = self.cpus.get_mut(cpu).ok_or(MemoryError::InvalidCpu(cpu))?;
        memory
            .port_writes
            .install(PortEntry { start, end, kind }, at_front);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{PortEntry, PortTable};

    #[test]
    fn first_match_wins_and_front_insert_shadows() {
        let mut table = PortTable::new();
        table.install(
            PortEntry {
                start: 0x00,
                end: 0x0f,
                kind: 'a',
            },
            false,
        );
        table.install(
            PortEntry {
                start: 0x08,
                end: 0x1f,
                kind: 'b',
            },
            false,
        );
        assert_eq!(table.find(0x09).map(|entry| entry.kind), Some('a'));
        assert_eq!(table.find(0x10).map(|entry| entry.kind), Some('b'));
        assert!(table.find(0x20).is_none());

        table.install(
            PortEntry {
                start: 0x04,
                end: 0x05,
                kind: 'c',
            },
            true,
        );
        assert_eq!(table.find(0x05).map(|entry| entry.kind), Some('c'));
        assert_eq!(table.entries().len(), 3);
    }
}
