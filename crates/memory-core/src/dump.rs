//! Memory-map listing for debugging.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::handler::{Direction, HandlerId};
use crate::system::MemorySystem;

/// One contiguous run of addresses backed by the same handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MapSpan {
    /// First address.
    pub start: u32,
    /// Last address.
    pub end: u32,
    /// Handler backing the run.
    pub handler: HandlerId,
    /// Offset the handler subtracts from addresses.
    pub offset: u32,
}

/// Every span of one CPU map.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CpuMap {
    /// CPU index.
    pub cpu: usize,
    /// Map direction.
    pub direction: Direction,
    /// Spans in address order.
    pub spans: Vec<MapSpan>,
}

/// Read and write maps of every CPU.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemoryMapDump {
    /// Maps ordered by CPU, reads before writes.
    pub maps: Vec<CpuMap>,
}

impl MemoryMapDump {
    /// Map of `cpu` in `direction`, if present.
    #[must_use]
    pub fn map(&self, cpu: usize, direction: Direction) -> Option<&CpuMap> {
        self.maps
            .iter()
            .find(|map| map.cpu == cpu && map.direction == direction)
    }

    /// Writes the listing to `out`.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from `out`.
    pub fn write_dump(&self, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{self}")?;
        out.flush()
    }
}

impl fmt::Display for MemoryMapDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for map in &self.maps {
            writeln!(f, "cpu {} {} memory", map.cpu, map.direction)?;
            for span in &map.spans {
                writeln!(
                    f,
                    "  {:08x}({:08x}) - {:08x} = {}",
                    span.start, span.offset, span.end, span.handler
                )?;
            }
        }
        Ok(())
    }
}

impl MemorySystem {
    /// Snapshot of every CPU's read and write map.
    #[must_use]
    pub fn memory_map(&self) -> MemoryMapDump {
        let mut maps = Vec::with_capacity(self.cpus.len() * 2);
        for (cpu, memory) in self.cpus.iter().enumerate() {
            let reads = memory
                .read_map
                .spans(&self.read_arena)
                .into_iter()
                .map(|(start, end, handler)| MapSpan {
                    start,
                    end,
                    handler,
                    offset: self.read_handlers.slot(handler).offset(),
                })
                .collect();
            maps.push(CpuMap {
                cpu,
                direction: Direction::Read,
                spans: reads,
            });

            let writes = memory
                .write_map
                .spans(&self.write_arena)
                .into_iter()
                .map(|(start, end, handler)| MapSpan {
                    start,
                    end,
                    handler,
                    offset: self.write_handlers.slot(handler).offset(),
                })
                .collect();
            maps.push(CpuMap {
                cpu,
                direction: Direction::Write,
                spans: writes,
            });
        }
        MemoryMapDump { maps }
    }

    /// Writes [`MemorySystem::memory_map`] to the file at `path`.
    ///
    /// # Errors
    ///
    /// Propagates file creation and write errors.
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.memory_map().write_dump(&mut out)
    }
}
