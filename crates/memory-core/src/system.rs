//! The memory system: every store, map and handler table of one machine.

use std::cell::RefCell;

use log::debug;

use crate::bus::BusConfig;
use crate::element::{ElementArena, ElementMap, ELE_MAX};
use crate::error::{MemoryError, Result};
use crate::handler::{
    Direction, HandlerTable, ReadHandler, SlotUsage, WriteHandler, BANK_MAX, HARD_MAX,
};
use crate::machine::MachineConfig;
use crate::opcode::{OpbaseOverride, OpcodeState};
use crate::port::{PortReadKind, PortTable, PortWriteKind};
use crate::store::{MemoryPointer, StoreId, StoreRegistry};

/// Base and byte size published for a labeled write range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LabeledRange {
    /// Resolved backing location of the range start.
    pub base: MemoryPointer,
    /// Range length in bytes.
    pub size: u32,
}

/// Per-CPU tables.
pub(crate) struct CpuMemory {
    pub(crate) bus: BusConfig,
    pub(crate) region: StoreId,
    pub(crate) opcode_rom: StoreId,
    pub(crate) read_map: ElementMap,
    pub(crate) write_map: ElementMap,
    pub(crate) port_reads: PortTable<PortReadKind>,
    pub(crate) port_writes: PortTable<PortWriteKind>,
    pub(crate) opbase_override: Option<OpbaseOverride>,
    pub(crate) labels: Vec<(String, LabeledRange)>,
}

/// State cached for the CPU currently executing.
pub(crate) struct ActiveContext {
    pub(crate) cpu: usize,
    pub(crate) bus: BusConfig,
    pub(crate) port_mask: u32,
    pub(crate) opcode: OpcodeState,
}

/// Address decoding and dispatch for every CPU of one machine.
///
/// Dispatch entry points act on the active CPU chosen with
/// [`MemorySystem::switch_context`]. Handler tables, element arenas and bank
/// pointers are shared by all CPUs, as bank numbers are machine-wide.
pub struct MemorySystem {
    pub(crate) stores: StoreRegistry,
    pub(crate) cpus: Vec<CpuMemory>,
    pub(crate) read_handlers: HandlerTable<RefCell<dyn ReadHandler>>,
    pub(crate) write_handlers: HandlerTable<RefCell<dyn WriteHandler>>,
    pub(crate) read_arena: ElementArena,
    pub(crate) write_arena: ElementArena,
    pub(crate) banks: [Option<MemoryPointer>; BANK_MAX as usize + 1],
    pub(crate) active: ActiveContext,
}

impl MemorySystem {
    /// Builds every map of `machine` and activates CPU 0.
    ///
    /// External memory is allocated first. Each CPU's read ranges and then
    /// its write ranges are installed from the last declared to the first, so
    /// earlier declarations win where ranges overlap. Port ranges keep
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns the first setup failure: invalid machine shape or geometry,
    /// external allocation failure, an invalid bank number, handler slot or
    /// element arena exhaustion.
    pub fn new(machine: MachineConfig) -> Result<Self> {
        machine.validate()?;

        let mut stores = StoreRegistry::new();
        let mut declared = Vec::with_capacity(machine.cpus.len());
        for mut cpu in machine.cpus {
            let region = stores.add_region(std::mem::take(&mut cpu.region));
            declared.push((region, cpu));
        }
        for (index, (_, cpu)) in declared.iter().enumerate() {
            let extents = cpu.memory_extents();
            stores.allocate_external_memory(index, &extents)?;
        }

        let mut cpus = Vec::with_capacity(declared.len());
        for (region, cpu) in &declared {
            let mut port_reads = PortTable::new();
            for entry in &cpu.port_reads {
                port_reads.install(entry.clone(), false);
            }
            let mut port_writes = PortTable::new();
            for entry in &cpu.port_writes {
                port_writes.install(entry.clone(), false);
            }
            cpus.push(CpuMemory {
                bus: cpu.bus,
                region: *region,
                opcode_rom: *region,
                read_map: ElementMap::new(&cpu.bus),
                write_map: ElementMap::new(&cpu.bus),
                port_reads,
                port_writes,
                opbase_override: None,
                labels: Vec::new(),
            });
        }

        let Some(head) = cpus.first() else {
            return Err(MemoryError::NoCpus);
        };
        let (first, first_region) = (head.bus, head.region);
        let mut system = Self {
            stores,
            cpus,
            read_handlers: HandlerTable::new(Direction::Read),
            write_handlers: HandlerTable::new(Direction::Write),
            read_arena: ElementArena::new(Direction::Read),
            write_arena: ElementArena::new(Direction::Write),
            banks: [None; BANK_MAX as usize + 1],
            active: ActiveContext {
                cpu: 0,
                bus: first,
                port_mask: first.port_mask(),
                opcode: OpcodeState::new(first_region),
            },
        };

        for (index, (_, cpu)) in declared.iter().enumerate() {
            for range in cpu.reads.iter().rev() {
                system.map_read(index, range.start, range.end, &range.kind)?;
            }
            for range in cpu.writes.iter().rev() {
                system.map_write(index, range.start, range.end, &range.kind)?;
            }
            for range in &cpu.writes {
                if let Some(label) = &range.label {
                    let base = system.stores.find_base(index, range.start)?;
                    let size = range.end.wrapping_sub(range.start).wrapping_add(1);
                    system.cpus[index]
                        .labels
                        .push((label.clone(), LabeledRange { base, size }));
                }
            }
        }

        system.log_usage();
        system.switch_context(0)?;
        Ok(system)
    }

    /// Makes `cpu` the target of every dispatch entry point.
    ///
    /// The read map, write map, port tables, port mask, opcode override and
    /// opcode windows are replaced together; the opcode base restarts at the
    /// CPU region.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn switch_context(&mut self, cpu: usize) -> Result<()> {
        let memory = self.cpus.get(cpu).ok_or(MemoryError::InvalidCpu(cpu))?;
        self.banks[0] = Some(MemoryPointer::new(memory.region, 0));
        self.active = ActiveContext {
            cpu,
            bus: memory.bus,
            port_mask: memory.bus.port_mask(),
            opcode: OpcodeState::with_rom(memory.region, memory.opcode_rom),
        };
        Ok(())
    }

    /// CPU the dispatch entry points act on.
    #[must_use]
    pub const fn active_cpu(&self) -> usize {
        self.active.cpu
    }

    /// Number of CPUs in the machine.
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Bus description of `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn bus(&self, cpu: usize) -> Result<BusConfig> {
        self.cpu(cpu).map(|memory| memory.bus)
    }

    pub(crate) fn cpu(&self, cpu: usize) -> Result<&CpuMemory> {
        self.cpus.get(cpu).ok_or(MemoryError::InvalidCpu(cpu))
    }

    /// Every backing store of the machine.
    #[must_use]
    pub const fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// Mutable access to every backing store, e.g. to load or inspect RAM.
    pub fn stores_mut(&mut self) -> &mut StoreRegistry {
        &mut self.stores
    }

    /// Registers a buffer that banks can later point into.
    pub fn add_store(&mut self, data: Vec<u8>) -> StoreId {
        self.stores.add_store(data)
    }

    /// Region store of `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn region(&self, cpu: usize) -> Result<StoreId> {
        self.stores.region(cpu)
    }

    /// Backing location of `address` on `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn find_base(&self, cpu: usize, address: u32) -> Result<MemoryPointer> {
        self.stores.find_base(cpu, address)
    }

    /// Base and size published for the write range labeled `label` on `cpu`.
    #[must_use]
    pub fn labeled_range(&self, cpu: usize, label: &str) -> Option<LabeledRange> {
        let labels = &self.cpus.get(cpu)?.labels;
        labels
            .iter()
            .find_map(|(name, range)| (name == label).then_some(*range))
    }

    /// Current pointer of bank `bank`, or of the active region for bank 0.
    #[must_use]
    pub fn bank_pointer(&self, bank: u8) -> Option<MemoryPointer> {
        self.banks.get(usize::from(bank)).copied().flatten()
    }

    /// Occupancy of one direction's handler table and element arena.
    #[must_use]
    pub fn usage(&self, direction: Direction) -> SlotUsage {
        let (elements_used, handlers_used) = match direction {
            Direction::Read => (
                self.read_arena.blocks_used(),
                self.read_handlers.handlers_used(),
            ),
            Direction::Write => (
                self.write_arena.blocks_used(),
                self.write_handlers.handlers_used(),
            ),
        };
        SlotUsage {
            elements_used,
            elements_max: ELE_MAX,
            handlers_used,
            handlers_max: HARD_MAX,
        }
    }

    pub(crate) fn log_usage(&self) {
        for direction in [Direction::Read, Direction::Write] {
            let usage = self.usage(direction);
            debug!(
                "used {direction:<5} elements {}/{}, functions {}/{}",
                usage.elements_used, usage.elements_max, usage.handlers_used, usage.handlers_max
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemorySystem;
    use crate::bus::{BUS_16, BUS_24};
    use crate::handler::{Direction, HandlerId, ReadKind, WriteKind};
    use crate::machine::{CpuConfig, MachineConfig};
    use crate::MemoryError;

    fn machine() -> MachineConfig {
        MachineConfig::new()
            .cpu(
                CpuConfig::new(BUS_16, vec![0x11; 0x1_0000])
                    .read(0x0000, 0x7fff, ReadKind::Rom)
                    .read(0x8000, 0xffff, ReadKind::Ram)
                    .write(0x8000, 0x87ff, WriteKind::Ram)
                    .labeled_write(0x9000, 0x93ff, WriteKind::Ram, "videoram"),
            )
            .cpu(
                CpuConfig::new(BUS_24, vec![0x22; 0x1_0000])
                    .read(0x00_0000, 0x00_ffff, ReadKind::Rom)
                    .read(0xff_0000, 0xff_ffff, ReadKind::Bank(1))
                    .write(0xff_0000, 0xff_ffff, WriteKind::Bank(1)),
            )
    }

    #[test]
    fn setup_builds_every_cpu() {
        let system = MemorySystem::new(machine()).expect("setup");
        assert_eq!(system.cpu_count(), 2);
        assert_eq!(system.active_cpu(), 0);
        assert_eq!(
            system.resolve(0, Direction::Read, 0x1234),
            Ok(HandlerId::RAM)
        );
        assert_eq!(
            system.resolve(0, Direction::Write, 0x1234),
            Ok(HandlerId::UNMAPPED)
        );
        assert_eq!(
            system.resolve(1, Direction::Read, 0xff_1234),
            Ok(HandlerId::bank(1).expect("bank"))
        );
    }

    #[test]
    fn banks_declared_past_the_region_use_external_memory() {
        let system = MemorySystem::new(machine()).expect("setup");
        let pointer = system.bank_pointer(1).expect("bank 1");
        assert!(system.stores().is_external(pointer));
        assert_eq!(pointer.offset, 0);
        assert_eq!(
            system.stores().store(pointer.store).expect("store").len(),
            0x1_0000
        );
    }

    #[test]
    fn labeled_ranges_publish_base_and_size() {
        let system = MemorySystem::new(machine()).expect("setup");
        let range = system.labeled_range(0, "videoram").expect("label");
        assert_eq!(range.base.offset, 0x9000);
        assert_eq!(range.base.store, system.region(0).expect("region"));
        assert_eq!(range.size, 0x400);
        assert!(system.labeled_range(0, "spriteram").is_none());
        assert!(system.labeled_range(5, "videoram").is_none());
    }

    #[test]
    fn context_switch_rejects_unknown_cpus() {
        let mut system = MemorySystem::new(machine()).expect("setup");
        assert_eq!(system.switch_context(2), Err(MemoryError::InvalidCpu(2)));
        assert_eq!(system.active_cpu(), 0);
        system.switch_context(1).expect("switch");
        assert_eq!(system.active_cpu(), 1);
        assert_eq!(
            system.bank_pointer(0).map(|p| p.store),
            system.region(1).ok()
        );
    }

    #[test]
    fn invalid_bank_declarations_fail_setup() {
        let cpu = CpuConfig::new(BUS_16, vec![0; 0x100]).read(0x0000, 0x00ff, ReadKind::Bank(17));
        let machine = MachineConfig::new().cpu(cpu);
        assert_eq!(
            MemorySystem::new(machine).err(),
            Some(MemoryError::InvalidBank(17))
        );
    }
}
