//! Range installation and runtime rebinding of banks and handlers.

use std::fmt;

use log::debug;

use crate::error::{MemoryError, Result};
use crate::handler::{
    check_bank, Direction, HandlerId, ReadCallback, ReadKind, Slot, WriteCallback, WriteKind,
};
use crate::store::MemoryPointer;
use crate::system::MemorySystem;

/// A callback to bind to a function slot of its direction.
#[derive(Clone)]
pub enum FunctionCallback {
    /// Bound in the read table.
    Read(ReadCallback),
    /// Bound in the write table.
    Write(WriteCallback),
}

impl FunctionCallback {
    /// Table the callback belongs to.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Read(_) => Direction::Read,
            Self::Write(_) => Direction::Write,
        }
    }
}

impl fmt::Debug for FunctionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionCallback::{:?}(..)", self.direction())
    }
}

impl MemorySystem {
    /// Handler id of a RAM-like range starting at `start`: the region when it
    /// backs the range, a direct slot into external memory otherwise.
    fn storage_id(&mut self, cpu: usize, direction: Direction, start: u32) -> Result<HandlerId> {
        let base = self.stores.find_base(cpu, start)?;
        if !self.stores.is_external(base) {
            return Ok(HandlerId::RAM);
        }
        match direction {
            Direction::Read => self.read_handlers.register_direct(base, start),
            Direction::Write => self.write_handlers.register_direct(base, start),
        }
    }

    fn declare_bank(
        &mut self,
        cpu: usize,
        direction: Direction,
        bank: u8,
        start: u32,
    ) -> Result<HandlerId> {
        let bank = check_bank(bank)?;
        match direction {
            Direction::Read => self.read_handlers.declare_bank(bank, start),
            Direction::Write => self.write_handlers.declare_bank(bank, start),
        }
        self.banks[usize::from(bank)] = Some(self.stores.find_base(cpu, start)?);
        HandlerId::bank(bank).ok_or(MemoryError::InvalidBank(bank))
    }

    fn read_kind_id(&mut self, cpu: usize, start: u32, kind: &ReadKind) -> Result<HandlerId> {
        match kind {
            ReadKind::Ram | ReadKind::Rom => self.storage_id(cpu, Direction::Read, start),
            ReadKind::Bank(bank) => self.declare_bank(cpu, Direction::Read, *bank, start),
            ReadKind::Nop => Ok(HandlerId::NOP),
            ReadKind::Handler(callback) => self.read_handlers.register_function(callback, start),
        }
    }

    fn write_kind_id(&mut self, cpu: usize, start: u32, kind: &WriteKind) -> Result<HandlerId> {
        match kind {
            WriteKind::Ram => self.storage_id(cpu, Direction::Write, start),
            WriteKind::Rom => Ok(HandlerId::ROM),
            WriteKind::RamRom => Ok(HandlerId::RAM_ROM),
            WriteKind::Bank(bank) => self.declare_bank(cpu, Direction::Write, *bank, start),
            WriteKind::Nop => Ok(HandlerId::NOP),
            WriteKind::Handler(callback) => self.write_handlers.register_function(callback, start),
        }
    }

    /// Clamps `start..=end` to the bus of `cpu`; `None` for an empty range.
    fn clamp_range(&self, cpu: usize, start: u32, end: u32) -> Result<Option<(u32, u32)>> {
        let mask = self.cpu(cpu)?.bus.address_mask();
        let end = end.min(mask);
        Ok((start <= end).then_some((start, end)))
    }

    pub(crate) fn map_read(
        &mut self,
        cpu: usize,
        start: u32,
        end: u32,
        kind: &ReadKind,
    ) -> Result<()> {
        let Some((start, end)) = self.clamp_range(cpu, start, end)? else {
            return Ok(());
        };
        let id = self.read_kind_id(cpu, start, kind)?;
        let memory = self.cpus.get_mut(cpu).ok_or(MemoryError::InvalidCpu(cpu))?;
        let arena = &mut self.read_arena;
        memory.read_map.install(arena, start, end, id)
    }

    pub(crate) fn map_write(
        &mut self,
        cpu: usize,
        start: u32,
        end: u32,
        kind: &WriteKind,
    ) -> Result<()> {
        let Some((start, end)) = self.clamp_range(cpu, start, end)? else {
            return Ok(());
        };
        let id = self.write_kind_id(cpu, start, kind)?;
        let memory = self.cpus.get_mut(cpu).ok_or(MemoryError::InvalidCpu(cpu))?;
        let arena = &mut self.write_arena;
        memory.write_map.install(arena, start, end, id)
    }

    /// Maps `start..=end` of `cpu` for reads at runtime.
    ///
    /// The new range overrides whatever was mapped there. Returns the
    /// backing location of `start`, for drivers that want direct access.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`], [`MemoryError::InvalidBank`],
    /// [`MemoryError::HandlerSlotsExhausted`] or
    /// [`MemoryError::ElementArenaExhausted`].
    pub fn install_read_handler(
        &mut self,
        cpu: usize,
        start: u32,
        end: u32,
        kind: ReadKind,
    ) -> Result<MemoryPointer> {
        debug!("cpu #{cpu}: install read handler {start:08x}-{end:08x} {kind:?}");
        self.map_read(cpu, start, end, &kind)?;
        self.log_usage();
        self.stores.find_base(cpu, start)
    }

    /// Maps `start..=end` of `cpu` for writes at runtime.
    ///
    /// # Errors
    ///
    /// Same as [`MemorySystem::install_read_handler`].
    pub fn install_write_handler(
        &mut self,
        cpu: usize,
        start: u32,
        end: u32,
        kind: WriteKind,
    ) -> Result<MemoryPointer> {
        debug!("cpu #{cpu}: install write handler {start:08x}-{end:08x} {kind:?}");
        self.map_write(cpu, start, end, &kind)?;
        self.log_usage();
        self.stores.find_base(cpu, start)
    }

    /// Binds `callback` to a function slot, reusing the slot of an identical
    /// `(callback, offset)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::HandlerSlotsExhausted`] when no id is left.
    pub fn register_function_handler(
        &mut self,
        callback: &FunctionCallback,
        offset: u32,
    ) -> Result<HandlerId> {
        match callback {
            FunctionCallback::Read(callback) => {
                self.read_handlers.register_function(callback, offset)
            }
            FunctionCallback::Write(callback) => {
                self.write_handlers.register_function(callback, offset)
            }
        }
    }

    /// Points bank `bank` at `base`, for reads and writes alike.
    ///
    /// Takes effect on the next access. When the active opcode base came
    /// from this bank it is recomputed from the last program counter.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidBank`] or [`MemoryError::UnknownStore`].
    pub fn set_bank_pointer(&mut self, bank: u8, base: MemoryPointer) -> Result<()> {
        let bank = check_bank(bank)?;
        self.stores.get(base.store)?;
        self.banks[usize::from(bank)] = Some(base);
        if self.active.opcode.handler.and_then(HandlerId::bank_number) == Some(bank) {
            self.active.opcode.handler = None;
            let pc = self.active.opcode.last_pc;
            self.set_opcode_base(pc);
        }
        Ok(())
    }

    /// Changes what reads of bank `bank` resolve to.
    ///
    /// Redirecting to another bank uses that bank's declared offset; a
    /// callback receives addresses relative to this bank's declared start.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidBank`] for either bank number.
    pub fn set_bank_read_handler(&mut self, bank: u8, kind: ReadKind) -> Result<()> {
        let bank = check_bank(bank)?;
        let table = &mut self.read_handlers;
        let slot = match kind {
            ReadKind::Ram | ReadKind::Rom => Slot::Storage { bank: 0, offset: 0 },
            ReadKind::Bank(target) => {
                let target = check_bank(target)?;
                Slot::Storage {
                    bank: target,
                    offset: table.bank_offset(target),
                }
            }
            ReadKind::Nop => Slot::Nop,
            ReadKind::Handler(callback) => Slot::Function {
                callback,
                offset: table.bank_offset(bank),
            },
        };
        table.rebind_bank(bank, slot);
        Ok(())
    }

    /// Changes what writes to bank `bank` resolve to.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidBank`] for either bank number.
    pub fn set_bank_write_handler(&mut self, bank: u8, kind: WriteKind) -> Result<()> {
        let bank = check_bank(bank)?;
        let table = &mut self.write_handlers;
        let slot = match kind {
            WriteKind::Ram => Slot::Storage { bank: 0, offset: 0 },
            WriteKind::Rom => Slot::Rom,
            WriteKind::RamRom => Slot::RamRom,
            WriteKind::Bank(target) => {
                let target = check_bank(target)?;
                Slot::Storage {
                    bank: target,
                    offset: table.bank_offset(target),
                }
            }
            WriteKind::Nop => Slot::Nop,
            WriteKind::Handler(callback) => Slot::Function {
                callback,
                offset: table.bank_offset(bank),
            },
        };
        table.rebind_bank(bank, slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FunctionCallback;
    use crate::bus::BUS_16;
    use crate::handler::{
        read_callback, write_callback, Direction, HandlerId, ReadKind, WriteKind,
    };
    use crate::machine::{CpuConfig, MachineConfig};
    use crate::system::MemorySystem;

    fn system() -> MemorySystem {
        let cpu = CpuConfig::new(BUS_16, vec![0; 0x1_0000])
            .read(0x0000, 0xffff, ReadKind::Ram)
            .write(0x0000, 0xffff, WriteKind::Ram);
        MemorySystem::new(MachineConfig::new().cpu(cpu)).expect("setup")
    }

    #[test]
    fn runtime_install_overrides_and_returns_the_base() {
        let mut system = system();
        let callback = read_callback(|offset| offset);
        let base = system
            .install_read_handler(0, 0x2000, 0x2003, ReadKind::Handler(callback))
            .expect("install");
        assert_eq!(base.offset, 0x2000);
        assert_eq!(
            system.resolve(0, Direction::Read, 0x2002),
            Ok(HandlerId::FIRST_FUNCTION)
        );
        assert_eq!(
            system.resolve(0, Direction::Read, 0x2004),
            Ok(HandlerId::RAM)
        );
    }

    #[test]
    fn empty_runtime_range_changes_nothing() {
        let mut system = system();
        system
            .install_write_handler(0, 0x3000, 0x2fff, WriteKind::Nop)
            .expect("install");
        assert_eq!(
            system.resolve(0, Direction::Write, 0x3000),
            Ok(HandlerId::RAM)
        );
    }

    #[test]
    fn installs_clamp_to_the_bus() {
        let mut system = system();
        system
            .install_write_handler(0, 0xff00, 0x00ff_ffff, WriteKind::Rom)
            .expect("install");
        assert_eq!(
            system.resolve(0, Direction::Write, 0xffff),
            Ok(HandlerId::ROM)
        );
    }

    #[test]
    fn register_function_handler_dedups_per_direction() {
        let mut system = system();
        let reader = FunctionCallback::Read(read_callback(|_| 0));
        let writer = FunctionCallback::Write(write_callback(|_, _| {}));
        let first = system
            .register_function_handler(&reader, 0x100)
            .expect("slot");
        let used = system.usage(Direction::Read).handlers_used;
        let again = system
            .register_function_handler(&reader, 0x100)
            .expect("slot");
        assert_eq!(first, again);
        assert_eq!(system.usage(Direction::Read).handlers_used, used);
        assert_eq!(
            system
                .register_function_handler(&writer, 0x100)
                .expect("slot"),
            HandlerId::FIRST_FUNCTION
        );
        assert_eq!(writer.direction(), Direction::Write);
    }

    #[test]
    fn bank_numbers_are_checked() {
        let mut system = system();
        let region = system.region(0).expect("region");
        assert!(system
            .set_bank_pointer(0, crate::MemoryPointer::new(region, 0))
            .is_err());
        assert!(system.set_bank_read_handler(3, ReadKind::Bank(40)).is_err());
        assert!(system.set_bank_write_handler(17, WriteKind::Nop).is_err());
    }
}
