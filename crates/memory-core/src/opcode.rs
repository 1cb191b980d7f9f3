//! Opcode fetch windows.
//!
//! The CPU core fetches instructions through a cached window instead of the
//! general read path. The window is moved by [`MemorySystem::set_opcode_base`]
//! whenever the program counter crosses into a region backed by another
//! handler.

use log::{debug, warn};

use crate::bus::{DataWidth, Endian};
use crate::dispatch::store_index;
use crate::error::{MemoryError, Result};
use crate::handler::{HandlerId, Slot};
use crate::store::StoreId;
use crate::system::MemorySystem;

/// A store positioned so that program counter `pc` fetches
/// `store[origin + pc]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct OpcodeWindow {
    /// Store fetched from.
    pub store: StoreId,
    /// Signed store position of program counter zero.
    pub origin: i64,
}

impl OpcodeWindow {
    /// Builds a window over `store` with program counter zero at `origin`.
    #[must_use]
    pub const fn new(store: StoreId, origin: i64) -> Self {
        Self { store, origin }
    }

    /// Store position fetched for `pc`.
    #[must_use]
    pub fn index(self, pc: u32) -> i64 {
        self.origin + i64::from(pc)
    }
}

/// Result of a driver opcode-base override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpbaseAction {
    /// Continue the lookup with this program counter.
    Lookup(u32),
    /// Use this window and skip the lookup.
    Window(OpcodeWindow),
    /// The override did everything needed.
    Handled,
}

/// What [`MemorySystem::set_opcode_base`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeBaseOutcome {
    /// The windows now point at the storage behind this handler.
    Updated(HandlerId),
    /// The override handled the change.
    Handled,
    /// The program counter landed on a device; the windows were kept.
    MappedIo(HandlerId),
}

/// Per-CPU opcode-base override, called with the shifted program counter.
pub type OpbaseOverride = Box<dyn FnMut(u32) -> OpbaseAction>;

/// Opcode windows of the active CPU.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpcodeState {
    pub(crate) ram: OpcodeWindow,
    pub(crate) rom: OpcodeWindow,
    /// Handler id the windows came from, `None` before the first lookup.
    pub(crate) handler: Option<HandlerId>,
    pub(crate) last_pc: u32,
}

impl OpcodeState {
    pub(crate) const fn new(region: StoreId) -> Self {
        Self::with_rom(region, region)
    }

    pub(crate) const fn with_rom(region: StoreId, rom: StoreId) -> Self {
        Self {
            ram: OpcodeWindow::new(region, 0),
            rom: OpcodeWindow::new(rom, 0),
            handler: None,
            last_pc: 0,
        }
    }

    /// Moves the RAM window to `window`; the ROM window keeps its
    /// displacement from it.
    fn move_to(&mut self, window: OpcodeWindow) {
        let displacement = self.rom.origin - self.ram.origin;
        self.rom = if self.rom.store == self.ram.store {
            OpcodeWindow::new(window.store, window.origin + displacement)
        } else {
            OpcodeWindow::new(self.rom.store, window.origin + displacement)
        };
        self.ram = window;
    }
}

impl MemorySystem {
    /// Points the opcode windows at the storage behind `pc`.
    ///
    /// The program counter is shifted by the bus `pc_shift` and handed to
    /// the CPU override, if any, before the read map is consulted.
    pub fn set_opcode_base(&mut self, pc: u32) -> OpcodeBaseOutcome {
        let bus = self.active.bus;
        let cpu = self.active.cpu;
        self.active.opcode.last_pc = pc;
        let mut pc = pc >> bus.pc_shift;

        let action = self
            .cpus
            .get_mut(cpu)
            .and_then(|memory| memory.opbase_override.as_mut())
            .map(|callback| callback(pc));
        match action {
            Some(OpbaseAction::Handled) => return OpcodeBaseOutcome::Handled,
            Some(OpbaseAction::Window(window)) => {
                self.active.opcode.move_to(window);
                return OpcodeBaseOutcome::Handled;
            }
            Some(OpbaseAction::Lookup(remapped)) => pc = remapped,
            None => {}
        }

        let Some(memory) = self.cpus.get(cpu) else {
            return OpcodeBaseOutcome::MappedIo(HandlerId::UNMAPPED);
        };
        let id = memory
            .read_map
            .resolve(&self.read_arena, pc & bus.address_mask());
        self.active.opcode.handler = Some(id);

        let base = match self.read_handlers.slot(id) {
            Slot::Storage { bank, offset } => self.bank_pointer(*bank).map(|base| (base, *offset)),
            Slot::Direct { base, offset } => Some((*base, *offset)),
            _ => None,
        };
        if let Some((base, offset)) = base {
            let window = OpcodeWindow::new(base.store, store_index(base, offset, 0));
            self.active.opcode.move_to(window);
            return OpcodeBaseOutcome::Updated(id);
        }

        warn!(
            "cpu #{cpu} pc {:08x}: warning - op-code execute on mapped i/o",
            self.active.opcode.last_pc
        );
        OpcodeBaseOutcome::MappedIo(id)
    }

    /// Calls [`MemorySystem::set_opcode_base`] when `pc` left the level-0
    /// cell the windows were built for.
    ///
    /// A cell split into a level-1 block always triggers a new lookup.
    pub fn change_pc(&mut self, pc: u32) -> Option<OpcodeBaseOutcome> {
        let cell = self
            .cpus
            .get(self.active.cpu)?
            .read_map
            .level0_cell(pc >> self.active.bus.pc_shift);
        let current = self.active.opcode.handler;
        if current.is_some() && HandlerId::from_cell(cell) == current {
            return None;
        }
        Some(self.set_opcode_base(pc))
    }

    /// Opcode byte at `pc`, fetched through the ROM window.
    #[must_use]
    pub fn read_opcode(&self, pc: u32) -> u8 {
        let window = self.active.opcode.rom;
        let index = window.index(pc ^ self.active.bus.byte_lane_xor());
        self.stores.byte(window.store, index).unwrap_or(0)
    }

    /// Operand byte at `pc`, fetched through the RAM window.
    #[must_use]
    pub fn read_opcode_arg(&self, pc: u32) -> u8 {
        let window = self.active.opcode.ram;
        let index = window.index(pc ^ self.active.bus.byte_lane_xor());
        self.stores.byte(window.store, index).unwrap_or(0)
    }

    /// 16-bit opcode at `pc` in bus byte order, fetched through the ROM window.
    #[must_use]
    pub fn read_opcode_word(&self, pc: u32) -> u16 {
        let bus = self.active.bus;
        if bus.data_width == DataWidth::Word {
            let window = self.active.opcode.rom;
            let index = window.index(pc);
            return self.stores.cell(window.store, index).unwrap_or(0);
        }
        let bytes = [self.read_opcode(pc), self.read_opcode(pc.wrapping_add(1))];
        match bus.endian {
            Endian::Big => u16::from_be_bytes(bytes),
            Endian::Little => u16::from_le_bytes(bytes),
        }
    }

    /// Current opcode RAM and ROM windows of the active CPU.
    #[must_use]
    pub const fn opcode_windows(&self) -> (OpcodeWindow, OpcodeWindow) {
        (self.active.opcode.ram, self.active.opcode.rom)
    }

    /// Handler id the opcode windows were last built from.
    #[must_use]
    pub const fn opcode_handler(&self) -> Option<HandlerId> {
        self.active.opcode.handler
    }

    /// Selects the store `cpu` fetches opcodes from, such as decrypted ROM.
    ///
    /// Takes effect at the next [`MemorySystem::switch_context`] to `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] or [`MemoryError::UnknownStore`].
    pub fn set_opcode_rom(&mut self, cpu: usize, store: StoreId) -> Result<()> {
        self.stores.get(store)?;
        let memory = self.cpus.get_mut(cpu).ok_or(MemoryError::InvalidCpu(cpu))?;
        memory.opcode_rom = store;
        debug!("cpu #{cpu} opcode rom set to store {}", store.index());
        Ok(())
    }

    /// Installs or clears the opcode-base override of `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn set_opbase_override(
        &mut self,
        cpu: usize,
        callback: Option<OpbaseOverride>,
    ) -> Result<()> {
        let memory = self.cpus.get_mut(cpu).ok_or(MemoryError::InvalidCpu(cpu))?;
        memory.opbase_override = callback;
        Ok(())
    }
}
