//! Handler ids, device callbacks and the per-direction slot tables.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use log::{debug, error};

use crate::error::{MemoryError, Result};
use crate::store::MemoryPointer;

/// Number of handler ids per direction; ids at or above it are element links.
pub const HARD_MAX: usize = 64;
/// Highest bank number.
pub const BANK_MAX: u8 = 16;

/// Access direction of a table, map or handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Direction {
    /// Memory reads and opcode fetch.
    Read,
    /// Memory writes.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Small integer naming what backs an address cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct HandlerId(u8);

impl HandlerId {
    /// The active CPU's region, addressed directly.
    pub const RAM: Self = Self(0);
    /// Nothing installed.
    pub const UNMAPPED: Self = Self(17);
    /// Reads return zero, writes are dropped.
    pub const NOP: Self = Self(18);
    /// Writes land in the region and its opcode mirror.
    pub const RAM_ROM: Self = Self(19);
    /// Writes are refused.
    pub const ROM: Self = Self(20);
    /// First id handed to registered callbacks.
    pub const FIRST_FUNCTION: Self = Self(21);

    /// Id of bank `number`, if it is within `1..=16`.
    #[must_use]
    pub const fn bank(number: u8) -> Option<Self> {
        if number >= 1 && number <= BANK_MAX {
            Some(Self(number))
        } else {
            None
        }
    }

    pub(crate) const fn from_cell(raw: u8) -> Option<Self> {
        if (raw as usize) < HARD_MAX {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Raw id value.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Returns `true` for RAM and bank ids, which resolve to storage directly.
    #[must_use]
    pub const fn is_storage(self) -> bool {
        self.0 <= BANK_MAX
    }

    /// Bank number when this is a bank id.
    #[must_use]
    pub const fn bank_number(self) -> Option<u8> {
        if self.0 >= 1 && self.0 <= BANK_MAX {
            Some(self.0)
        } else {
            None
        }
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Device read callback. `offset` is relative to the installed range start.
pub trait ReadHandler {
    /// Produces the value at `offset`.
    fn read(&mut self, offset: u32) -> u32;
}

/// Device write callback. `offset` is relative to the installed range start.
pub trait WriteHandler {
    /// Consumes `data` written at `offset`.
    fn write(&mut self, offset: u32, data: u32);
}

impl<F: FnMut(u32) -> u32> ReadHandler for F {
    fn read(&mut self, offset: u32) -> u32 {
        self(offset)
    }
}

impl<F: FnMut(u32, u32)> WriteHandler for F {
    fn write(&mut self, offset: u32, data: u32) {
        self(offset, data);
    }
}

/// Shared read callback; identity is the allocation.
pub type ReadCallback = Rc<RefCell<dyn ReadHandler>>;
/// Shared write callback; identity is the allocation.
pub type WriteCallback = Rc<RefCell<dyn WriteHandler>>;

/// Wraps a read closure for installation.
pub fn read_callback(handler: impl FnMut(u32) -> u32 + 'static) -> ReadCallback {
    Rc::new(RefCell::new(handler))
}

/// Wraps a write closure for installation.
pub fn write_callback(handler: impl FnMut(u32, u32) + 'static) -> WriteCallback {
    Rc::new(RefCell::new(handler))
}

/// Wraps a stateful read device for installation.
pub fn read_device(device: impl ReadHandler + 'static) -> ReadCallback {
    Rc::new(RefCell::new(device))
}

/// Wraps a stateful write device for installation.
pub fn write_device(device: impl WriteHandler + 'static) -> WriteCallback {
    Rc::new(RefCell::new(device))
}

/// What a memory read range is backed by.
#[derive(Clone)]
pub enum ReadKind {
    /// The CPU region.
    Ram,
    /// The CPU region; identical to [`ReadKind::Ram`] for reads.
    Rom,
    /// A switchable bank, `1..=16`.
    Bank(u8),
    /// Always reads zero.
    Nop,
    /// A device callback.
    Handler(ReadCallback),
}

/// What a memory write range is backed by.
#[derive(Clone)]
pub enum WriteKind {
    /// The CPU region.
    Ram,
    /// Read-only; writes are dropped and logged.
    Rom,
    /// The CPU region and its opcode mirror.
    RamRom,
    /// A switchable bank, `1..=16`.
    Bank(u8),
    /// Writes are dropped.
    Nop,
    /// A device callback.
    Handler(WriteCallback),
}

impl fmt::Debug for ReadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ram => f.write_str("Ram"),
            Self::Rom => f.write_str("Rom"),
            Self::Bank(bank) => f.debug_tuple("Bank").field(bank).finish(),
            Self::Nop => f.write_str("Nop"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

impl fmt::Debug for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ram => f.write_str("Ram"),
            Self::Rom => f.write_str("Rom"),
            Self::RamRom => f.write_str("RamRom"),
            Self::Bank(bank) => f.debug_tuple("Bank").field(bank).finish(),
            Self::Nop => f.write_str("Nop"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Behavior bound to one handler id.
pub(crate) enum Slot<T: ?Sized> {
    /// Never handed out.
    Free,
    /// Bank pointer `bank` (0 is the active region), addressed at `address - offset`.
    Storage { bank: u8, offset: u32 },
    /// Fixed store location, addressed at `address - offset`.
    Direct { base: MemoryPointer, offset: u32 },
    Nop,
    Unmapped,
    Rom,
    RamRom,
    Function { callback: Rc<T>, offset: u32 },
}

impl<T: ?Sized> Clone for Slot<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Free => Self::Free,
            Self::Storage { bank, offset } => Self::Storage {
                bank: *bank,
                offset: *offset,
            },
            Self::Direct { base, offset } => Self::Direct {
                base: *base,
                offset: *offset,
            },
            Self::Nop => Self::Nop,
            Self::Unmapped => Self::Unmapped,
            Self::Rom => Self::Rom,
            Self::RamRom => Self::RamRom,
            Self::Function { callback, offset } => Self::Function {
                callback: Rc::clone(callback),
                offset: *offset,
            },
        }
    }
}

impl<T: ?Sized> Slot<T> {
    /// Offset subtracted from addresses before they reach the backing.
    pub(crate) const fn offset(&self) -> u32 {
        match self {
            Self::Storage { offset, .. }
            | Self::Direct { offset, .. }
            | Self::Function { offset, .. } => *offset,
            _ => 0,
        }
    }
}

/// Occupancy of one direction's handler table and element arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SlotUsage {
    /// Level-1 blocks allocated.
    pub elements_used: usize,
    /// Level-1 block capacity.
    pub elements_max: usize,
    /// Handler ids handed out, reserved ids included.
    pub handlers_used: usize,
    /// Handler id capacity.
    pub handlers_max: usize,
}

/// Slot table of one direction, shared by every CPU of the machine.
pub(crate) struct HandlerTable<T: ?Sized> {
    direction: Direction,
    slots: [Slot<T>; HARD_MAX],
    next: usize,
    bank_offsets: [u32; BANK_MAX as usize + 1],
}

impl<T: ?Sized> HandlerTable<T> {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(direction: Direction) -> Self {
        let slots = std::array::from_fn(|index| match index {
            0 => Slot::Storage { bank: 0, offset: 0 },
            17 => Slot::Unmapped,
            18 => Slot::Nop,
            19 => Slot::RamRom,
            20 => Slot::Rom,
            bank if bank <= BANK_MAX as usize => Slot::Storage {
                bank: bank as u8,
                offset: 0,
            },
            _ => Slot::Free,
        });
        Self {
            direction,
            slots,
            next: HandlerId::FIRST_FUNCTION.index(),
            bank_offsets: [0; BANK_MAX as usize + 1],
        }
    }

    pub(crate) const fn slot(&self, id: HandlerId) -> &Slot<T> {
        &self.slots[id.index()]
    }

    pub(crate) const fn handlers_used(&self) -> usize {
        self.next
    }

    /// Binds `callback` at `offset`, reusing an identical earlier registration.
    pub(crate) fn register_function(&mut self, callback: &Rc<T>, offset: u32) -> Result<HandlerId> {
        let existing = self.registered().find(|(_, slot)| {
            matches!(slot, Slot::Function { callback: bound, offset: at }
                if Rc::ptr_eq(bound, callback) && *at == offset)
        });
        if let Some((id, _)) = existing {
            debug!("{} handler match at {offset:08x}, reusing {id}", self.direction);
            return Ok(id);
        }
        self.allocate(Slot::Function {
            callback: Rc::clone(callback),
            offset,
        })
    }

    /// Binds a fixed store location, reusing an identical earlier binding.
    pub(crate) fn register_direct(
        &mut self,
        base: MemoryPointer,
        offset: u32,
    ) -> Result<HandlerId> {
        let existing = self.registered().find(|(_, slot)| {
            matches!(slot, Slot::Direct { base: bound, offset: at }
                if *bound == base && *at == offset)
        });
        if let Some((id, _)) = existing {
            return Ok(id);
        }
        self.allocate(Slot::Direct { base, offset })
    }

    fn registered(&self) -> impl Iterator<Item = (HandlerId, &Slot<T>)> {
        self.slots
            .iter()
            .enumerate()
            .take(self.next)
            .skip(HandlerId::FIRST_FUNCTION.index())
            .filter_map(|(index, slot)| {
                let id = HandlerId::from_cell(u8::try_from(index).ok()?)?;
                Some((id, slot))
            })
    }

    fn allocate(&mut self, slot: Slot<T>) -> Result<HandlerId> {
        let Some(id) = u8::try_from(self.next).ok().and_then(HandlerId::from_cell) else {
            error!("{} memory hardware pattern over", self.direction);
            return Err(MemoryError::HandlerSlotsExhausted {
                direction: self.direction,
                capacity: HARD_MAX,
            });
        };
        self.slots[id.index()] = slot;
        self.next += 1;
        debug!("{} handler {id} registered", self.direction);
        Ok(id)
    }

    /// Offset recorded when `bank` was declared.
    pub(crate) const fn bank_offset(&self, bank: u8) -> u32 {
        self.bank_offsets[bank as usize]
    }

    /// Declares `bank` as storage starting at `offset`.
    pub(crate) fn declare_bank(&mut self, bank: u8, offset: u32) {
        self.bank_offsets[bank as usize] = offset;
        self.slots[bank as usize] = Slot::Storage { bank, offset };
    }

    /// Rebinds the slot of `bank` without touching its recorded offset.
    pub(crate) fn rebind_bank(&mut self, bank: u8, slot: Slot<T>) {
        self.slots[bank as usize] = slot;
    }
}

/// Merges a word-bus write into `old`.
///
/// The upper half of `data` masks the bits of `old` to keep; the lower half
/// carries the bits written.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn combine_word(old: u16, data: u32) -> u16 {
    ((old as u32 & (data >> 16)) | (data & 0xffff)) as u16
}

/// Validates a bank number.
///
/// # Errors
///
/// Returns [`MemoryError::InvalidBank`] outside `1..=16`.
pub const fn check_bank(bank: u8) -> Result<u8> {
    if bank >= 1 && bank <= BANK_MAX {
        Ok(bank)
    } else {
        Err(MemoryError::InvalidBank(bank))
    }
}
