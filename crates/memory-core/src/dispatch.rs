//! Read and write entry points called by CPU cores on every access.
//!
//! Each access masks the address to the active bus, resolves a handler id
//! through the element map and either touches a backing store directly
//! (RAM, banks, direct slots) or calls the bound device callback.

use std::rc::Rc;

use log::warn;

use crate::bus::{Alignment, DataWidth, Endian, UnmappedPolicy};
use crate::error::Result;
use crate::handler::{Direction, HandlerId, ReadCallback, Slot, WriteCallback};
use crate::store::MemoryPointer;
use crate::system::MemorySystem;

/// Resolved behavior of one read.
enum ReadTarget {
    Store { base: MemoryPointer, offset: u32 },
    Unbound(u8),
    Nop,
    Unmapped,
    Function { device: ReadCallback, offset: u32 },
}

/// Resolved behavior of one write.
enum WriteTarget {
    Store { base: MemoryPointer, offset: u32 },
    Unbound(u8),
    Nop,
    Unmapped,
    Rom,
    RamRom,
    Function { device: WriteCallback, offset: u32 },
}

/// Signed store position of `address` in a range starting at `offset` and
/// backed from `base`.
pub(crate) fn store_index(base: MemoryPointer, offset: u32, address: u32) -> i64 {
    i64::try_from(base.offset).unwrap_or(i64::MAX) + i64::from(address) - i64::from(offset)
}

const fn low_byte(value: u32) -> u8 {
    value.to_le_bytes()[0]
}

const fn low_half(value: u32) -> u16 {
    let [low, high, _, _] = value.to_le_bytes();
    u16::from_le_bytes([low, high])
}

impl MemorySystem {
    /// Handler id backing `address` of `cpu` in the `direction` map.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn resolve(&self, cpu: usize, direction: Direction, address: u32) -> Result<HandlerId> {
        let memory = self.cpu(cpu)?;
        let address = address & memory.bus.address_mask();
        Ok(match direction {
            Direction::Read => memory.read_map.resolve(&self.read_arena, address),
            Direction::Write => memory.write_map.resolve(&self.write_arena, address),
        })
    }

    fn read_target(&self, address: u32) -> ReadTarget {
        let Some(memory) = self.cpus.get(self.active.cpu) else {
            return ReadTarget::Unmapped;
        };
        let id = memory.read_map.resolve(&self.read_arena, address);
        match self.read_handlers.slot(id) {
            Slot::Storage { bank, offset } => match self.bank_pointer(*bank) {
                Some(base) => ReadTarget::Store {
                    base,
                    offset: *offset,
                },
                None => ReadTarget::Unbound(*bank),
            },
            Slot::Direct { base, offset } => ReadTarget::Store {
                base: *base,
                offset: *offset,
            },
            Slot::Rom | Slot::RamRom => match self.bank_pointer(0) {
                Some(base) => ReadTarget::Store { base, offset: 0 },
                None => ReadTarget::Unbound(0),
            },
            Slot::Nop => ReadTarget::Nop,
            Slot::Unmapped | Slot::Free => ReadTarget::Unmapped,
            Slot::Function { callback, offset } => ReadTarget::Function {
                device: Rc::clone(callback),
                offset: *offset,
            },
        }
    }

    fn write_target(&self, address: u32) -> WriteTarget {
        let Some(memory) = self.cpus.get(self.active.cpu) else {
            return WriteTarget::Unmapped;
        };
        let id = memory.write_map.resolve(&self.write_arena, address);
        match self.write_handlers.slot(id) {
            Slot::Storage { bank, offset } => match self.bank_pointer(*bank) {
                Some(base) => WriteTarget::Store {
                    base,
                    offset: *offset,
                },
                None => WriteTarget::Unbound(*bank),
            },
            Slot::Direct { base, offset } => WriteTarget::Store {
                base: *base,
                offset: *offset,
            },
            Slot::Nop => WriteTarget::Nop,
            Slot::Unmapped | Slot::Free => WriteTarget::Unmapped,
            Slot::Rom => WriteTarget::Rom,
            Slot::RamRom => WriteTarget::RamRom,
            Slot::Function { callback, offset } => WriteTarget::Function {
                device: Rc::clone(callback),
                offset: *offset,
            },
        }
    }

    fn call_read(&self, callback: &ReadCallback, offset: u32) -> u32 {
        let Ok(mut handler) = callback.try_borrow_mut() else {
            warn!(
                "cpu #{}: read handler re-entered at offset {offset:08x}, reading 0",
                self.active.cpu
            );
            return 0;
        };
        handler.read(offset)
    }

    fn call_write(&self, callback: &WriteCallback, offset: u32, data: u32) {
        let Ok(mut handler) = callback.try_borrow_mut() else {
            warn!(
                "cpu #{}: write handler re-entered at offset {offset:08x}, write dropped",
                self.active.cpu
            );
            return;
        };
        handler.write(offset, data);
    }

    fn warn_unmapped_read(&self, address: u32) {
        warn!(
            "cpu #{} pc {:08x}: warning - read unmapped memory address {:08x}",
            self.active.cpu,
            self.active.opcode.last_pc,
            self.active.bus.diagnostic_address(address)
        );
    }

    fn warn_unmapped_write(&self, address: u32, data: u32) {
        warn!(
            "cpu #{} pc {:08x}: warning - write {data:02x} to unmapped memory address {:08x}",
            self.active.cpu,
            self.active.opcode.last_pc,
            self.active.bus.diagnostic_address(address)
        );
    }

    fn warn_rom_write(&self, address: u32, data: u32) {
        warn!(
            "cpu #{} pc {:08x}: warning - write {data:02x} to ROM address {:08x}",
            self.active.cpu,
            self.active.opcode.last_pc,
            self.active.bus.diagnostic_address(address)
        );
    }

    fn warn_unbound(&self, bank: u8, address: u32) {
        warn!(
            "cpu #{} pc {:08x}: warning - bank {bank} has no backing at {:08x}",
            self.active.cpu,
            self.active.opcode.last_pc,
            self.active.bus.diagnostic_address(address)
        );
    }

    /// Byte read of an unmapped cell under the active policy.
    fn unmapped_byte(&self, address: u32) -> u8 {
        self.warn_unmapped_read(address);
        match self.active.bus.unmapped {
            UnmappedPolicy::Zero => 0,
            UnmappedPolicy::FloatingBus => self
                .bank_pointer(0)
                .and_then(|region| {
                    let lane = address ^ self.active.bus.byte_lane_xor();
                    self.stores.byte(region.store, store_index(region, 0, lane))
                })
                .unwrap_or(0),
        }
    }

    /// Word read of an unmapped cell under the active policy.
    fn unmapped_word(&self, address: u32) -> u16 {
        self.warn_unmapped_read(address);
        match self.active.bus.unmapped {
            UnmappedPolicy::Zero => 0,
            UnmappedPolicy::FloatingBus => self
                .bank_pointer(0)
                .and_then(|region| {
                    let index = store_index(region, 0, address);
                    self.stores.cell(region.store, index)
                })
                .unwrap_or(0),
        }
    }

    /// Reads one byte from the active CPU's address space.
    pub fn read_byte(&mut self, address: u32) -> u8 {
        let bus = self.active.bus;
        let address = address & bus.address_mask();
        match self.read_target(address) {
            ReadTarget::Store { base, offset } => {
                let index = store_index(base, offset, address ^ bus.byte_lane_xor());
                self.stores
                    .byte(base.store, index)
                    .unwrap_or_else(|| self.unmapped_byte(address))
            }
            ReadTarget::Unbound(bank) => {
                self.warn_unbound(bank, address);
                0
            }
            ReadTarget::Nop => 0,
            ReadTarget::Unmapped => self.unmapped_byte(address),
            ReadTarget::Function { device, offset } => match bus.data_width {
                DataWidth::Byte => low_byte(self.call_read(&device, address.wrapping_sub(offset))),
                DataWidth::Word => {
                    let cell = (address & !1).wrapping_sub(offset);
                    let data = self.call_read(&device, cell);
                    let shift = (address & 1) << 3;
                    let shift = match bus.endian {
                        Endian::Big => shift ^ 8,
                        Endian::Little => shift,
                    };
                    low_byte(data >> shift)
                }
            },
        }
    }

    /// Writes one byte to the active CPU's address space.
    ///
    /// On word buses a device callback receives the byte in its lane, with
    /// the mask of lanes to keep in the upper half (see [`crate::combine_word`]).
    pub fn write_byte(&mut self, address: u32, data: u8) {
        let bus = self.active.bus;
        let address = address & bus.address_mask();
        match self.write_target(address) {
            WriteTarget::Store { base, offset } => {
                let index = store_index(base, offset, address ^ bus.byte_lane_xor());
                if !self.stores.set_byte(base.store, index, data) {
                    self.warn_unmapped_write(address, u32::from(data));
                }
            }
            WriteTarget::Unbound(bank) => self.warn_unbound(bank, address),
            WriteTarget::Nop => {}
            WriteTarget::Unmapped => self.warn_unmapped_write(address, u32::from(data)),
            WriteTarget::Rom => self.warn_rom_write(address, u32::from(data)),
            WriteTarget::RamRom => {
                let lane = address ^ bus.byte_lane_xor();
                self.write_ram_rom(lane, &[data]);
            }
            WriteTarget::Function { device, offset } => match bus.data_width {
                DataWidth::Byte => {
                    let relative = address.wrapping_sub(offset);
                    self.call_write(&device, relative, u32::from(data));
                }
                DataWidth::Word => {
                    let shift = (address & 1) << 3;
                    let shift = match bus.endian {
                        Endian::Big => shift ^ 8,
                        Endian::Little => shift,
                    };
                    let merged = (0xff00_0000 >> shift) | (u32::from(data) << shift);
                    let cell = (address & !1).wrapping_sub(offset);
                    self.call_write(&device, cell, merged);
                }
            },
        }
    }

    /// Writes `bytes` at `index` of both the region and the opcode ROM of
    /// the active CPU.
    fn write_ram_rom(&mut self, index: u32, bytes: &[u8]) {
        let Some(memory) = self.cpus.get(self.active.cpu) else {
            return;
        };
        let (region, rom) = (memory.region, memory.opcode_rom);
        for (position, &byte) in (i64::from(index)..).zip(bytes) {
            let stored = self.stores.set_byte(region, position, byte);
            if rom != region {
                self.stores.set_byte(rom, position, byte);
            }
            if !stored {
                self.warn_unmapped_write(index, u32::from(byte));
            }
        }
    }

    const fn aligned(&self, address: u32) -> u32 {
        match (self.active.bus.data_width, self.active.bus.alignment) {
            (DataWidth::Word, Alignment::AlwaysAligned) => address & !1,
            _ => address,
        }
    }

    fn compose_word(&mut self, address: u32) -> u16 {
        let mask = self.active.bus.address_mask();
        let first = self.read_byte(address);
        let second = self.read_byte(address.wrapping_add(1) & mask);
        match self.active.bus.endian {
            Endian::Big => u16::from_be_bytes([first, second]),
            Endian::Little => u16::from_le_bytes([first, second]),
        }
    }

    fn split_word(&mut self, address: u32, data: u16) {
        let mask = self.active.bus.address_mask();
        let [first, second] = match self.active.bus.endian {
            Endian::Big => data.to_be_bytes(),
            Endian::Little => data.to_le_bytes(),
        };
        self.write_byte(address, first);
        self.write_byte(address.wrapping_add(1) & mask, second);
    }

    /// Reads a 16-bit value in the bus byte order.
    ///
    /// Byte buses and odd addresses on misaligned word buses compose two
    /// byte reads; aligned word-bus accesses read one cell or call the
    /// device once.
    pub fn read_word(&mut self, address: u32) -> u16 {
        let bus = self.active.bus;
        let address = self.aligned(address & bus.address_mask());
        if bus.data_width == DataWidth::Byte || address & 1 != 0 {
            return self.compose_word(address);
        }
        match self.read_target(address) {
            ReadTarget::Store { base, offset } => self
                .stores
                .cell(base.store, store_index(base, offset, address))
                .unwrap_or_else(|| self.unmapped_word(address)),
            ReadTarget::Unbound(bank) => {
                self.warn_unbound(bank, address);
                0
            }
            ReadTarget::Nop => 0,
            ReadTarget::Unmapped => self.unmapped_word(address),
            ReadTarget::Function { device, offset } => {
                low_half(self.call_read(&device, address.wrapping_sub(offset)))
            }
        }
    }

    /// Writes a 16-bit value in the bus byte order.
    pub fn write_word(&mut self, address: u32, data: u16) {
        let bus = self.active.bus;
        let address = self.aligned(address & bus.address_mask());
        if bus.data_width == DataWidth::Byte || address & 1 != 0 {
            self.split_word(address, data);
            return;
        }
        match self.write_target(address) {
            WriteTarget::Store { base, offset } => {
                if !self
                    .stores
                    .set_cell(base.store, store_index(base, offset, address), data)
                {
                    self.warn_unmapped_write(address, u32::from(data));
                }
            }
            WriteTarget::Unbound(bank) => self.warn_unbound(bank, address),
            WriteTarget::Nop => {}
            WriteTarget::Unmapped => self.warn_unmapped_write(address, u32::from(data)),
            WriteTarget::Rom => self.warn_rom_write(address, u32::from(data)),
            WriteTarget::RamRom => self.write_ram_rom(address, &data.to_le_bytes()),
            WriteTarget::Function { device, offset } => {
                let relative = address.wrapping_sub(offset);
                self.call_write(&device, relative, u32::from(data));
            }
        }
    }

    /// Reads a 32-bit value in the bus byte order.
    ///
    /// Even addresses read two words at `address` and `address + 2`; odd
    /// addresses on misaligned word buses read a byte, a word and a byte.
    pub fn read_dword(&mut self, address: u32) -> u32 {
        let bus = self.active.bus;
        let mask = bus.address_mask();
        let address = self.aligned(address & mask);
        let endian = bus.endian;

        if bus.data_width == DataWidth::Word && address & 1 != 0 {
            let first = u32::from(self.read_byte(address));
            let middle = u32::from(self.read_word(address.wrapping_add(1) & mask));
            let last = u32::from(self.read_byte(address.wrapping_add(3) & mask));
            return match endian {
                Endian::Big => (first << 24) | (middle << 8) | last,
                Endian::Little => first | (middle << 8) | (last << 24),
            };
        }

        let first = u32::from(self.read_word(address));
        let second = u32::from(self.read_word(address.wrapping_add(2) & mask));
        match endian {
            Endian::Big => (first << 16) | second,
            Endian::Little => first | (second << 16),
        }
    }

    /// Writes a 32-bit value in the bus byte order.
    pub fn write_dword(&mut self, address: u32, data: u32) {
        let bus = self.active.bus;
        let mask = bus.address_mask();
        let address = self.aligned(address & mask);
        let [b3, b2, b1, b0] = data.to_be_bytes();

        if bus.data_width == DataWidth::Word && address & 1 != 0 {
            let (first, middle, last) = match bus.endian {
                Endian::Big => (b3, u16::from_be_bytes([b2, b1]), b0),
                Endian::Little => (b0, u16::from_be_bytes([b2, b1]), b3),
            };
            self.write_byte(address, first);
            self.write_word(address.wrapping_add(1) & mask, middle);
            self.write_byte(address.wrapping_add(3) & mask, last);
            return;
        }

        let high = u16::from_be_bytes([b3, b2]);
        let low = u16::from_be_bytes([b1, b0]);
        let (first, second) = match bus.endian {
            Endian::Big => (high, low),
            Endian::Little => (low, high),
        };
        self.write_word(address, first);
        self.write_word(address.wrapping_add(2) & mask, second);
    }
}
