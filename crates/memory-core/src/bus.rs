//! Per-CPU bus geometry: element-map split, data width, byte order and the
//! behavior of unmapped cells.

use crate::error::{MemoryError, Result};

/// Bits addressed by one level-1 block (256 cells).
pub const SUB_BLOCK_BITS: u8 = 8;

/// Address width at which the default unmapped policy switches to [`UnmappedPolicy::Zero`].
pub const SPARSE_BUS_BITS: u32 = 21;

/// Natural transfer unit of the backing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum DataWidth {
    /// 8-bit data bus: stores are addressed byte for byte.
    Byte,
    /// 16-bit data bus: stores hold 16-bit cells in little-endian lane order.
    Word,
}

/// Byte order used when composing wider values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Endian {
    /// Most significant byte at the lowest address.
    Big,
    /// Least significant byte at the lowest address.
    Little,
}

/// How wide accesses treat odd addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Alignment {
    /// Odd word addresses are composed from byte accesses.
    Misaligned,
    /// The CPU never issues odd word addresses; bit 0 is ignored.
    AlwaysAligned,
}

/// Value produced by reads of cells nothing was installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum UnmappedPolicy {
    /// Return whatever the CPU region holds at that address.
    FloatingBus,
    /// Return zero.
    Zero,
}

impl UnmappedPolicy {
    /// Policy used when a bus does not pick one explicitly.
    #[must_use]
    pub const fn for_address_bits(bits: u32) -> Self {
        if bits < SPARSE_BUS_BITS {
            Self::FloatingBus
        } else {
            Self::Zero
        }
    }
}

/// Bus description of one CPU type.
///
/// The address width is `level0_bits + level1_bits + min_bits`. Level 0 is
/// indexed by the top `level0_bits`, level 1 by the next `level1_bits`, and the
/// lowest `min_bits` never select a different handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct BusConfig {
    /// Bits indexing the level-0 table.
    pub level0_bits: u8,
    /// Bits indexing a level-1 block.
    pub level1_bits: u8,
    /// Low address bits below handler granularity.
    pub min_bits: u8,
    /// Transfer unit of the backing stores.
    pub data_width: DataWidth,
    /// Byte order for composed accesses.
    pub endian: Endian,
    /// Odd-address handling for word accesses.
    pub alignment: Alignment,
    /// Behavior of reads from unmapped cells.
    pub unmapped: UnmappedPolicy,
    /// Significant port-number bits.
    pub port_bits: u8,
    /// Addresses are bit addresses; diagnostics report them in bits.
    pub bit_addressed: bool,
    /// Right shift applied to the program counter before opcode-base lookup.
    pub pc_shift: u8,
}

impl BusConfig {
    const fn preset(
        level0_bits: u8,
        level1_bits: u8,
        min_bits: u8,
        data_width: DataWidth,
        endian: Endian,
        alignment: Alignment,
    ) -> Self {
        let bits = level0_bits as u32 + level1_bits as u32 + min_bits as u32;
        Self {
            level0_bits,
            level1_bits,
            min_bits,
            data_width,
            endian,
            alignment,
            unmapped: UnmappedPolicy::for_address_bits(bits),
            port_bits: 16,
            bit_addressed: false,
            pc_shift: 0,
        }
    }

    /// Returns a copy with another unmapped-read policy.
    #[must_use]
    pub const fn with_unmapped(mut self, unmapped: UnmappedPolicy) -> Self {
        self.unmapped = unmapped;
        self
    }

    /// Returns a copy decoding `port_bits` bits of port number.
    #[must_use]
    pub const fn with_port_bits(mut self, port_bits: u8) -> Self {
        self.port_bits = port_bits;
        self
    }

    /// Returns a copy with another byte order.
    #[must_use]
    pub const fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Total address width in bits.
    #[must_use]
    pub const fn address_bits(&self) -> u32 {
        self.level0_bits as u32 + self.level1_bits as u32 + self.min_bits as u32
    }

    /// Mask of valid address bits.
    #[must_use]
    pub const fn address_mask(&self) -> u32 {
        let bits = self.address_bits();
        if bits >= 32 {
            u32::MAX
        } else {
            (1 << bits) - 1
        }
    }

    /// Mask applied to port numbers.
    #[must_use]
    pub const fn port_mask(&self) -> u32 {
        if self.port_bits >= 32 {
            u32::MAX
        } else {
            (1 << self.port_bits) - 1
        }
    }

    /// Shift turning an address into a level-0 index.
    #[must_use]
    pub const fn level0_shift(&self) -> u32 {
        self.level1_bits as u32 + self.min_bits as u32
    }

    /// Number of level-0 cells.
    #[must_use]
    pub const fn level0_len(&self) -> usize {
        1 << self.level0_bits
    }

    /// Mask selecting a level-1 cell from an address shifted by `min_bits`.
    #[must_use]
    pub const fn level1_mask(&self) -> u32 {
        (1 << self.level1_bits) - 1
    }

    /// XOR applied to a byte address to find its lane in a 16-bit cell.
    #[must_use]
    pub const fn byte_lane_xor(&self) -> u32 {
        match (self.data_width, self.endian) {
            (DataWidth::Word, Endian::Big) => 1,
            _ => 0,
        }
    }

    /// Address as it should appear in diagnostics.
    #[must_use]
    pub const fn diagnostic_address(&self, address: u32) -> u64 {
        if self.bit_addressed {
            (address as u64) << 3
        } else {
            address as u64
        }
    }

    /// Checks that the element map can decode this bus.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidGeometry`] naming the first violated limit.
    pub const fn validate(&self, cpu: usize) -> Result<()> {
        let reason = if self.address_bits() == 0 {
            Some("address width is zero")
        } else if self.address_bits() > 32 {
            Some("address width exceeds 32 bits")
        } else if self.level0_bits == 0 {
            Some("level-0 table needs at least one bit")
        } else if self.level0_bits > 24 {
            Some("level-0 table exceeds 24 bits")
        } else if self.level1_bits > SUB_BLOCK_BITS {
            Some("level-1 index exceeds a 256-cell block")
        } else if self.min_bits > 2 {
            Some("handler granularity exceeds 4 bytes")
        } else if self.port_bits == 0 || self.port_bits > 16 {
            Some("port width must be 1 to 16 bits")
        } else if self.pc_shift > 3 {
            Some("program counter shift exceeds 3")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(MemoryError::InvalidGeometry { cpu, reason }),
            None => Ok(()),
        }
    }
}

/// 8-bit CPUs with a 16-bit address bus.
pub const BUS_16: BusConfig = BusConfig::preset(
    12,
    4,
    0,
    DataWidth::Byte,
    Endian::Big,
    Alignment::Misaligned,
);
/// 8-bit CPUs with a 20-bit address bus.
pub const BUS_20: BusConfig = BusConfig::preset(
    12,
    8,
    0,
    DataWidth::Byte,
    Endian::Little,
    Alignment::Misaligned,
);
/// 8-bit CPUs with a 21-bit address bus.
pub const BUS_21: BusConfig = BusConfig::preset(
    13,
    8,
    0,
    DataWidth::Byte,
    Endian::Big,
    Alignment::Misaligned,
);
/// 16-bit big-endian word CPUs with a 16-bit address bus.
pub const BUS_16_BEW: BusConfig = BusConfig::preset(
    12,
    3,
    1,
    DataWidth::Word,
    Endian::Big,
    Alignment::AlwaysAligned,
);
/// 16-bit little-endian word CPUs with a 16-bit address bus.
pub const BUS_16_LEW: BusConfig = BusConfig::preset(
    12,
    3,
    1,
    DataWidth::Word,
    Endian::Little,
    Alignment::AlwaysAligned,
);
/// 16-bit big-endian CPUs with a 24-bit address bus and misaligned access.
pub const BUS_24: BusConfig = BusConfig::preset(
    15,
    8,
    1,
    DataWidth::Word,
    Endian::Big,
    Alignment::Misaligned,
);
/// Bit-addressed little-endian CPUs with a 29-bit address bus.
pub const BUS_29: BusConfig = {
    let mut bus = BusConfig::preset(
        19,
        8,
        2,
        DataWidth::Word,
        Endian::Little,
        Alignment::AlwaysAligned,
    );
    bus.bit_addressed = true;
    bus.pc_shift = 3;
    bus
};
/// 32-bit big-endian CPUs with a 16-bit data path.
pub const BUS_32: BusConfig = BusConfig::preset(
    23,
    8,
    1,
    DataWidth::Word,
    Endian::Big,
    Alignment::Misaligned,
);

const _: () = assert_presets();

const fn assert_presets() {
    assert!(BUS_16.address_bits() == 16, "16-bit preset width");
    assert!(BUS_20.address_bits() == 20, "20-bit preset width");
    assert!(BUS_21.address_bits() == 21, "21-bit preset width");
    assert!(BUS_16_BEW.address_bits() == 16, "16-bit word preset width");
    assert!(BUS_16_LEW.address_bits() == 16, "16-bit word preset width");
    assert!(BUS_24.address_bits() == 24, "24-bit preset width");
    assert!(BUS_29.address_bits() == 29, "29-bit preset width");
    assert!(BUS_32.address_bits() == 32, "32-bit preset width");
    assert!(
        matches!(BUS_16.unmapped, UnmappedPolicy::FloatingBus),
        "narrow buses float by default"
    );
    assert!(
        matches!(BUS_24.unmapped, UnmappedPolicy::Zero),
        "wide buses read zero by default"
    );
}
