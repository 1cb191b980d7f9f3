//! Dispatch suite: bank switching, unmapped policies, word composition,
//! device callbacks and opcode fetch across the bus presets.

#![allow(
    clippy::pedantic,
    clippy::nursery,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

use std::cell::RefCell;
use std::rc::Rc;

use log as _;
use memory_core::{
    combine_word, read_callback, read_device, write_callback, write_device, BusConfig, CpuConfig,
    Direction, HandlerId, MachineConfig, MemoryPointer, MemorySystem, OpcodeBaseOutcome,
    ReadHandler, ReadKind, UnmappedPolicy, WriteHandler, WriteKind, BUS_16, BUS_16_BEW, BUS_16_LEW,
    BUS_20, BUS_21, BUS_24, BUS_29, BUS_32,
};
use proptest as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use tempfile as _;
use thiserror as _;

fn patterned_region() -> Vec<u8> {
    (0..0x1_0000_u32).map(|i| (i * 7 + 3) as u8).collect()
}

fn build(cpu: CpuConfig) -> MemorySystem {
    MemorySystem::new(MachineConfig::new().cpu(cpu)).expect("setup")
}

fn ram_system(bus: BusConfig) -> MemorySystem {
    build(
        CpuConfig::new(bus, patterned_region())
            .read(0x0000, 0xffff, ReadKind::Ram)
            .write(0x0000, 0xffff, WriteKind::Ram),
    )
}

#[test]
fn bank_pointer_changes_are_visible_immediately() {
    let mut system = build(
        CpuConfig::new(BUS_16, vec![0; 0x1_0000])
            .read(0x8000, 0xbfff, ReadKind::Bank(1))
            .write(0x8000, 0xbfff, WriteKind::Bank(1)),
    );
    let paged: Vec<u8> = (0..0x8000_u32).map(|i| (i >> 8) as u8 ^ 0x5a).collect();
    let store = system.add_store(paged.clone());

    system
        .set_bank_pointer(1, MemoryPointer::new(store, 0))
        .expect("bank");
    assert_eq!(system.read_byte(0x8005), paged[5]);

    system
        .set_bank_pointer(1, MemoryPointer::new(store, 0x4000))
        .expect("bank");
    assert_eq!(system.read_byte(0x8005), paged[0x4005]);

    system.write_byte(0x8010, 0xee);
    assert_eq!(system.stores().store(store).expect("store")[0x4010], 0xee);
}

#[rstest]
#[case::narrow_zero(BUS_16.with_unmapped(UnmappedPolicy::Zero))]
#[case::wide_default(BUS_21)]
#[case::word_default(BUS_24)]
#[case::bit_addressed(BUS_29)]
fn unmapped_reads_return_zero_and_writes_are_dropped(#[case] bus: BusConfig) {
    let mut system = build(CpuConfig::new(bus, patterned_region()));
    let region = system.region(0).expect("region");
    let before = system.stores().store(region).expect("store").to_vec();

    assert_eq!(system.read_byte(0x1234), 0);
    assert_eq!(system.read_word(0x1234), 0);
    assert_eq!(system.read_dword(0x1234), 0);
    system.write_byte(0x1234, 0xaa);
    system.write_word(0x1236, 0xbbbb);
    system.write_dword(0x1238, 0xcccc_cccc);

    assert_eq!(system.stores().store(region).expect("store"), &before[..]);
}

#[test]
fn floating_bus_reads_the_region_byte() {
    let mut system = build(CpuConfig::new(BUS_16, patterned_region()));
    assert_eq!(system.read_byte(0x0100), patterned_region()[0x0100]);
    assert_eq!(system.read_byte(0xffff), patterned_region()[0xffff]);
}

#[rstest]
#[case::big(BUS_16_BEW, [1, 0])]
#[case::little(BUS_16_LEW, [0, 1])]
fn floating_word_buses_read_region_cells(#[case] bus: BusConfig, #[case] lanes: [usize; 2]) {
    let region: Vec<u8> = (0..0x1_0000_u32).map(|i| i as u8).collect();
    let mut system = build(CpuConfig::new(bus, region.clone()));
    for address in [0x0010_u32, 0x0124, 0x8000] {
        let base = address as usize;
        let cell = u16::from_le_bytes([region[base], region[base + 1]]);
        assert_eq!(system.read_word(address), cell);
        assert_eq!(system.read_byte(address), region[base + lanes[0]]);
        assert_eq!(system.read_byte(address + 1), region[base + lanes[1]]);
    }
}

#[rstest]
#[case::bus_16(BUS_16)]
#[case::bus_20(BUS_20)]
#[case::bus_21(BUS_21)]
#[case::bus_16_bew(BUS_16_BEW)]
#[case::bus_16_lew(BUS_16_LEW)]
#[case::bus_24(BUS_24)]
#[case::bus_32(BUS_32)]
fn aligned_words_and_dwords_round_trip(#[case] bus: BusConfig) {
    let mut system = ram_system(bus);
    for address in [0x0000_u32, 0x0010, 0x7ffc, 0xfffc] {
        system.write_word(address, 0xbeef);
        assert_eq!(system.read_word(address), 0xbeef);
        system.write_dword(address, 0x1234_5678);
        assert_eq!(system.read_dword(address), 0x1234_5678);
    }
}

#[rstest]
#[case::bus_16(BUS_16)]
#[case::bus_20(BUS_20)]
#[case::bus_24(BUS_24)]
#[case::bus_32(BUS_32)]
fn odd_words_compose_bytes_in_bus_order(#[case] bus: BusConfig) {
    let mut system = ram_system(bus);
    for address in [0x0001_u32, 0x0123, 0x8001] {
        let first = u16::from(system.read_byte(address));
        let second = u16::from(system.read_byte(address + 1));
        let expected = match bus.endian {
            memory_core::Endian::Big => (first << 8) | second,
            memory_core::Endian::Little => first | (second << 8),
        };
        assert_eq!(system.read_word(address), expected);
    }
}

#[test]
fn misaligned_dwords_on_word_buses_round_trip() {
    let mut system = ram_system(BUS_24);
    system.write_dword(0x0101, 0xa1b2_c3d4);
    assert_eq!(system.read_byte(0x0101), 0xa1);
    assert_eq!(system.read_byte(0x0102), 0xb2);
    assert_eq!(system.read_byte(0x0103), 0xc3);
    assert_eq!(system.read_byte(0x0104), 0xd4);
    assert_eq!(system.read_dword(0x0101), 0xa1b2_c3d4);
}

#[test]
fn external_ram_is_reached_through_a_direct_slot() {
    let mut system = build(
        CpuConfig::new(BUS_24, vec![0; 0x1000])
            .read(0xff_0000, 0xff_ffff, ReadKind::Ram)
            .write(0xff_0000, 0xff_ffff, WriteKind::Ram),
    );
    let region = system.region(0).expect("region");
    let before = system.stores().store(region).expect("store").to_vec();

    system.write_word(0xff_0010, 0xbeef);
    system.write_dword(0xff_0040, 0x1234_5678);
    system.write_dword(0xff_0021, 0xa1b2_c3d4);
    assert_eq!(system.read_word(0xff_0010), 0xbeef);
    assert_eq!(system.read_dword(0xff_0040), 0x1234_5678);
    assert_eq!(system.read_dword(0xff_0021), 0xa1b2_c3d4);
    assert_eq!(system.read_byte(0xff_0021), 0xa1);
    assert_eq!(system.read_byte(0xff_0024), 0xd4);

    assert_eq!(system.stores().store(region).expect("store"), &before[..]);
    for direction in [Direction::Read, Direction::Write] {
        let id = system.resolve(0, direction, 0xff_0021).expect("resolve");
        assert!(id >= HandlerId::FIRST_FUNCTION);
    }
}

#[test]
fn always_aligned_buses_ignore_bit_zero() {
    let mut system = ram_system(BUS_16_BEW);
    system.write_word(0x0021, 0x1234);
    assert_eq!(system.read_word(0x0020), 0x1234);
    assert_eq!(system.read_word(0x0021), 0x1234);
}

#[rstest]
#[case::big(BUS_16_BEW, [0x12, 0x34])]
#[case::little(BUS_16_LEW, [0x34, 0x12])]
fn word_bus_bytes_follow_the_byte_order(#[case] bus: BusConfig, #[case] bytes: [u8; 2]) {
    let mut system = ram_system(bus);
    system.write_word(0x0040, 0x1234);
    assert_eq!([system.read_byte(0x0040), system.read_byte(0x0041)], bytes);
    let region = system.region(0).expect("region");
    assert_eq!(
        &system.stores().store(region).expect("store")[0x40..0x42],
        &[0x34, 0x12]
    );
}

#[test]
fn byte_buses_store_bytes_in_address_order() {
    let mut system = ram_system(BUS_16);
    system.write_word(0x0040, 0x1234);
    let region = system.region(0).expect("region");
    assert_eq!(
        &system.stores().store(region).expect("store")[0x40..0x42],
        &[0x12, 0x34]
    );
    system.write_dword(0x0050, 0x0102_0304);
    assert_eq!(
        &system.stores().store(region).expect("store")[0x50..0x54],
        &[1, 2, 3, 4]
    );
}

#[test]
fn rom_writes_are_discarded() {
    let mut system = build(
        CpuConfig::new(BUS_16, patterned_region())
            .read(0x0000, 0xffff, ReadKind::Rom)
            .write(0x0000, 0x7fff, WriteKind::Rom)
            .write(0x8000, 0xffff, WriteKind::Ram),
    );
    let original = system.read_byte(0x1000);
    system.write_byte(0x1000, original.wrapping_add(1));
    assert_eq!(system.read_byte(0x1000), original);
    system.write_byte(0x9000, 0x42);
    assert_eq!(system.read_byte(0x9000), 0x42);
}

#[test]
fn ram_rom_writes_reach_the_opcode_store() {
    let mut system = build(
        CpuConfig::new(BUS_16, vec![0; 0x1_0000])
            .read(0x0000, 0xffff, ReadKind::Ram)
            .write(0x0000, 0x0fff, WriteKind::RamRom),
    );
    let decrypted = system.add_store(vec![0; 0x1_0000]);
    system.set_opcode_rom(0, decrypted).expect("opcode rom");
    system.switch_context(0).expect("switch");

    system.write_byte(0x0123, 0x99);
    system.write_word(0x0200, 0xabcd);
    let region = system.region(0).expect("region");
    for store in [region, decrypted] {
        let bytes = system.stores().store(store).expect("store");
        assert_eq!(bytes[0x0123], 0x99);
        assert_eq!(&bytes[0x0200..0x0202], &[0xab, 0xcd]);
    }
    assert_eq!(
        system.set_opcode_base(0x0123),
        OpcodeBaseOutcome::Updated(HandlerId::RAM)
    );
    assert_eq!(system.read_opcode(0x0123), 0x99);
}

struct LatchedWord {
    value: u16,
    history: Rc<RefCell<Vec<(u32, u32, u16)>>>,
}

impl WriteHandler for LatchedWord {
    fn write(&mut self, offset: u32, data: u32) {
        self.value = combine_word(self.value, data);
        self.history.borrow_mut().push((offset, data, self.value));
    }
}

struct FixedWord {
    value: u32,
    offsets: Rc<RefCell<Vec<u32>>>,
}

impl ReadHandler for FixedWord {
    fn read(&mut self, offset: u32) -> u32 {
        self.offsets.borrow_mut().push(offset);
        self.value
    }
}

#[test]
fn word_bus_byte_writes_carry_a_lane_mask() {
    let history = Rc::new(RefCell::new(Vec::new()));
    let latch = LatchedWord {
        value: 0x1234,
        history: Rc::clone(&history),
    };
    let mut system = build(CpuConfig::new(BUS_16_BEW, vec![0; 0x1_0000]));
    system
        .install_write_handler(0, 0x4000, 0x4001, WriteKind::Handler(write_device(latch)))
        .expect("install");

    system.write_byte(0x4001, 0xab);
    system.write_byte(0x4000, 0xcd);
    system.write_word(0x4000, 0x5678);
    assert_eq!(
        *history.borrow(),
        vec![
            (0, 0xff00_00ab, 0x12ab),
            (0, 0x00ff_cd00, 0xcdab),
            (0, 0x5678, 0x5678),
        ]
    );
}

#[rstest]
#[case::big(BUS_16_BEW, 0x12, 0x34)]
#[case::little(BUS_16_LEW, 0x34, 0x12)]
fn word_bus_byte_reads_pick_the_lane(#[case] bus: BusConfig, #[case] even: u8, #[case] odd: u8) {
    let offsets = Rc::new(RefCell::new(Vec::new()));
    let device = read_device(FixedWord {
        value: 0xffff_1234,
        offsets: Rc::clone(&offsets),
    });
    let cpu = CpuConfig::new(bus, vec![0; 0x1_0000]);
    let mut system = build(cpu.read(0x2000, 0x2fff, ReadKind::Handler(device)));
    assert_eq!(system.read_byte(0x2010), even);
    assert_eq!(system.read_byte(0x2011), odd);
    assert_eq!(system.read_word(0x2010), 0x1234);
    assert_eq!(*offsets.borrow(), vec![0x10, 0x10, 0x10]);
}

#[test]
fn byte_bus_callbacks_see_range_relative_offsets() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let reader = read_callback(|offset| offset + 0x100);
    let writer = write_callback(move |offset, data| {
        sink.borrow_mut().push((offset, data));
    });
    let mut system = build(
        CpuConfig::new(BUS_16, vec![0; 0x1_0000])
            .read(0xd000, 0xd0ff, ReadKind::Handler(reader))
            .write(0xd000, 0xd0ff, WriteKind::Handler(writer)),
    );
    assert_eq!(system.read_byte(0xd020), 0x20);
    system.write_byte(0xd031, 0x7f);
    system.write_word(0xd040, 0x0102);
    assert_eq!(
        *log.borrow(),
        vec![(0x31, 0x7f), (0x40, 0x01), (0x41, 0x02)]
    );
}

#[test]
fn bank_handlers_can_be_rebound_at_runtime() {
    let mut system = build(
        CpuConfig::new(BUS_16, patterned_region())
            .read(0x4000, 0x7fff, ReadKind::Bank(1))
            .write(0x4000, 0x7fff, WriteKind::Bank(1)),
    );
    let banked = system.read_byte(0x4000);
    assert_eq!(banked, patterned_region()[0x4000]);

    system
        .set_bank_read_handler(1, ReadKind::Nop)
        .expect("rebind");
    assert_eq!(system.read_byte(0x4000), 0);

    system
        .set_bank_read_handler(1, ReadKind::Handler(read_callback(|offset| offset ^ 0xff)))
        .expect("rebind");
    assert_eq!(system.read_byte(0x4001), 0xfe);

    system
        .set_bank_write_handler(1, WriteKind::Rom)
        .expect("rebind");
    system.write_byte(0x4000, banked.wrapping_add(1));
    system
        .set_bank_read_handler(1, ReadKind::Bank(1))
        .expect("rebind");
    assert_eq!(system.read_byte(0x4000), banked);
}

#[test]
fn banks_without_backing_read_zero() {
    let cpu = CpuConfig::new(BUS_16, patterned_region()).read(0x4000, 0x7fff, ReadKind::Bank(1));
    let mut system = build(cpu);
    system
        .set_bank_read_handler(1, ReadKind::Bank(9))
        .expect("rebind");
    assert_eq!(system.read_byte(0x4000), 0);
}

#[test]
fn each_cpu_dispatches_through_its_own_maps() {
    let mut system = MemorySystem::new(
        MachineConfig::new()
            .cpu(
                CpuConfig::new(BUS_16, vec![0x11; 0x1_0000])
                    .read(0x0000, 0xffff, ReadKind::Ram)
                    .write(0x0000, 0xffff, WriteKind::Ram),
            )
            .cpu(
                CpuConfig::new(BUS_16, vec![0x22; 0x1_0000])
                    .read(0x0000, 0xffff, ReadKind::Ram)
                    .write(0x0000, 0xffff, WriteKind::Ram),
            ),
    )
    .expect("setup");
    assert_eq!(system.read_byte(0x0100), 0x11);
    system.switch_context(1).expect("switch");
    assert_eq!(system.read_byte(0x0100), 0x22);
    system.write_byte(0x0100, 0x33);
    system.switch_context(0).expect("switch");
    assert_eq!(system.read_byte(0x0100), 0x11);
}

#[test]
fn opcode_base_tracks_banks_across_rebinds() {
    let mut system = build(
        CpuConfig::new(BUS_16, vec![0; 0x1_0000])
            .read(0x0000, 0x7fff, ReadKind::Rom)
            .read(0x8000, 0xffff, ReadKind::Bank(1)),
    );
    let first = system.add_store(vec![0xa0; 0x8000]);
    let second = system.add_store(vec![0xb0; 0x8000]);
    system
        .set_bank_pointer(1, MemoryPointer::new(first, 0))
        .expect("bank");
    let bank = HandlerId::bank(1).expect("bank");
    assert_eq!(
        system.change_pc(0x8000),
        Some(OpcodeBaseOutcome::Updated(bank))
    );
    assert_eq!(system.read_opcode(0x8000), 0xa0);

    system
        .set_bank_pointer(1, MemoryPointer::new(second, 0))
        .expect("bank");
    assert_eq!(system.read_opcode(0x8000), 0xb0);
    assert_eq!(system.read_opcode_word(0x8000), 0xb0b0);
}
