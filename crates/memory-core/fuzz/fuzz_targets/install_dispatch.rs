#![no_main]

use libfuzzer_sys::fuzz_target;
use memory_core::{
    read_callback, write_callback, BusConfig, CpuConfig, Direction, MachineConfig, MemoryPointer,
    MemorySystem, PortReadKind, ReadKind, WriteKind, BUS_16, BUS_16_BEW, BUS_20, BUS_24, BUS_29,
    BUS_32,
};

const PRESETS: [BusConfig; 6] = [BUS_16, BUS_20, BUS_16_BEW, BUS_24, BUS_29, BUS_32];

fn word(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    for (slot, byte) in bytes.iter_mut().zip(data.iter().skip(at)) {
        *slot = *byte;
    }
    u32::from_le_bytes(bytes)
}

fn read_kind(selector: u8) -> ReadKind {
    match selector % 5 {
        0 => ReadKind::Ram,
        1 => ReadKind::Rom,
        2 => ReadKind::Nop,
        3 => ReadKind::Bank(1 + selector % 16),
        _ => ReadKind::Handler(read_callback(|offset| offset.rotate_left(3))),
    }
}

fn write_kind(selector: u8) -> WriteKind {
    match selector % 6 {
        0 => WriteKind::Ram,
        1 => WriteKind::Rom,
        2 => WriteKind::RamRom,
        3 => WriteKind::Nop,
        4 => WriteKind::Bank(1 + selector % 16),
        _ => WriteKind::Handler(write_callback(|_, _| {})),
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let bus = PRESETS[usize::from(data[0]) % PRESETS.len()];
    let window = bus.address_mask().min(0xf_ffff);

    let mut cpu = CpuConfig::new(bus, vec![0; 0x1000]);
    for chunk in data[2..].chunks(9).take(usize::from(data[1] % 12)) {
        let start = word(chunk, 0) & window;
        let end = word(chunk, 4) & window;
        let selector = chunk.get(8).copied().unwrap_or(0);
        cpu = cpu
            .read(start.min(end), start.max(end), read_kind(selector))
            .write(start.min(end), start.max(end), write_kind(selector));
    }
    cpu = cpu.port_read(0, 0xff, PortReadKind::Nop);

    let Ok(mut system) = MemorySystem::new(MachineConfig::new().cpu(cpu)) else {
        return;
    };

    for chunk in data.chunks(5) {
        let address = word(chunk, 0);
        let op = chunk.get(4).copied().unwrap_or(0);
        match op % 10 {
            0 => {
                let _ = system.read_byte(address);
            }
            1 => system.write_byte(address, op),
            2 => {
                let _ = system.read_word(address);
            }
            3 => system.write_word(address, u16::from(op) << 4),
            4 => {
                let _ = system.read_dword(address);
            }
            5 => system.write_dword(address, address.rotate_right(7)),
            6 => {
                let _ = system.change_pc(address);
                let _ = system.read_opcode(address);
                let _ = system.read_opcode_word(address);
            }
            7 => {
                if let Ok(region) = system.region(0) {
                    let _ = system.set_bank_pointer(
                        1 + op % 16,
                        MemoryPointer::new(region, address as usize % 0x2000),
                    );
                }
            }
            8 => {
                let _ = system.read_port(address);
            }
            _ => {
                let _ = system.resolve(0, Direction::Read, address);
                let start = address & window;
                let _ = system.install_write_handler(0, start, start | 0xff, WriteKind::Nop);
            }
        }
    }

    if bus.address_bits() <= 24 {
        let _ = system.memory_map();
    }
});
