//! Dispatch throughput harness for memory-core.
//!
//! Measures accesses per second through the public dispatch entry points
//! with a typical banked 8-bit machine and a 24-bit word machine.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p memory-core --example dispatch_throughput
//! ```
//!
//! Each thread builds its own `MemorySystem`; a system is never shared
//! between threads.

#![allow(clippy::pedantic)]

use log as _;
use memory_core::{
    read_callback, write_callback, CpuConfig, MachineConfig, MemoryPointer, MemorySystem, ReadKind,
    WriteKind, BUS_16, BUS_24,
};
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use tempfile as _;
use thiserror as _;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const NUM_THREADS: usize = 4;
const ACCESSES_PER_BATCH: u32 = 4096;

#[derive(Debug, Clone, Copy)]
struct BenchmarkResult {
    name: &'static str,
    accesses_per_second: f64,
}

fn banked_8bit() -> MemorySystem {
    let status = ReadKind::Handler(read_callback(|offset| offset));
    let control = WriteKind::Handler(write_callback(|_, _| {}));
    let cpu = CpuConfig::new(BUS_16, vec![0; 0x1_0000])
        .read(0x0000, 0x7fff, ReadKind::Rom)
        .read(0x8000, 0xbfff, ReadKind::Bank(1))
        .read(0xd000, 0xd0ff, status)
        .read(0xc000, 0xffff, ReadKind::Ram)
        .write(0x0000, 0x7fff, WriteKind::Rom)
        .write(0xd000, 0xd0ff, control)
        .write(0xc000, 0xffff, WriteKind::Ram);
    MemorySystem::new(MachineConfig::new().cpu(cpu)).expect("banked machine")
}

fn word_24bit() -> MemorySystem {
    let cpu = CpuConfig::new(BUS_24, vec![0; 0x8_0000])
        .read(0x00_0000, 0x07_ffff, ReadKind::Rom)
        .read(0xff_0000, 0xff_ffff, ReadKind::Ram)
        .write(0xff_0000, 0xff_ffff, WriteKind::Ram);
    MemorySystem::new(MachineConfig::new().cpu(cpu)).expect("word machine")
}

fn byte_workload(system: &mut MemorySystem, round: u32) -> u64 {
    let mut checksum = 0_u32;
    for step in 0..ACCESSES_PER_BATCH {
        let address = step.wrapping_mul(97) & 0xffff;
        checksum = checksum.wrapping_add(u32::from(system.read_byte(address)));
        system.write_byte(0xc000 | (address & 0x3fff), checksum as u8);
    }
    if round % 64 == 0 {
        if let Ok(region) = system.region(0) {
            let page = (round / 64) % 4;
            system
                .set_bank_pointer(1, MemoryPointer::new(region, page as usize * 0x4000))
                .ok();
        }
    }
    std::hint::black_box(checksum);
    u64::from(ACCESSES_PER_BATCH) * 2
}

fn word_workload(system: &mut MemorySystem, _round: u32) -> u64 {
    let mut checksum = 0_u32;
    for step in 0..ACCESSES_PER_BATCH {
        let address = 0xff_0000 | (step.wrapping_mul(4) & 0xfffc);
        checksum = checksum.wrapping_add(system.read_dword(address));
        system.write_word(address, checksum as u16);
    }
    std::hint::black_box(checksum);
    u64::from(ACCESSES_PER_BATCH) * 2
}

fn benchmark(
    name: &'static str,
    duration: Duration,
    build: fn() -> MemorySystem,
    workload: fn(&mut MemorySystem, u32) -> u64,
) -> BenchmarkResult {
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let tx = tx.clone();
            thread::spawn(move || {
                let mut system = build();
                let mut total_accesses = 0u64;
                let mut round = 0u32;
                let start = Instant::now();

                while start.elapsed() < duration {
                    total_accesses += workload(&mut system, round);
                    round = round.wrapping_add(1);
                }

                tx.send(total_accesses).ok();
            })
        })
        .collect();

    for h in handles {
        h.join().ok();
    }

    drop(tx);

    let total_accesses: u64 = rx.iter().sum();
    BenchmarkResult {
        name,
        accesses_per_second: total_accesses as f64 / duration.as_secs_f64(),
    }
}

fn format_number(n: f64) -> String {
    if n >= 1_000_000.0 {
        format!("{:.2}M", n / 1_000_000.0)
    } else if n >= 1_000.0 {
        format!("{:.2}K", n / 1_000.0)
    } else {
        format!("{:.2}", n)
    }
}

fn print_results(results: &[BenchmarkResult]) {
    println!("\nmemory-core dispatch throughput ({NUM_THREADS} threads)");
    println!("{:14} {:>15}", "Benchmark", "Accesses/sec");
    for result in results {
        println!(
            "{:14} {:>15}",
            result.name,
            format_number(result.accesses_per_second)
        );
    }
}

fn main() {
    let warmup = Duration::from_millis(500);
    let duration = Duration::from_secs(3);

    println!("Running warmup for {:?}...", warmup);
    let _ = benchmark("warmup", warmup, banked_8bit, byte_workload);

    println!("Running benchmarks for {:?} each...", duration);
    let byte_result = benchmark("banked_8bit", duration, banked_8bit, byte_workload);
    let word_result = benchmark("word_24bit", duration, word_24bit, word_workload);

    print_results(&[byte_result, word_result]);
}
