//! Headless throughput driver: loads a ROM, executes a fixed instruction
//! budget on either core and reports instructions per second.

use std::time::Instant;
use std::{env, fs, process};

use okto::{Chip8Core, InterpCore};

#[cfg(all(target_arch = "x86_64", unix))]
use okto::JitCore;

const DEFAULT_BUDGET: u64 = 100_000_000;

fn main() -> Result<(), String> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <rom_path> [--interp] [--budget N]", args[0]);
        process::exit(1);
    }

    let rom_path = &args[1];
    let use_interp = args.iter().any(|a| a == "--interp");
    let budget = args
        .iter()
        .position(|a| a == "--budget")
        .and_then(|i| args.get(i + 1))
        .map(|n| n.parse::<u64>().map_err(|e| format!("bad --budget: {e}")))
        .transpose()?
        .unwrap_or(DEFAULT_BUDGET);

    let rom = fs::read(rom_path).map_err(|e| format!("failed to read {rom_path}: {e}"))?;
    let mut core = make_core(use_interp)?;
    core.load_rom(&rom).map_err(|e| e.to_string())?;

    let start = Instant::now();
    let mut total: u64 = 0;
    while total < budget {
        let executed = core.execute();
        if executed == 0 {
            eprintln!("core is idle (awaiting key input), stopping early");
            break;
        }
        total += executed;
    }
    let elapsed = start.elapsed().as_secs_f64();

    println!("Executed {total} instructions in {elapsed:.3} s");
    println!("Instructions per second: {:.0}", total as f64 / elapsed);
    Ok(())
}

#[cfg(all(target_arch = "x86_64", unix))]
fn make_core(use_interp: bool) -> Result<Box<dyn Chip8Core>, String> {
    if use_interp {
        Ok(Box::new(InterpCore::new()))
    } else {
        Ok(Box::new(JitCore::new().map_err(|e| e.to_string())?))
    }
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
fn make_core(_use_interp: bool) -> Result<Box<dyn Chip8Core>, String> {
    Ok(Box::new(InterpCore::new()))
}
