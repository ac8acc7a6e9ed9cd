//! The translator core: looks up the block for the current guest pc,
//! compiles one on a miss, dispatches into the code cache and reports how
//! many guest opcodes actually ran.

mod asm;
mod block;
mod cache;
mod disasm;
mod emitter;

use std::io;

use crate::error::CoreResult;
use crate::quirks::Quirks;
use crate::state::{ChipState, SCR_HEIGHT};
use crate::Chip8Core;
use block::{BlockTable, JitBlock};
use cache::CodeCache;
use emitter::Emitter;

/// Executable arena size.
const CACHE_SIZE: usize = 256 * 1024;
/// Compiling past this point resets the cache first; no block comes close
/// to the remaining 20%.
const CACHE_CLEAR_THRESHOLD: usize = CACHE_SIZE / 5 * 4;
/// Guest opcodes per block, except in slow mode.
const BLOCK_MAX_INSTR: u64 = 64;

pub struct JitCore {
    state: Box<ChipState>,
    table: Box<BlockTable>,
    cache: CodeCache,
    emitter: Emitter,
    quirks: Quirks,
    rom_loaded: bool,
    instructions_per_block: u64,
}

impl JitCore {
    pub fn new() -> CoreResult<Self> {
        Ok(JitCore {
            state: Box::new(ChipState::new()),
            table: BlockTable::new(),
            cache: CodeCache::new(CACHE_SIZE)?,
            emitter: Emitter::new(),
            quirks: Quirks::default(),
            rom_loaded: false,
            instructions_per_block: BLOCK_MAX_INSTR,
        })
    }

    /// Drops every compiled block.
    pub fn clear_cache(&mut self) {
        self.cache.reset();
        self.table.reset();
    }

    /// Slow mode caps blocks at a single opcode, which keeps the JIT's
    /// visible stepping granularity close to the interpreter's.
    pub fn set_slow_mode(&mut self, enable: bool) {
        self.instructions_per_block = if enable { 1 } else { BLOCK_MAX_INSTR };
        log::info!("slow mode {}", if enable { "on" } else { "off" });
        self.clear_cache();
    }

    /// Mutable guest access for test setups (pre-seeding RAM, rewinding
    /// pc). Callers touching code that may already be compiled should
    /// `clear_cache` afterwards.
    pub fn state_mut(&mut self) -> &mut ChipState {
        &mut self.state
    }

    /// Writes a disassembly listing of every valid block.
    pub fn dump_code<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        for b in &self.table.blocks {
            if !self.table.map[(b.start_pc & 0xFFF) as usize].valid {
                continue;
            }
            writeln!(
                out,
                "block {:#06X}-{:#06X} ({} bytes at offset {})",
                b.start_pc, b.end_pc, b.cache_size, b.cache_offset
            )?;
            writeln!(out, "--------------------------------")?;
            let code = self.cache.code(b.cache_offset as usize, b.cache_size as usize);
            disasm::write_listing(out, code)?;
            writeln!(out)?;
        }
        Ok(())
    }

    fn compile_block(&mut self) -> u64 {
        let start_pc = self.state.pc & 0xFFF;
        self.state.pc = start_pc;

        self.emitter.begin_block(self.quirks);
        self.analyze_block();
        self.emitter.allocate_regs();
        self.emit_block();
        self.emitter.emit_epilogue();
        let code = self.emitter.take_code();
        let end_pc = self.state.pc;

        if self.cache.size() >= CACHE_CLEAR_THRESHOLD || code.len() > self.cache.remaining() {
            log::info!("code cache at {} bytes, resetting", self.cache.size());
            self.clear_cache();
        }

        let entry = &mut self.table.map[start_pc as usize];
        entry.valid = true;
        if entry.block < 0 {
            entry.block = self.table.blocks.len() as i16;
            self.table.blocks.push(JitBlock::new(start_pc));
        }
        let idx = entry.block as usize;

        let offset = self.cache.append(&code);
        let b = &mut self.table.blocks[idx];
        b.end_pc = end_pc;
        b.cache_offset = offset as u32;
        b.cache_size = code.len() as u32;

        log::debug!(
            "compiled block {:#06X}-{:#06X}: {} bytes at offset {}",
            start_pc,
            end_pc,
            code.len(),
            offset
        );

        self.cache.call(offset)
    }

    /// Whether the skip at `pc - 2` may be fused with the instruction at
    /// `pc`. Control-flow terminators need the block to end, and a second
    /// skip would need its own landing label inside the first one's span,
    /// which also breaks the retired-count identity; both fall back to the
    /// `pc += 2` form.
    fn fuses_with_next(&self, pc: u16) -> bool {
        let opcode = self.state.opcode_at(pc);
        match opcode & 0xF000 {
            0x0000 => opcode & 0x0FFF != 0x00EE,
            0x1000 | 0x2000 | 0xB000 => false,
            0x3000 | 0x4000 => false,
            0x5000 | 0x9000 => opcode & 0xF != 0,
            0xE000 => !matches!(opcode & 0xFF, 0x9E | 0xA1),
            _ => true,
        }
    }

    /// Counts V/I usage over the opcodes the codegen pass will consume and
    /// pre-counts the fused skips, so register allocation and the prologue
    /// see the whole block. Mirrors `emit_block`'s control flow exactly.
    fn analyze_block(&mut self) {
        let limit = self.instructions_per_block;
        let quirks = self.quirks;
        let mut pc = self.state.pc;
        let mut count = 0u64;
        let mut pending_fuse = false;

        while count < limit || pending_fuse {
            pending_fuse = false;
            let opcode = self.state.opcode_at(pc);
            let x = ((opcode >> 8) & 0xF) as usize;
            let y = ((opcode >> 4) & 0xF) as usize;
            pc = pc.wrapping_add(2) & 0xFFF;
            count += 1;

            let e = &mut self.emitter;
            match opcode & 0xF000 {
                0x0000 => {
                    if opcode & 0x0FFF == 0x0EE {
                        return;
                    }
                }
                0x1000 | 0x2000 => return,
                0x3000 | 0x4000 => {
                    e.v_usage[x] += 1;
                    if self.fuses_with_next(pc) {
                        self.emitter.block_branches += 1;
                        pending_fuse = true;
                    } else {
                        return;
                    }
                }
                0x5000 | 0x9000 => {
                    if opcode & 0xF == 0 {
                        e.v_usage[x] += 1;
                        e.v_usage[y] += 1;
                        if self.fuses_with_next(pc) {
                            self.emitter.block_branches += 1;
                            pending_fuse = true;
                        } else {
                            return;
                        }
                    }
                }
                0x6000 | 0x7000 | 0xC000 => e.v_usage[x] += 1,
                0x8000 => match opcode & 0x000F {
                    0x0 => {
                        e.v_usage[x] += 1;
                        e.v_usage[y] += 1;
                    }
                    0x1..=0x3 => {
                        e.v_usage[x] += 1;
                        e.v_usage[y] += 1;
                        if quirks.vf_reset {
                            e.v_usage[0xF] += 1;
                        }
                    }
                    0x4 | 0x5 | 0x7 => {
                        e.v_usage[x] += 1;
                        e.v_usage[y] += 1;
                        e.v_usage[0xF] += 1;
                    }
                    0x6 | 0xE => {
                        e.v_usage[x] += 1;
                        e.v_usage[0xF] += 1;
                        if !quirks.shifting {
                            e.v_usage[y] += 1;
                        }
                    }
                    _ => {}
                },
                0xA000 => e.i_usage += 1,
                0xB000 => {
                    e.v_usage[if quirks.jumping { x } else { 0 }] += 1;
                    return;
                }
                0xD000 => {
                    e.v_usage[x] += 1;
                    e.v_usage[y] += 1;
                    e.i_usage += 1;
                }
                0xE000 => {
                    if matches!(opcode & 0xFF, 0x9E | 0xA1) {
                        e.v_usage[x] += 1;
                        if self.fuses_with_next(pc) {
                            self.emitter.block_branches += 1;
                            pending_fuse = true;
                        } else {
                            return;
                        }
                    }
                }
                0xF000 => match opcode & 0x00FF {
                    0x07 | 0x15 | 0x18 => e.v_usage[x] += 1,
                    0x0A => return,
                    0x1E | 0x29 | 0x33 => {
                        e.i_usage += 1;
                        e.v_usage[x] += 1;
                    }
                    0x55 | 0x65 => {
                        e.i_usage += 1;
                        for r in 0..=x {
                            e.v_usage[r] += 1;
                        }
                        if opcode & 0xFF == 0x55 {
                            return;
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    /// One codegen pass over the same opcode window, consuming guest pc as
    /// it goes. Unknown opcodes emit nothing and count as executed NOPs.
    fn emit_block(&mut self) {
        let state_ptr: *mut ChipState = &mut *self.state;
        let table_ptr: *mut BlockTable = &mut *self.table;
        self.emitter.emit_prologue(state_ptr);

        let limit = self.instructions_per_block;
        // Landing label of the previous opcode's fused skip, bound after
        // the current opcode's code.
        let mut pending: Option<asm::Label> = None;

        while self.emitter.instructions < limit || pending.is_some() {
            let opcode = self.state.opcode_at(self.state.pc);
            let x = ((opcode >> 8) & 0xF) as u8;
            let y = ((opcode >> 4) & 0xF) as u8;
            let nn = (opcode & 0x00FF) as u8;
            let nnn = opcode & 0x0FFF;
            self.state.pc = self.state.pc.wrapping_add(2) & 0xFFF;
            self.emitter.instructions += 1;

            let fuse = |core: &Self| core.fuses_with_next(core.state.pc);
            let mut ended = false;
            let mut fused: Option<asm::Label> = None;

            match opcode & 0xF000 {
                0x0000 => match opcode & 0x0FFF {
                    0x0E0 => self.emitter.emit_00e0(),
                    0x0EE => {
                        self.emitter.emit_00ee();
                        ended = true;
                    }
                    _ => {}
                },
                0x1000 => {
                    self.emitter.emit_1nnn(nnn);
                    ended = true;
                }
                0x2000 => {
                    self.emitter.emit_2nnn(nnn);
                    ended = true;
                }
                0x3000 => {
                    let f = fuse(self);
                    fused = self.emitter.emit_3xnn(x, nn, f);
                    ended = !f;
                }
                0x4000 => {
                    let f = fuse(self);
                    fused = self.emitter.emit_4xnn(x, nn, f);
                    ended = !f;
                }
                0x5000 => {
                    if opcode & 0xF == 0 {
                        let f = fuse(self);
                        fused = self.emitter.emit_5xy0(x, y, f);
                        ended = !f;
                    }
                }
                0x6000 => self.emitter.emit_6xnn(x, nn),
                0x7000 => self.emitter.emit_7xnn(x, nn),
                0x8000 => match opcode & 0x000F {
                    0x0 => self.emitter.emit_8xy0(x, y),
                    0x1 => self.emitter.emit_8xy1(x, y),
                    0x2 => self.emitter.emit_8xy2(x, y),
                    0x3 => self.emitter.emit_8xy3(x, y),
                    0x4 => self.emitter.emit_8xy4(x, y),
                    0x5 => self.emitter.emit_8xy5(x, y),
                    0x6 => self.emitter.emit_8xy6(x, y),
                    0x7 => self.emitter.emit_8xy7(x, y),
                    0xE => self.emitter.emit_8xye(x, y),
                    _ => {}
                },
                0x9000 => {
                    if opcode & 0xF == 0 {
                        let f = fuse(self);
                        fused = self.emitter.emit_9xy0(x, y, f);
                        ended = !f;
                    }
                }
                0xA000 => self.emitter.emit_annn(nnn),
                0xB000 => {
                    self.emitter.emit_bnnn(nnn, x);
                    ended = true;
                }
                0xC000 => self.emitter.emit_cxnn(x, nn),
                0xD000 => self.emitter.emit_dxyn(x, y, (opcode & 0xF) as u8),
                0xE000 => match opcode & 0x00FF {
                    0x9E => {
                        let f = fuse(self);
                        fused = self.emitter.emit_ex9e(x, f);
                        ended = !f;
                    }
                    0xA1 => {
                        let f = fuse(self);
                        fused = self.emitter.emit_exa1(x, f);
                        ended = !f;
                    }
                    _ => {}
                },
                0xF000 => match opcode & 0x00FF {
                    0x07 => self.emitter.emit_fx07(x),
                    0x0A => {
                        self.emitter.emit_fx0a(x);
                        ended = true;
                    }
                    0x15 => self.emitter.emit_fx15(x),
                    0x18 => self.emitter.emit_fx18(x),
                    0x1E => self.emitter.emit_fx1e(x),
                    0x29 => self.emitter.emit_fx29(x),
                    0x33 => self.emitter.emit_fx33(x),
                    0x55 => {
                        self.emitter.emit_fx55(x, table_ptr);
                        ended = true;
                    }
                    0x65 => self.emitter.emit_fx65(x),
                    _ => {}
                },
                _ => {}
            }

            // The previous fused skip lands after this opcode, whether or
            // not this opcode terminated the block.
            if let Some(label) = pending.take() {
                self.emitter.bind_skip_label(label);
            }
            pending = fused;

            if ended {
                return;
            }
        }
    }
}

impl Chip8Core for JitCore {
    fn load_rom(&mut self, rom: &[u8]) -> CoreResult<()> {
        self.state.load_rom(rom)?;
        self.clear_cache();
        self.rom_loaded = true;
        Ok(())
    }

    fn execute(&mut self) -> u64 {
        if !self.rom_loaded || self.state.awaiting_key() {
            return 0;
        }

        let entry = self.table.map[(self.state.pc & 0xFFF) as usize];
        if !entry.valid {
            return self.compile_block();
        }

        let b = self.table.blocks[entry.block as usize];
        self.state.pc = b.end_pc;
        self.cache.call(b.cache_offset as usize)
    }

    fn set_key(&mut self, key: u8, pressed: bool) {
        self.state.set_key(key, pressed);
    }

    fn reset_keys(&mut self) {
        self.state.reset_keys();
    }

    fn update_timers(&mut self) {
        self.state.update_timers();
    }

    fn screen_buffer(&self) -> &[u64; SCR_HEIGHT] {
        &self.state.screen
    }

    fn state(&self) -> &ChipState {
        &self.state
    }

    fn set_quirks(&mut self, quirks: Quirks) {
        self.quirks = quirks;
        self.clear_cache();
    }
}
