//! Lowers individual guest opcodes to x86-64 at the current block's buffer,
//! managing per-block promotion of guest registers into host registers.
//!
//! Register conventions (System V):
//! - `r11`: Guest State base pointer, live for the whole block.
//! - `r10`: branch-skip accumulator, zeroed in the prologue when the block
//!   contains fused skips.
//! - `rbx, rbp, r12, r13, r14`: promotion slots for V registers
//!   (callee-saved, pushed in the prologue). VF claims the first slot.
//! - `r15`: promoted I register, zero-extended once in the prologue; all
//!   later writes are 16-bit so its upper bits stay clear.
//! - everything else is scratch within a single opcode's sequence.

use core::mem::offset_of;

use super::asm::{Alu, Asm, Cond, Label, Mem, Reg, Rm};
use super::block::{invalidate_blocks, BlockTable};
use crate::quirks::Quirks;
use crate::state::ChipState;

/// Guest State base pointer.
const BASE: Reg = Reg::R11;
/// Branch-skip accumulator for fused conditional skips.
const SKIP: Reg = Reg::R10;
/// Host register holding a promoted I.
const I_FULL: Reg = Reg::R15;
/// Promotion slots for V registers, in allocation order. All callee-saved.
const V_SLOTS: [Reg; 5] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14];
const MAX_ALLOC_REGS: usize = V_SLOTS.len();

const OFF_RAM: i32 = offset_of!(ChipState, ram) as i32;
const OFF_V: i32 = offset_of!(ChipState, v) as i32;
const OFF_I: i32 = offset_of!(ChipState, i) as i32;
const OFF_PC: i32 = offset_of!(ChipState, pc) as i32;
const OFF_SP: i32 = offset_of!(ChipState, sp) as i32;
const OFF_STACK: i32 = offset_of!(ChipState, stack) as i32;
const OFF_DELAY: i32 = offset_of!(ChipState, delay_timer) as i32;
const OFF_SOUND: i32 = offset_of!(ChipState, sound_timer) as i32;
const OFF_KEYS: i32 = offset_of!(ChipState, keys) as i32;
const OFF_INPUT: i32 = offset_of!(ChipState, input_reg) as i32;
const OFF_SCREEN: i32 = offset_of!(ChipState, screen) as i32;

/// Widest store form available for the screen clear, probed once at
/// construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SimdLevel {
    Avx256,
    Sse128,
    Scalar,
}

pub struct Emitter {
    asm: Asm,
    quirks: Quirks,
    simd: SimdLevel,

    /// Usage counts filled in by the orchestrator's analysis pass.
    pub v_usage: [u8; 16],
    pub i_usage: u8,
    /// Fused skips the analysis pass promised; emission must produce
    /// exactly this many for the epilogue count identity to hold.
    pub block_branches: u64,
    /// Guest opcodes consumed so far in this block.
    pub instructions: u64,

    allocated: Vec<u8>,
    i_allocated: bool,
    flag_allocated: bool,
}

impl Emitter {
    pub fn new() -> Self {
        let simd = if std::arch::is_x86_feature_detected!("avx") {
            SimdLevel::Avx256
        } else if std::arch::is_x86_feature_detected!("sse2") {
            SimdLevel::Sse128
        } else {
            SimdLevel::Scalar
        };
        Emitter {
            asm: Asm::new(),
            quirks: Quirks::default(),
            simd,
            v_usage: [0; 16],
            i_usage: 0,
            block_branches: 0,
            instructions: 0,
            allocated: Vec::with_capacity(MAX_ALLOC_REGS),
            i_allocated: false,
            flag_allocated: false,
        }
    }

    /// Clears all per-block state and captures the quirk snapshot the
    /// whole block will be compiled under.
    pub fn begin_block(&mut self, quirks: Quirks) {
        self.quirks = quirks;
        self.v_usage = [0; 16];
        self.i_usage = 0;
        self.block_branches = 0;
        self.instructions = 0;
        self.allocated.clear();
        self.i_allocated = false;
        self.flag_allocated = false;
    }

    /// Promotes the hottest guest registers to host registers. VF gets a
    /// slot whenever the block touches it; other V registers and I need at
    /// least three uses to earn one.
    pub fn allocate_regs(&mut self) {
        if self.v_usage[0xF] > 0 {
            self.allocated.push(0xF);
            self.flag_allocated = true;
        }
        for v in 0..15u8 {
            if self.v_usage[v as usize] >= 3 {
                self.allocated.push(v);
                if self.allocated.len() == MAX_ALLOC_REGS {
                    break;
                }
            }
        }
        self.i_allocated = self.i_usage >= 3;
    }

    /// Finishes the block and hands its relocatable bytes over.
    pub fn take_code(&mut self) -> Vec<u8> {
        self.asm.take_code()
    }

    // --- Operand resolution ---

    fn v_mem(&self, v: u8) -> Mem {
        Mem::base(BASE, OFF_V + v as i32)
    }

    /// Register or home slot of a V register, depending on promotion.
    fn vreg(&self, v: u8) -> Rm {
        match self.allocated.iter().position(|&a| a == v) {
            Some(slot) => Rm::Reg(V_SLOTS[slot]),
            None => Rm::Mem(self.v_mem(v)),
        }
    }

    fn flag(&self) -> Rm {
        if self.flag_allocated {
            Rm::Reg(V_SLOTS[0])
        } else {
            Rm::Mem(self.v_mem(0xF))
        }
    }

    fn ireg(&self) -> Rm {
        if self.i_allocated {
            Rm::Reg(I_FULL)
        } else {
            Rm::Mem(Mem::base(BASE, OFF_I))
        }
    }

    fn pc_mem(&self) -> Rm {
        Rm::Mem(Mem::base(BASE, OFF_PC))
    }

    fn sp_mem(&self) -> Rm {
        Rm::Mem(Mem::base(BASE, OFF_SP))
    }

    fn ram_at(&self, index: Reg) -> Mem {
        Mem::sib(BASE, index, 1, OFF_RAM)
    }

    /// Two-operand byte op with a scratch fallback when both operands live
    /// in memory.
    fn op8(&mut self, op: impl Fn(&mut Asm, Rm, Rm), dst: Rm, src: Rm) {
        if dst.is_reg() || src.is_reg() {
            op(&mut self.asm, dst, src);
        } else {
            self.asm.mov8(Rm::Reg(Reg::Rcx), src);
            op(&mut self.asm, dst, Rm::Reg(Reg::Rcx));
        }
    }

    fn mov8(&mut self, dst: Rm, src: Rm) {
        self.op8(|a, d, s| a.mov8(d, s), dst, src);
    }

    fn alu8(&mut self, op: Alu, dst: Rm, src: Rm) {
        self.op8(move |a, d, s| a.alu8(op, d, s), dst, src);
    }

    // --- Prologue / epilogue ---

    pub fn emit_prologue(&mut self, state: *mut ChipState) {
        self.asm.mov64_imm(BASE, state as u64);

        if self.block_branches > 0 {
            self.asm.alu64_rr(Alu::Xor, SKIP, SKIP);
        }
        if self.i_allocated {
            self.asm.push64(I_FULL);
            self.asm.movzx32_rm16(I_FULL, Rm::Mem(Mem::base(BASE, OFF_I)));
        }
        for slot in 0..self.allocated.len() {
            self.asm.push64(V_SLOTS[slot]);
            let v = self.allocated[slot];
            self.asm.mov8(Rm::Reg(V_SLOTS[slot]), Rm::Mem(self.v_mem(v)));
        }
    }

    /// Writes promoted state back, restores host registers and loads the
    /// executed-opcode count: `instructions - fused + skip accumulator`.
    pub fn emit_epilogue(&mut self) {
        for slot in (0..self.allocated.len()).rev() {
            let v = self.allocated[slot];
            self.asm.mov8(Rm::Mem(self.v_mem(v)), Rm::Reg(V_SLOTS[slot]));
            self.asm.pop64(V_SLOTS[slot]);
        }

        let retired = self.instructions - self.block_branches;
        if self.block_branches > 0 {
            self.asm.lea64(Reg::Rax, Mem::base(SKIP, retired as i32));
        } else {
            self.asm.mov32_imm(Reg::Rax, retired as u32);
        }

        if self.i_allocated {
            self.asm.mov16(Rm::Mem(Mem::base(BASE, OFF_I)), Rm::Reg(I_FULL));
            self.asm.pop64(I_FULL);
        }
        self.asm.ret();
    }

    // --- Opcode emitters ---

    /// `00E0`: zero the framebuffer with the widest stores available.
    pub fn emit_00e0(&mut self) {
        self.asm.lea64(Reg::Rcx, Mem::base(BASE, OFF_SCREEN));
        match self.simd {
            SimdLevel::Avx256 => {
                self.asm.vxorps_ymm0();
                for row in (0..32).step_by(4) {
                    self.asm.vmovdqu_store_ymm0(Mem::base(Reg::Rcx, row * 8));
                }
                self.asm.vzeroupper();
            }
            SimdLevel::Sse128 => {
                self.asm.pxor_xmm0();
                for row in (0..32).step_by(2) {
                    self.asm.movdqu_store_xmm0(Mem::base(Reg::Rcx, row * 8));
                }
            }
            SimdLevel::Scalar => {
                for row in 0..32 {
                    self.asm.mov64_mem_imm32(Mem::base(Reg::Rcx, row * 8), 0);
                }
            }
        }
    }

    /// `00EE`: pop the return address into pc.
    pub fn emit_00ee(&mut self) {
        self.asm.dec16(self.sp_mem());
        self.asm.mov16(Rm::Reg(Reg::Rcx), self.sp_mem());
        self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::Rcx), 0xF);
        self.asm
            .mov16(Rm::Reg(Reg::Rcx), Rm::Mem(Mem::sib(BASE, Reg::Rcx, 2, OFF_STACK)));
        self.asm.mov16(self.pc_mem(), Rm::Reg(Reg::Rcx));
    }

    pub fn emit_1nnn(&mut self, addr: u16) {
        self.asm.mov16_imm(self.pc_mem(), addr & 0xFFF);
    }

    /// `2NNN`: push the block's end pc (already stored to guest pc by the
    /// dispatcher) and jump.
    pub fn emit_2nnn(&mut self, addr: u16) {
        self.asm.mov16(Rm::Reg(Reg::Rcx), self.sp_mem());
        self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::Rcx), 0xF);
        self.asm.mov16(Rm::Reg(Reg::Rax), self.pc_mem());
        self.asm
            .mov16(Rm::Mem(Mem::sib(BASE, Reg::Rcx, 2, OFF_STACK)), Rm::Reg(Reg::Rax));
        self.asm.mov16_imm(self.pc_mem(), addr & 0xFFF);
        self.asm.inc16(self.sp_mem());
    }

    // Skip emitters come in two shapes: fused (native branch over the next
    // opcode's code, returning the label to bind after it) and block-ending
    // (`pc += 2` on the predicate).

    pub fn emit_3xnn(&mut self, x: u8, nn: u8, fused: bool) -> Option<Label> {
        if !fused {
            self.asm.alu64_rr(Alu::Xor, Reg::Rcx, Reg::Rcx);
        }
        self.asm.alu8_imm(Alu::Cmp, self.vreg(x), nn);
        self.finish_skip(Cond::E, fused)
    }

    pub fn emit_4xnn(&mut self, x: u8, nn: u8, fused: bool) -> Option<Label> {
        if !fused {
            self.asm.alu64_rr(Alu::Xor, Reg::Rcx, Reg::Rcx);
        }
        self.asm.alu8_imm(Alu::Cmp, self.vreg(x), nn);
        self.finish_skip(Cond::Ne, fused)
    }

    pub fn emit_5xy0(&mut self, x: u8, y: u8, fused: bool) -> Option<Label> {
        if !fused {
            self.asm.alu64_rr(Alu::Xor, Reg::Rcx, Reg::Rcx);
        }
        self.alu8(Alu::Cmp, self.vreg(x), self.vreg(y));
        self.finish_skip(Cond::E, fused)
    }

    pub fn emit_9xy0(&mut self, x: u8, y: u8, fused: bool) -> Option<Label> {
        if !fused {
            self.asm.alu64_rr(Alu::Xor, Reg::Rcx, Reg::Rcx);
        }
        self.alu8(Alu::Cmp, self.vreg(x), self.vreg(y));
        self.finish_skip(Cond::Ne, fused)
    }

    pub fn emit_ex9e(&mut self, x: u8, fused: bool) -> Option<Label> {
        self.load_key_flag(x);
        if fused {
            self.asm.test8(Rm::Reg(Reg::Rcx), Reg::Rcx);
            Some(self.fused_branch(Cond::Ne))
        } else {
            // cl is 0/1; pc += flag * 2.
            self.asm.shl8_imm(Rm::Reg(Reg::Rcx), 1);
            self.asm.alu16(Alu::Add, self.pc_mem(), Rm::Reg(Reg::Rcx));
            self.asm.alu16_imm(Alu::And, self.pc_mem(), 0xFFF);
            None
        }
    }

    pub fn emit_exa1(&mut self, x: u8, fused: bool) -> Option<Label> {
        self.load_key_flag(x);
        if fused {
            self.asm.test8(Rm::Reg(Reg::Rcx), Reg::Rcx);
            Some(self.fused_branch(Cond::E))
        } else {
            self.asm.alu8_imm(Alu::Xor, Rm::Reg(Reg::Rcx), 1);
            self.asm.shl8_imm(Rm::Reg(Reg::Rcx), 1);
            self.asm.alu16(Alu::Add, self.pc_mem(), Rm::Reg(Reg::Rcx));
            self.asm.alu16_imm(Alu::And, self.pc_mem(), 0xFFF);
            None
        }
    }

    /// rcx = keys[VX & 0xF]; leaves the whole register zero-extended.
    fn load_key_flag(&mut self, x: u8) {
        self.asm.movzx32_rm8(Reg::Rcx, self.vreg(x));
        self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::Rcx), 0xF);
        self.asm
            .mov8(Rm::Reg(Reg::Rcx), Rm::Mem(Mem::sib(BASE, Reg::Rcx, 1, OFF_KEYS)));
    }

    fn finish_skip(&mut self, taken: Cond, fused: bool) -> Option<Label> {
        if fused {
            Some(self.fused_branch(taken))
        } else {
            self.asm.setcc(taken, Rm::Reg(Reg::Rcx));
            self.asm.shl8_imm(Rm::Reg(Reg::Rcx), 1);
            self.asm.alu16(Alu::Add, self.pc_mem(), Rm::Reg(Reg::Rcx));
            self.asm.alu16_imm(Alu::And, self.pc_mem(), 0xFFF);
            None
        }
    }

    /// Branch over the next opcode; the not-taken path bumps the skip
    /// accumulator so the epilogue count nets out correctly.
    fn fused_branch(&mut self, taken: Cond) -> Label {
        let label = self.asm.new_label();
        self.asm.jcc(taken, label);
        self.asm.inc64(SKIP);
        label
    }

    /// Lands the forward branch of a fused skip after the skipped opcode.
    pub fn bind_skip_label(&mut self, label: Label) {
        self.asm.bind(label);
    }

    pub fn emit_6xnn(&mut self, x: u8, nn: u8) {
        self.asm.mov8_imm(self.vreg(x), nn);
    }

    pub fn emit_7xnn(&mut self, x: u8, nn: u8) {
        self.asm.alu8_imm(Alu::Add, self.vreg(x), nn);
    }

    pub fn emit_8xy0(&mut self, x: u8, y: u8) {
        self.mov8(self.vreg(x), self.vreg(y));
    }

    pub fn emit_8xy1(&mut self, x: u8, y: u8) {
        self.alu8(Alu::Or, self.vreg(x), self.vreg(y));
        if self.quirks.vf_reset {
            self.asm.mov8_imm(self.flag(), 0);
        }
    }

    pub fn emit_8xy2(&mut self, x: u8, y: u8) {
        self.alu8(Alu::And, self.vreg(x), self.vreg(y));
        if self.quirks.vf_reset {
            self.asm.mov8_imm(self.flag(), 0);
        }
    }

    pub fn emit_8xy3(&mut self, x: u8, y: u8) {
        self.alu8(Alu::Xor, self.vreg(x), self.vreg(y));
        if self.quirks.vf_reset {
            self.asm.mov8_imm(self.flag(), 0);
        }
    }

    pub fn emit_8xy4(&mut self, x: u8, y: u8) {
        self.alu8(Alu::Add, self.vreg(x), self.vreg(y));
        self.asm.setcc(Cond::B, self.flag());
    }

    pub fn emit_8xy5(&mut self, x: u8, y: u8) {
        self.alu8(Alu::Sub, self.vreg(x), self.vreg(y));
        self.asm.setcc(Cond::Ae, self.flag());
    }

    /// `8XY6`. When X is the flag register the shifted value is dead; only
    /// the shifted-out bit survives in VF.
    pub fn emit_8xy6(&mut self, x: u8, y: u8) {
        if !self.quirks.shifting {
            self.emit_8xy0(x, y);
        }
        if x == 0xF {
            self.asm.alu8_imm(Alu::And, self.flag(), 1);
        } else {
            self.mov8(self.flag(), self.vreg(x));
            self.asm.alu8_imm(Alu::And, self.flag(), 1);
            self.asm.shr8_imm(self.vreg(x), 1);
        }
    }

    pub fn emit_8xy7(&mut self, x: u8, y: u8) {
        self.asm.mov8(Rm::Reg(Reg::Rcx), self.vreg(y));
        self.asm.alu8(Alu::Sub, Rm::Reg(Reg::Rcx), self.vreg(x));
        if x != 0xF {
            self.asm.mov8(self.vreg(x), Rm::Reg(Reg::Rcx));
        }
        self.asm.setcc(Cond::Ae, self.flag());
    }

    pub fn emit_8xye(&mut self, x: u8, y: u8) {
        if !self.quirks.shifting {
            self.emit_8xy0(x, y);
        }
        if x == 0xF {
            self.asm.shr8_imm(self.flag(), 7);
        } else {
            self.mov8(self.flag(), self.vreg(x));
            self.asm.shr8_imm(self.flag(), 7);
            self.asm.shl8_imm(self.vreg(x), 1);
        }
    }

    pub fn emit_annn(&mut self, addr: u16) {
        self.asm.mov16_imm(self.ireg(), addr);
    }

    pub fn emit_bnnn(&mut self, addr: u16, x: u8) {
        self.asm.mov16_imm(self.pc_mem(), addr);
        let offset_reg = if self.quirks.jumping { x } else { 0 };
        self.asm.movzx32_rm8(Reg::Rcx, self.vreg(offset_reg));
        self.asm.alu16(Alu::Add, self.pc_mem(), Rm::Reg(Reg::Rcx));
        self.asm.alu16_imm(Alu::And, self.pc_mem(), 0xFFF);
    }

    /// `CXNN`: the timestamp counter is a cheap entropy source; guest code
    /// only ever sees it masked.
    pub fn emit_cxnn(&mut self, x: u8, nn: u8) {
        self.asm.rdtsc();
        self.asm.alu8_imm(Alu::And, Rm::Reg(Reg::Rax), nn);
        self.asm.mov8(self.vreg(x), Rm::Reg(Reg::Rax));
    }

    /// `DXYN`: unrolled per sprite row. r8 = row index, r9 = column,
    /// rax/rdx = row bits and mask, rcx = shift counts then row address.
    pub fn emit_dxyn(&mut self, x: u8, y: u8, height: u8) {
        if height == 0 {
            self.asm.mov8_imm(self.flag(), 0);
            return;
        }

        self.asm.mov8(Rm::Reg(Reg::R8), self.vreg(y));
        self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::R8), 31);
        self.asm.mov8(Rm::Reg(Reg::R9), self.vreg(x));
        self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::R9), 63);
        self.asm.mov8_imm(self.flag(), 0);

        let loop_end = self.asm.new_label();

        for row in 0..height as i32 {
            // rax = ram[(I + row) & 0xFFF]
            if self.i_allocated {
                self.asm.lea64(Reg::Rax, Mem::base(I_FULL, row));
            } else {
                self.asm.movzx32_rm16(Reg::Rax, Rm::Mem(Mem::base(BASE, OFF_I)));
                if row > 0 {
                    self.asm.lea64(Reg::Rax, Mem::base(Reg::Rax, row));
                }
            }
            self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::Rax), 0xFFF);
            self.asm.movzx32_rm8(Reg::Rax, Rm::Mem(self.ram_at(Reg::Rax)));

            if row > 0 {
                if self.quirks.clipping {
                    self.asm.alu8_imm(Alu::Cmp, Rm::Reg(Reg::R8), 32);
                    self.asm.jcc(Cond::Ae, loop_end);
                } else {
                    self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::R8), 31);
                }
            }

            let full_draw = self.asm.new_label();
            let do_xor = self.asm.new_label();

            self.asm.mov64_rr(Reg::Rdx, Reg::Rax);
            self.asm.alu8_imm(Alu::Cmp, Rm::Reg(Reg::R9), 56);
            self.asm.jcc(Cond::Be, full_draw);

            // Column past 56: the sprite hangs off the right edge.
            self.asm.lea64(Reg::Rcx, Mem::base(Reg::R9, -56));
            self.asm.shr64_cl(Reg::Rdx);
            if !self.quirks.clipping {
                self.asm.mov8_imm(Rm::Reg(Reg::Rcx), 120);
                self.asm.alu8(Alu::Sub, Rm::Reg(Reg::Rcx), Rm::Reg(Reg::R9));
                self.asm.shl64_cl(Reg::Rax);
                self.asm.alu64_rr(Alu::Or, Reg::Rdx, Reg::Rax);
            }
            self.asm.jmp(do_xor);

            self.asm.bind(full_draw);
            self.asm.mov8_imm(Rm::Reg(Reg::Rcx), 56);
            self.asm.alu8(Alu::Sub, Rm::Reg(Reg::Rcx), Rm::Reg(Reg::R9));
            self.asm.shl64_cl(Reg::Rdx);

            self.asm.bind(do_xor);
            self.asm.lea64(Reg::Rcx, Mem::sib(BASE, Reg::R8, 8, OFF_SCREEN));
            self.asm.test64(Rm::Mem(Mem::base(Reg::Rcx, 0)), Reg::Rdx);
            self.asm.setcc(Cond::Ne, Rm::Reg(Reg::Rax));
            self.alu8(Alu::Or, self.flag(), Rm::Reg(Reg::Rax));
            self.asm.xor64_mem(Mem::base(Reg::Rcx, 0), Reg::Rdx);
            self.asm.inc8(Rm::Reg(Reg::R8));
        }

        self.asm.bind(loop_end);
    }

    pub fn emit_fx07(&mut self, x: u8) {
        self.mov8(self.vreg(x), Rm::Mem(Mem::base(BASE, OFF_DELAY)));
    }

    pub fn emit_fx15(&mut self, x: u8) {
        self.mov8(Rm::Mem(Mem::base(BASE, OFF_DELAY)), self.vreg(x));
    }

    pub fn emit_fx18(&mut self, x: u8) {
        self.mov8(Rm::Mem(Mem::base(BASE, OFF_SOUND)), self.vreg(x));
    }

    /// `FX0A`: park the destination register index in `input_reg`; the
    /// block ends here and `execute` idles until a key release clears it.
    pub fn emit_fx0a(&mut self, x: u8) {
        self.asm
            .mov16_imm(Rm::Mem(Mem::base(BASE, OFF_INPUT)), x as u16);
    }

    pub fn emit_fx1e(&mut self, x: u8) {
        self.asm.movzx32_rm8(Reg::Rcx, self.vreg(x));
        self.asm.alu16(Alu::Add, self.ireg(), Rm::Reg(Reg::Rcx));
    }

    /// `FX29`: I = (VX & 0xF) * 5, the font glyph address.
    pub fn emit_fx29(&mut self, x: u8) {
        self.asm.movzx32_rm8(Reg::Rcx, self.vreg(x));
        self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::Rcx), 0xF);
        self.asm.lea64(Reg::Rcx, Mem::sib(Reg::Rcx, Reg::Rcx, 4, 0));
        self.asm.mov16(self.ireg(), Rm::Reg(Reg::Rcx));
    }

    /// `FX33`: BCD of VX at I, I+1, I+2, each masked to RAM. `div` wants
    /// the dividend in ax; remainders are recovered by shifting ah down
    /// (the high byte forms are unreachable alongside a REX base).
    pub fn emit_fx33(&mut self, x: u8) {
        self.asm.movzx32_rm16(Reg::Rdx, self.ireg());
        self.asm.mov8(Rm::Reg(Reg::R8), self.vreg(x));

        // Hundreds digit at I.
        self.asm.movzx32_rm8(Reg::Rax, Rm::Reg(Reg::R8));
        self.asm.mov8_imm(Rm::Reg(Reg::Rcx), 100);
        self.asm.div8(Rm::Reg(Reg::Rcx));
        self.store_digit(Reg::Rdx, 0);

        // Ones digit (VX % 10) at I + 2; keep VX / 10 for the tens pass.
        self.asm.movzx32_rm8(Reg::Rax, Rm::Reg(Reg::R8));
        self.asm.mov8_imm(Rm::Reg(Reg::Rcx), 10);
        self.asm.div8(Rm::Reg(Reg::Rcx));
        self.asm.mov8(Rm::Reg(Reg::R8), Rm::Reg(Reg::Rax));
        self.asm.shr32_imm(Reg::Rax, 8);
        self.store_digit(Reg::Rdx, 2);

        // Tens digit ((VX / 10) % 10) at I + 1.
        self.asm.movzx32_rm8(Reg::Rax, Rm::Reg(Reg::R8));
        self.asm.div8(Rm::Reg(Reg::Rcx));
        self.asm.shr32_imm(Reg::Rax, 8);
        self.store_digit(Reg::Rdx, 1);
    }

    /// ram[(base_reg + offset) & 0xFFF] = al
    fn store_digit(&mut self, i_reg: Reg, offset: i32) {
        self.asm.lea64(Reg::R9, Mem::base(i_reg, offset));
        self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::R9), 0xFFF);
        self.asm.mov8(Rm::Mem(self.ram_at(Reg::R9)), Rm::Reg(Reg::Rax));
    }

    /// `FX55`: store V0..VX, then drop any compiled block covering the
    /// written range before the memory-increment quirk adjusts I.
    pub fn emit_fx55(&mut self, x: u8, table: *mut BlockTable) {
        self.store_regs(x, true);

        self.asm.movzx32_rm16(Reg::Rsi, self.ireg());
        self.asm.lea64(Reg::Rdx, Mem::base(Reg::Rsi, x as i32));
        self.asm.mov64_imm(Reg::Rdi, table as u64);

        // Spill the caller-saved block registers around the helper call and
        // keep rsp 16-byte aligned at the call site.
        self.asm.push64(BASE);
        let mut pushes = 1 + self.allocated.len() + self.i_allocated as usize;
        if self.block_branches > 0 {
            self.asm.push64(SKIP);
            pushes += 1;
        }
        let realign = pushes % 2 == 0;
        if realign {
            self.asm.alu64_imm(Alu::Sub, Rm::Reg(Reg::Rsp), 8);
        }
        self.asm.mov64_imm(Reg::Rax, invalidate_blocks as usize as u64);
        self.asm.call_reg(Reg::Rax);
        if realign {
            self.asm.alu64_imm(Alu::Add, Rm::Reg(Reg::Rsp), 8);
        }
        if self.block_branches > 0 {
            self.asm.pop64(SKIP);
        }
        self.asm.pop64(BASE);

        if self.quirks.memory_increment {
            self.asm.alu16_imm(Alu::Add, self.ireg(), x as u16 + 1);
        }
    }

    pub fn emit_fx65(&mut self, x: u8) {
        self.store_regs(x, false);
        if self.quirks.memory_increment {
            self.asm.alu16_imm(Alu::Add, self.ireg(), x as u16 + 1);
        }
    }

    /// Bulk register file transfer for `FX55`/`FX65`, one masked RAM
    /// address per register.
    fn store_regs(&mut self, x: u8, to_mem: bool) {
        self.asm.movzx32_rm16(Reg::Rdx, self.ireg());
        for r in 0..=x {
            self.asm.lea64(Reg::Rax, Mem::base(Reg::Rdx, r as i32));
            self.asm.alu64_imm(Alu::And, Rm::Reg(Reg::Rax), 0xFFF);
            let ram = Rm::Mem(self.ram_at(Reg::Rax));
            if to_mem {
                self.mov8(ram, self.vreg(r));
            } else {
                self.mov8(self.vreg(r), ram);
            }
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}
