//! Equivalence of the translator against the interpreter oracle: the JIT
//! runs a block at a time, the interpreter is stepped exactly as many
//! opcodes, and the complete guest record must match after every call.

#![cfg(all(target_arch = "x86_64", unix))]

use okto::{Chip8Core, InterpCore, JitCore, Quirks, SCR_HEIGHT};

fn rom(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn jit_with(image: &[u8]) -> JitCore {
    let mut jit = JitCore::new().unwrap();
    jit.load_rom(image).unwrap();
    jit
}

/// Runs both cores in lockstep for up to `calls` JIT dispatches, comparing
/// the whole guest state after each one.
fn lockstep(image: &[u8], calls: usize, slow: bool, quirks: Option<Quirks>, keys: &[u8]) -> JitCore {
    let mut jit = JitCore::new().unwrap();
    let mut interp = InterpCore::new();
    if let Some(q) = quirks {
        jit.set_quirks(q);
        interp.set_quirks(q);
    }
    jit.load_rom(image).unwrap();
    interp.load_rom(image).unwrap();
    if slow {
        jit.set_slow_mode(true);
    }
    for &k in keys {
        jit.set_key(k, true);
        interp.set_key(k, true);
    }

    for call in 0..calls {
        let executed = jit.execute();
        assert!(executed <= 65, "block claims {executed} executed opcodes");
        if executed == 0 {
            assert_eq!(interp.execute(), 0, "interpreter not blocked at call {call}");
            break;
        }
        for _ in 0..executed {
            assert_eq!(interp.execute(), 1);
        }
        assert_eq!(jit.state(), interp.state(), "state diverged at call {call}");
    }
    jit
}

// --- End-to-end scenarios through generated code ---

#[test]
fn add_with_carry() {
    let image = rom(&[0x60FF, 0x6101, 0x8014, 0x1206]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 4);
    assert_eq!(jit.state().v[0], 0x00);
    assert_eq!(jit.state().v[1], 0x01);
    assert_eq!(jit.state().v[0xF], 1);
    assert_eq!(jit.state().pc, 0x206);
}

#[test]
fn subtract_without_borrow() {
    let image = rom(&[0x6005, 0x6102, 0x8015, 0x1206]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 4);
    assert_eq!(jit.state().v[0], 0x03);
    assert_eq!(jit.state().v[0xF], 1);
}

#[test]
fn fused_skip_taken_counts_one() {
    // V0 == 5, so the fused skip branches over `V1 = 1`.
    let image = rom(&[0x6005, 0x3005, 0x6101, 0x1206]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 3);
    assert_eq!(jit.state().v[1], 0);
    assert_eq!(jit.state().pc, 0x206);
}

#[test]
fn fused_skip_not_taken_counts_both() {
    let image = rom(&[0x6005, 0x3006, 0x6101, 0x1206]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 4);
    assert_eq!(jit.state().v[1], 1);
}

#[test]
fn fused_skip_in_slow_mode_still_pairs() {
    let image = rom(&[0x6005, 0x3005, 0x6101, 0x1206]);
    let mut jit = jit_with(&image);
    jit.set_slow_mode(true);
    assert_eq!(jit.execute(), 1); // 6005
    assert_eq!(jit.execute(), 1); // fused pair, skip taken
    assert_eq!(jit.state().v[1], 0);
    assert_eq!(jit.state().pc, 0x206);
}

#[test]
fn call_and_return() {
    let image = rom(&[0x2204, 0x1200, 0x00EE]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 1); // 2204
    assert_eq!(jit.execute(), 1); // 00EE
    assert_eq!(jit.execute(), 1); // 1200
    assert_eq!(jit.state().pc, 0x200);
    assert_eq!(jit.state().sp, 0);
    assert_eq!(jit.state().stack[0], 0x202);
}

#[test]
fn sprite_draw_and_collision() {
    let image = rom(&[0x6000, 0x6100, 0xA300, 0xD011, 0x1208]);
    let mut jit = jit_with(&image);
    jit.state_mut().ram[0x300] = 0xFF;
    assert_eq!(jit.execute(), 5);
    assert_eq!(jit.state().screen[0], 0xFF00_0000_0000_0000);
    assert_eq!(jit.state().v[0xF], 0);

    // Redraw toggles every pixel off and reports the collision.
    jit.state_mut().pc = 0x206;
    jit.execute();
    assert_eq!(jit.state().screen[0], 0);
    assert_eq!(jit.state().v[0xF], 1);
}

#[test]
fn bcd_digits() {
    let image = rom(&[0x609C, 0xA300, 0xF033, 0x1206]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 4);
    assert_eq!(jit.state().ram[0x300], 1);
    assert_eq!(jit.state().ram[0x301], 5);
    assert_eq!(jit.state().ram[0x302], 6);
}

#[test]
fn store_clear_load_round_trip() {
    let image = rom(&[0x6042, 0xA300, 0xF055, 0x6000, 0x00E0, 0xF065, 0x120C]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 3); // FX55 ends the block
    assert_eq!(jit.execute(), 4);
    assert_eq!(jit.state().v[0], 0x42);
    assert_eq!(jit.state().screen, [0u64; SCR_HEIGHT]);
}

#[test]
fn screen_clear_zeroes_every_row() {
    let image = rom(&[0x6000, 0x6100, 0xA300, 0xD014, 0x00E0, 0x120A]);
    let mut jit = jit_with(&image);
    jit.state_mut().ram[0x300..0x304].fill(0xFF);
    jit.execute();
    assert_eq!(jit.state().screen, [0u64; SCR_HEIGHT]);
}

// --- Flag-register corner cases (VF wins) ---

#[test]
fn vf_wins_shift_right_on_flag_register() {
    let image = rom(&[0x6F02, 0x8FF6, 0x1204]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 3);
    assert_eq!(jit.state().v[0xF], 0);
}

#[test]
fn vf_wins_subtract_on_flag_register() {
    let image = rom(&[0x6F05, 0x6102, 0x8F15, 0x1206]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 4);
    assert_eq!(jit.state().v[0xF], 1);
}

// --- Quirk variants, verified against the oracle ---

#[test]
fn shift_copies_vy_without_shifting_quirk() {
    let image = rom(&[0x6181, 0x8016, 0x1204]);
    let q = Quirks { shifting: false, ..Quirks::default() };
    let jit = lockstep(&image, 4, false, Some(q), &[]);
    assert_eq!(jit.state().v[0], 0x40);
    assert_eq!(jit.state().v[0xF], 1);
}

#[test]
fn memory_increment_quirk_moves_i() {
    let image = rom(&[0xA300, 0x6001, 0x6102, 0xF155, 0x1208]);
    let q = Quirks { memory_increment: true, ..Quirks::default() };
    let jit = lockstep(&image, 4, false, Some(q), &[]);
    assert_eq!(jit.state().i, 0x302);
    assert_eq!(jit.state().ram[0x300], 1);
    assert_eq!(jit.state().ram[0x301], 2);
}

#[test]
fn sprite_clipping_versus_wrapping() {
    // 5-row font glyph drawn at (60, 30): clips to two rows, or wraps both
    // vertically and horizontally.
    let image = rom(&[0x603C, 0x611E, 0xA000, 0xD015, 0x1208]);
    lockstep(&image, 4, false, None, &[]);
    let q = Quirks { clipping: false, ..Quirks::default() };
    lockstep(&image, 4, false, Some(q), &[]);
}

#[test]
fn jump_with_offset_quirk() {
    let image = rom(&[0x6004, 0x6202, 0xB202, 0x0000, 0x6107, 0x120A]);
    lockstep(&image, 4, false, None, &[]);
    let q = Quirks { jumping: true, ..Quirks::default() };
    lockstep(&image, 4, false, Some(q), &[]);
}

// --- Key handling ---

#[test]
fn key_skips_follow_keypad_state() {
    let image = rom(&[0x6005, 0xE09E, 0x6101, 0xE0A1, 0x6201, 0x120A]);
    let jit = lockstep(&image, 6, false, None, &[5]);
    // Key 5 held: EX9E skips, EXA1 does not.
    assert_eq!(jit.state().v[1], 0);
    assert_eq!(jit.state().v[2], 1);
}

#[test]
fn fx0a_blocks_until_press_then_release() {
    let image = rom(&[0xF20A, 0x6101, 0x1204]);
    let mut jit = jit_with(&image);
    assert_eq!(jit.execute(), 1);
    assert_eq!(jit.execute(), 0);

    // A release without a prior press is ignored.
    jit.set_key(9, false);
    assert_eq!(jit.execute(), 0);

    jit.set_key(9, true);
    assert_eq!(jit.execute(), 0);
    jit.set_key(9, false);
    assert_eq!(jit.state().v[2], 9);
    assert_eq!(jit.execute(), 2);
    assert_eq!(jit.state().v[1], 1);
}

// --- Self-modifying code ---

#[test]
fn fx55_store_invalidates_overwritten_block() {
    let image = rom(&[
        0x220C, // call sub
        0xA20D, // I = operand byte of sub's first opcode
        0x60BB, // V0 = 0xBB
        0xF055, // patch sub: 63AA -> 63BB
        0x220C, // call sub again
        0x120A, // spin
        0x63AA, // sub: V3 = 0xAA
        0x00EE,
    ]);
    let mut jit = jit_with(&image);
    jit.execute(); // call
    jit.execute(); // sub body, compiled with the original operand
    assert_eq!(jit.state().v[3], 0xAA);
    jit.execute(); // patch + invalidate
    jit.execute(); // call
    jit.execute(); // sub recompiled from patched RAM
    assert_eq!(jit.state().v[3], 0xBB);
}

#[test]
fn fx55_with_promoted_registers_and_fused_skip() {
    // One block holding a promoted V0, a promoted I, a fused skip and the
    // FX55 invalidation call, so the spill/realign path runs.
    let image = rom(&[0x6005, 0x3009, 0x7001, 0xA300, 0xF11E, 0xF11E, 0xF155, 0x120E]);
    let jit = lockstep(&image, 3, false, None, &[]);
    assert_eq!(jit.state().v[0], 6);
    assert_eq!(jit.state().i, 0x30C);
    assert_eq!(jit.state().ram[0x30C], 6);
}

// --- Loops and promotion under lockstep ---

#[test]
fn counting_loop_with_promoted_registers() {
    let image = rom(&[
        0x6000, // V0 = 0
        0x7001, // V0 += 1
        0x8104, // V1 += V0
        0x8204, // V2 += V0
        0x30FF, // until V0 == 0xFF
        0x1202, // loop
        0x120C, // done
    ]);
    lockstep(&image, 1200, false, None, &[]);
    lockstep(&image, 40, true, None, &[]);
}

// --- Deterministic opcode soup ---

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }
}

/// Arbitrary straight-line-plus-jumps program over a whitelist that stays
/// deterministic: no CXNN, no FX0A, and no stores that could rewrite the
/// program with bytes outside the whitelist.
fn soup_rom(seed: u64, ops: usize, with_ram_writes: bool) -> Vec<u8> {
    let mut rng = Lcg(seed);
    let mut words = Vec::with_capacity(ops);
    let span = (ops as u16) * 2;
    let even_target = |r: &mut Lcg| 0x200 + (r.next() as u16 % (span / 2)) * 2;

    for _ in 0..ops - 1 {
        let x = (rng.next() % 16) as u16;
        let y = (rng.next() % 16) as u16;
        let nn = (rng.next() % 256) as u16;
        let word = match rng.next() % 100 {
            0..=29 => match rng.next() % 11 {
                0 => 0x6000 | x << 8 | nn,
                1 => 0x7000 | x << 8 | nn,
                2 => 0x8000 | x << 8 | y << 4,
                3 => 0x8001 | x << 8 | y << 4,
                4 => 0x8002 | x << 8 | y << 4,
                5 => 0x8003 | x << 8 | y << 4,
                6 => 0x8004 | x << 8 | y << 4,
                7 => 0x8005 | x << 8 | y << 4,
                8 => 0x8006 | x << 8 | y << 4,
                9 => 0x8007 | x << 8 | y << 4,
                _ => 0x800E | x << 8 | y << 4,
            },
            30..=44 => match rng.next() % 4 {
                0 => 0x3000 | x << 8 | (nn % 8),
                1 => 0x4000 | x << 8 | (nn % 8),
                2 => 0x5000 | x << 8 | y << 4,
                _ => 0x9000 | x << 8 | y << 4,
            },
            45..=52 => {
                if with_ram_writes {
                    // Keep I well past the program so FX33/FX55 cannot
                    // rewrite executable bytes.
                    0xA000 | (0xE00 + (rng.next() as u16 % 0x80) * 2)
                } else {
                    0xA000 | (rng.next() as u16 % 0x1000)
                }
            }
            53..=60 => 0xD000 | x << 8 | y << 4 | (1 + rng.next() as u16 % 8),
            61..=66 => {
                if with_ram_writes {
                    match rng.next() % 3 {
                        0 => 0xF033 | x << 8,
                        1 => 0xF055 | (x % 8) << 8,
                        _ => 0xF065 | (x % 8) << 8,
                    }
                } else {
                    match rng.next() % 3 {
                        0 => 0xF029 | x << 8,
                        1 => 0xF01E | x << 8,
                        _ => 0xF065 | (x % 8) << 8,
                    }
                }
            }
            67..=74 => match rng.next() % 3 {
                0 => 0xF007 | x << 8,
                1 => 0xF015 | x << 8,
                _ => 0xF018 | x << 8,
            },
            75..=80 => {
                if rng.next() % 2 == 0 {
                    0xE09E | x << 8
                } else {
                    0xE0A1 | x << 8
                }
            }
            81..=84 => 0x00E0,
            85..=88 => 0x2000 | even_target(&mut rng),
            89..=91 => 0x00EE,
            _ => 0x1000 | even_target(&mut rng),
        };
        words.push(word);
    }
    words.push(0x1200);
    rom(&words)
}

#[test]
fn opcode_soup_matches_interpreter() {
    for seed in [1u64, 7, 42] {
        let image = soup_rom(seed, 200, false);
        lockstep(&image, 3000, false, None, &[5, 0xA]);
    }
}

#[test]
fn opcode_soup_matches_interpreter_in_slow_mode() {
    for seed in [3u64, 99] {
        let image = soup_rom(seed, 200, false);
        lockstep(&image, 2000, true, None, &[]);
    }
}

#[test]
fn ram_writing_soup_matches_interpreter() {
    for seed in [11u64, 1234] {
        let image = soup_rom(seed, 200, true);
        lockstep(&image, 3000, false, None, &[]);
    }
}

#[test]
fn soup_survives_quirk_variants() {
    let image = soup_rom(77, 200, false);
    let q = Quirks {
        vf_reset: false,
        shifting: false,
        jumping: false,
        clipping: false,
        memory_increment: true,
    };
    lockstep(&image, 2000, false, Some(q), &[]);
}

// --- Diagnostics ---

#[test]
fn dump_code_lists_compiled_blocks() {
    let image = rom(&[0x6005, 0x3005, 0x6101, 0x1206]);
    let mut jit = jit_with(&image);
    jit.execute();

    let mut out = Vec::new();
    jit.dump_code(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("block 0x0200"));
    assert!(text.contains("ret"));
}

#[test]
fn cores_share_the_driver_facing_trait() {
    let image = rom(&[0x6001, 0x1202]);
    let mut cores: Vec<Box<dyn Chip8Core>> =
        vec![Box::new(jit_with(&image)), Box::new(InterpCore::new())];
    cores[1].load_rom(&image).unwrap();
    for core in &mut cores {
        core.execute();
        assert_eq!(core.state().v[0], 1);
    }
}
