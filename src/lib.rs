//! A CHIP-8 virtual machine built around a block-compiling dynamic
//! translator for x86-64, with an interpreter core kept as the reference
//! implementation.
//!
//! Drivers own a core value ([`JitCore`] or [`InterpCore`]), feed it a ROM,
//! call [`Chip8Core::execute`] in a loop, tick the timers at 60 Hz and
//! forward key transitions. Rendering reads the packed screen buffer.

mod error;
mod interp;
mod quirks;
mod state;

#[cfg(all(target_arch = "x86_64", unix))]
mod jit;

pub use error::{CoreError, CoreResult};
pub use interp::InterpCore;
pub use quirks::Quirks;
pub use state::{ChipState, FONT, MAX_ROM_SIZE, PROGRAM_START, RAM_SIZE, SCR_HEIGHT, SCR_WIDTH};

#[cfg(all(target_arch = "x86_64", unix))]
pub use jit::JitCore;

/// The operations a driver needs from either core. The JIT additionally
/// exposes cache control ([`JitCore::clear_cache`], [`JitCore::set_slow_mode`],
/// [`JitCore::dump_code`]) on the concrete type.
pub trait Chip8Core {
    /// Resets the guest and loads `rom` at 0x200. Fails if the image does
    /// not fit; the guest is left untouched in that case.
    fn load_rom(&mut self, rom: &[u8]) -> CoreResult<()>;

    /// Runs guest code and returns the number of guest opcodes that
    /// actually executed: one per call for the interpreter, a whole block
    /// for the JIT. Returns 0 when no ROM is loaded or the CPU is blocked
    /// awaiting a key release.
    fn execute(&mut self) -> u64;

    /// Updates one key flag; may complete a pending FX0A wait.
    fn set_key(&mut self, key: u8, pressed: bool);

    fn reset_keys(&mut self);

    /// Decrements the delay and sound timers. Call at 60 Hz.
    fn update_timers(&mut self);

    /// Borrow of the packed framebuffer, one `u64` per row.
    fn screen_buffer(&self) -> &[u64; SCR_HEIGHT];

    /// Full guest record, mainly for state comparison in tests and
    /// debugging front-ends.
    fn state(&self) -> &ChipState;

    /// Replaces the quirk configuration. On the JIT core this invalidates
    /// all compiled code.
    fn set_quirks(&mut self, quirks: Quirks);
}
