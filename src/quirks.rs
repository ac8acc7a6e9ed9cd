//! Per-opcode semantic toggles selecting among historically divergent
//! CHIP-8 behaviors.

/// A quirk snapshot is read at block-compile time by the translator and per
/// opcode by the interpreter; changing quirks on the JIT core invalidates
/// the code cache so stale semantics never execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quirks {
    /// `8XY1/2/3` clear VF after the bitwise op.
    pub vf_reset: bool,
    /// `8XY6/E` shift VX in place instead of copying VY first.
    pub shifting: bool,
    /// `BNNN` adds `V[X]` (X = top nibble of NNN) instead of `V0`.
    pub jumping: bool,
    /// Sprites clip at the bottom edge instead of wrapping.
    pub clipping: bool,
    /// `FX55/FX65` post-increment I by X + 1.
    pub memory_increment: bool,
}

impl Default for Quirks {
    fn default() -> Self {
        Quirks {
            vf_reset: true,
            shifting: true,
            jumping: false,
            clipping: true,
            memory_increment: false,
        }
    }
}
