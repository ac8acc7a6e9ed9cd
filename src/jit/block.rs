//! Compiled-block bookkeeping: one descriptor per block plus a
//! constant-time map from guest PC to descriptor slot.

use crate::state::RAM_SIZE;

/// Descriptor of one compiled region. `end_pc` is the guest PC following
/// the last consumed instruction.
#[derive(Clone, Copy, Debug, Default)]
pub struct JitBlock {
    pub start_pc: u16,
    pub end_pc: u16,
    pub cache_offset: u32,
    pub cache_size: u32,
}

impl JitBlock {
    pub fn new(start_pc: u16) -> Self {
        JitBlock { start_pc, ..Default::default() }
    }
}

/// One entry per RAM byte, keyed by the PC at which execution enters the
/// block. `block` stays allocated across invalidation so a recompile at
/// the same PC reuses its slot.
#[derive(Clone, Copy, Debug)]
pub struct MapEntry {
    pub valid: bool,
    pub block: i16,
}

impl Default for MapEntry {
    fn default() -> Self {
        MapEntry { valid: false, block: -1 }
    }
}

/// Lives in a `Box` owned by the JIT core: generated `FX55` code calls
/// [`invalidate_blocks`] with its address, so it must never move.
pub struct BlockTable {
    pub map: [MapEntry; RAM_SIZE],
    pub blocks: Vec<JitBlock>,
}

impl BlockTable {
    pub fn new() -> Box<Self> {
        Box::new(BlockTable {
            map: [MapEntry::default(); RAM_SIZE],
            blocks: Vec::new(),
        })
    }

    /// Forgets every block and slot assignment (cache reset).
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.map = [MapEntry::default(); RAM_SIZE];
    }

    /// Marks every block overlapping `[start, end]` invalid. Linear in the
    /// block count, which stays in the hundreds for real ROMs.
    pub fn invalidate_range(&mut self, start: u16, end: u16) {
        for block in &self.blocks {
            if block.start_pc <= end && block.end_pc >= start {
                self.map[(block.start_pc & 0xFFF) as usize].valid = false;
            }
        }
    }
}

/// Entry point for generated code (called after an `FX55` store with the
/// written RAM range).
///
/// Safety: `table` is the boxed `BlockTable` of the core whose block is
/// executing; the core cannot touch it concurrently because `execute()`
/// is blocked inside the generated call.
pub extern "C" fn invalidate_blocks(table: *mut BlockTable, start: u16, end: u16) {
    let table = unsafe { &mut *table };
    table.invalidate_range(start, end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_hits_overlapping_blocks_only() {
        let mut table = BlockTable::new();
        table.blocks.push(JitBlock { start_pc: 0x200, end_pc: 0x208, ..Default::default() });
        table.blocks.push(JitBlock { start_pc: 0x300, end_pc: 0x310, ..Default::default() });
        table.map[0x200].valid = true;
        table.map[0x200].block = 0;
        table.map[0x300].valid = true;
        table.map[0x300].block = 1;

        table.invalidate_range(0x204, 0x206);
        assert!(!table.map[0x200].valid);
        assert!(table.map[0x300].valid);
        // Slot assignment survives invalidation for reuse on recompile.
        assert_eq!(table.map[0x200].block, 0);
    }

    #[test]
    fn reset_clears_slots() {
        let mut table = BlockTable::new();
        table.blocks.push(JitBlock::new(0x200));
        table.map[0x200].valid = true;
        table.map[0x200].block = 0;
        table.reset();
        assert!(table.blocks.is_empty());
        assert_eq!(table.map[0x200].block, -1);
    }
}
