//! ARM64 Register Allocation
//!
//! Linear scan over live ranges from the linearized instruction order.
//! 16-byte tagged values occupy two physical registers with consecutive
//! encodings, so the free pool is searched for an adjacent pair before one
//! is claimed. Allocation never fails: exhausted pools fall back to stack
//! spill slots sized by the value's class.

use std::collections::HashMap;

use log::trace;

use crate::ir::{Function, SizeClass, Value, Vreg};

use super::registers::{Reg64, ALLOCATABLE_REGS};

/// Per-frame block reserved for the 16 interpreter global slots
pub const GLOBALS_BLOCK_SIZE: u32 = 256;

/// Number of addressable global slots
pub const GLOBAL_SLOT_COUNT: u32 = 16;

/// Live range of one virtual register
#[derive(Debug, Clone)]
pub struct LiveRange {
    pub vreg: Vreg,
    pub start: u32,
    pub end: u32,
    pub size: SizeClass,
}

/// Compute `[first, last]` linear instruction positions per virtual
/// register.
///
/// Positions increase across blocks in block-list order rather than
/// control-flow order. The approximation lives behind this function so a
/// CFG-based analysis could replace it without touching the allocator.
pub fn compute_live_ranges(func: &Function) -> Vec<LiveRange> {
    let mut ranges: HashMap<Vreg, LiveRange> = HashMap::new();
    let mut pos: u32 = 0;
    for block in &func.blocks {
        for insn in &block.instructions {
            if let Some((vreg, size)) = insn.def() {
                touch(&mut ranges, vreg, size, pos);
            }
            for value in insn.uses() {
                if let Value::Reg { vreg, size } = value {
                    touch(&mut ranges, *vreg, *size, pos);
                }
            }
            pos += 1;
        }
    }
    let mut out: Vec<LiveRange> = ranges.into_values().collect();
    out.sort_by_key(|r| (r.start, r.vreg));
    out
}

fn touch(ranges: &mut HashMap<Vreg, LiveRange>, vreg: Vreg, size: SizeClass, pos: u32) {
    let range = ranges.entry(vreg).or_insert(LiveRange {
        vreg,
        start: pos,
        end: pos,
        size,
    });
    range.start = range.start.min(pos);
    range.end = range.end.max(pos);
    // Widen on re-use: the recorded size class is the maximum observed
    range.size = range.size.max(size);
}

fn pool_index(reg: Reg64) -> usize {
    ALLOCATABLE_REGS
        .iter()
        .position(|&r| r == reg)
        .unwrap_or(ALLOCATABLE_REGS.len())
}

/// Result of register allocation for one function.
///
/// A `Pair` vreg's assigned register is the low half; the high half is the
/// register with the next encoding.
#[derive(Debug, Default)]
pub struct Allocation {
    registers: HashMap<Vreg, Reg64>,
    sizes: HashMap<Vreg, SizeClass>,
    spill_slots: HashMap<Vreg, u32>,
    spill_slot_count: u32,
    local_count: u32,
    used_callee_saved: Vec<Reg64>,
}

impl Allocation {
    /// Run linear scan over the function
    pub fn run(func: &Function) -> Allocation {
        let ranges = compute_live_ranges(func);
        let mut alloc = Allocation {
            local_count: func.local_count as u32,
            ..Default::default()
        };

        let mut free: Vec<Reg64> = ALLOCATABLE_REGS.to_vec();
        // Active ranges, sorted by ascending end position
        let mut active: Vec<(u32, Vreg, Reg64, SizeClass)> = Vec::new();

        for range in &ranges {
            while let Some(&(end, _, reg, size)) = active.first() {
                if end >= range.start {
                    break;
                }
                active.remove(0);
                free.push(reg);
                if size == SizeClass::Pair {
                    if let Some(high) = reg.next() {
                        free.push(high);
                    }
                }
                free.sort_by_key(|&r| pool_index(r));
            }

            let assigned = match range.size {
                SizeClass::Word => {
                    if free.is_empty() {
                        None
                    } else {
                        Some(free.remove(0))
                    }
                }
                SizeClass::Pair => take_pair(&mut free),
            };

            match assigned {
                Some(reg) => {
                    trace!(
                        "v{} -> {}{} [{}..{}]",
                        range.vreg.0,
                        reg,
                        if range.size == SizeClass::Pair { ":pair" } else { "" },
                        range.start,
                        range.end
                    );
                    alloc.note_callee_saved(reg, range.size);
                    alloc.registers.insert(range.vreg, reg);
                    alloc.sizes.insert(range.vreg, range.size);
                    let idx = active.partition_point(|&(end, _, _, _)| end <= range.end);
                    active.insert(idx, (range.end, range.vreg, reg, range.size));
                }
                None => {
                    let slot = alloc.spill_slot_count;
                    alloc.spill_slot_count += range.size.slots();
                    trace!("v{} -> spill slot {}", range.vreg.0, slot);
                    alloc.spill_slots.insert(range.vreg, slot);
                }
            }
        }

        alloc
    }

    fn note_callee_saved(&mut self, low: Reg64, size: SizeClass) {
        let mut note = |reg: Reg64| {
            if reg.is_callee_saved() && !self.used_callee_saved.contains(&reg) {
                self.used_callee_saved.push(reg);
            }
        };
        note(low);
        if size == SizeClass::Pair {
            if let Some(high) = low.next() {
                note(high);
            }
        }
    }

    /// Assigned physical register (low half for pairs)
    pub fn register_of(&self, vreg: Vreg) -> Option<Reg64> {
        self.registers.get(&vreg).copied()
    }

    /// High half of a pair assignment
    pub fn pair_high_of(&self, vreg: Vreg) -> Option<Reg64> {
        match self.sizes.get(&vreg) {
            Some(SizeClass::Pair) => self.registers.get(&vreg).and_then(|r| r.next()),
            _ => None,
        }
    }

    /// Assigned spill slot index. Callers check this before `register_of`.
    pub fn spill_slot_of(&self, vreg: Vreg) -> Option<u32> {
        self.spill_slots.get(&vreg).copied()
    }

    /// Callee-saved registers the prologue must preserve, in pool order
    pub fn used_callee_saved(&self) -> &[Reg64] {
        &self.used_callee_saved
    }

    /// Total frame size: globals block, locals, spill slots, and the
    /// callee-saved save area, rounded up to 16 bytes.
    pub fn frame_size(&self) -> u32 {
        let raw = self.saved_base() + self.used_callee_saved.len() as u32 * 8;
        (raw + 15) & !15
    }

    fn saved_base(&self) -> u32 {
        GLOBALS_BLOCK_SIZE + self.local_count * 8 + self.spill_slot_count * 8
    }

    /// SP-relative offset of an interpreter global slot
    pub fn global_offset(&self, slot: u32) -> u16 {
        (slot * 16) as u16
    }

    /// SP-relative offset of a bytecode local slot
    pub fn local_offset(&self, slot: u32) -> u16 {
        (GLOBALS_BLOCK_SIZE + slot * 8) as u16
    }

    /// SP-relative offset of a spill slot
    pub fn spill_offset(&self, slot: u32) -> u16 {
        (GLOBALS_BLOCK_SIZE + self.local_count * 8 + slot * 8) as u16
    }

    /// SP-relative offset of the i-th saved callee-saved register
    pub fn saved_offset(&self, index: usize) -> u16 {
        (self.saved_base() + index as u32 * 8) as u16
    }
}

/// Claim two registers with consecutive encodings from the free pool,
/// returning the low half.
fn take_pair(free: &mut Vec<Reg64>) -> Option<Reg64> {
    let low_idx = free
        .iter()
        .position(|&r| r.next().map_or(false, |high| free.contains(&high)))?;
    let low = free.remove(low_idx);
    if let Some(high) = low.next() {
        free.retain(|&r| r != high);
    }
    Some(low)
}
