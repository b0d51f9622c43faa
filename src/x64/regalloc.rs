//! x64 Register Allocation
//!
//! Linear scan over live ranges computed from the linearized instruction
//! order. Allocation never fails: when the free pool is empty the range is
//! assigned a stack spill slot instead.

use std::collections::HashMap;

use log::trace;

use crate::ir::{Function, SizeClass, Value, Vreg};

use super::registers::{Reg64, ALLOCATABLE_REGS};

/// Bytes the prologue pushes below the saved RBP: RBX and R12-R15.
/// Local and spill slots start below this area.
pub const SAVE_AREA_BYTES: u32 = 40;

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
/// The position counter increases across the function's blocks in
/// block-list order, not control-flow order; loop-carried values may
/// receive ranges that under-cover their true extent. The approximation is
/// isolated here so a CFG-based liveness pass could be substituted without
/// touching the allocator.
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

/// Result of register allocation for one function
#[derive(Debug, Default)]
pub struct Allocation {
    registers: HashMap<Vreg, Reg64>,
    spill_slots: HashMap<Vreg, u32>,
    spill_slot_count: u32,
    local_count: u32,
}

impl Allocation {
    /// Run linear scan over the function
    pub fn run(func: &Function) -> Allocation {
        let ranges = compute_live_ranges(func);
        let mut alloc = Allocation {
            local_count: func.local_count as u32,
            ..Default::default()
        };

        // Pop order follows the declared allocatable order
        let mut free: Vec<Reg64> = ALLOCATABLE_REGS.iter().rev().copied().collect();
        // Active ranges, kept sorted by ascending end position
        let mut active: Vec<(u32, Vreg, Reg64)> = Vec::new();

        for range in &ranges {
            // Expire every active range ending before this one starts
            while let Some(&(end, _, reg)) = active.first() {
                if end >= range.start {
                    break;
                }
                active.remove(0);
                free.push(reg);
            }

            if let Some(reg) = free.pop() {
                trace!("v{} -> {} [{}..{}]", range.vreg.0, reg, range.start, range.end);
                alloc.registers.insert(range.vreg, reg);
                let idx = active.partition_point(|&(end, _, _)| end <= range.end);
                active.insert(idx, (range.end, range.vreg, reg));
            } else {
                let slot = alloc.spill_slot_count;
                alloc.spill_slot_count += range.size.slots();
                trace!("v{} -> spill slot {}", range.vreg.0, slot);
                alloc.spill_slots.insert(range.vreg, slot);
            }
        }

        alloc
    }

    /// Assigned physical register, if the vreg was not spilled
    pub fn register_of(&self, vreg: Vreg) -> Option<Reg64> {
        self.registers.get(&vreg).copied()
    }

    /// Assigned spill slot index. Callers check this before `register_of`.
    pub fn spill_slot_of(&self, vreg: Vreg) -> Option<u32> {
        self.spill_slots.get(&vreg).copied()
    }

    /// Stack bytes reserved below the callee-saved save area.
    ///
    /// The six prologue pushes (RBP plus the save area) leave RSP eight
    /// bytes off a 16-byte boundary, so the frame carries an extra eight
    /// to keep RSP aligned at every call site.
    pub fn frame_size(&self) -> u32 {
        let raw = self.spill_slot_count * 8 + self.local_count * 8;
        ((raw + 15) & !15) + 8
    }

    /// RBP-relative offset of a bytecode local slot
    pub fn local_offset(&self, slot: u32) -> i32 {
        -(SAVE_AREA_BYTES as i32 + (slot as i32 + 1) * 8)
    }

    /// RBP-relative offset of a spill slot (spills live below the locals)
    pub fn spill_offset(&self, slot: u32) -> i32 {
        -(SAVE_AREA_BYTES as i32 + (self.local_count as i32 + slot as i32 + 1) * 8)
    }
}
