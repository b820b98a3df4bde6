use std::collections::HashMap;
use std::fmt;

/// Stable handle of an instruction inside a [`Program`](crate::program::Program).
///
/// Handles are allocated monotonically and never reused, so a handle to a
/// removed instruction can never alias a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct InstId(pub u32);

impl InstId {
    pub(crate) fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Position and version bookkeeping for the instruction order.
#[derive(Debug, Clone, Default)]
pub struct ProgramIndices {
    pos_of: HashMap<InstId, usize>,
    version: HashMap<InstId, u32>,
    next_inst: u32,
}

impl ProgramIndices {
    /// Position of the instruction in the program order.
    pub fn position(&self, inst: InstId) -> Option<usize> {
        self.pos_of.get(&inst).copied()
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.pos_of.contains_key(&inst)
    }

    /// Mutation counter, bumped whenever the instruction is rewritten in place.
    pub fn version(&self, inst: InstId) -> Option<u32> {
        self.version.get(&inst).copied()
    }

    pub fn len(&self) -> usize {
        self.pos_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos_of.is_empty()
    }

    pub(crate) fn allocate_inst(&mut self) -> InstId {
        let inst = InstId(self.next_inst);
        self.next_inst += 1;
        inst
    }

    pub(crate) fn insert_at(&mut self, inst: InstId, pos: usize) {
        self.shift_positions_from(pos, 1);
        self.pos_of.insert(inst, pos);
        self.version.insert(inst, 0);
    }

    pub(crate) fn remove(&mut self, inst: InstId) {
        if let Some(pos) = self.pos_of.remove(&inst) {
            self.shift_positions_from(pos + 1, -1);
        }
        self.version.remove(&inst);
    }

    pub(crate) fn bump_version(&mut self, inst: InstId) {
        if let Some(ver) = self.version.get_mut(&inst) {
            *ver = ver.wrapping_add(1);
        }
    }

    /// Rebuilds positions after the order was permuted.
    pub(crate) fn reindex(&mut self, order: &[InstId]) {
        for (pos, inst) in order.iter().enumerate() {
            self.pos_of.insert(*inst, pos);
        }
    }

    fn shift_positions_from(&mut self, start: usize, delta: isize) {
        if delta == 0 {
            return;
        }
        for (_, pos) in self.pos_of.iter_mut() {
            if *pos >= start {
                if delta.is_positive() {
                    *pos += delta.unsigned_abs();
                } else {
                    *pos -= delta.unsigned_abs();
                }
            }
        }
    }
}
