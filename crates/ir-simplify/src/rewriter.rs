use crate::{
    index::InstId,
    ops::Operation,
    program::Program,
    shape::{Shape, ShapeError},
};

/// Mutable program editor handed to rewrite patterns.
///
/// Edits are transactional: the first mutation snapshots the program, and
/// [`rollback`](Self::rollback) restores that snapshot. The driver commits
/// only when a pattern reports success, so a pattern that declines halfway
/// through never leaves a partial rewrite behind.
pub struct ProgramRewriter<'a> {
    program: &'a mut Program,
    snapshot: Option<Program>,
    touched: Vec<InstId>,
}

impl<'a> ProgramRewriter<'a> {
    pub fn new(program: &'a mut Program) -> Self {
        Self {
            program,
            snapshot: None,
            touched: Vec::new(),
        }
    }

    /// Read-only view of the program being rewritten.
    pub fn program(&self) -> &Program {
        self.program
    }

    pub fn op(&self, inst: InstId) -> &Operation {
        self.program.op(inst)
    }

    pub fn inputs(&self, inst: InstId) -> &[InstId] {
        self.program.inputs(inst)
    }

    pub fn shape(&self, inst: InstId) -> &Shape {
        self.program.shape(inst)
    }

    pub fn consumers(&self, inst: InstId) -> &[InstId] {
        self.program.consumers(inst)
    }

    /// Inserts a new instruction before `at`.
    pub fn insert_before(
        &mut self,
        at: InstId,
        op: Operation,
        inputs: &[InstId],
    ) -> Result<InstId, ShapeError> {
        self.checkpoint();
        let inst = self.program.insert_instruction(at, op, inputs)?;
        self.touched.push(inst);
        Ok(inst)
    }

    /// Inserts a new instruction directly after `at`.
    pub fn insert_after(
        &mut self,
        at: InstId,
        op: Operation,
        inputs: &[InstId],
    ) -> Result<InstId, ShapeError> {
        self.checkpoint();
        let inst = self.program.insert_after(at, op, inputs)?;
        self.touched.push(inst);
        Ok(inst)
    }

    /// Replaces all uses of `from` with `to`.
    pub fn replace_all_uses(&mut self, from: InstId, to: InstId) -> Result<(), ShapeError> {
        self.checkpoint();
        let consumers = self.program.consumers(from).to_vec();
        self.program.replace_instruction(from, to)?;
        self.touched.push(to);
        self.touched.extend(consumers);
        Ok(())
    }

    /// Rewrites `inst` in place; its consumers keep reading the same handle.
    pub fn replace_with(
        &mut self,
        inst: InstId,
        op: Operation,
        inputs: &[InstId],
    ) -> Result<(), ShapeError> {
        self.checkpoint();
        self.program.replace_with(inst, op, inputs)?;
        self.touched.push(inst);
        Ok(())
    }

    pub fn replace_argument(
        &mut self,
        consumer: InstId,
        from: InstId,
        to: InstId,
    ) -> Result<(), ShapeError> {
        self.checkpoint();
        self.program.replace_argument(consumer, from, to)?;
        self.touched.push(consumer);
        Ok(())
    }

    /// Moves `inst` and its late dependencies before `anchor`.
    pub fn hoist_before(&mut self, inst: InstId, anchor: InstId) -> bool {
        if self.program.position(inst) < self.program.position(anchor) {
            return true;
        }
        self.checkpoint();
        self.program.hoist_before(inst, anchor)
    }

    /// Verifies the structural invariants after mutations.
    pub fn verify(&self) -> bool {
        self.program.verify()
    }

    /// Keeps the edits and returns the instructions they created or touched.
    pub fn commit(self) -> Vec<InstId> {
        let program = self.program;
        self.touched
            .into_iter()
            .filter(|inst| program.contains(*inst))
            .collect()
    }

    /// Discards every edit made through this rewriter.
    pub fn rollback(mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.program = snapshot;
        }
    }

    fn checkpoint(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.program.clone());
        }
    }
}
