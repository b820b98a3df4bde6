//! Mutable instruction graph.
//!
//! A [`Program`] owns every [`Instruction`] in an arena addressed by
//! [`InstId`]. The instruction order is always a valid topological order:
//! an instruction only references instructions placed before it. Consumer
//! lists are maintained incrementally alongside the inputs, and every cached
//! output shape equals the operator's shape rule applied to the current
//! inputs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

use crate::index::{InstId, ProgramIndices};
use crate::literal::Literal;
use crate::ops::{reinterpret, EvalError, Operation, ParameterSpec};
use crate::shape::{Shape, ShapeError};

/// Errors raised while building a program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("parameter `{name}` is already registered")]
    DuplicateParameter { name: String },
}

/// Graph node pairing an operator with its resolved output shape and edges.
#[derive(Debug, Clone)]
pub struct Instruction {
    op: Operation,
    shape: Shape,
    inputs: SmallVec<[InstId; 4]>,
    consumers: SmallVec<[InstId; 4]>,
}

impl Instruction {
    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn inputs(&self) -> &[InstId] {
        &self.inputs
    }

    /// Instructions that read this one, each listed once.
    pub fn consumers(&self) -> &[InstId] {
        &self.consumers
    }

    pub fn name(&self) -> &'static str {
        self.op.name()
    }
}

/// Pending change of an instruction's operator and inputs.
struct Edit {
    inst: InstId,
    op: Operation,
    inputs: SmallVec<[InstId; 4]>,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    nodes: Vec<Option<Instruction>>,
    order: Vec<InstId>,
    indices: ProgramIndices,
    parameters: HashMap<String, InstId>,
    returns: Vec<InstId>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named program input.
    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
    ) -> Result<InstId, ProgramError> {
        let name = name.into();
        if self.parameters.contains_key(&name) {
            return Err(ProgramError::DuplicateParameter { name });
        }
        let op = Operation::Parameter(ParameterSpec {
            name: name.clone(),
            shape: shape.clone(),
        });
        let inst = self.insert_at(self.order.len(), op, &[], shape);
        self.parameters.insert(name, inst);
        Ok(inst)
    }

    pub fn add_literal(&mut self, literal: Literal) -> InstId {
        let shape = literal.shape().clone();
        self.insert_at(self.order.len(), Operation::Literal(literal), &[], shape)
    }

    /// Appends an instruction after every existing one.
    pub fn add_instruction(
        &mut self,
        op: Operation,
        inputs: &[InstId],
    ) -> Result<InstId, ShapeError> {
        let shape = self.infer_shape(&op, inputs)?;
        Ok(self.insert_at(self.order.len(), op, inputs, shape))
    }

    /// Inserts an instruction immediately before `before`.
    ///
    /// Panics if an input does not precede `before`.
    pub fn insert_instruction(
        &mut self,
        before: InstId,
        op: Operation,
        inputs: &[InstId],
    ) -> Result<InstId, ShapeError> {
        let pos = self.position(before);
        self.assert_inputs_precede(inputs, pos, before);
        let shape = self.infer_shape(&op, inputs)?;
        Ok(self.insert_at(pos, op, inputs, shape))
    }

    /// Inserts an instruction immediately after `after`.
    pub fn insert_after(
        &mut self,
        after: InstId,
        op: Operation,
        inputs: &[InstId],
    ) -> Result<InstId, ShapeError> {
        let pos = self.position(after) + 1;
        self.assert_inputs_precede(inputs, pos, after);
        let shape = self.infer_shape(&op, inputs)?;
        Ok(self.insert_at(pos, op, inputs, shape))
    }

    /// Redirects every consumer of `old` (other than `new` itself) and every
    /// output reference to `new`. `old` is left in place without consumers.
    ///
    /// Consumer shapes are recomputed transitively; nothing is mutated when
    /// one of them is rejected.
    pub fn replace_instruction(&mut self, old: InstId, new: InstId) -> Result<(), ShapeError> {
        assert_ne!(old, new, "instruction {old} cannot replace itself");
        let new_pos = self.position(new);
        let mut edits = Vec::new();
        for &consumer in self.consumers(old) {
            if consumer == new {
                continue;
            }
            assert!(
                new_pos < self.position(consumer),
                "replacement {new} must precede consumer {consumer}"
            );
            let inst = self.get(consumer);
            let inputs = inst
                .inputs
                .iter()
                .map(|&input| if input == old { new } else { input })
                .collect();
            edits.push(Edit {
                inst: consumer,
                op: inst.op.clone(),
                inputs,
            });
        }

        let shapes = self.plan_shapes(&edits)?;
        let promote_implicit = self.returns.is_empty() && self.order.last() == Some(&old);
        self.commit(edits, shapes);

        for output in &mut self.returns {
            if *output == old {
                *output = new;
            }
        }
        if promote_implicit {
            self.returns.push(new);
        }
        Ok(())
    }

    /// Rewrites `inst` in place with a new operator and inputs.
    ///
    /// The handle stays the same, so consumers keep reading from it; their
    /// shapes are recomputed transitively and validated before anything is
    /// mutated. Panics if an input does not precede `inst`.
    pub fn replace_with(
        &mut self,
        inst: InstId,
        op: Operation,
        inputs: &[InstId],
    ) -> Result<(), ShapeError> {
        if let Operation::Parameter(_) = op {
            return Err(ShapeError::new(
                op.name(),
                "parameters are registered through add_parameter",
            ));
        }
        let pos = self.position(inst);
        self.assert_inputs_precede(inputs, pos, inst);
        let edits = vec![Edit {
            inst,
            op,
            inputs: inputs.iter().copied().collect(),
        }];
        let shapes = self.plan_shapes(&edits)?;
        if let Operation::Parameter(spec) = &self.get(inst).op {
            let name = spec.name.clone();
            self.parameters.remove(&name);
        }
        self.commit(edits, shapes);
        Ok(())
    }

    /// Makes `consumer` read `new_input` wherever it read `old_input`.
    pub fn replace_argument(
        &mut self,
        consumer: InstId,
        old_input: InstId,
        new_input: InstId,
    ) -> Result<(), ShapeError> {
        let inst = self.get(consumer);
        let op = inst.op.clone();
        let inputs: Vec<InstId> = inst
            .inputs
            .iter()
            .map(|&input| if input == old_input { new_input } else { input })
            .collect();
        self.replace_with(consumer, op, &inputs)
    }

    /// Deletes an instruction that has no consumers and is not an output.
    pub fn remove_instruction(&mut self, inst: InstId) {
        if !self.consumers(inst).is_empty() {
            panic!("attempting to remove instruction {inst} with live consumers");
        }
        if self.returns.contains(&inst) {
            panic!("attempting to remove program output {inst}");
        }
        let pos = self.position(inst);
        let removed = self.nodes[inst.slot()]
            .take()
            .expect("instruction id must be valid");
        for input in removed.inputs.iter().copied() {
            self.unlink(input, inst);
        }
        if let Operation::Parameter(spec) = &removed.op {
            self.parameters.remove(&spec.name);
        }
        self.order.remove(pos);
        self.indices.remove(inst);
    }

    /// Moves `inst`, along with every dependency of it placed after
    /// `anchor`, directly before `anchor`.
    ///
    /// Returns `false` without mutating when `inst` depends on `anchor`.
    pub fn hoist_before(&mut self, inst: InstId, anchor: InstId) -> bool {
        let anchor_pos = self.position(anchor);
        if self.position(inst) < anchor_pos {
            return true;
        }
        let mut closure = HashSet::new();
        let mut stack = vec![inst];
        while let Some(current) = stack.pop() {
            if current == anchor {
                return false;
            }
            if self.position(current) < anchor_pos || !closure.insert(current) {
                continue;
            }
            stack.extend(self.inputs(current).iter().copied());
        }

        let moved: Vec<InstId> = self
            .order
            .iter()
            .copied()
            .filter(|id| closure.contains(id))
            .collect();
        self.order.retain(|id| !closure.contains(id));
        let at = self
            .order
            .iter()
            .position(|&id| id == anchor)
            .expect("anchor must stay in the order");
        self.order.splice(at..at, moved);
        self.indices.reindex(&self.order);
        true
    }

    /// Declares the program outputs.
    pub fn add_return(&mut self, outputs: &[InstId]) {
        for &output in outputs {
            assert!(self.contains(output), "output {output} is not in the program");
        }
        self.returns = outputs.to_vec();
    }

    /// Declared outputs, or the last instruction when none were declared.
    pub fn outputs(&self) -> Vec<InstId> {
        if self.returns.is_empty() {
            self.order.last().copied().into_iter().collect()
        } else {
            self.returns.clone()
        }
    }

    pub fn is_output(&self, inst: InstId) -> bool {
        self.outputs().contains(&inst)
    }

    pub fn get(&self, inst: InstId) -> &Instruction {
        self.try_get(inst).expect("instruction id must be valid")
    }

    pub fn try_get(&self, inst: InstId) -> Option<&Instruction> {
        self.nodes.get(inst.slot()).and_then(Option::as_ref)
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.indices.contains(inst)
    }

    pub fn op(&self, inst: InstId) -> &Operation {
        &self.get(inst).op
    }

    pub fn shape(&self, inst: InstId) -> &Shape {
        &self.get(inst).shape
    }

    pub fn inputs(&self, inst: InstId) -> &[InstId] {
        &self.get(inst).inputs
    }

    pub fn consumers(&self, inst: InstId) -> &[InstId] {
        &self.get(inst).consumers
    }

    pub fn position(&self, inst: InstId) -> usize {
        self.indices
            .position(inst)
            .expect("instruction id must be valid")
    }

    pub fn version(&self, inst: InstId) -> Option<u32> {
        self.indices.version(inst)
    }

    pub fn parameter(&self, name: &str) -> Option<InstId> {
        self.parameters.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Instruction handles in program order.
    pub fn ids(&self) -> Vec<InstId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstId, &Instruction)> + '_ {
        self.order.iter().map(move |&id| (id, self.get(id)))
    }

    /// Canonical copy: a depth-first post-order from the outputs, visiting
    /// inputs in operand order, followed by the unreached instructions in
    /// their current relative order.
    pub fn sort(&self) -> Program {
        let mut emitted: Vec<InstId> = Vec::with_capacity(self.len());
        let mut visited: HashSet<InstId> = HashSet::with_capacity(self.len());
        for root in self.outputs() {
            let mut stack: Vec<(InstId, usize)> = vec![(root, 0)];
            if !visited.insert(root) {
                continue;
            }
            while let Some((inst, next)) = stack.pop() {
                let inputs = self.inputs(inst);
                if next < inputs.len() {
                    stack.push((inst, next + 1));
                    let input = inputs[next];
                    if visited.insert(input) {
                        stack.push((input, 0));
                    }
                } else {
                    emitted.push(inst);
                }
            }
        }
        emitted.extend(self.order.iter().filter(|id| !visited.contains(id)));

        let mut sorted = Program::new();
        let mut remap: HashMap<InstId, InstId> = HashMap::with_capacity(self.len());
        for inst in emitted {
            let node = self.get(inst);
            let inputs: Vec<InstId> = node.inputs.iter().map(|input| remap[input]).collect();
            let id = sorted.insert_at(sorted.len(), node.op.clone(), &inputs, node.shape.clone());
            if let Operation::Parameter(spec) = &node.op {
                sorted.parameters.insert(spec.name.clone(), id);
            }
            remap.insert(inst, id);
        }
        let outputs: Vec<InstId> = self.outputs().iter().map(|output| remap[output]).collect();
        if !self.returns.is_empty() || sorted.outputs() != outputs {
            sorted.returns = outputs;
        }
        sorted
    }

    /// Checks edge symmetry, topological order and cached shapes.
    pub fn verify(&self) -> bool {
        for (pos, &id) in self.order.iter().enumerate() {
            let Some(inst) = self.try_get(id) else {
                return false;
            };
            if self.indices.position(id) != Some(pos) {
                return false;
            }
            for &input in &inst.inputs {
                match self.indices.position(input) {
                    Some(input_pos) if input_pos < pos => {}
                    _ => return false,
                }
                if !self.consumers(input).contains(&id) {
                    return false;
                }
            }
            for &consumer in &inst.consumers {
                if !self.contains(consumer) || !self.inputs(consumer).contains(&id) {
                    return false;
                }
            }
            let shapes: Vec<&Shape> = inst.inputs.iter().map(|&input| self.shape(input)).collect();
            match inst.op.compute_shape(&shapes) {
                Ok(shape) if shape == inst.shape => {}
                _ => return false,
            }
        }
        self.returns.iter().all(|&output| self.contains(output))
    }

    /// Runs the program on the host, binding parameters by name.
    pub fn evaluate(&self, params: &HashMap<String, Literal>) -> Result<Vec<Literal>, EvalError> {
        let mut values: HashMap<InstId, Literal> = HashMap::with_capacity(self.len());
        for (id, inst) in self.iter() {
            let value = match &inst.op {
                Operation::Parameter(spec) => {
                    let bound =
                        params
                            .get(&spec.name)
                            .ok_or_else(|| EvalError::MissingParameter {
                                name: spec.name.clone(),
                            })?;
                    if bound.shape().lens() != spec.shape.lens()
                        || bound.dtype() != spec.shape.dtype()
                    {
                        return Err(EvalError::ParameterMismatch {
                            name: spec.name.clone(),
                            expected: spec.shape.clone(),
                            found: bound.shape().clone(),
                        });
                    }
                    bound.clone()
                }
                Operation::AsShape(spec) => {
                    let input = inst.inputs[0];
                    reinterpret(&spec.shape, self.shape(input), &values[&input])?
                }
                op => {
                    let args: Vec<&Literal> = inst.inputs.iter().map(|input| &values[input]).collect();
                    op.evaluate(&inst.shape, &args)?
                }
            };
            values.insert(id, value);
        }
        Ok(self
            .outputs()
            .iter()
            .map(|output| values[output].clone())
            .collect())
    }

    fn infer_shape(&self, op: &Operation, inputs: &[InstId]) -> Result<Shape, ShapeError> {
        if let Operation::Parameter(_) = op {
            return Err(ShapeError::new(
                op.name(),
                "parameters are registered through add_parameter",
            ));
        }
        let shapes: Vec<&Shape> = inputs.iter().map(|&input| self.shape(input)).collect();
        op.compute_shape(&shapes)
    }

    fn assert_inputs_precede(&self, inputs: &[InstId], pos: usize, point: InstId) {
        for &input in inputs {
            assert!(
                self.position(input) < pos,
                "input {input} does not precede insertion point {point}"
            );
        }
    }

    fn insert_at(&mut self, pos: usize, op: Operation, inputs: &[InstId], shape: Shape) -> InstId {
        let inst = self.indices.allocate_inst();
        debug_assert_eq!(inst.slot(), self.nodes.len());
        self.nodes.push(Some(Instruction {
            op,
            shape,
            inputs: inputs.iter().copied().collect(),
            consumers: SmallVec::new(),
        }));
        self.order.insert(pos, inst);
        self.indices.insert_at(inst, pos);
        for &input in inputs {
            self.link(input, inst);
        }
        inst
    }

    /// Shapes of every instruction affected by `edits`, following consumers
    /// whose shape changes.
    fn plan_shapes(&self, edits: &[Edit]) -> Result<HashMap<InstId, Shape>, ShapeError> {
        let edited: HashMap<InstId, &Edit> = edits.iter().map(|edit| (edit.inst, edit)).collect();
        let mut planned: HashMap<InstId, Shape> = HashMap::new();
        let mut pending: BTreeSet<(usize, InstId)> = edits
            .iter()
            .map(|edit| (self.position(edit.inst), edit.inst))
            .collect();

        while let Some((_, inst)) = pending.pop_first() {
            let (op, inputs) = match edited.get(&inst) {
                Some(edit) => (&edit.op, edit.inputs.as_slice()),
                None => {
                    let node = self.get(inst);
                    (&node.op, node.inputs.as_slice())
                }
            };
            let shape = {
                let shapes: Vec<&Shape> = inputs
                    .iter()
                    .map(|input| planned.get(input).unwrap_or_else(|| self.shape(*input)))
                    .collect();
                op.compute_shape(&shapes)?
            };
            let current = planned.get(&inst).unwrap_or_else(|| self.shape(inst));
            if shape == *current && !edited.contains_key(&inst) {
                continue;
            }
            if shape != *self.shape(inst) {
                for &consumer in self.consumers(inst) {
                    pending.insert((self.position(consumer), consumer));
                }
            }
            planned.insert(inst, shape);
        }
        Ok(planned)
    }

    fn commit(&mut self, edits: Vec<Edit>, shapes: HashMap<InstId, Shape>) {
        for edit in edits {
            let node = self.node_mut(edit.inst);
            node.op = edit.op;
            let previous = std::mem::replace(&mut node.inputs, edit.inputs.clone());
            for input in previous {
                if !edit.inputs.contains(&input) {
                    self.unlink(input, edit.inst);
                }
            }
            for &input in &edit.inputs {
                self.link(input, edit.inst);
            }
            self.indices.bump_version(edit.inst);
        }
        for (inst, shape) in shapes {
            self.node_mut(inst).shape = shape;
            self.indices.bump_version(inst);
        }
    }

    fn node_mut(&mut self, inst: InstId) -> &mut Instruction {
        self.nodes
            .get_mut(inst.slot())
            .and_then(Option::as_mut)
            .expect("instruction id must be valid")
    }

    fn link(&mut self, input: InstId, consumer: InstId) {
        let consumers = &mut self.node_mut(input).consumers;
        if !consumers.contains(&consumer) {
            consumers.push(consumer);
        }
    }

    fn unlink(&mut self, input: InstId, consumer: InstId) {
        self.node_mut(input).consumers.retain(|id| *id != consumer);
    }
}

impl PartialEq for Program {
    /// Order-sensitive structural comparison; inputs and outputs are compared
    /// by position, so handles need not match.
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let same_stream = self.iter().zip(other.iter()).all(|((_, lhs), (_, rhs))| {
            lhs.op == rhs.op
                && lhs.shape == rhs.shape
                && lhs.inputs.len() == rhs.inputs.len()
                && lhs
                    .inputs
                    .iter()
                    .zip(&rhs.inputs)
                    .all(|(&a, &b)| self.position(a) == other.position(b))
        });
        let positions = |program: &Program| -> Vec<usize> {
            program
                .outputs()
                .iter()
                .map(|&output| program.position(output))
                .collect()
        };
        same_stream && positions(self) == positions(other)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, (_, inst)) in self.iter().enumerate() {
            let inputs: Vec<String> = inst
                .inputs
                .iter()
                .map(|&input| format!("@{}", self.position(input)))
                .collect();
            let line = if inst.inputs.is_empty() {
                format!("@{pos} = {} -> {}", inst.op, inst.shape)
            } else {
                format!("@{pos} = {}({}) -> {}", inst.op, inputs.join(", "), inst.shape)
            };
            write_line(f, &line)?;
        }
        let outputs: Vec<String> = self
            .outputs()
            .iter()
            .map(|&output| format!("@{}", self.position(output)))
            .collect();
        write_line(f, &format!("@return({})", outputs.join(", ")))
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, line: &str) -> fmt::Result {
    f.write_str(line)?;
    f.write_str("\n")
}
