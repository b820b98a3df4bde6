use crate::ops::Operation;
use crate::passes::{PassResult, ProgramPass};
use crate::program::Program;

#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl ProgramPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program) -> PassResult {
        let removed = eliminate_dead_code(program);
        PassResult {
            changed: removed > 0,
            iterations: 0,
            rewrites_applied: 0,
            erased_insts: removed,
        }
    }
}

/// Removes every instruction that is neither an output nor read by a live
/// instruction, returning how many were removed. Parameters are part of the
/// program signature and always stay.
///
/// One backward walk suffices: consumers always follow their inputs, so by
/// the time an instruction is reached all of its consumers have been
/// decided.
pub fn eliminate_dead_code(program: &mut Program) -> usize {
    let outputs = program.outputs();
    let mut removed = 0;
    for inst in program.ids().into_iter().rev() {
        if outputs.contains(&inst) || !program.consumers(inst).is_empty() {
            continue;
        }
        if matches!(program.op(inst), Operation::Parameter(_)) {
            continue;
        }
        program.remove_instruction(inst);
        removed += 1;
    }
    removed
}
