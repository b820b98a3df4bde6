use crate::index::InstId;
use crate::literal::Literal;
use crate::ops::Operation;
use crate::passes::{PassResult, ProgramPass};
use crate::program::Program;

/// Evaluates instructions whose inputs are all literals and turns them into
/// literals in place.
///
/// Broadcast results are left alone since materializing them only grows the
/// program, and so are values reinterpreted by an `as_shape` consumer, which
/// depends on the producer's layout.
#[derive(Default)]
pub struct ConstantPropagationPass;

impl ConstantPropagationPass {
    const NAME: &'static str = "constant-propagation";
}

impl ProgramPass for ConstantPropagationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program) -> PassResult {
        let mut folded = 0usize;
        for inst in program.ids() {
            let Some(literal) = fold(program, inst) else {
                continue;
            };
            match program.replace_with(inst, Operation::Literal(literal), &[]) {
                Ok(()) => folded += 1,
                Err(err) => log::debug!("kept {inst} unfolded: {err}"),
            }
        }
        PassResult {
            changed: folded > 0,
            iterations: 1,
            rewrites_applied: folded,
            erased_insts: 0,
        }
    }
}

fn fold(program: &Program, inst: InstId) -> Option<Literal> {
    let node = program.get(inst);
    if node.inputs().is_empty() || node.shape().is_broadcasted() {
        return None;
    }
    if node
        .consumers()
        .iter()
        .any(|&consumer| matches!(program.op(consumer), Operation::AsShape(_)))
    {
        return None;
    }
    let args = node
        .inputs()
        .iter()
        .map(|&input| match program.op(input) {
            Operation::Literal(literal) => Some(literal),
            _ => None,
        })
        .collect::<Option<Vec<&Literal>>>()?;
    match node.op().evaluate(node.shape(), &args) {
        Ok(literal) => Some(literal),
        Err(err) => {
            log::debug!("cannot fold {inst} ({}): {err}", node.name());
            None
        }
    }
}
