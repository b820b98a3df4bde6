//! Re-association of `add`/`mul` chains so constants end up together.

use crate::index::InstId;
use crate::ops::Operation;
use crate::pattern::matchers::{
    add_of_constant_or_broadcast, broadcast_spec, conv_with_constant_weights, either_arg,
    is_constant, is_constant_or_broadcast, used_once,
};
use crate::pattern::{filters, AddOpView, MulOpView, OpRewritePattern, RewriteResult};
use crate::program::Program;
use crate::rewriter::ProgramRewriter;

/// `op(broadcast(x), broadcast(y))` becomes `broadcast(op(x, y))` when both
/// broadcasts are the same operation over equally sized inputs.
pub struct InnerBroadcast;

impl InnerBroadcast {
    fn rewrite(
        root: InstId,
        lhs: InstId,
        rhs: InstId,
        rewriter: &mut ProgramRewriter,
    ) -> RewriteResult {
        let program = rewriter.program();
        let (Some(lhs_spec), Some(rhs_spec)) =
            (broadcast_spec(program, lhs), broadcast_spec(program, rhs))
        else {
            return Ok(false);
        };
        if lhs_spec != rhs_spec {
            return Ok(false);
        }
        let x = program.inputs(lhs)[0];
        let y = program.inputs(rhs)[0];
        if program.shape(x).lens() != program.shape(y).lens() {
            return Ok(false);
        }
        let broadcast = Operation::Broadcast(lhs_spec.clone());
        let op = program.op(root).clone();

        let inner = rewriter.insert_before(root, op, &[x, y])?;
        rewriter.replace_with(root, broadcast, &[inner])?;
        Ok(true)
    }
}

impl OpRewritePattern<AddOpView> for InnerBroadcast {
    fn match_and_rewrite(&self, view: AddOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        Self::rewrite(view.root, view.lhs, view.rhs, rewriter)
    }
}

impl OpRewritePattern<MulOpView> for InnerBroadcast {
    fn match_and_rewrite(&self, view: MulOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        Self::rewrite(view.root, view.lhs, view.rhs, rewriter)
    }
}

/// `add(add(x, a), add(y, b))` with constant or broadcast `a` and `b`
/// becomes `add(add(x, y), add(a, b))`.
///
/// Two broadcasts of the same shape are summed before broadcasting.
pub struct DoubleAddLitBroadcast;

impl OpRewritePattern<AddOpView> for DoubleAddLitBroadcast {
    fn match_and_rewrite(&self, view: AddOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some((a, x)) = add_of_constant_or_broadcast(program, view.lhs) else {
            return Ok(false);
        };
        let Some((b, y)) = add_of_constant_or_broadcast(program, view.rhs) else {
            return Ok(false);
        };
        let presum = match (broadcast_spec(program, a), broadcast_spec(program, b)) {
            (Some(a_spec), Some(b_spec)) if a_spec == b_spec => {
                let a_in = program.inputs(a)[0];
                let b_in = program.inputs(b)[0];
                (program.shape(a_in).lens() == program.shape(b_in).lens())
                    .then(|| (Operation::Broadcast(a_spec.clone()), a_in, b_in))
            }
            _ => None,
        };

        let sumab = match presum {
            Some((broadcast, a_in, b_in)) => {
                let inner = rewriter.insert_before(view.root, Operation::add(), &[a_in, b_in])?;
                rewriter.insert_before(view.root, broadcast, &[inner])?
            }
            None => rewriter.insert_before(view.root, Operation::add(), &[a, b])?,
        };
        let sumxy = rewriter.insert_before(view.root, Operation::add(), &[x, y])?;
        rewriter.replace_with(view.root, Operation::add(), &[sumxy, sumab])?;
        Ok(true)
    }
}

/// `add(add(x, a), b)` with constant or broadcast `a` and `b` becomes
/// `add(x, add(a, b))`.
pub struct AddLitBroadcast;

impl OpRewritePattern<AddOpView> for AddLitBroadcast {
    fn match_and_rewrite(&self, view: AddOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some((inner, b)) = either_arg(
            program,
            view.root,
            |inst| add_of_constant_or_broadcast(program, inst).is_some(),
            |inst| is_constant_or_broadcast(program, inst),
        ) else {
            return Ok(false);
        };
        let Some((a, x)) = add_of_constant_or_broadcast(program, inner) else {
            return Ok(false);
        };

        let sumab = rewriter.insert_before(view.root, Operation::add(), &[a, b])?;
        rewriter.replace_with(view.root, Operation::add(), &[x, sumab])?;
        Ok(true)
    }
}

/// Distributes a constant factor over a single-use sum:
/// `mul(add(x, b), a)` becomes `add(mul(a, x), mul(a, b))`.
///
/// `b` must be constant or a convolution with constant weights so the
/// second product can be folded later.
pub struct MulAdd;

impl OpRewritePattern<MulOpView> for MulAdd {
    fn match_and_rewrite(&self, view: MulOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some((sum, a)) = either_arg(
            program,
            view.root,
            |inst| filters::add(program.op(inst)),
            |inst| is_constant(program, inst),
        ) else {
            return Ok(false);
        };
        if !used_once(program, sum) {
            return Ok(false);
        }
        if program
            .inputs(sum)
            .iter()
            .all(|&input| is_constant(program, input))
        {
            return Ok(false);
        }
        let Some((x, b)) = either_arg(
            program,
            sum,
            |_| true,
            |inst| is_constant(program, inst) || conv_with_constant_weights(program, inst),
        ) else {
            return Ok(false);
        };

        let ax = rewriter.insert_before(view.root, Operation::mul(), &[a, x])?;
        let ab = rewriter.insert_before(view.root, Operation::mul(), &[a, b])?;
        rewriter.replace_with(view.root, Operation::add(), &[ax, ab])?;
        Ok(true)
    }
}

/// `add(x, 0)` and `mul(x, 1)` with a literal of the result's size forward
/// `x` to every consumer.
///
/// Fully constant expressions are left to constant propagation.
pub struct EliminateIdentity;

impl EliminateIdentity {
    fn rewrite(root: InstId, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Operation::ElementwiseBinary(op) = program.op(root) else {
            return Ok(false);
        };
        let Some(identity) = op.identity() else {
            return Ok(false);
        };
        let Some((_, x)) = either_arg(
            program,
            root,
            |inst| is_identity_literal(program, inst, root, identity),
            |inst| !is_constant(program, inst),
        ) else {
            return Ok(false);
        };

        rewriter.replace_all_uses(root, x)?;
        Ok(true)
    }
}

impl OpRewritePattern<AddOpView> for EliminateIdentity {
    fn match_and_rewrite(&self, view: AddOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        Self::rewrite(view.root, rewriter)
    }
}

impl OpRewritePattern<MulOpView> for EliminateIdentity {
    fn match_and_rewrite(&self, view: MulOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        Self::rewrite(view.root, rewriter)
    }
}

fn is_identity_literal(program: &Program, inst: InstId, root: InstId, identity: f64) -> bool {
    match program.op(inst) {
        Operation::Literal(literal) => {
            literal.shape().lens() == program.shape(root).lens()
                && literal.to_f64_vec().iter().all(|&value| value == identity)
        }
        _ => false,
    }
}
