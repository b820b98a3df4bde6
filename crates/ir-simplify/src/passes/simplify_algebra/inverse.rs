//! Canonicalizes `div`, `sub` and `recip(sqrt)` into forms the associative
//! rules can see through.

use crate::ops::Operation;
use crate::pattern::matchers::{is_constant, used_once};
use crate::pattern::{filters, DivOpView, OpRewritePattern, RecipOpView, RewriteResult, SubOpView};
use crate::rewriter::ProgramRewriter;

/// `div(x, c)` with constant `c` becomes `mul(x, recip(c))`.
pub struct DivConst;

impl OpRewritePattern<DivOpView> for DivConst {
    fn match_and_rewrite(&self, view: DivOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        if !is_constant(rewriter.program(), view.rhs) {
            return Ok(false);
        }
        let recip = rewriter.insert_after(view.rhs, Operation::recip(), &[view.rhs])?;
        rewriter.replace_with(view.root, Operation::mul(), &[view.lhs, recip])?;
        Ok(true)
    }
}

/// `sub(x, c)` with constant `c` becomes `add(x, neg(c))`.
pub struct SubConst;

impl OpRewritePattern<SubOpView> for SubConst {
    fn match_and_rewrite(&self, view: SubOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        if !is_constant(rewriter.program(), view.rhs) {
            return Ok(false);
        }
        let neg = rewriter.insert_after(view.rhs, Operation::neg(), &[view.rhs])?;
        rewriter.replace_with(view.root, Operation::add(), &[view.lhs, neg])?;
        Ok(true)
    }
}

/// `recip(sqrt(x))` becomes `rsqrt(x)` when nothing else reads the square root.
pub struct Rsqrt;

impl OpRewritePattern<RecipOpView> for Rsqrt {
    fn match_and_rewrite(&self, view: RecipOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        if !filters::sqrt(program.op(view.input)) || !used_once(program, view.input) {
            return Ok(false);
        }
        let x = program.inputs(view.input)[0];
        rewriter.replace_with(view.root, Operation::rsqrt(), &[x])?;
        Ok(true)
    }
}
