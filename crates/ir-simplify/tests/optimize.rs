
use std::collections::HashMap;

use ir_simplify::pattern::{Pattern, PatternSet, RewriteResult};
use ir_simplify::{
    apply_patterns_greedily, optimize, run_passes, ConstantPropagationPass,
    DeadCodeEliminationPass, GreedyConfig, InstId, Literal, OptimizeConfig, Operation, Program,
    ProgramPass, ProgramRewriter, SimplifyAlgebraPass,
};
use program_support::{count_named, float, float_literal, ins, int, int_literal, param, scalar};

/// `(1 + x) + (1 + 2)` on a single-element integer tensor.
fn constant_heavy_sum() -> Program {
    let mut p = Program::new();
    let x = param(&mut p, "x", int(&[1]));
    let one = scalar(&mut p, 1);
    let two = scalar(&mut p, 2);
    let sum1 = ins(&mut p, Operation::add(), &[one, x]);
    let sum2 = ins(&mut p, Operation::add(), &[one, two]);
    let sum3 = ins(&mut p, Operation::add(), &[sum1, sum2]);
    p.add_return(&[sum3]);
    p
}

fn bind_x(value: i32) -> HashMap<String, Literal> {
    HashMap::from([("x".to_string(), Literal::scalar(value))])
}

#[test]
fn optimize_groups_and_folds_constants() -> anyhow::Result<()> {
    let mut p = constant_heavy_sum();
    let before = p.evaluate(&bind_x(5))?;

    let result = optimize(&mut p, &OptimizeConfig::default());
    assert!(result.changed);
    assert!(p.verify());
    assert_eq!(p.len(), 3);
    assert_eq!(count_named(&p, "add"), 1);
    assert_eq!(count_named(&p, "@literal"), 1);

    let after = p.evaluate(&bind_x(5))?;
    assert_eq!(after[0].to_vec::<i32>(), Some(vec![9]));
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn optimize_without_folding_keeps_constant_arithmetic() {
    let mut p = constant_heavy_sum();
    let cfg = OptimizeConfig {
        fold_constants: false,
        ..OptimizeConfig::default()
    };
    optimize(&mut p, &cfg);
    assert_eq!(count_named(&p, "add"), 3);
}

#[test]
fn optimize_reaches_a_fixed_point() {
    let mut p = constant_heavy_sum();
    let cfg = OptimizeConfig::default();
    optimize(&mut p, &cfg);
    let settled = p.clone();
    let result = optimize(&mut p, &cfg);
    assert!(!result.changed);
    assert_eq!(result.rewrites_applied, 0);
    assert_eq!(p, settled);
}

#[test]
fn constant_propagation_folds_in_place() {
    let mut p = Program::new();
    let x = param(&mut p, "x", int(&[2]));
    let a = int_literal(&mut p, &[2], &[2, 3]);
    let b = int_literal(&mut p, &[2], &[4, 5]);
    let product = ins(&mut p, Operation::mul(), &[a, b]);
    let out = ins(&mut p, Operation::add(), &[x, product]);

    let result = ConstantPropagationPass.run(&mut p);
    assert!(result.changed);
    assert_eq!(result.rewrites_applied, 1);
    assert_eq!(p.inputs(out), &[x, product]);
    match p.op(product) {
        Operation::Literal(literal) => assert_eq!(literal.to_vec::<i32>(), Some(vec![8, 15])),
        other => panic!("expected a literal, found {other}"),
    }
    assert!(p.consumers(a).is_empty());
    assert!(p.verify());
}

#[test]
fn constant_propagation_folds_log() {
    let mut p = Program::new();
    let x = param(&mut p, "x", float(&[3]));
    let values = float_literal(&mut p, &[3], &[1.0, 4.0, 0.5]);
    let logs = ins(&mut p, Operation::log(), &[values]);
    let out = ins(&mut p, Operation::mul(), &[x, logs]);
    p.add_return(&[out]);

    let result = ConstantPropagationPass.run(&mut p);
    assert_eq!(result.rewrites_applied, 1);
    let Operation::Literal(literal) = p.op(logs) else {
        panic!("expected a literal, found {}", p.op(logs));
    };
    let folded = literal.to_vec::<f32>().expect("f32 payload");
    for (got, want) in folded.iter().zip([0.0f32, 4.0f32.ln(), 0.5f32.ln()]) {
        assert!((got - want).abs() < 1e-6, "{got} vs {want}");
    }
}

#[test]
fn constant_propagation_keeps_broadcasts_and_reinterpreted_values() {
    let mut p = Program::new();
    let x = param(&mut p, "x", float(&[2, 3]));
    let half = float_literal(&mut p, &[3], &[0.5, 0.5, 0.5]);
    let bcast = ins(&mut p, Operation::broadcast(1, vec![2, 3]), &[half]);
    let scaled = ins(&mut p, Operation::mul(), &[x, bcast]);
    let square = float_literal(&mut p, &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let flipped = ins(&mut p, Operation::transpose(vec![1, 0]), &[square]);
    let view = ins(&mut p, Operation::as_shape(float(&[4])), &[flipped]);
    p.add_return(&[scaled, view]);

    let result = ConstantPropagationPass.run(&mut p);
    assert!(!result.changed);
    assert_eq!(p.op(bcast).name(), "broadcast");
    assert_eq!(p.op(flipped).name(), "transpose");
}

#[test]
fn dead_code_elimination_keeps_parameters_and_outputs() {
    let mut p = Program::new();
    let x = param(&mut p, "x", int(&[2]));
    let unused = param(&mut p, "unused", int(&[2]));
    let dead_literal = scalar(&mut p, 7);
    let dead = ins(&mut p, Operation::neg(), &[x]);
    let dead_user = ins(&mut p, Operation::relu(), &[dead]);
    let live = ins(&mut p, Operation::relu(), &[x]);
    p.add_return(&[live]);

    let result = DeadCodeEliminationPass.run(&mut p);
    assert!(result.changed);
    assert_eq!(result.erased_insts, 3);
    assert_eq!(p.ids(), vec![x, unused, live]);
    for gone in [dead_literal, dead, dead_user] {
        assert!(!p.contains(gone));
    }
    assert_eq!(DeadCodeEliminationPass.run(&mut p).erased_insts, 0);
}

#[test]
fn run_passes_merges_statistics() {
    let mut p = constant_heavy_sum();
    let result = run_passes(
        &mut p,
        &[
            &SimplifyAlgebraPass::default(),
            &ConstantPropagationPass,
            &DeadCodeEliminationPass,
        ],
    );
    assert!(result.changed);
    assert!(result.rewrites_applied >= 2);
    assert!(result.erased_insts >= 2);
    assert_eq!(count_named(&p, "add"), 1);
}

/// Swaps `relu` and `neg` forever.
struct Flip;

impl Pattern for Flip {
    fn matches_operation(&self, op: &Operation) -> bool {
        matches!(op.name(), "relu" | "neg")
    }

    fn match_and_rewrite(&self, root: InstId, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let next = match rewriter.op(root).name() {
            "relu" => Operation::neg(),
            _ => Operation::relu(),
        };
        let inputs = rewriter.inputs(root).to_vec();
        rewriter.replace_with(root, next, &inputs)?;
        Ok(true)
    }
}

/// Matches everything and never rewrites.
struct Decline;

impl Pattern for Decline {
    fn match_and_rewrite(&self, _root: InstId, _rewriter: &mut ProgramRewriter) -> RewriteResult {
        Ok(false)
    }
}

fn relu_program() -> (Program, InstId) {
    let mut p = Program::new();
    let x = param(&mut p, "x", int(&[2]));
    let relu = ins(&mut p, Operation::relu(), &[x]);
    p.add_return(&[relu]);
    (p, relu)
}

#[test]
fn driver_stops_at_the_sweep_cap() {
    let (mut p, relu) = relu_program();
    let mut patterns = PatternSet::new();
    patterns.add(Flip);
    let cfg = GreedyConfig {
        max_iterations: 3,
        ..GreedyConfig::default()
    };

    let stats = apply_patterns_greedily(&mut p, &patterns.freeze(), &cfg);
    assert_eq!(stats.iterations, 3);
    assert_eq!(stats.applied, 3);
    assert!(!stats.converged);
    assert_eq!(p.op(relu).name(), "neg");
    assert!(p.verify());
}

#[test]
fn driver_converges_when_nothing_applies() {
    let (mut p, _) = relu_program();
    let untouched = p.clone();
    let mut patterns = PatternSet::new();
    patterns.add(Decline);

    let stats = apply_patterns_greedily(&mut p, &patterns.freeze(), &GreedyConfig::default());
    assert_eq!(stats.iterations, 1);
    assert_eq!(stats.applied, 0);
    assert!(stats.converged);
    assert_eq!(p, untouched);
}

#[test]
fn empty_pattern_set_is_a_no_op() {
    let (mut p, _) = relu_program();
    let untouched = p.clone();
    let stats = apply_patterns_greedily(
        &mut p,
        &PatternSet::new().freeze(),
        &GreedyConfig::default(),
    );
    assert!(stats.converged);
    assert_eq!(stats.iterations, 0);
    assert_eq!(p, untouched);
}

/// `recip(sqrt(x))`, which fuses into `rsqrt(x)` and orphans the square root.
fn reciprocal_root() -> Program {
    let mut p = Program::new();
    let x = param(&mut p, "x", float(&[4]));
    let root = ins(&mut p, Operation::sqrt(), &[x]);
    ins(&mut p, Operation::recip(), &[root]);
    p
}

#[test]
fn driver_removes_dead_code_between_sweeps() {
    let mut p = reciprocal_root();
    let stats = apply_patterns_greedily(
        &mut p,
        &SimplifyAlgebraPass::patterns(),
        &GreedyConfig::default(),
    );
    assert!(stats.converged);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.dce_removed, 1);
    assert_eq!(count_named(&p, "sqrt"), 0);
    assert_eq!(count_named(&p, "rsqrt"), 1);

    let mut kept = reciprocal_root();
    let cfg = GreedyConfig {
        enable_dce: false,
        ..GreedyConfig::default()
    };
    let stats = apply_patterns_greedily(&mut kept, &SimplifyAlgebraPass::patterns(), &cfg);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.dce_removed, 0);
    assert_eq!(count_named(&kept, "sqrt"), 1);
}

#[test]
fn config_defaults_fill_missing_fields() -> anyhow::Result<()> {
    let cfg: OptimizeConfig = serde_json::from_str("{}")?;
    assert_eq!(cfg, OptimizeConfig::default());
    assert_eq!(cfg.greedy.max_iterations, 10);
    assert!(cfg.greedy.enable_dce);
    assert!(cfg.fold_constants);
    assert_eq!(cfg.pipeline_max_iters, 4);

    let cfg: OptimizeConfig =
        serde_json::from_str(r#"{"greedy": {"max_iterations": 2}, "fold_constants": false}"#)?;
    assert_eq!(cfg.greedy.max_iterations, 2);
    assert!(cfg.greedy.enable_dce);
    assert!(!cfg.fold_constants);
    Ok(())
}

#[test]
fn config_survives_json() -> anyhow::Result<()> {
    let cfg = OptimizeConfig {
        greedy: GreedyConfig {
            max_iterations: 1,
            enable_dce: false,
        },
        fold_constants: false,
        pipeline_max_iters: 2,
    };
    let text = serde_json::to_string(&cfg)?;
    let parsed: OptimizeConfig = serde_json::from_str(&text)?;
    assert_eq!(parsed, cfg);
    Ok(())
}
