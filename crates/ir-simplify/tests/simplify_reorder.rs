
use ir_simplify::{simplify_algebra, InstId, Operation, Program};
use program_support::{assert_simplify_preserves_values, count_named, float, ins, param, run_pass};

fn slice(axis: usize, start: usize, end: usize) -> Operation {
    Operation::slice(vec![axis], vec![start], vec![end])
}

/// Splits `input` into equal slices along `axis`.
fn split(p: &mut Program, input: InstId, axis: usize, parts: usize, width: usize) -> Vec<InstId> {
    (0..parts)
        .map(|idx| ins(p, slice(axis, idx * width, (idx + 1) * width), &[input]))
        .collect()
}

/// Packs and reshapes every slice to `lens`.
fn reshape_each(p: &mut Program, slices: &[InstId], lens: &[&[i64]]) -> Vec<InstId> {
    slices
        .iter()
        .zip(lens)
        .map(|(&slice, &dims)| {
            let packed = ins(p, Operation::Contiguous, &[slice]);
            ins(p, Operation::reshape(dims.to_vec()), &[packed])
        })
        .collect()
}

/// `dot(t0 + t1, t2)` over per-slice transposes.
fn attention_tail(p: &mut Program, parts: &[InstId], perm0: &[usize], perm1: &[usize]) {
    let t0 = ins(p, Operation::transpose(perm0.to_vec()), &[parts[0]]);
    let t1 = ins(p, Operation::transpose(perm0.to_vec()), &[parts[1]]);
    let t2 = ins(p, Operation::transpose(perm1.to_vec()), &[parts[2]]);
    let sum = ins(p, Operation::add(), &[t0, t1]);
    let ret = ins(p, Operation::Dot, &[sum, t2]);
    p.add_return(&[ret]);
}

/// `(parts[0] + parts[1]) * parts[2]`.
fn elementwise_tail(p: &mut Program, parts: &[InstId]) -> InstId {
    let sum = ins(p, Operation::add(), &[parts[0], parts[1]]);
    ins(p, Operation::mul(), &[sum, parts[2]])
}

const PERM0: [usize; 4] = [0, 2, 1, 3];
const PERM1: [usize; 4] = [0, 2, 3, 1];

#[test]
fn reshape_moves_above_split_of_heads() {
    for batch in [1, 4, 8] {
        let lens: &[i64] = &[batch as i64, 128, 10, 64];
        let mut p1 = Program::new();
        {
            let input = param(&mut p1, "input", float(&[batch, 128, 1920]));
            let slices = split(&mut p1, input, 2, 3, 640);
            let reshaped = reshape_each(&mut p1, &slices, &[lens, lens, lens]);
            attention_tail(&mut p1, &reshaped, &PERM0, &PERM1);
        }
        run_pass(&mut p1);

        let mut p2 = Program::new();
        {
            let input = param(&mut p2, "input", float(&[batch, 128, 1920]));
            let dims = vec![batch as i64, 128, 30, 64];
            let r = ins(&mut p2, Operation::reshape(dims), &[input]);
            let slices = split(&mut p2, r, 2, 3, 10);
            attention_tail(&mut p2, &slices, &PERM0, &PERM1);
        }
        assert_eq!(p1.sort(), p2.sort(), "batch {batch}");
    }
}

#[test]
fn reshape_moves_above_split_on_last_axis() {
    for batch in [4, 8] {
        let lens: &[i64] = &[batch as i64, 64, 4, 32];
        let mut p1 = Program::new();
        {
            let input = param(&mut p1, "input", float(&[batch, 256, 96]));
            let slices = split(&mut p1, input, 2, 3, 32);
            let reshaped = reshape_each(&mut p1, &slices, &[lens, lens, lens]);
            attention_tail(&mut p1, &reshaped, &PERM0, &PERM1);
        }
        run_pass(&mut p1);

        let mut p2 = Program::new();
        {
            let input = param(&mut p2, "input", float(&[batch, 256, 96]));
            let dims = vec![batch as i64, 64, 4, 96];
            let rsp = ins(&mut p2, Operation::reshape(dims), &[input]);
            let slices = split(&mut p2, rsp, 3, 3, 32);
            attention_tail(&mut p2, &slices, &PERM0, &PERM1);
        }
        assert_eq!(p1.sort(), p2.sort(), "batch {batch}");
    }
}

#[test]
fn reshape_moves_above_split_of_a_matrix() {
    let lens: &[i64] = &[1, 16, 8, 32];
    let mut p1 = Program::new();
    {
        let input = param(&mut p1, "input", float(&[128, 96]));
        let slices = split(&mut p1, input, 1, 3, 32);
        let reshaped = reshape_each(&mut p1, &slices, &[lens, lens, lens]);
        let ret = elementwise_tail(&mut p1, &reshaped);
        p1.add_return(&[ret]);
    }
    run_pass(&mut p1);

    let mut p2 = Program::new();
    {
        let input = param(&mut p2, "input", float(&[128, 96]));
        let rsp = ins(&mut p2, Operation::reshape(vec![1, 16, 8, 96]), &[input]);
        let slices = split(&mut p2, rsp, 3, 3, 32);
        let ret = elementwise_tail(&mut p2, &slices);
        p2.add_return(&[ret]);
    }
    assert_eq!(p1.sort(), p2.sort());
}

#[test]
fn reshape_that_mixes_slices_stays_below_split() {
    let lens: &[i64] = &[1, 16, 16, 16];
    let mut p1 = Program::new();
    {
        let input = param(&mut p1, "input", float(&[128, 96]));
        let slices = split(&mut p1, input, 1, 3, 32);
        let reshaped = reshape_each(&mut p1, &slices, &[lens, lens, lens]);
        let ret = elementwise_tail(&mut p1, &reshaped);
        p1.add_return(&[ret]);
    }
    let p2 = p1.clone();
    run_pass(&mut p1);
    assert_eq!(p1.sort(), p2.sort());
}

#[test]
fn reshapes_to_different_dims_stay_below_split() {
    for batch in [4, 8] {
        let lens: &[i64] = &[batch as i64, 32, 3, 32];
        let lens1: &[i64] = &[batch as i64, 48, 2, 32];
        let mut p1 = Program::new();
        {
            let input = param(&mut p1, "input", float(&[batch, 96, 96]));
            let slices = split(&mut p1, input, 2, 3, 32);
            let reshaped = reshape_each(&mut p1, &slices, &[lens, lens, lens1]);
            p1.add_return(&reshaped);
        }
        let p2 = p1.clone();
        run_pass(&mut p1);
        assert_eq!(p1.sort(), p2.sort(), "batch {batch}");
    }
}

#[test]
fn transpose_moves_above_split() {
    let perm = vec![0, 2, 1];
    for batch in [1, 8] {
        let mut p1 = Program::new();
        {
            let input = param(&mut p1, "input", float(&[batch, 128, 1920]));
            let slices = split(&mut p1, input, 2, 3, 640);
            let transposed: Vec<_> = slices
                .iter()
                .map(|&slice| ins(&mut p1, Operation::transpose(perm.clone()), &[slice]))
                .collect();
            let ret = elementwise_tail(&mut p1, &transposed);
            p1.add_return(&[ret]);
        }
        run_pass(&mut p1);

        let mut p2 = Program::new();
        {
            let input = param(&mut p2, "input", float(&[batch, 128, 1920]));
            let r = ins(&mut p2, Operation::transpose(perm.clone()), &[input]);
            let slices = split(&mut p2, r, 1, 3, 640);
            let ret = elementwise_tail(&mut p2, &slices);
            p2.add_return(&[ret]);
        }
        assert_eq!(p1.sort(), p2.sort(), "batch {batch}");
    }
}

#[test]
fn transposes_with_different_perms_stay_below_split() {
    for batch in [1, 4] {
        let mut p1 = Program::new();
        {
            let input = param(&mut p1, "input", float(&[batch, 128, 1920]));
            let slices = split(&mut p1, input, 2, 3, 640);
            let t0 = ins(&mut p1, Operation::transpose(vec![0, 2, 1]), &[slices[0]]);
            let t1 = ins(&mut p1, Operation::transpose(vec![0, 2, 1]), &[slices[1]]);
            let t2 = ins(&mut p1, Operation::transpose(vec![0, 1, 2]), &[slices[2]]);
            let sum = ins(&mut p1, Operation::add(), &[t0, t1]);
            let ret = ins(&mut p1, Operation::Dot, &[sum, t2]);
            p1.add_return(&[ret]);
        }
        let p2 = p1.clone();
        run_pass(&mut p1);
        assert_eq!(p1.sort(), p2.sort(), "batch {batch}");
    }
}

#[test]
fn reordered_reshape_preserves_values() {
    let lens: &[i64] = &[1, 4, 2, 2];
    let mut p = Program::new();
    let input = param(&mut p, "input", float(&[8, 6]));
    let slices = split(&mut p, input, 1, 3, 2);
    let reshaped = reshape_each(&mut p, &slices, &[lens, lens, lens]);
    elementwise_tail(&mut p, &reshaped);

    let simplified = assert_simplify_preserves_values(&p, 1e-6);
    assert_eq!(count_named(&simplified, "reshape"), 1);
    assert_eq!(count_named(&simplified, "contiguous"), 0);
}

#[test]
fn reordered_transpose_preserves_values() {
    let mut p = Program::new();
    let input = param(&mut p, "input", float(&[2, 3, 6]));
    let slices = split(&mut p, input, 2, 3, 2);
    let transposed: Vec<_> = slices
        .iter()
        .map(|&slice| ins(&mut p, Operation::transpose(vec![0, 2, 1]), &[slice]))
        .collect();
    elementwise_tail(&mut p, &transposed);

    let simplified = assert_simplify_preserves_values(&p, 1e-6);
    assert_eq!(count_named(&simplified, "transpose"), 1);
}

#[test]
fn transpose_moves_above_split_once_dead_slices_are_gone() {
    let mut p = Program::new();
    let x = param(&mut p, "x", float(&[4, 2]));
    let y = param(&mut p, "y", float(&[2, 4]));
    for _ in 0..2 {
        split(&mut p, y, 1, 2, 2);
    }
    let slices = split(&mut p, y, 1, 2, 2);
    let transposed: Vec<_> = slices
        .iter()
        .map(|&slice| ins(&mut p, Operation::transpose(vec![1, 0]), &[slice]))
        .collect();
    let joined = ins(&mut p, Operation::concat(0), &transposed);
    let ret = ins(&mut p, Operation::add(), &[joined, x]);
    p.add_return(&[ret]);

    let first = simplify_algebra(&mut p);
    assert!(first.changed);
    assert!(first.rewrites_applied > 0);
    assert!(p.verify());
    assert_eq!(count_named(&p, "transpose"), 1);

    let settled = p.clone();
    let second = simplify_algebra(&mut p);
    assert!(!second.changed, "{second:?}");
    assert_eq!(p, settled);
}
