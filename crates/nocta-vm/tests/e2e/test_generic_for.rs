use super::helpers::*;
use nocta_bytecode::opcode::OpCode::*;

// Generic-for layout: R[A] = iterator, R[A+1] = state, R[A+2] = control,
// R[A+3] = closing slot, results land at R[A+4..]. TFORPREP jumps to the
// TFORCALL; TFORLOOP re-enters the body while the first result is
// non-nil.

#[test]
fn generic_for_over_a_native_iterator() {
    // sum the values produced by range_iter(3, _)
    let mut c = Chunk::new(7);
    let k_iter = c.k_str("range_iter");
    c.op(abc(GetTabUp, 0, 0, k_iter)) // pc0: iterator
        .op(asbx(LoadI, 1, 3)) // pc1: state = limit
        .op(asbx(LoadI, 2, 0)) // pc2: control
        .op(abx(LoadNil, 3, 0)) // pc3: closing slot
        .op(asbx(LoadI, 5, 0)) // pc4: acc in R5
        .op(abx(TForPrep, 0, 1)) // pc5 -> pc7
        .op(abc(Add, 5, 5, 4)) // pc6: body
        .op(abc(TForCall, 0, 0, 1)) // pc7: R4 = iter(R1, R2)
        .op(abx(TForLoop, 2, 3)) // pc8: while R4 != nil
        .op(abc(Return1, 5, 0, 0)); // pc9
    let r = c.run().unwrap();
    assert_int(&r, 0, 6);
}

#[test]
fn generic_for_zero_iterations() {
    let mut c = Chunk::new(7);
    let k_iter = c.k_str("range_iter");
    c.op(abc(GetTabUp, 0, 0, k_iter))
        .op(asbx(LoadI, 1, 0)) // limit 0: first call yields nil
        .op(asbx(LoadI, 2, 0))
        .op(abx(LoadNil, 3, 0))
        .op(asbx(LoadI, 5, 0))
        .op(abx(TForPrep, 0, 1))
        .op(abc(Add, 5, 5, 4))
        .op(abc(TForCall, 0, 0, 1))
        .op(abx(TForLoop, 2, 3))
        .op(abc(Return1, 5, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 0);
}

#[test]
fn generic_for_over_a_closure_iterator() {
    // iterator fn(state, ctrl): ctrl < state and ctrl + 1 or nil
    let iter = Func::new(2, 4)
        .op(abc(Lt, 1, 0, 0)) // pred = ctrl < state; JMP runs when pred
        .op(isj(Jmp, 2)) // -> produce next
        .op(abx(LoadNil, 2, 0))
        .op(abc(Return1, 2, 0, 0))
        .op(abc(AddI, 2, 1, 1)) // pc4
        .op(abc(Return1, 2, 0, 0))
        .build();
    let mut c = Chunk::new(7);
    let iter = c.child(iter);
    c.op(abx(Closure, 0, iter))
        .op(asbx(LoadI, 1, 4)) // state
        .op(asbx(LoadI, 2, 0)) // control
        .op(abx(LoadNil, 3, 0))
        .op(asbx(LoadI, 5, 0))
        .op(abx(TForPrep, 0, 1))
        .op(abc(Add, 5, 5, 4))
        .op(abc(TForCall, 0, 0, 1))
        .op(abx(TForLoop, 2, 3))
        .op(abc(Return1, 5, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 1 + 2 + 3 + 4);
}

#[test]
fn tforcall_places_multiple_results() {
    // an iterator returning a pair; C = 2 captures both
    let iter = Func::new(2, 4)
        .op(abc(EqI, 1, 0, 0)) // stop after one round: ctrl == 0 continues
        .op(isj(Jmp, 2))
        .op(abx(LoadNil, 2, 0))
        .op(abc(Return1, 2, 0, 0))
        .op(asbx(LoadI, 2, 5)) // pc4: first result (new control)
        .op(asbx(LoadI, 3, 50)) // second result
        .op(abc(Return, 2, 3, 0))
        .build();
    let mut c = Chunk::new(8);
    let iter = c.child(iter);
    c.op(abx(Closure, 0, iter))
        .op(abx(LoadNil, 1, 0)) // pc1: state unused
        .op(asbx(LoadI, 2, 0)) // pc2: control = 0
        .op(abx(LoadNil, 3, 0)) // pc3
        .op(abx(LoadNil, 6, 0)) // pc4
        .op(abx(TForPrep, 0, 1)) // pc5 -> pc7
        .op(abc(Move, 6, 5, 0)) // pc6: body saves the second result
        .op(abc(TForCall, 0, 0, 2)) // pc7: R4, R5 = iter(R1, R2)
        .op(abx(TForLoop, 2, 3)) // pc8: back to pc6
        .op(abc(Return1, 6, 0, 0)); // pc9
    let r = c.run().unwrap();
    assert_int(&r, 0, 50);
}
