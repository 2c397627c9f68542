use super::helpers::*;
use nocta_bytecode::opcode::OpCode::*;
use nocta_vm::error::VmError;

// The branch protocol: a conditional computes `pred XOR k`; when false
// the following JMP is skipped, when true it runs. The canonical
// compiler shape materializing a boolean is
//   <cond> ; JMP +1 ; LFALSESKIP r ; LOADTRUE r

fn bool_of_cond(mut c: Chunk, cond: nocta_bytecode::opcode::Instruction) -> bool {
    c.op(cond)
        .op(isj(Jmp, 1))
        .op(abc(LFalseSkip, 2, 0, 0))
        .op(abc(LoadTrue, 2, 0, 0))
        .op(abc(Return1, 2, 0, 0));
    let r = c.run().unwrap();
    r[0].as_bool().expect("boolean result")
}

#[test]
fn jmp_moves_the_pc() {
    let mut c = Chunk::new(2);
    c.op(asbx(LoadI, 0, 1))
        .op(isj(Jmp, 1))
        .op(asbx(LoadI, 0, 2)) // jumped over
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 1);
}

#[test]
fn backward_jump_loops() {
    // count R0 down to 0: the JMP runs while R0 != 0 (pred XOR k true)
    let mut c = Chunk::new(2);
    c.op(asbx(LoadI, 0, 3))
        .op(abc(AddI, 0, 0, (-1i8) as u8)) // pc1
        .op(abck(EqI, 0, 0, 0)) // pred = (R0 == 0), k inverts
        .op(isj(Jmp, -3)) // back to the decrement
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 0);
}

#[test]
fn eq_true_takes_the_jump() {
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 5)).op(asbx(LoadI, 1, 5));
    assert!(bool_of_cond(c, abc(Eq, 0, 1, 0)));
}

#[test]
fn eq_false_skips_the_jump() {
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 5)).op(asbx(LoadI, 1, 6));
    assert!(!bool_of_cond(c, abc(Eq, 0, 1, 0)));
}

#[test]
fn eq_k_flag_inverts() {
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 5)).op(asbx(LoadI, 1, 6));
    assert!(bool_of_cond(c, abck(Eq, 0, 1, 0)));
}

#[test]
fn lt_and_le() {
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 2)).op(asbx(LoadI, 1, 3));
    assert!(bool_of_cond(c, abc(Lt, 0, 1, 0)));

    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 3)).op(asbx(LoadI, 1, 3));
    assert!(!bool_of_cond(c, abc(Lt, 0, 1, 0)));
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 3)).op(asbx(LoadI, 1, 3));
    assert!(bool_of_cond(c, abc(Le, 0, 1, 0)));
}

#[test]
fn string_ordering_is_lexicographic() {
    let mut c = Chunk::new(3);
    let ka = c.k_str("apple");
    let kb = c.k_str("banana");
    c.op(abx(LoadK, 0, ka as u32)).op(abx(LoadK, 1, kb as u32));
    assert!(bool_of_cond(c, abc(Lt, 0, 1, 0)));
}

#[test]
fn nan_comparisons_are_false() {
    let mut c = Chunk::new(3);
    let knan = c.k_float(f64::NAN);
    c.op(abx(LoadK, 0, knan as u32)).op(abx(LoadK, 1, knan as u32));
    assert!(!bool_of_cond(c, abc(Eq, 0, 1, 0)));
    let mut c = Chunk::new(3);
    let knan = c.k_float(f64::NAN);
    c.op(abx(LoadK, 0, knan as u32)).op(asbx(LoadF, 1, 1));
    assert!(!bool_of_cond(c, abc(Lt, 0, 1, 0)));
}

#[test]
fn int_float_compare_by_value() {
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 3)).op(asbx(LoadF, 1, 3));
    assert!(bool_of_cond(c, abc(Eq, 0, 1, 0)));
}

#[test]
fn immediate_comparisons() {
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 7));
    assert!(bool_of_cond(c, abc(EqI, 0, 7, 0)));
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 7));
    assert!(bool_of_cond(c, abc(GtI, 0, 5, 0)));
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 7));
    assert!(bool_of_cond(c, abc(GeI, 0, 7, 0)));
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 4));
    assert!(bool_of_cond(c, abc(LtI, 0, 5, 0)));
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 4));
    assert!(!bool_of_cond(c, abc(LeI, 0, 3, 0)));
}

#[test]
fn comparing_mismatched_types_raises() {
    let mut c = Chunk::new(3);
    let ks = c.k_str("1");
    c.op(abx(LoadK, 0, ks as u32))
        .op(asbx(LoadI, 1, 1))
        .op(abc(Lt, 0, 1, 0))
        .op(isj(Jmp, 0))
        .op(abc(Return0, 0, 0, 0));
    match c.run() {
        Err(VmError::Type(msg)) => assert!(msg.contains("compare")),
        other => panic!("expected type error, got {other:?}"),
    }
}

#[test]
fn testset_assigns_on_match() {
    // TESTSET A B k: truthy(R[B]) == k assigns and falls through,
    // otherwise skips.
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 7))
        .op(abx(LoadNil, 1, 0))
        .op(abck(TestSet, 1, 0, 0)) // k=1, R0 truthy: assign R1 = R0
        .op(isj(Jmp, 0)) // the paired jump (offset 0: next)
        .op(abc(Return1, 1, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 7);
}

#[test]
fn testset_skips_on_mismatch() {
    let mut c = Chunk::new(3);
    c.op(abx(LoadNil, 0, 0))
        .op(asbx(LoadI, 1, 1))
        .op(abck(TestSet, 1, 0, 0)) // k=1, R0 falsy: skip the JMP
        .op(isj(Jmp, 1)) // would skip the next LOADI
        .op(asbx(LoadI, 1, 2))
        .op(abc(Return1, 1, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 2);
}

// ---- Numeric for ----

#[test]
fn numeric_for_sums() {
    let mut c = Chunk::new(6);
    c.op(asbx(LoadI, 1, 1)) // init
        .op(asbx(LoadI, 2, 5)) // limit
        .op(asbx(LoadI, 3, 1)) // step
        .op(asbx(LoadI, 0, 0)) // acc in R0
        .op(abx(ForPrep, 1, 1)) // pc4; skip -> pc7
        .op(abc(Add, 0, 0, 4)) // pc5: acc += R4 (visible loop var)
        .op(abx(ForLoop, 1, 2)) // pc6: back to pc5
        .op(abc(Return1, 0, 0, 0)); // pc7
    let r = c.run().unwrap();
    assert_int(&r, 0, 15);
}

#[test]
fn numeric_for_negative_step() {
    let mut c = Chunk::new(6);
    c.op(asbx(LoadI, 1, 5))
        .op(asbx(LoadI, 2, 1))
        .op(asbx(LoadI, 3, -2))
        .op(asbx(LoadI, 0, 0))
        .op(abx(ForPrep, 1, 1))
        .op(abc(Add, 0, 0, 4))
        .op(abx(ForLoop, 1, 2))
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 5 + 3 + 1);
}

#[test]
fn numeric_for_zero_iterations() {
    let mut c = Chunk::new(6);
    c.op(asbx(LoadI, 1, 5))
        .op(asbx(LoadI, 2, 1))
        .op(asbx(LoadI, 3, 1)) // ascending step, init > limit
        .op(asbx(LoadI, 0, 0))
        .op(abx(ForPrep, 1, 1))
        .op(abc(Add, 0, 0, 4))
        .op(abx(ForLoop, 1, 2))
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 0);
}

#[test]
fn numeric_for_float_loop() {
    let mut c = Chunk::new(6);
    let khalf = c.k_float(0.5);
    let k2 = c.k_float(2.0);
    c.op(asbx(LoadF, 1, 1))
        .op(abx(LoadK, 2, k2 as u32))
        .op(abx(LoadK, 3, khalf as u32))
        .op(asbx(LoadI, 0, 0))
        .op(abx(ForPrep, 1, 1))
        .op(abc(Add, 0, 0, 4))
        .op(abx(ForLoop, 1, 2))
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    // 1.0 + 1.5 + 2.0
    assert_float(&r, 0, 4.5);
}

#[test]
fn numeric_for_step_zero_raises() {
    let mut c = Chunk::new(6);
    c.op(asbx(LoadI, 1, 1))
        .op(asbx(LoadI, 2, 5))
        .op(asbx(LoadI, 3, 0))
        .op(abx(ForPrep, 1, 0))
        .op(abx(ForLoop, 1, 1))
        .op(abc(Return0, 0, 0, 0));
    assert!(matches!(c.run(), Err(VmError::Arith(_))));
}

#[test]
fn numeric_for_near_i64_boundary_terminates() {
    // two iterations right at the top of the integer range; a naive
    // "add then compare" implementation wraps and never exits
    let mut c = Chunk::new(6);
    let kinit = c.k_int(i64::MAX - 1);
    let klimit = c.k_int(i64::MAX);
    c.op(abx(LoadK, 1, kinit as u32))
        .op(abx(LoadK, 2, klimit as u32))
        .op(asbx(LoadI, 3, 1))
        .op(asbx(LoadI, 0, 0))
        .op(abx(ForPrep, 1, 1))
        .op(abc(AddI, 0, 0, 1)) // count iterations
        .op(abx(ForLoop, 1, 2))
        .op(abc(Return1, 0, 0, 0));
    let mut vm = c.into_vm();
    vm.instruction_limit = Some(10_000);
    let r = vm.run().unwrap();
    assert_int(&r, 0, 2);
}
