use super::helpers::*;
use nocta_bytecode::opcode::OpCode::*;
use nocta_vm::error::VmError;

/// `fn(a, b) -> a + b`
fn adder() -> nocta_bytecode::proto::Proto {
    Func::new(2, 3)
        .op(abc(Add, 2, 0, 1))
        .op(abc(Return1, 2, 0, 0))
        .build()
}

#[test]
fn call_a_closure_with_arguments() {
    let mut c = Chunk::new(4);
    let child = {
        let p = adder();
        c.child(p)
    };
    c.op(abx(Closure, 0, child))
        .op(asbx(LoadI, 1, 30))
        .op(asbx(LoadI, 2, 12))
        .op(abc(Call, 0, 3, 2)) // 2 args, 1 result
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 42);
}

#[test]
fn missing_arguments_read_as_nil() {
    // fn(a, b) -> b == nil
    let child = Func::new(2, 3)
        .op(abc(LoadFalse, 2, 0, 0))
        .op(abck(Test, 1, 0, 0)) // truthy(b) != k(1) -> skip jump; nil b skips
        .op(isj(Jmp, 1))
        .op(abc(LoadTrue, 2, 0, 0)) // reached when b is nil
        .op(abc(Return1, 2, 0, 0))
        .build();
    let mut c = Chunk::new(3);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(asbx(LoadI, 1, 1))
        .op(abc(Call, 0, 2, 2)) // one arg only
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert_bool(&r, 0, true);
}

#[test]
fn multiple_results_fixed_expectation_pads_with_nil() {
    // fn() -> 1, 2
    let child = Func::new(0, 3)
        .op(asbx(LoadI, 0, 1))
        .op(asbx(LoadI, 1, 2))
        .op(abc(Return, 0, 3, 0))
        .build();
    let mut c = Chunk::new(5);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(abc(Call, 0, 1, 5)) // expect 4 results: pad R2, R3 with nil
        .op(abc(Return, 0, 5, 0));
    let r = c.run().unwrap();
    assert_eq!(r.len(), 4);
    assert_int(&r, 0, 1);
    assert_int(&r, 1, 2);
    assert_nil(&r, 2);
    assert_nil(&r, 3);
}

#[test]
fn open_call_forwards_all_results() {
    // g() -> 1, 2, 3 ; main returns g() (B=0 / C=0 chain)
    let child = Func::new(0, 4)
        .op(asbx(LoadI, 0, 1))
        .op(asbx(LoadI, 1, 2))
        .op(asbx(LoadI, 2, 3))
        .op(abc(Return, 0, 4, 0))
        .build();
    let mut c = Chunk::new(4);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(abc(Call, 0, 1, 0)) // all results, top tracks
        .op(abc(Return, 0, 0, 0)); // return to top
    let r = c.run().unwrap();
    assert_eq!(r.len(), 3);
    assert_int(&r, 0, 1);
    assert_int(&r, 1, 2);
    assert_int(&r, 2, 3);
}

#[test]
fn return0_returns_nothing() {
    let child = Func::new(0, 2).op(abc(Return0, 0, 0, 0)).build();
    let mut c = Chunk::new(3);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(abc(Call, 0, 1, 1)) // expect zero results
        .op(abc(Return0, 0, 0, 0));
    let r = c.run().unwrap();
    assert!(r.is_empty());
}

#[test]
fn nested_calls() {
    // add(add(1, 2), add(3, 4))
    let mut c = Chunk::new(8);
    let child = {
        let p = adder();
        c.child(p)
    };
    c.op(abx(Closure, 0, child))
        .op(abc(Move, 1, 0, 0))
        .op(asbx(LoadI, 2, 1))
        .op(asbx(LoadI, 3, 2))
        .op(abc(Call, 1, 3, 2)) // R1 = 3
        .op(abc(Move, 2, 0, 0))
        .op(asbx(LoadI, 3, 3))
        .op(asbx(LoadI, 4, 4))
        .op(abc(Call, 2, 3, 2)) // R2 = 7
        .op(abc(Move, 3, 0, 0))
        .op(abc(Move, 4, 1, 0))
        .op(abc(Move, 5, 2, 0))
        .op(abc(Call, 3, 3, 2)) // R3 = 10
        .op(abc(Return1, 3, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 10);
}

#[test]
fn calling_a_non_function_raises() {
    let mut c = Chunk::new(3);
    c.op(asbx(LoadI, 0, 1))
        .op(abc(Call, 0, 1, 1))
        .op(abc(Return0, 0, 0, 0));
    match c.run() {
        Err(VmError::Type(msg)) => assert!(msg.contains("attempt to call a number value")),
        other => panic!("expected type error, got {other:?}"),
    }
}

#[test]
fn deep_recursion_exhausts_call_depth() {
    // f() -> f()  (not a tail call: depth grows)
    let child = Func::new(0, 3)
        .upval_in_stack(0) // main R0 = f
        .op(abc(GetUpval, 0, 0, 0))
        .op(abc(Call, 0, 1, 1))
        .op(abc(Return0, 0, 0, 0))
        .build();
    let mut c = Chunk::new(3);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(abc(Move, 1, 0, 0))
        .op(abc(Call, 1, 1, 1))
        .op(abc(Return0, 0, 0, 0));
    match c.run() {
        Err(VmError::Resource(msg)) => assert!(msg.contains("call stack depth")),
        other => panic!("expected resource error, got {other:?}"),
    }
}

#[test]
fn tail_call_keeps_depth_flat() {
    // f(n) -> n == 0 and 0 or f(n - 1), via TAILCALL; ten thousand hops
    // under a depth limit of 200 only works if frames are reused
    let child = Func::new(1, 4)
        .upval_in_stack(0)
        .op(abc(EqI, 0, 0, 0)) // pred = (n == 0); JMP runs when pred != k(0)
        .op(isj(Jmp, 3)) // n == 0: jump to the constant return
        .op(abc(GetUpval, 1, 0, 0))
        .op(abc(AddI, 2, 0, (-1i8) as u8))
        .op(abc(TailCall, 1, 2, 0))
        .op(asbx(LoadI, 1, 0))
        .op(abc(Return1, 1, 0, 0))
        .build();
    let mut c = Chunk::new(4);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(abc(Move, 1, 0, 0))
        .op(asbx(LoadI, 2, 10_000))
        .op(abc(Call, 1, 2, 2))
        .op(abc(Return1, 1, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 0);
}

#[test]
fn tail_call_into_native() {
    // f(t) -> return setmetatable(t), tail-called into the native
    let mut c = Chunk::new(4);
    let sid = c.strings.intern(b"setmetatable");
    let f = Func::new(1, 4)
        .upval_of_parent(0) // _ENV
        .k(nocta_bytecode::proto::Constant::String(sid))
        .op(abc(GetTabUp, 1, 0, 0))
        .op(abc(Move, 2, 0, 0))
        .op(abc(TailCall, 1, 2, 0))
        .build();
    let child = c.child(f);
    c.op(abx(Closure, 0, child))
        .op(abc(NewTable, 1, 0, 0))
        .op(abc(Call, 0, 2, 2))
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert!(r[0].is_table());
}

// ---- Varargs ----

#[test]
fn vararg_fixed_and_extra() {
    // f(a, ...) -> a + first vararg
    let child = Func::new(1, 4)
        .vararg()
        .op(abc(VarArgPrep, 1, 0, 0))
        .op(abc(VarArg, 1, 0, 2)) // R1 = first vararg
        .op(abc(Add, 2, 0, 1))
        .op(abc(Return1, 2, 0, 0))
        .build();
    let mut c = Chunk::new(4);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(asbx(LoadI, 1, 10))
        .op(asbx(LoadI, 2, 32))
        .op(abc(Call, 0, 3, 2))
        .op(abc(Return1, 0, 0, 0));
    let r = c.run().unwrap();
    assert_int(&r, 0, 42);
}

#[test]
fn vararg_copy_pads_with_nil() {
    // f(...) -> (...), asking for three values with one supplied
    let child = Func::new(0, 5)
        .vararg()
        .op(abc(VarArgPrep, 0, 0, 0))
        .op(abc(VarArg, 0, 0, 4)) // R0..R2 = three varargs
        .op(abc(Return, 0, 4, 0))
        .build();
    let mut c = Chunk::new(3);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(asbx(LoadI, 1, 9))
        .op(abc(Call, 0, 2, 0))
        .op(abc(Return, 0, 0, 0));
    let r = c.run().unwrap();
    assert_eq!(r.len(), 3);
    assert_int(&r, 0, 9);
    assert_nil(&r, 1);
    assert_nil(&r, 2);
}

#[test]
fn vararg_all_forwards_everything() {
    // f(...) -> ...
    let child = Func::new(0, 3)
        .vararg()
        .op(abc(VarArgPrep, 0, 0, 0))
        .op(abc(VarArg, 0, 0, 0)) // all varargs, top tracks
        .op(abc(Return, 0, 0, 0))
        .build();
    let mut c = Chunk::new(5);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(asbx(LoadI, 1, 1))
        .op(asbx(LoadI, 2, 2))
        .op(asbx(LoadI, 3, 3))
        .op(abc(Call, 0, 4, 0))
        .op(abc(Return, 0, 0, 0));
    let r = c.run().unwrap();
    assert_eq!(r.len(), 3);
    assert_int(&r, 0, 1);
    assert_int(&r, 1, 2);
    assert_int(&r, 2, 3);
}

#[test]
fn vararg_with_no_extras_is_empty() {
    let child = Func::new(1, 4)
        .vararg()
        .op(abc(VarArgPrep, 1, 0, 0))
        .op(abc(VarArg, 1, 0, 0))
        .op(abc(Return, 1, 0, 0))
        .build();
    let mut c = Chunk::new(3);
    let child = c.child(child);
    c.op(abx(Closure, 0, child))
        .op(asbx(LoadI, 1, 5))
        .op(abc(Call, 0, 2, 0))
        .op(abc(Return, 0, 0, 0));
    let r = c.run().unwrap();
    assert!(r.is_empty());
}

// ---- Host-side calls ----

#[test]
fn host_call_into_a_returned_closure() {
    let child = adder();
    let mut c = Chunk::new(2);
    let child = c.child(child);
    c.op(abx(Closure, 0, child)).op(abc(Return1, 0, 0, 0));
    let (mut vm, r) = c.run_keep();
    let f = r.unwrap()[0];
    let out = vm
        .call(
            f,
            &[
                nocta_core::value::TValue::from_integer(20),
                nocta_core::value::TValue::from_integer(22),
            ],
        )
        .unwrap();
    assert_eq!(out[0].as_integer(), Some(42));
    // the boundary is reusable
    let out = vm
        .call(
            f,
            &[
                nocta_core::value::TValue::from_integer(1),
                nocta_core::value::TValue::from_integer(2),
            ],
        )
        .unwrap();
    assert_eq!(out[0].as_integer(), Some(3));
}
