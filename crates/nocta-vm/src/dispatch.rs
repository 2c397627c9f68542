//! The bytecode dispatch loop, call machinery, and operator dispatch.
//!
//! One loop drives every frame: `CALL` pushes frames rather than
//! recursing, and only metamethods and iterator invocations nest through
//! [`call_value`], which runs an inner loop bounded by frame depth. No
//! borrow of the operand stack is held across any call that can re-enter
//! the interpreter; registers are addressed by absolute index throughout.

use crate::arith::{self, ArithOp, RawArith};
use crate::callinfo::CallInfo;
use crate::compare;
use crate::error::VmError;
use crate::metamethod::{get_metamethod, Mm};
use crate::vm::Vm;
use nocta_bytecode::opcode::{Instruction, OpCode};
use nocta_bytecode::proto::Constant;
use nocta_core::object::type_name;
use nocta_core::value::TValue;

/// Bound on `__index`/`__newindex` chain hops.
const MAX_INDEX_CHAIN: usize = 100;
/// Bound on `__call` indirections for one call site.
const MAX_CALL_CHAIN: usize = 8;

/// Run frames above `base_depth` until the frame at `base_depth` returns.
/// On error the same frames are unwound, closing upvalues and running
/// to-be-closed handlers once per frame; `dump_on_error` additionally
/// emits the critical dump for VM-internal errors before unwinding.
pub fn execute_until(
    vm: &mut Vm,
    base_depth: usize,
    dump_on_error: bool,
) -> Result<Vec<TValue>, VmError> {
    let result = run_loop(vm, base_depth);
    if let Err(e) = &result {
        if dump_on_error && !e.is_user() {
            let dump = crate::debug::critical_dump(vm, e);
            tracing::error!(target: "nocta_vm::dispatch", "{dump}");
        }
        unwind(vm, base_depth, e);
    }
    result
}

/// Call any callable value with `args`, returning all its results. This
/// is the protected boundary: errors raised inside are caught here after
/// unwinding exactly the frames this call created.
pub fn call_value(vm: &mut Vm, func: TValue, args: &[TValue]) -> Result<Vec<TValue>, VmError> {
    let func_slot = vm.stack_top;
    vm.ensure_stack(func_slot + 1 + args.len())?;
    vm.stack[func_slot] = func;
    for (i, &a) in args.iter().enumerate() {
        vm.stack[func_slot + 1 + i] = a;
    }
    vm.stack_top = func_slot + 1 + args.len();

    let depth = vm.call_stack.len();
    if let Err(e) = call_prologue(vm, func_slot, args.len(), -1) {
        vm.clear_stack_range(func_slot, vm.stack_top);
        vm.stack_top = func_slot;
        return Err(e);
    }
    if vm.call_stack.len() > depth {
        execute_until(vm, depth, false)
    } else {
        // native completed synchronously; results sit at func_slot..top
        let results = vm.stack[func_slot..vm.stack_top].to_vec();
        vm.clear_stack_range(func_slot, vm.stack_top);
        vm.stack_top = func_slot;
        Ok(results)
    }
}

fn run_loop(vm: &mut Vm, base_depth: usize) -> Result<Vec<TValue>, VmError> {
    macro_rules! ret {
        ($vm:expr, $results:expr) => {
            if let Some(out) = do_return($vm, base_depth, $results)? {
                return Ok(out);
            }
        };
    }

    loop {
        if let Some(limit) = vm.instruction_limit {
            if vm.instructions_retired >= limit {
                return Err(VmError::Resource("instruction budget exhausted".into()));
            }
        }
        vm.instructions_retired += 1;

        let ci = vm.call_stack.len() - 1;
        let base = vm.call_stack[ci].base;
        let pc = vm.call_stack[ci].pc;
        let proto_idx = vm.call_stack[ci].proto;

        if pc >= vm.protos[proto_idx].code.len() {
            // fell off the end: behave as a bare return
            ret!(vm, Vec::new());
            continue;
        }

        if vm.trace_enabled() {
            let line = nocta_bytecode::disasm::disasm_line(&vm.protos[proto_idx], pc, &vm.strings);
            vm.trace_emit(&line);
        }

        let inst = vm.protos[proto_idx].code[pc];
        vm.call_stack[ci].pc += 1;
        let op = inst.opcode().ok_or_else(|| {
            VmError::Structural(format!(
                "invalid opcode {} at pc {pc}",
                inst.raw_opcode()
            ))
        })?;
        let a = inst.a() as usize;

        match op {
            // ---- Moves and loads ----
            OpCode::Move => {
                let v = vm.stack[base + inst.b() as usize];
                vm.stack[base + a] = v;
            }
            OpCode::LoadI => {
                vm.stack[base + a] = TValue::from_integer(inst.sbx() as i64);
            }
            OpCode::LoadF => {
                vm.stack[base + a] = TValue::from_float(inst.sbx() as f64);
            }
            OpCode::LoadK => {
                let v = constant_value(vm, ci, inst.bx() as usize)?;
                vm.stack[base + a] = v;
            }
            OpCode::LoadKX => {
                let ax = consume_extra_arg(vm, ci)?;
                let v = constant_value(vm, ci, ax as usize)?;
                vm.stack[base + a] = v;
            }
            OpCode::LoadFalse => {
                vm.stack[base + a] = TValue::from_bool(false);
            }
            OpCode::LFalseSkip => {
                vm.stack[base + a] = TValue::from_bool(false);
                vm.call_stack[ci].pc += 1;
            }
            OpCode::LoadTrue => {
                vm.stack[base + a] = TValue::from_bool(true);
            }
            OpCode::LoadNil => {
                let b = inst.b() as usize;
                for i in a..=a + b {
                    vm.stack[base + i] = TValue::nil();
                }
            }

            // ---- Upvalues ----
            OpCode::GetUpval => {
                let handle = upvalue_handle(vm, ci, inst.b() as usize)?;
                vm.stack[base + a] = vm.upvalue_get(handle);
            }
            OpCode::SetUpval => {
                let handle = upvalue_handle(vm, ci, inst.b() as usize)?;
                let v = vm.stack[base + a];
                vm.upvalue_set(handle, v);
            }
            OpCode::GetTabUp => {
                let handle = upvalue_handle(vm, ci, inst.b() as usize)?;
                let t = vm.upvalue_get(handle);
                let key = constant_string(vm, ci, inst.c() as usize)?;
                let v = index_get(vm, t, key)?;
                let base = vm.call_stack[ci].base;
                vm.stack[base + a] = v;
            }
            OpCode::SetTabUp => {
                let handle = upvalue_handle(vm, ci, a)?;
                let t = vm.upvalue_get(handle);
                let key = constant_string(vm, ci, inst.b() as usize)?;
                let v = rk_value(vm, ci, inst.c() as usize, inst.k())?;
                index_set(vm, t, key, v)?;
            }

            // ---- Table access ----
            OpCode::GetTable => {
                let t = vm.stack[base + inst.b() as usize];
                let key = vm.stack[base + inst.c() as usize];
                let v = index_get(vm, t, key)?;
                vm.stack[base + a] = v;
            }
            OpCode::GetI => {
                let t = vm.stack[base + inst.b() as usize];
                let key = TValue::from_integer(inst.c() as i64);
                let v = index_get(vm, t, key)?;
                vm.stack[base + a] = v;
            }
            OpCode::GetField => {
                let t = vm.stack[base + inst.b() as usize];
                let key = constant_string(vm, ci, inst.c() as usize)?;
                let v = index_get(vm, t, key)?;
                vm.stack[base + a] = v;
            }
            OpCode::SetTable => {
                let t = vm.stack[base + a];
                let key = vm.stack[base + inst.b() as usize];
                let v = rk_value(vm, ci, inst.c() as usize, inst.k())?;
                index_set(vm, t, key, v)?;
            }
            OpCode::SetI => {
                let t = vm.stack[base + a];
                let key = TValue::from_integer(inst.b() as i64);
                let v = rk_value(vm, ci, inst.c() as usize, inst.k())?;
                index_set(vm, t, key, v)?;
            }
            OpCode::SetField => {
                let t = vm.stack[base + a];
                let key = constant_string(vm, ci, inst.b() as usize)?;
                let v = rk_value(vm, ci, inst.c() as usize, inst.k())?;
                index_set(vm, t, key, v)?;
            }
            OpCode::NewTable => {
                let mut array_hint = inst.b() as usize;
                let hash_hint = inst.c() as usize;
                if inst.k() {
                    array_hint += consume_extra_arg(vm, ci)? as usize * 256;
                }
                let t = vm.heap.alloc_table(array_hint, hash_hint);
                vm.stack[base + a] = TValue::from_table(t);
            }
            OpCode::Self_ => {
                let recv = vm.stack[base + inst.b() as usize];
                vm.stack[base + a + 1] = recv;
                let key = if inst.k() {
                    constant_string(vm, ci, inst.c() as usize)?
                } else {
                    vm.stack[base + inst.c() as usize]
                };
                let v = index_get(vm, recv, key)?;
                let base = vm.call_stack[ci].base;
                vm.stack[base + a] = v;
            }
            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut start = inst.c() as usize;
                if inst.k() {
                    start += consume_extra_arg(vm, ci)? as usize * 256;
                }
                let t = vm.stack[base + a];
                let tidx = t.as_table_idx().ok_or_else(|| {
                    VmError::Type(format!("attempt to index a {} value", type_name(t)))
                })?;
                let count = if b == 0 {
                    vm.stack_top.saturating_sub(base + a + 1)
                } else {
                    b
                };
                for i in 1..=count {
                    let v = vm.stack[base + a + i];
                    vm.heap.table_mut(tidx).raw_seti((start + i) as i64, v);
                }
            }

            // ---- Arithmetic ----
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Mod | OpCode::Pow
            | OpCode::Div | OpCode::IDiv | OpCode::BAnd | OpCode::BOr | OpCode::BXor
            | OpCode::Shl | OpCode::Shr => {
                let vb = vm.stack[base + inst.b() as usize];
                let vc = vm.stack[base + inst.c() as usize];
                do_arith(vm, ci, arith_op_of(op), base + a, vb, vc)?;
            }
            OpCode::AddK | OpCode::SubK | OpCode::MulK | OpCode::ModK | OpCode::PowK
            | OpCode::DivK | OpCode::IDivK | OpCode::BAndK | OpCode::BOrK | OpCode::BXorK => {
                let vb = vm.stack[base + inst.b() as usize];
                let vc = constant_value(vm, ci, inst.c() as usize)?;
                do_arith(vm, ci, arith_op_of(op), base + a, vb, vc)?;
            }
            OpCode::AddI => {
                let vb = vm.stack[base + inst.b() as usize];
                let imm = TValue::from_integer(inst.sc() as i64);
                do_arith(vm, ci, ArithOp::Add, base + a, vb, imm)?;
            }
            OpCode::ShrI => {
                let vb = vm.stack[base + inst.b() as usize];
                let imm = TValue::from_integer(inst.sc() as i64);
                do_arith(vm, ci, ArithOp::Shr, base + a, vb, imm)?;
            }
            OpCode::ShlI => {
                // immediate on the left: R[A] := sC << R[B]
                let vb = vm.stack[base + inst.b() as usize];
                let imm = TValue::from_integer(inst.sc() as i64);
                do_arith(vm, ci, ArithOp::Shl, base + a, imm, vb)?;
            }

            // ---- Metamethod fallbacks ----
            OpCode::MMBin => {
                let va = vm.stack[base + a];
                let vb = vm.stack[base + inst.b() as usize];
                let mm = mm_operand(inst.c())?;
                let dest = mm_fallback_dest(vm, ci)?;
                let v = try_bin_mm(vm, mm, va, vb)?;
                vm.stack[dest] = v;
            }
            OpCode::MMBinI => {
                let va = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let mm = mm_operand(inst.c())?;
                let (lhs, rhs) = if inst.k() { (imm, va) } else { (va, imm) };
                let dest = mm_fallback_dest(vm, ci)?;
                let v = try_bin_mm(vm, mm, lhs, rhs)?;
                vm.stack[dest] = v;
            }
            OpCode::MMBinK => {
                let va = vm.stack[base + a];
                let kb = constant_value(vm, ci, inst.b() as usize)?;
                let mm = mm_operand(inst.c())?;
                let (lhs, rhs) = if inst.k() { (kb, va) } else { (va, kb) };
                let dest = mm_fallback_dest(vm, ci)?;
                let v = try_bin_mm(vm, mm, lhs, rhs)?;
                vm.stack[dest] = v;
            }

            // ---- Unary ----
            OpCode::Unm => {
                let v = vm.stack[base + inst.b() as usize];
                match arith::raw_negate(v, &mut vm.heap, &vm.strings) {
                    RawArith::Value(r) => vm.stack[base + a] = r,
                    RawArith::Error(e) => return Err(e),
                    RawArith::NeedMeta => {
                        let r = try_un_mm(vm, Mm::Unm, v)?;
                        let base = vm.call_stack[ci].base;
                        vm.stack[base + a] = r;
                    }
                }
            }
            OpCode::BNot => {
                let v = vm.stack[base + inst.b() as usize];
                match arith::raw_bnot(v, &mut vm.heap, &vm.strings) {
                    RawArith::Value(r) => vm.stack[base + a] = r,
                    RawArith::Error(e) => return Err(e),
                    RawArith::NeedMeta => {
                        let r = try_un_mm(vm, Mm::BNot, v)?;
                        let base = vm.call_stack[ci].base;
                        vm.stack[base + a] = r;
                    }
                }
            }
            OpCode::Not => {
                let v = vm.stack[base + inst.b() as usize];
                vm.stack[base + a] = TValue::from_bool(v.is_falsy());
            }
            OpCode::Len => {
                let v = vm.stack[base + inst.b() as usize];
                let r = length_of(vm, v)?;
                let base = vm.call_stack[ci].base;
                vm.stack[base + a] = r;
            }
            OpCode::Concat => {
                let n = inst.b() as usize;
                if n == 0 {
                    return Err(VmError::Structural("CONCAT of zero values".into()));
                }
                // fold right so `__concat` sees right-associative pairs
                let mut acc = vm.stack[base + a + n - 1];
                for i in (0..n - 1).rev() {
                    let lhs = vm.stack[vm.call_stack[ci].base + a + i];
                    acc = concat_pair(vm, lhs, acc)?;
                }
                let base = vm.call_stack[ci].base;
                vm.stack[base + a] = acc;
            }

            // ---- Scope exit ----
            OpCode::Close => {
                close_scope(vm, base + a, None, false)?;
            }
            OpCode::Tbc => {
                mark_tbc(vm, base + a)?;
            }

            // ---- Control flow ----
            OpCode::Jmp => {
                jump(vm, ci, inst.sj())?;
            }
            OpCode::Eq => {
                let va = vm.stack[base + a];
                let vb = vm.stack[base + inst.b() as usize];
                let pred = eq_with_mm(vm, va, vb)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::Lt => {
                let va = vm.stack[base + a];
                let vb = vm.stack[base + inst.b() as usize];
                let pred = lt_with_mm(vm, va, vb)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::Le => {
                let va = vm.stack[base + a];
                let vb = vm.stack[base + inst.b() as usize];
                let pred = le_with_mm(vm, va, vb)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::EqK => {
                let va = vm.stack[base + a];
                let kb = constant_value(vm, ci, inst.b() as usize)?;
                let pred = compare::raw_eq(va, kb, &vm.heap, &vm.strings);
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::EqI => {
                let va = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let pred = eq_with_mm(vm, va, imm)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::LtI => {
                let va = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let pred = lt_with_mm(vm, va, imm)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::LeI => {
                let va = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let pred = le_with_mm(vm, va, imm)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::GtI => {
                let va = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let pred = lt_with_mm(vm, imm, va)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::GeI => {
                let va = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let pred = le_with_mm(vm, imm, va)?;
                cond_skip(vm, ci, pred, inst.k());
            }
            OpCode::Test => {
                let truthy = vm.stack[base + a].is_truthy();
                if truthy != inst.k() {
                    vm.call_stack[ci].pc += 1;
                }
            }
            OpCode::TestSet => {
                let vb = vm.stack[base + inst.b() as usize];
                if vb.is_truthy() == inst.k() {
                    vm.stack[base + a] = vb;
                } else {
                    vm.call_stack[ci].pc += 1;
                }
            }

            // ---- Calls and returns ----
            OpCode::Call => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let func_slot = base + a;
                let nargs = if b == 0 {
                    vm.stack_top.saturating_sub(func_slot + 1)
                } else {
                    b - 1
                };
                let expected = if c == 0 { -1 } else { c as i32 - 1 };
                call_prologue(vm, func_slot, nargs, expected)?;
            }
            OpCode::TailCall => {
                let b = inst.b() as usize;
                let nargs = if b == 0 {
                    vm.stack_top.saturating_sub(base + a + 1)
                } else {
                    b - 1
                };
                if let Some(out) = tail_call(vm, base_depth, ci, base + a, nargs)? {
                    return Ok(out);
                }
            }
            OpCode::Return => {
                let b = inst.b() as usize;
                let results = if b == 0 {
                    vm.stack[base + a..vm.stack_top].to_vec()
                } else {
                    vm.stack[base + a..base + a + b - 1].to_vec()
                };
                ret!(vm, results);
            }
            OpCode::Return0 => {
                ret!(vm, Vec::new());
            }
            OpCode::Return1 => {
                ret!(vm, vec![vm.stack[base + a]]);
            }

            // ---- Numeric for ----
            OpCode::ForPrep => {
                for_prep(vm, ci, base + a, inst.bx() as usize)?;
            }
            OpCode::ForLoop => {
                for_loop(vm, ci, base + a, inst.bx() as usize);
            }

            // ---- Generic for ----
            OpCode::TForPrep => {
                mark_tbc(vm, base + a + 3)?;
                vm.call_stack[ci].pc += inst.bx() as usize;
            }
            OpCode::TForCall => {
                let c = inst.c() as usize;
                let f = vm.stack[base + a];
                let state = vm.stack[base + a + 1];
                let control = vm.stack[base + a + 2];
                let results = call_value(vm, f, &[state, control])?;
                let base = vm.call_stack[ci].base;
                vm.ensure_stack(base + a + 4 + c)?;
                for i in 0..c {
                    vm.stack[base + a + 4 + i] =
                        results.get(i).copied().unwrap_or(TValue::nil());
                }
            }
            OpCode::TForLoop => {
                let control = vm.stack[base + a + 2];
                if !control.is_nil() {
                    vm.stack[base + a] = control;
                    let pc = &mut vm.call_stack[ci].pc;
                    *pc -= inst.bx() as usize;
                }
            }

            // ---- Closures and varargs ----
            OpCode::Closure => {
                let v = make_closure(vm, ci, inst.bx() as usize)?;
                let base = vm.call_stack[ci].base;
                vm.stack[base + a] = v;
            }
            OpCode::VarArg => {
                let c = inst.c() as usize;
                vararg_copy(vm, ci, a, c)?;
            }
            OpCode::VarArgPrep => {
                vararg_prep(vm, ci)?;
            }

            OpCode::ExtraArg => {
                // operand extension; consumed by the preceding opcode
            }
        }
    }
}

// ---- Instruction helpers ----

fn arith_op_of(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add | OpCode::AddK => ArithOp::Add,
        OpCode::Sub | OpCode::SubK => ArithOp::Sub,
        OpCode::Mul | OpCode::MulK => ArithOp::Mul,
        OpCode::Mod | OpCode::ModK => ArithOp::Mod,
        OpCode::Pow | OpCode::PowK => ArithOp::Pow,
        OpCode::Div | OpCode::DivK => ArithOp::Div,
        OpCode::IDiv | OpCode::IDivK => ArithOp::IDiv,
        OpCode::BAnd | OpCode::BAndK => ArithOp::BAnd,
        OpCode::BOr | OpCode::BOrK => ArithOp::BOr,
        OpCode::BXor | OpCode::BXorK => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        OpCode::Shr => ArithOp::Shr,
        _ => unreachable!("not an arithmetic opcode"),
    }
}

fn mm_operand(c: u8) -> Result<Mm, VmError> {
    Mm::from_u8(c).ok_or_else(|| VmError::Structural(format!("bad metamethod operand {c}")))
}

/// Convert a constant-pool entry to a value.
fn constant_value(vm: &mut Vm, ci: usize, idx: usize) -> Result<TValue, VmError> {
    let proto = vm.call_stack[ci].proto;
    let k = vm.protos[proto]
        .constants
        .get(idx)
        .cloned()
        .ok_or_else(|| VmError::Structural(format!("bad constant index {idx}")))?;
    Ok(match k {
        Constant::Nil => TValue::nil(),
        Constant::Boolean(b) => TValue::from_bool(b),
        Constant::Integer(i) => TValue::from_full_integer(i, &mut vm.heap),
        Constant::Float(f) => TValue::from_float(f),
        Constant::String(sid) => TValue::from_string_id(sid),
    })
}

/// A constant that must be a string key.
fn constant_string(vm: &Vm, ci: usize, idx: usize) -> Result<TValue, VmError> {
    let proto = vm.call_stack[ci].proto;
    match vm.protos[proto].constants.get(idx) {
        Some(Constant::String(sid)) => Ok(TValue::from_string_id(*sid)),
        Some(other) => Err(VmError::Structural(format!(
            "constant {idx} is not a string key: {other:?}"
        ))),
        None => Err(VmError::Structural(format!("bad constant index {idx}"))),
    }
}

/// RK operand: register `C`, or constant `K[C]` when the k flag is set.
fn rk_value(vm: &mut Vm, ci: usize, c: usize, k: bool) -> Result<TValue, VmError> {
    if k {
        constant_value(vm, ci, c)
    } else {
        let base = vm.call_stack[ci].base;
        Ok(vm.stack[base + c])
    }
}

/// Read the EXTRAARG instruction at pc, advancing past it.
fn consume_extra_arg(vm: &mut Vm, ci: usize) -> Result<u32, VmError> {
    let proto = vm.call_stack[ci].proto;
    let pc = vm.call_stack[ci].pc;
    let inst = vm.protos[proto]
        .code
        .get(pc)
        .copied()
        .ok_or_else(|| VmError::Structural("missing EXTRAARG".into()))?;
    if inst.opcode() != Some(OpCode::ExtraArg) {
        return Err(VmError::Structural(format!(
            "expected EXTRAARG at pc {pc}"
        )));
    }
    vm.call_stack[ci].pc += 1;
    Ok(inst.ax())
}

fn upvalue_handle(
    vm: &Vm,
    ci: usize,
    idx: usize,
) -> Result<nocta_core::heap::HeapIdx<nocta_core::heap::UpValue>, VmError> {
    let closure = vm.call_stack[ci]
        .closure
        .ok_or_else(|| VmError::Structural("upvalue access outside a closure".into()))?;
    vm.heap
        .closure(closure)
        .upvalues
        .get(idx)
        .copied()
        .ok_or_else(|| VmError::Structural(format!("bad upvalue index {idx}")))
}

fn jump(vm: &mut Vm, ci: usize, offset: i32) -> Result<(), VmError> {
    let pc = vm.call_stack[ci].pc as i64 + offset as i64;
    if pc < 0 {
        return Err(VmError::Structural(format!("jump to pc {pc}")));
    }
    vm.call_stack[ci].pc = pc as usize;
    Ok(())
}

/// Conditional skip: the effective predicate is `pred XOR k`; when it is
/// false the following JMP is skipped, when true the JMP executes.
fn cond_skip(vm: &mut Vm, ci: usize, pred: bool, k: bool) {
    if pred == k {
        vm.call_stack[ci].pc += 1;
    }
}

// ---- Calls ----

/// Begin a call at `func_slot` with `nargs` arguments. Closures push a
/// frame; natives run synchronously and place their results; other values
/// go through `__call`.
fn call_prologue(
    vm: &mut Vm,
    func_slot: usize,
    mut nargs: usize,
    expected: i32,
) -> Result<(), VmError> {
    if vm.call_stack.len() >= vm.call_depth_limit {
        return Err(VmError::Resource("call stack depth exceeded".into()));
    }
    let mut func = vm.stack[func_slot];

    for _ in 0..MAX_CALL_CHAIN {
        if let Some(closure_idx) = func.as_closure_idx() {
            let proto_idx = vm.heap.closure(closure_idx).proto;
            let p = &vm.protos[proto_idx];
            let num_params = p.num_params as usize;
            let max_stack = p.max_stack_size as usize;
            let is_vararg = p.is_vararg;
            let base = func_slot + 1;

            if is_vararg {
                vm.ensure_stack(base + nargs.max(max_stack))?;
                if nargs < max_stack {
                    vm.clear_stack_range(base + nargs, base + max_stack);
                }
                vm.stack_top = base + nargs.max(max_stack);
            } else {
                vm.ensure_stack(base + max_stack)?;
                vm.clear_stack_range(base + num_params.min(nargs), base + max_stack);
                vm.stack_top = base + max_stack;
            }

            let mut frame = CallInfo::new(base, proto_idx);
            frame.expected_results = expected;
            frame.closure = Some(closure_idx);
            frame.func_slot = func_slot;
            frame.num_args = nargs;
            vm.call_stack.push(frame);
            return Ok(());
        }

        if let Some(nidx) = func.as_native_index() {
            let native = vm
                .natives
                .get(nidx as usize)
                .ok_or_else(|| VmError::Structural(format!("unknown native #{nidx}")))?
                .func;
            let arg_base = func_slot + 1;
            let old_top = vm.stack_top;
            vm.stack_top = arg_base + nargs;
            let nres = native(vm, arg_base, nargs)?;

            // shift results down onto the callee slot
            for i in 0..nres {
                vm.stack[func_slot + i] = vm.stack[arg_base + i];
            }
            let want = if expected < 0 { nres } else { expected as usize };
            vm.ensure_stack(func_slot + want)?;
            for i in nres..want {
                vm.stack[func_slot + i] = TValue::nil();
            }
            let new_top = func_slot + want;
            vm.clear_stack_range(new_top, old_top.max(arg_base + nres));
            vm.stack_top = new_top;
            return Ok(());
        }

        // not callable directly: try __call with the value itself prepended
        let sid = vm.mm_names.id(Mm::Call);
        let handler = get_metamethod(func, sid, &vm.heap, &vm.strings).ok_or_else(|| {
            VmError::Type(format!("attempt to call a {} value", type_name(func)))
        })?;
        vm.ensure_stack(func_slot + 2 + nargs)?;
        for i in (0..nargs).rev() {
            vm.stack[func_slot + 2 + i] = vm.stack[func_slot + 1 + i];
        }
        vm.stack[func_slot + 1] = func;
        vm.stack[func_slot] = handler;
        nargs += 1;
        if vm.stack_top < func_slot + 1 + nargs {
            vm.stack_top = func_slot + 1 + nargs;
        }
        func = handler;
    }
    Err(VmError::Type("'__call' chain too long".into()))
}

/// Replace the current frame with a call to the function at `func_reg`,
/// keeping stack depth flat. Natives complete the frame instead.
fn tail_call(
    vm: &mut Vm,
    base_depth: usize,
    ci: usize,
    func_reg: usize,
    mut nargs: usize,
) -> Result<Option<Vec<TValue>>, VmError> {
    let frame_base = vm.call_stack[ci].base;
    close_scope(vm, frame_base, None, false)?;
    vm.call_stack[ci].tbc.clear();

    let mut func = vm.stack[func_reg];
    let mut arg_base = func_reg + 1;

    for _ in 0..MAX_CALL_CHAIN {
        if let Some(closure_idx) = func.as_closure_idx() {
            let proto_idx = vm.heap.closure(closure_idx).proto;
            let p = &vm.protos[proto_idx];
            let num_params = p.num_params as usize;
            let max_stack = p.max_stack_size as usize;
            let is_vararg = p.is_vararg;

            let func_slot = vm.call_stack[ci].func_slot;
            vm.stack[func_slot] = func;
            for i in 0..nargs {
                vm.stack[func_slot + 1 + i] = vm.stack[arg_base + i];
            }
            let base = func_slot + 1;

            if is_vararg {
                vm.ensure_stack(base + nargs.max(max_stack))?;
                if nargs < max_stack {
                    vm.clear_stack_range(base + nargs, base + max_stack);
                }
                vm.stack_top = base + nargs.max(max_stack);
            } else {
                vm.ensure_stack(base + max_stack)?;
                vm.clear_stack_range(base + num_params.min(nargs), base + max_stack);
                vm.stack_top = base + max_stack;
            }

            let frame = &mut vm.call_stack[ci];
            frame.base = base;
            frame.pc = 0;
            frame.proto = proto_idx;
            frame.closure = Some(closure_idx);
            frame.num_args = nargs;
            frame.vararg_base = None;
            return Ok(None);
        }

        if let Some(nidx) = func.as_native_index() {
            let native = vm
                .natives
                .get(nidx as usize)
                .ok_or_else(|| VmError::Structural(format!("unknown native #{nidx}")))?
                .func;
            vm.stack_top = arg_base + nargs;
            let nres = native(vm, arg_base, nargs)?;
            let results = vm.stack[arg_base..arg_base + nres].to_vec();
            return do_return(vm, base_depth, results);
        }

        let sid = vm.mm_names.id(Mm::Call);
        let handler = get_metamethod(func, sid, &vm.heap, &vm.strings).ok_or_else(|| {
            VmError::Type(format!("attempt to call a {} value", type_name(func)))
        })?;
        vm.ensure_stack(arg_base + 1 + nargs)?;
        for i in (0..nargs).rev() {
            vm.stack[arg_base + 1 + i] = vm.stack[arg_base + i];
        }
        vm.stack[arg_base] = func;
        nargs += 1;
        func = handler;
    }
    Err(VmError::Type("'__call' chain too long".into()))
}

/// Return from the innermost frame. At the boundary frame the results go
/// back to the driver; otherwise they are placed for the caller per its
/// expected-result count.
fn do_return(
    vm: &mut Vm,
    base_depth: usize,
    results: Vec<TValue>,
) -> Result<Option<Vec<TValue>>, VmError> {
    let frame = vm.call_stack.len() - 1;
    let frame_base = vm.call_stack[frame].base;
    close_scope(vm, frame_base, None, false)?;

    let ci = vm.call_stack.pop().expect("frame present");
    let old_top = vm.stack_top;

    if frame == base_depth {
        vm.clear_stack_range(ci.func_slot, old_top);
        vm.stack_top = ci.func_slot;
        return Ok(Some(results));
    }

    let dest = ci.func_slot;
    if ci.expected_results < 0 {
        vm.ensure_stack(dest + results.len())?;
        for (i, &v) in results.iter().enumerate() {
            vm.stack[dest + i] = v;
        }
        vm.stack_top = dest + results.len();
    } else {
        let want = ci.expected_results as usize;
        vm.ensure_stack(dest + want)?;
        for i in 0..want {
            vm.stack[dest + i] = results.get(i).copied().unwrap_or(TValue::nil());
        }
        vm.stack_top = dest + want;
    }
    vm.clear_stack_range(vm.stack_top, old_top);
    Ok(None)
}

/// Unwind frames above `base_depth`, closing each frame's scope with the
/// error object. `__close` failures during unwind are logged, not raised.
fn unwind(vm: &mut Vm, base_depth: usize, err: &VmError) {
    let errval = err.to_value(&mut vm.strings);
    while vm.call_stack.len() > base_depth {
        let frame = vm.call_stack.len() - 1;
        let frame_base = vm.call_stack[frame].base;
        let func_slot = vm.call_stack[frame].func_slot;
        let _ = close_scope(vm, frame_base, Some(errval), true);
        vm.call_stack.pop();
        if vm.call_stack.len() == base_depth {
            let top = vm.stack_top.max(func_slot);
            vm.clear_stack_range(func_slot, top);
            vm.stack_top = func_slot;
        }
    }
}

// ---- Scope exit ----

/// Mark a register to-be-closed. Nil and false are ignored; anything else
/// must have a `__close` metamethod.
fn mark_tbc(vm: &mut Vm, slot: usize) -> Result<(), VmError> {
    let v = vm.stack[slot];
    if v.is_falsy() {
        return Ok(());
    }
    let sid = vm.mm_names.id(Mm::Close);
    if get_metamethod(v, sid, &vm.heap, &vm.strings).is_none() {
        return Err(VmError::Type(format!(
            "got a non-closable value of type {}",
            type_name(v)
        )));
    }
    vm.call_stack
        .last_mut()
        .expect("running frame")
        .tbc
        .push(slot);
    Ok(())
}

/// Close the current frame's scope at or above `level`: run `__close`
/// handlers newest-first, then close upvalues. During unwind the error
/// object is passed through and handler failures are logged instead of
/// raised.
fn close_scope(
    vm: &mut Vm,
    level: usize,
    errobj: Option<TValue>,
    in_unwind: bool,
) -> Result<(), VmError> {
    let frame = vm.call_stack.len() - 1;
    loop {
        let slot = match vm.call_stack[frame].tbc.last().copied() {
            Some(s) if s >= level => {
                vm.call_stack[frame].tbc.pop();
                s
            }
            _ => break,
        };
        let v = vm.stack[slot];
        if v.is_falsy() {
            continue;
        }
        let sid = vm.mm_names.id(Mm::Close);
        // the metatable may have changed since the mark; nothing to call then
        if let Some(handler) = get_metamethod(v, sid, &vm.heap, &vm.strings) {
            let earg = errobj.unwrap_or_else(TValue::nil);
            if let Err(e) = call_value(vm, handler, &[v, earg]) {
                if in_unwind {
                    tracing::warn!(
                        target: "nocta_vm::dispatch",
                        "__close raised during unwind: {e}"
                    );
                } else {
                    vm.close_upvalues(level);
                    return Err(e);
                }
            }
        }
    }
    vm.close_upvalues(level);
    Ok(())
}

// ---- Operator dispatch ----

/// Fast path plus fallback protocol for one binary arithmetic operation.
/// On success the following `MMBIN*` (if any) is skipped; on a type
/// mismatch the `MMBIN*` takes over, or, in streams without one, the
/// dispatcher is invoked directly.
fn do_arith(
    vm: &mut Vm,
    ci: usize,
    op: ArithOp,
    dest: usize,
    vb: TValue,
    vc: TValue,
) -> Result<(), VmError> {
    match arith::raw_binary(op, vb, vc, &mut vm.heap, &vm.strings) {
        RawArith::Value(v) => {
            vm.stack[dest] = v;
            if next_is_mm_fallback(vm, ci) {
                vm.call_stack[ci].pc += 1;
            }
            Ok(())
        }
        RawArith::Error(e) => Err(e),
        RawArith::NeedMeta => {
            if next_is_mm_fallback(vm, ci) {
                return Ok(());
            }
            let v = try_bin_mm(vm, Mm::from_arith_op(op), vb, vc)?;
            vm.stack[dest] = v;
            Ok(())
        }
    }
}

fn next_is_mm_fallback(vm: &Vm, ci: usize) -> bool {
    let proto = vm.call_stack[ci].proto;
    let pc = vm.call_stack[ci].pc;
    vm.protos[proto]
        .code
        .get(pc)
        .and_then(|i| i.opcode())
        .map_or(false, |o| o.is_mm_fallback())
}

/// Result register of an `MMBIN*`: the A operand of the arithmetic
/// instruction immediately before it.
fn mm_fallback_dest(vm: &Vm, ci: usize) -> Result<usize, VmError> {
    let proto = vm.call_stack[ci].proto;
    let pc = vm.call_stack[ci].pc;
    if pc < 2 {
        return Err(VmError::Structural("MMBIN without a preceding operation".into()));
    }
    let prev: Instruction = vm.protos[proto].code[pc - 2];
    Ok(vm.call_stack[ci].base + prev.a() as usize)
}

fn first_result(results: Vec<TValue>) -> TValue {
    results.first().copied().unwrap_or_else(TValue::nil)
}

/// Binary metamethod dispatch: `a`'s handler, else `b`'s, else a type
/// error naming the offending operand.
fn try_bin_mm(vm: &mut Vm, mm: Mm, a: TValue, b: TValue) -> Result<TValue, VmError> {
    let sid = vm.mm_names.id(mm);
    let handler = get_metamethod(a, sid, &vm.heap, &vm.strings)
        .or_else(|| get_metamethod(b, sid, &vm.heap, &vm.strings));
    match handler {
        Some(h) => Ok(first_result(call_value(vm, h, &[a, b])?)),
        None => {
            let culprit = pick_culprit(vm, mm, a, b);
            Err(VmError::Type(format!(
                "attempt to {} a {} value",
                mm.operation_phrase(),
                type_name(culprit)
            )))
        }
    }
}

/// Unary metamethod dispatch; the operand doubles as both arguments.
fn try_un_mm(vm: &mut Vm, mm: Mm, v: TValue) -> Result<TValue, VmError> {
    let sid = vm.mm_names.id(mm);
    match get_metamethod(v, sid, &vm.heap, &vm.strings) {
        Some(h) => Ok(first_result(call_value(vm, h, &[v, v])?)),
        None => Err(VmError::Type(format!(
            "attempt to {} a {} value",
            mm.operation_phrase(),
            type_name(v)
        ))),
    }
}

/// The operand to blame in a metamethod-less failure message.
fn pick_culprit(vm: &Vm, mm: Mm, a: TValue, b: TValue) -> TValue {
    let fine = |v: TValue| match mm {
        Mm::Concat => v.is_string() || v.is_number() || v.as_full_integer(&vm.heap).is_some(),
        _ => crate::coerce::to_number(v, &vm.heap, &vm.strings).is_some(),
    };
    if !fine(a) {
        a
    } else {
        b
    }
}

fn eq_with_mm(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, VmError> {
    if compare::raw_eq(a, b, &vm.heap, &vm.strings) {
        return Ok(true);
    }
    // __eq only when raw equality failed and both sides are tables or
    // both are full userdata
    let comparable = (a.is_table() && b.is_table()) || (a.is_userdata() && b.is_userdata());
    if !comparable {
        return Ok(false);
    }
    let sid = vm.mm_names.id(Mm::Eq);
    let handler = get_metamethod(a, sid, &vm.heap, &vm.strings)
        .or_else(|| get_metamethod(b, sid, &vm.heap, &vm.strings));
    match handler {
        Some(h) => Ok(first_result(call_value(vm, h, &[a, b])?).is_truthy()),
        None => Ok(false),
    }
}

fn lt_with_mm(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, VmError> {
    if let Some(r) = compare::raw_lt(a, b, &vm.heap, &vm.strings) {
        return Ok(r);
    }
    order_mm(vm, Mm::Lt, a, b)
}

fn le_with_mm(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, VmError> {
    if let Some(r) = compare::raw_le(a, b, &vm.heap, &vm.strings) {
        return Ok(r);
    }
    order_mm(vm, Mm::Le, a, b)
}

fn order_mm(vm: &mut Vm, mm: Mm, a: TValue, b: TValue) -> Result<bool, VmError> {
    let sid = vm.mm_names.id(mm);
    let handler = get_metamethod(a, sid, &vm.heap, &vm.strings)
        .or_else(|| get_metamethod(b, sid, &vm.heap, &vm.strings));
    match handler {
        Some(h) => Ok(first_result(call_value(vm, h, &[a, b])?).is_truthy()),
        None => Err(VmError::Type(format!(
            "attempt to compare {} with {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

/// `#v`: string length, table border (after `__len`), else `__len` or a
/// type error.
fn length_of(vm: &mut Vm, v: TValue) -> Result<TValue, VmError> {
    if let Some(sid) = v.as_string_id() {
        let len = vm.strings.get_bytes(sid).len() as i64;
        return Ok(TValue::from_full_integer(len, &mut vm.heap));
    }
    if let Some(tidx) = v.as_table_idx() {
        let lensid = vm.mm_names.id(Mm::Len);
        if let Some(h) = get_metamethod(v, lensid, &vm.heap, &vm.strings) {
            return Ok(first_result(call_value(vm, h, &[v, v])?));
        }
        let border = vm.heap.table(tidx).length();
        return Ok(TValue::from_full_integer(border, &mut vm.heap));
    }
    try_un_mm(vm, Mm::Len, v)
}

/// One right-associative concatenation step.
fn concat_pair(vm: &mut Vm, l: TValue, r: TValue) -> Result<TValue, VmError> {
    let stringable = |v: TValue, vm: &Vm| {
        v.is_string() || v.is_float() || v.as_full_integer(&vm.heap).is_some()
    };
    if stringable(l, vm) && stringable(r, vm) {
        let mut bytes = Vec::new();
        let ls = crate::coerce::to_concat_string(l, &vm.heap, &mut vm.strings)
            .expect("stringable operand");
        bytes.extend_from_slice(vm.strings.get_bytes(ls));
        let rs = crate::coerce::to_concat_string(r, &vm.heap, &mut vm.strings)
            .expect("stringable operand");
        bytes.extend_from_slice(vm.strings.get_bytes(rs));
        let sid = vm.strings.intern_or_create(&bytes);
        return Ok(TValue::from_string_id(sid));
    }
    try_bin_mm(vm, Mm::Concat, l, r)
}

// ---- Indexing ----

/// `t[k]` with the `__index` protocol: raw hit wins; a table handler
/// restarts the lookup on it; a function handler is called `(t, k)`.
pub fn index_get(vm: &mut Vm, t: TValue, k: TValue) -> Result<TValue, VmError> {
    let mut cur = t;
    for _ in 0..MAX_INDEX_CHAIN {
        if let Some(tidx) = cur.as_table_idx() {
            let raw = vm.heap.table(tidx).raw_get(k, &vm.strings);
            if !raw.is_nil() {
                return Ok(raw);
            }
            let sid = vm.mm_names.id(Mm::Index);
            let handler = match vm.heap.table(tidx).metatable {
                None => return Ok(TValue::nil()),
                Some(mt) => {
                    let h = vm.heap.table(mt).raw_get_str(sid, &vm.strings);
                    if h.is_nil() {
                        return Ok(TValue::nil());
                    }
                    h
                }
            };
            if handler.is_function() {
                return Ok(first_result(call_value(vm, handler, &[cur, k])?));
            }
            cur = handler;
        } else {
            let sid = vm.mm_names.id(Mm::Index);
            match get_metamethod(cur, sid, &vm.heap, &vm.strings) {
                None => {
                    return Err(VmError::Reference(format!(
                        "attempt to index a {} value",
                        type_name(cur)
                    )))
                }
                Some(h) if h.is_function() => {
                    return Ok(first_result(call_value(vm, h, &[cur, k])?))
                }
                Some(h) => cur = h,
            }
        }
    }
    Err(VmError::Reference("'__index' chain too long; possible loop".into()))
}

/// `t[k] = v` with the `__newindex` protocol: a raw-present key writes
/// directly; otherwise a table handler forwards the assignment and a
/// function handler is called `(t, k, v)`.
pub fn index_set(vm: &mut Vm, t: TValue, k: TValue, v: TValue) -> Result<(), VmError> {
    let mut cur = t;
    for _ in 0..MAX_INDEX_CHAIN {
        if let Some(tidx) = cur.as_table_idx() {
            let present = !vm.heap.table(tidx).raw_get(k, &vm.strings).is_nil();
            if present {
                vm.heap
                    .table_mut(tidx)
                    .raw_set(k, v, &vm.strings)
                    .map_err(|m| VmError::Type(m.to_string()))?;
                return Ok(());
            }
            let sid = vm.mm_names.id(Mm::NewIndex);
            let handler = match vm.heap.table(tidx).metatable {
                None => TValue::nil(),
                Some(mt) => vm.heap.table(mt).raw_get_str(sid, &vm.strings),
            };
            if handler.is_nil() {
                vm.heap
                    .table_mut(tidx)
                    .raw_set(k, v, &vm.strings)
                    .map_err(|m| VmError::Type(m.to_string()))?;
                return Ok(());
            }
            if handler.is_function() {
                call_value(vm, handler, &[cur, k, v])?;
                return Ok(());
            }
            cur = handler;
        } else {
            let sid = vm.mm_names.id(Mm::NewIndex);
            match get_metamethod(cur, sid, &vm.heap, &vm.strings) {
                None => {
                    return Err(VmError::Reference(format!(
                        "attempt to index a {} value",
                        type_name(cur)
                    )))
                }
                Some(h) if h.is_function() => {
                    call_value(vm, h, &[cur, k, v])?;
                    return Ok(());
                }
                Some(h) => cur = h,
            }
        }
    }
    Err(VmError::Reference("'__newindex' chain too long; possible loop".into()))
}

// ---- Closures ----

fn make_closure(vm: &mut Vm, ci: usize, bx: usize) -> Result<TValue, VmError> {
    let proto_idx = vm.call_stack[ci].proto;
    let base = vm.call_stack[ci].base;
    let child = vm.proto_children[proto_idx]
        .get(bx)
        .copied()
        .ok_or_else(|| VmError::Structural(format!("bad child prototype index {bx}")))?;

    let ndescs = vm.protos[child].upvalues.len();
    let mut upvals = Vec::with_capacity(ndescs);
    for di in 0..ndescs {
        let (in_stack, index) = {
            let d = &vm.protos[child].upvalues[di];
            (d.in_stack, d.index as usize)
        };
        if in_stack {
            upvals.push(vm.find_or_create_open_upvalue(base + index));
        } else {
            let parent = vm.call_stack[ci]
                .closure
                .ok_or_else(|| VmError::Structural("upvalue capture outside a closure".into()))?;
            let handle = vm
                .heap
                .closure(parent)
                .upvalues
                .get(index)
                .copied()
                .ok_or_else(|| VmError::Structural(format!("bad upvalue index {index}")))?;
            upvals.push(handle);
        }
    }
    let idx = vm.heap.alloc_closure(child, upvals);
    Ok(TValue::from_closure(idx))
}

// ---- Varargs ----

/// Relocate a vararg frame: fixed parameters move above the received
/// arguments, which stay behind as the vararg list.
fn vararg_prep(vm: &mut Vm, ci: usize) -> Result<(), VmError> {
    if vm.call_stack[ci].vararg_base.is_some() {
        return Ok(()); // already adjusted (tail call re-entry)
    }
    let old_base = vm.call_stack[ci].base;
    let nargs = vm.call_stack[ci].num_args;
    let proto_idx = vm.call_stack[ci].proto;
    let nfixed = vm.protos[proto_idx].num_params as usize;
    let max_stack = vm.protos[proto_idx].max_stack_size as usize;

    let new_base = old_base + nargs;
    vm.ensure_stack(new_base + max_stack)?;
    let copied = nfixed.min(nargs);
    for i in 0..copied {
        vm.stack[new_base + i] = vm.stack[old_base + i];
        vm.stack[old_base + i] = TValue::nil();
    }
    vm.clear_stack_range(new_base + copied, new_base + max_stack);
    vm.stack_top = new_base + max_stack;

    let frame = &mut vm.call_stack[ci];
    frame.base = new_base;
    frame.vararg_base = Some(old_base);
    Ok(())
}

/// VARARG A C: copy up to C-1 varargs to R[A..], nil-padded; C == 0
/// copies all and leaves the top after them.
fn vararg_copy(vm: &mut Vm, ci: usize, a: usize, c: usize) -> Result<(), VmError> {
    let base = vm.call_stack[ci].base;
    let (vararg_start, vararg_count) = match vm.call_stack[ci].vararg_base {
        Some(vb) => {
            let proto_idx = vm.call_stack[ci].proto;
            let nfixed = vm.protos[proto_idx].num_params as usize;
            let count = vm.call_stack[ci].num_args.saturating_sub(nfixed);
            (vb + nfixed, count)
        }
        None => (0, 0),
    };
    let wanted = if c == 0 { vararg_count } else { c - 1 };
    vm.ensure_stack(base + a + wanted)?;
    for i in 0..wanted {
        vm.stack[base + a + i] = if i < vararg_count {
            vm.stack[vararg_start + i]
        } else {
            TValue::nil()
        };
    }
    if c == 0 {
        vm.stack_top = base + a + wanted;
    }
    Ok(())
}

// ---- Numeric for ----

/// FORPREP A Bx: validate and normalize the control values; skip the
/// whole loop (jump Bx+1) when it would not run. Integer loops precompute
/// an unsigned trip count in R[A+1] so wrap-around near the i64 bounds
/// cannot mis-iterate; the raw limit is no longer needed after that.
fn for_prep(vm: &mut Vm, ci: usize, slot: usize, bx: usize) -> Result<(), VmError> {
    let init = vm.stack[slot];
    let limit = vm.stack[slot + 1];
    let step = vm.stack[slot + 2];

    let ints = (
        init.as_full_integer(&vm.heap),
        limit.as_full_integer(&vm.heap),
        step.as_full_integer(&vm.heap),
    );
    if let (Some(i0), Some(l), Some(s)) = ints {
        if s == 0 {
            return Err(VmError::Arith("'for' step is zero".into()));
        }
        let runs = if s > 0 { i0 <= l } else { i0 >= l };
        if !runs {
            vm.call_stack[ci].pc += bx + 1;
            return Ok(());
        }
        let span = if s > 0 {
            (l as u64).wrapping_sub(i0 as u64)
        } else {
            (i0 as u64).wrapping_sub(l as u64)
        };
        let step_mag = if s > 0 {
            s as u64
        } else {
            // |s| without overflowing on i64::MIN
            ((-(s + 1)) as u64).wrapping_add(1)
        };
        let count = span / step_mag;
        // the count is an internal u64 carried in the limit slot's bits
        vm.stack[slot + 1] = TValue::from_full_integer(count as i64, &mut vm.heap);
        vm.stack[slot + 3] = init;
        return Ok(());
    }

    let f0 = crate::coerce::to_number(init, &vm.heap, &vm.strings)
        .ok_or_else(|| VmError::Type("'for' initial value must be a number".into()))?;
    let fl = crate::coerce::to_number(limit, &vm.heap, &vm.strings)
        .ok_or_else(|| VmError::Type("'for' limit must be a number".into()))?;
    let fs = crate::coerce::to_number(step, &vm.heap, &vm.strings)
        .ok_or_else(|| VmError::Type("'for' step must be a number".into()))?;
    if fs == 0.0 {
        return Err(VmError::Arith("'for' step is zero".into()));
    }
    let runs = if fs > 0.0 { f0 <= fl } else { f0 >= fl };
    if !runs {
        vm.call_stack[ci].pc += bx + 1;
        return Ok(());
    }
    vm.stack[slot] = TValue::from_float(f0);
    vm.stack[slot + 1] = TValue::from_float(fl);
    vm.stack[slot + 2] = TValue::from_float(fs);
    vm.stack[slot + 3] = TValue::from_float(f0);
    Ok(())
}

/// FORLOOP A Bx: advance and jump back while iterations remain. The loop
/// variable's visible copy lives in R[A+3]; its captures are closed each
/// iteration so every pass observes a fresh cell.
fn for_loop(vm: &mut Vm, ci: usize, slot: usize, bx: usize) {
    let step = vm.stack[slot + 2];
    if let Some(s) = step.as_full_integer(&vm.heap) {
        let count = vm.stack[slot + 1]
            .as_full_integer(&vm.heap)
            .unwrap_or(0) as u64;
        if count > 0 {
            let cur = vm.stack[slot]
                .as_full_integer(&vm.heap)
                .expect("integer loop variable");
            let next = cur.wrapping_add(s);
            vm.stack[slot + 1] = TValue::from_full_integer((count - 1) as i64, &mut vm.heap);
            let next_val = TValue::from_full_integer(next, &mut vm.heap);
            vm.stack[slot] = next_val;
            vm.close_upvalues(slot + 3);
            vm.stack[slot + 3] = next_val;
            vm.call_stack[ci].pc -= bx;
        }
    } else {
        let cur = vm.stack[slot].as_float().expect("float loop variable");
        let fl = vm.stack[slot + 1].as_float().expect("float loop limit");
        let fs = step.as_float().expect("float loop step");
        let next = cur + fs;
        let continues = if fs > 0.0 { next <= fl } else { next >= fl };
        if continues {
            let next_val = TValue::from_float(next);
            vm.stack[slot] = next_val;
            vm.close_upvalues(slot + 3);
            vm.stack[slot + 3] = next_val;
            vm.call_stack[ci].pc -= bx;
        }
    }
}
