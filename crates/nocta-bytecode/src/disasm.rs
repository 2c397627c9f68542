//! Textual disassembly, used by the execution trace and the crash dump.

use crate::opcode::{Instruction, OpCode, OpMode};
use crate::proto::{Constant, Proto};
use nocta_core::string::StringInterner;
use std::fmt::Write;

/// Render one instruction as a single line: pc, opcode, operands, and a
/// constant annotation where one applies.
pub fn disasm_line(proto: &Proto, pc: usize, strings: &StringInterner) -> String {
    let mut out = String::new();
    let inst = proto.code[pc];
    write!(out, "{pc:4}  ").unwrap();
    let line = proto.line_for(pc);
    if line > 0 {
        write!(out, "[{line:>4}]  ").unwrap();
    } else {
        write!(out, "[   -]  ").unwrap();
    }
    disasm_inst(&mut out, inst, proto, strings);
    out
}

fn disasm_inst(out: &mut String, inst: Instruction, proto: &Proto, strings: &StringInterner) {
    let op = match inst.opcode() {
        Some(op) => op,
        None => {
            write!(out, "BADOP({})", inst.raw_opcode()).unwrap();
            return;
        }
    };
    write!(out, "{:<12}", op.name()).unwrap();
    match op.mode() {
        OpMode::IABC => {
            write!(out, "{} {} {}", inst.a(), inst.b(), inst.c()).unwrap();
            if inst.k() {
                write!(out, " k").unwrap();
            }
            match op {
                OpCode::GetField | OpCode::GetTabUp => annotate_constant(out, proto, inst.c() as usize, strings),
                OpCode::SetField | OpCode::SetTabUp => annotate_constant(out, proto, inst.b() as usize, strings),
                _ => {}
            }
        }
        OpMode::IABx => {
            write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
            if op == OpCode::LoadK {
                annotate_constant(out, proto, inst.bx() as usize, strings);
            } else if op == OpCode::Closure {
                write!(out, "\t; proto [{}]", inst.bx()).unwrap();
            }
        }
        OpMode::IAsBx => write!(out, "{} {}", inst.a(), inst.sbx()).unwrap(),
        OpMode::IAx => write!(out, "{}", inst.ax()).unwrap(),
        OpMode::IsJ => write!(out, "{}", inst.sj()).unwrap(),
    }
}

fn annotate_constant(out: &mut String, proto: &Proto, idx: usize, strings: &StringInterner) {
    if let Some(k) = proto.constants.get(idx) {
        write!(out, "\t; ").unwrap();
        format_constant(out, k, strings);
    }
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => write!(out, "nil").unwrap(),
        Constant::Boolean(b) => write!(out, "{b}").unwrap(),
        Constant::Integer(i) => write!(out, "{i}").unwrap(),
        Constant::Float(f) => write!(out, "{f}").unwrap(),
        Constant::String(id) => {
            let bytes = strings.get_bytes(*id);
            match std::str::from_utf8(bytes) {
                Ok(s) => write!(out, "\"{s}\"").unwrap(),
                Err(_) => write!(out, "<binary>").unwrap(),
            }
        }
    }
}

/// Full listing of a prototype and its children.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_into(&mut out, proto, strings, 0);
    out
}

fn disassemble_into(out: &mut String, proto: &Proto, strings: &StringInterner, depth: usize) {
    let indent = "  ".repeat(depth);
    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function ({}{vararg} params, {} slots, {} upvalues, {} constants, {} protos)",
        proto.num_params,
        proto.max_stack_size,
        proto.upvalues.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();
    for pc in 0..proto.code.len() {
        writeln!(out, "{indent}  {}", disasm_line(proto, pc, strings)).unwrap();
    }
    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants:").unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "{indent}  {i}\t").unwrap();
            format_constant(out, k, strings);
            writeln!(out).unwrap();
        }
    }
    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}upvalues:").unwrap();
        for (i, up) in proto.upvalues.iter().enumerate() {
            let name = up
                .name
                .map(|id| String::from_utf8_lossy(strings.get_bytes(id)).into_owned())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "{indent}  {i}\t{name}\t{}\t{}",
                up.in_stack as u8, up.index
            )
            .unwrap();
        }
    }
    for (i, child) in proto.protos.iter().enumerate() {
        writeln!(out, "{indent}proto [{i}]:").unwrap();
        disassemble_into(out, child, strings, depth + 1);
    }
}
