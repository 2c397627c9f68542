//! Crash diagnostics: the critical dump.
//!
//! When a VM-internal error escapes every frame, the dump renders the
//! bytecode around each frame's pc, a slice of the operand stack, and the
//! call chain with source positions from prototype debug info. It is
//! emitted through `tracing::error!` before the error surfaces to the
//! host; user-raised errors do not dump.

use crate::error::VmError;
use crate::vm::Vm;
use nocta_bytecode::disasm;
use std::fmt::Write;

/// Instructions shown on each side of the faulting pc.
const CODE_WINDOW: usize = 3;
/// Stack slots shown per frame.
const STACK_WINDOW: usize = 12;

pub fn critical_dump(vm: &Vm, err: &VmError) -> String {
    let mut out = String::new();
    writeln!(out, "== vm error: {err}").unwrap();
    writeln!(out, "== call chain ({} frames):", vm.call_stack.len()).unwrap();

    for (depth, ci) in vm.call_stack.iter().enumerate().rev() {
        let proto = &vm.protos[ci.proto];
        let source = proto
            .source
            .map(|sid| String::from_utf8_lossy(vm.strings.get_bytes(sid)).into_owned())
            .unwrap_or_else(|| "?".to_string());
        // pc has advanced past the faulting instruction
        let pc = ci.pc.saturating_sub(1);
        let line = proto.line_for(pc);
        writeln!(
            out,
            "  #{depth} {source}:{line} (pc {pc}, base {}, expects {})",
            ci.base, ci.expected_results
        )
        .unwrap();

        let lo = pc.saturating_sub(CODE_WINDOW);
        let hi = (pc + CODE_WINDOW + 1).min(proto.code.len());
        for p in lo..hi {
            let marker = if p == pc { ">" } else { " " };
            writeln!(out, "   {marker} {}", disasm::disasm_line(proto, p, &vm.strings)).unwrap();
        }

        let reg_hi = (ci.base + STACK_WINDOW).min(vm.stack_top);
        for (r, slot) in (ci.base..reg_hi).enumerate() {
            writeln!(out, "     R[{r}] = {:?}", vm.stack[slot]).unwrap();
        }
    }

    writeln!(
        out,
        "== operand stack: top {}, {} slots reserved",
        vm.stack_top,
        vm.stack.len()
    )
    .unwrap();
    out
}
