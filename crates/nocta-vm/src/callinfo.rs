//! Per-invocation call frames.

use nocta_core::heap::{Closure, HeapIdx};

/// One activation record. Register `R[n]` of this frame resolves to the
/// absolute operand-stack slot `base + n`.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Absolute stack index of register 0.
    pub base: usize,
    /// Next instruction to execute, as an index into the proto's code.
    pub pc: usize,
    /// Results the caller asked for; -1 means "all".
    pub expected_results: i32,
    /// Flat index into the VM's prototype registry.
    pub proto: usize,
    /// The closure being executed.
    pub closure: Option<HeapIdx<Closure>>,
    /// Absolute stack index of the callee value; results land here.
    pub func_slot: usize,
    /// Arguments the call actually received (VARARGPREP consumes this).
    pub num_args: usize,
    /// Start of the raw argument area once VARARGPREP has relocated the
    /// frame; None for non-vararg functions.
    pub vararg_base: Option<usize>,
    /// Absolute stack indexes marked to-be-closed, in mark order.
    pub tbc: Vec<usize>,
}

impl CallInfo {
    pub fn new(base: usize, proto: usize) -> Self {
        CallInfo {
            base,
            pc: 0,
            expected_results: -1,
            proto,
            closure: None,
            func_slot: base.saturating_sub(1),
            num_args: 0,
            vararg_base: None,
            tbc: Vec::new(),
        }
    }
}
