//! VM state and the host-facing API surface.

use crate::callinfo::CallInfo;
use crate::dispatch;
use crate::error::VmError;
use crate::metamethod::MmNames;
use nocta_bytecode::proto::Proto;
use nocta_core::heap::{Heap, HeapIdx, UpValue};
use nocta_core::string::StringInterner;
use nocta_core::table::Table;
use nocta_core::value::TValue;

/// Native function ABI: `(vm, base, num_args) -> num_results`. Arguments
/// sit at `stack[base..base+num_args]`; results are written starting at
/// `stack[base]` and their count returned.
pub type NativeFn = fn(&mut Vm, usize, usize) -> Result<usize, VmError>;

/// A registered native function. Natives are never collected.
pub struct NativeFunction {
    pub func: NativeFn,
    pub name: &'static str,
}

/// Default operand-stack ceiling, in slots.
pub const DEFAULT_STACK_LIMIT: usize = 1_000_000;
/// Default call-stack depth ceiling.
pub const DEFAULT_CALL_DEPTH: usize = 200;

/// A virtual machine instance. Single-threaded: one instruction at a time,
/// with native calls and metamethods as the only reentry points.
pub struct Vm {
    /// Operand stack; registers address it by absolute index.
    pub stack: Vec<TValue>,
    /// First free slot above the live region.
    pub stack_top: usize,
    pub call_stack: Vec<CallInfo>,
    pub heap: Heap,
    pub strings: StringInterner,
    /// Flattened prototype registry; closures index into it.
    pub protos: Vec<Proto>,
    /// Flat indices of each prototype's children, parallel to `protos`.
    pub proto_children: Vec<Vec<usize>>,
    /// Open upvalues as (absolute stack index, handle), sorted ascending
    /// so closing consumes a suffix.
    pub open_upvalues: Vec<(usize, HeapIdx<UpValue>)>,
    pub natives: Vec<NativeFunction>,
    pub mm_names: MmNames,
    globals: Option<HeapIdx<Table>>,
    main: Option<TValue>,
    /// Operand-stack slot ceiling; exceeding it is a resource error.
    pub stack_limit: usize,
    /// Call-frame depth ceiling.
    pub call_depth_limit: usize,
    /// Optional instruction budget; `None` runs unmetered.
    pub instruction_limit: Option<u64>,
    pub(crate) instructions_retired: u64,
    trace_enabled: bool,
    trace_sink: Option<Box<dyn FnMut(&str)>>,
}

impl Vm {
    pub fn new() -> Self {
        let mut strings = StringInterner::new();
        let mm_names = MmNames::init(&mut strings);
        Vm {
            stack: vec![TValue::nil(); 1024],
            stack_top: 0,
            call_stack: Vec::new(),
            heap: Heap::new(),
            strings,
            protos: Vec::new(),
            proto_children: Vec::new(),
            open_upvalues: Vec::new(),
            natives: Vec::new(),
            mm_names,
            globals: None,
            main: None,
            stack_limit: DEFAULT_STACK_LIMIT,
            call_depth_limit: DEFAULT_CALL_DEPTH,
            instruction_limit: None,
            instructions_retired: 0,
            trace_enabled: false,
            trace_sink: None,
        }
    }

    // ---- Loading and running ----

    /// Install a main chunk. The front end's interner replaces the VM's
    /// (constants reference its ids), so metamethod names and builtins are
    /// re-interned here, and the main closure gets a single `_ENV` upvalue
    /// bound to a fresh globals table carrying the builtins.
    pub fn load_main(&mut self, proto: &Proto, strings: StringInterner) {
        self.strings = strings;
        self.mm_names = MmNames::init(&mut self.strings);
        self.protos.clear();
        self.proto_children.clear();
        let root = self.register_proto(proto);
        debug_assert_eq!(root, 0);

        let globals = self.heap.alloc_table(0, 16);
        self.globals = Some(globals);
        crate::builtins::install(self);

        let env = TValue::from_table(globals);
        let mut upvals = Vec::with_capacity(proto.upvalues.len().max(1));
        upvals.push(self.heap.alloc_upvalue(UpValue::Closed(env)));
        for _ in 1..proto.upvalues.len() {
            upvals.push(self.heap.alloc_upvalue(UpValue::Closed(TValue::nil())));
        }
        let main = self.heap.alloc_closure(root, upvals);
        self.main = Some(TValue::from_closure(main));
    }

    fn register_proto(&mut self, proto: &Proto) -> usize {
        let idx = self.protos.len();
        let mut flat = proto.clone();
        // Children live as their own registry entries; the stored copy
        // does not duplicate the subtree.
        flat.protos = Vec::new();
        self.protos.push(flat);
        self.proto_children.push(Vec::new());
        let children: Vec<usize> = proto
            .protos
            .iter()
            .map(|child| self.register_proto(child))
            .collect();
        self.proto_children[idx] = children;
        idx
    }

    /// Execute the main chunk to completion. Returns its results, or the
    /// error that escaped every frame.
    pub fn run(&mut self) -> Result<Vec<TValue>, VmError> {
        let main = self.main.ok_or_else(|| {
            VmError::Structural("no main chunk loaded".into())
        })?;
        let closure_idx = main
            .as_closure_idx()
            .ok_or_else(|| VmError::Structural("main chunk is not a closure".into()))?;
        let proto_idx = self.heap.closure(closure_idx).proto;
        let max_stack = self.protos[proto_idx].max_stack_size as usize;

        let base = 1;
        self.ensure_stack(base + max_stack)?;
        self.stack[0] = main;
        for slot in &mut self.stack[base..base + max_stack] {
            *slot = TValue::nil();
        }
        self.stack_top = base + max_stack;

        let mut ci = CallInfo::new(base, proto_idx);
        ci.closure = Some(closure_idx);
        ci.func_slot = 0;
        self.call_stack.push(ci);

        dispatch::execute_until(self, 0, true)
    }

    /// Protected call boundary: call any callable with `args`, catching
    /// errors at this frame depth and returning them to the host.
    pub fn call(&mut self, func: TValue, args: &[TValue]) -> Result<Vec<TValue>, VmError> {
        dispatch::call_value(self, func, args)
    }

    /// The globals table, once a chunk is loaded.
    pub fn globals(&self) -> Option<HeapIdx<Table>> {
        self.globals
    }

    pub fn main_closure(&self) -> Option<TValue> {
        self.main
    }

    // ---- Tracing ----

    /// Toggle the per-instruction disassembly trace.
    pub fn set_trace(&mut self, on: bool) {
        self.trace_enabled = on;
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// Route trace lines to a host sink instead of the `tracing` target.
    pub fn set_trace_sink(&mut self, sink: Box<dyn FnMut(&str)>) {
        self.trace_sink = Some(sink);
    }

    pub(crate) fn trace_emit(&mut self, line: &str) {
        match &mut self.trace_sink {
            Some(sink) => sink(line),
            None => tracing::trace!(target: "nocta_vm::dispatch", "{line}"),
        }
    }

    // ---- Stack management ----

    /// Grow the operand stack to hold `needed` slots. Absolute indexing
    /// keeps every outstanding reference valid across growth.
    pub fn ensure_stack(&mut self, needed: usize) -> Result<(), VmError> {
        if needed > self.stack_limit {
            return Err(VmError::Resource("stack overflow".into()));
        }
        if needed > self.stack.len() {
            let target = (self.stack.len() * 2).clamp(needed, self.stack_limit.max(needed));
            self.stack.resize(target.max(needed), TValue::nil());
        }
        Ok(())
    }

    /// Nil out `[from, to)` so stale slots do not pin heap objects.
    pub(crate) fn clear_stack_range(&mut self, from: usize, to: usize) {
        let to = to.min(self.stack.len());
        for slot in &mut self.stack[from.min(to)..to] {
            *slot = TValue::nil();
        }
    }

    // ---- Upvalue registry ----

    /// Find the open upvalue at an absolute stack index, creating it if
    /// none exists. Two closures over the same local share one cell.
    pub fn find_or_create_open_upvalue(&mut self, stack_idx: usize) -> HeapIdx<UpValue> {
        let pos = self
            .open_upvalues
            .partition_point(|&(idx, _)| idx < stack_idx);
        if let Some(&(idx, handle)) = self.open_upvalues.get(pos) {
            if idx == stack_idx {
                return handle;
            }
        }
        let handle = self.heap.alloc_upvalue(UpValue::Open(stack_idx));
        self.open_upvalues.insert(pos, (stack_idx, handle));
        handle
    }

    /// Close every open upvalue at or above `level`: snapshot the stack
    /// slot into the cell and drop it from the registry. The list is
    /// sorted ascending, so this consumes a suffix.
    pub fn close_upvalues(&mut self, level: usize) {
        while let Some(&(idx, handle)) = self.open_upvalues.last() {
            if idx < level {
                break;
            }
            let snapshot = self.stack[idx];
            *self.heap.upvalue_mut(handle) = UpValue::Closed(snapshot);
            self.open_upvalues.pop();
        }
    }

    pub fn upvalue_get(&self, handle: HeapIdx<UpValue>) -> TValue {
        match *self.heap.upvalue(handle) {
            UpValue::Open(idx) => self.stack[idx],
            UpValue::Closed(v) => v,
        }
    }

    pub fn upvalue_set(&mut self, handle: HeapIdx<UpValue>, value: TValue) {
        match *self.heap.upvalue(handle) {
            UpValue::Open(idx) => self.stack[idx] = value,
            UpValue::Closed(_) => *self.heap.upvalue_mut(handle) = UpValue::Closed(value),
        }
    }

    // ---- Natives and values ----

    /// Register a native function; binds it into the globals table when a
    /// chunk is loaded, and returns its value either way.
    pub fn register_native(&mut self, name: &'static str, func: NativeFn) -> TValue {
        let idx = self.natives.len() as u32;
        self.natives.push(NativeFunction { func, name });
        let val = TValue::from_native_index(idx);
        if let Some(globals) = self.globals {
            let sid = self.strings.intern(name.as_bytes());
            self.heap
                .table_mut(globals)
                .raw_set_str(sid, val, &self.strings);
        }
        val
    }

    /// Build a string value in this VM's interner.
    pub fn new_string(&mut self, bytes: &[u8]) -> TValue {
        TValue::from_string_id(self.strings.intern_or_create(bytes))
    }

    /// Build an empty table value.
    pub fn new_table(&mut self) -> TValue {
        TValue::from_table(self.heap.alloc_table(0, 0))
    }

    /// Human-readable rendering, as `print` shows values.
    pub fn format_value(&self, val: TValue) -> String {
        if val.is_nil() {
            "nil".to_string()
        } else if let Some(b) = val.as_bool() {
            b.to_string()
        } else if let Some(i) = val.as_full_integer(&self.heap) {
            i.to_string()
        } else if let Some(f) = val.as_float() {
            crate::coerce::format_float(f)
        } else if let Some(sid) = val.as_string_id() {
            String::from_utf8_lossy(self.strings.get_bytes(sid)).into_owned()
        } else if val.is_table() {
            format!("table: {:#x}", val.heap_index().unwrap_or(0))
        } else if val.is_function() {
            format!("function: {:#x}", val.heap_index().unwrap_or(0))
        } else {
            format!("{val:?}")
        }
    }

    // ---- Collection ----

    /// Explicit mark-sweep over the heap. Roots: the live operand stack,
    /// every frame's closure, the open-upvalue registry, the globals
    /// table, and the main closure. Runs only when the host calls it, so
    /// values held in native locals are never swept mid-operation as long
    /// as they are also reachable from a root.
    pub fn collect(&mut self) -> usize {
        self.heap.begin_mark();
        for i in 0..self.stack_top.min(self.stack.len()) {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for ci in &self.call_stack {
            if let Some(c) = ci.closure {
                self.heap.mark_closure_idx(c);
            }
        }
        for &(_, handle) in &self.open_upvalues {
            self.heap.mark_upvalue_idx(handle);
        }
        if let Some(g) = self.globals {
            self.heap.mark_table_idx(g);
        }
        if let Some(m) = self.main {
            self.heap.mark_value(m);
        }
        self.heap.propagate_marks();
        let swept = self.heap.sweep();
        if swept > 0 {
            tracing::debug!(target: "nocta_vm::heap", swept, "collection finished");
        }
        swept
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
