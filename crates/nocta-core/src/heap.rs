//! Arena heap with typed indices and an explicit mark-sweep collector.
//!
//! Every collectable object lives in a per-kind arena (`Vec<Option<T>>`
//! plus a free list). Values reference objects by 44-bit arena index, so
//! nothing holds a raw pointer across a mutation and arenas may grow
//! freely. Collection runs only when the owner asks (`Vm::collect`); there
//! is no allocation-triggered step, so objects held in host locals can
//! never be swept mid-operation.
//!
//! Strings are owned by the interner and are not collected. Native
//! functions live in a VM-side registry and are permanent.

use crate::table::{Table, TableKey};
use crate::value::TValue;
use std::any::Any;
use std::marker::PhantomData;

/// Typed index into one of the heap arenas.
#[derive(Debug)]
pub struct HeapIdx<T>(pub u32, pub PhantomData<T>);

impl<T> HeapIdx<T> {
    pub fn new(raw: u32) -> Self {
        HeapIdx(raw, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl<T> Clone for HeapIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for HeapIdx<T> {}

impl<T> PartialEq for HeapIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for HeapIdx<T> {}

impl<T> std::hash::Hash for HeapIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Heap object kinds, stored in bits 44-46 of a handle payload.
pub const HEAP_KIND_TABLE: u64 = 0;
pub const HEAP_KIND_CLOSURE: u64 = 1;
pub const HEAP_KIND_NATIVE: u64 = 2;
pub const HEAP_KIND_UPVALUE: u64 = 3;
pub const HEAP_KIND_BOXED_INT: u64 = 4;
pub const HEAP_KIND_STRING: u64 = 5;
pub const HEAP_KIND_USERDATA: u64 = 6;

pub const HEAP_KIND_SHIFT: u64 = 44;
pub const HEAP_KIND_MASK: u64 = 0x7;
/// Lower 44 bits of the payload: the arena index.
pub const HEAP_INDEX_MASK: u64 = (1u64 << 44) - 1;

/// A closure: one prototype plus its captured upvalues.
///
/// `proto` indexes the VM's flattened prototype registry; `upvalues` has
/// exactly as many entries as the prototype declares descriptors.
#[derive(Debug)]
pub struct Closure {
    pub proto: usize,
    pub upvalues: Vec<HeapIdx<UpValue>>,
}

/// A two-state upvalue cell. Open points at an absolute operand-stack
/// slot; the open->closed transition snapshots that slot and is one-way.
#[derive(Debug)]
pub enum UpValue {
    Open(usize),
    Closed(TValue),
}

/// Full userdata: an opaque host payload plus an optional metatable.
pub struct UserData {
    pub data: Box<dyn Any>,
    pub metatable: Option<HeapIdx<Table>>,
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "userdata(mt={})", self.metatable.is_some())
    }
}

/// Per-cycle mark state. Mark vectors parallel the arenas; gray lists hold
/// marked-but-untraversed objects.
#[derive(Default)]
struct MarkState {
    tables: Vec<bool>,
    closures: Vec<bool>,
    upvalues: Vec<bool>,
    boxed_ints: Vec<bool>,
    userdata: Vec<bool>,
    gray_tables: Vec<u32>,
    gray_closures: Vec<u32>,
    gray_upvalues: Vec<u32>,
    gray_userdata: Vec<u32>,
}

/// The arena heap.
#[derive(Default)]
pub struct Heap {
    tables: Vec<Option<Table>>,
    tables_free: Vec<u32>,
    closures: Vec<Option<Closure>>,
    closures_free: Vec<u32>,
    upvalues: Vec<Option<UpValue>>,
    upvalues_free: Vec<u32>,
    boxed_ints: Vec<Option<i64>>,
    boxed_ints_free: Vec<u32>,
    userdata: Vec<Option<UserData>>,
    userdata_free: Vec<u32>,
    marks: MarkState,
    /// Rough live-byte estimate, for diagnostics only.
    bytes_estimate: usize,
}

fn arena_alloc<T>(slots: &mut Vec<Option<T>>, free: &mut Vec<u32>, obj: T) -> HeapIdx<T> {
    if let Some(idx) = free.pop() {
        slots[idx as usize] = Some(obj);
        HeapIdx(idx, PhantomData)
    } else {
        let idx = slots.len() as u32;
        slots.push(Some(obj));
        HeapIdx(idx, PhantomData)
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    // ---- Allocation and access ----

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> HeapIdx<Table> {
        self.bytes_estimate += 64 + array_hint * 8 + hash_hint * 24;
        arena_alloc(
            &mut self.tables,
            &mut self.tables_free,
            Table::with_capacity(array_hint, hash_hint),
        )
    }

    pub fn table(&self, idx: HeapIdx<Table>) -> &Table {
        self.tables[idx.0 as usize].as_ref().expect("table was swept")
    }

    pub fn table_mut(&mut self, idx: HeapIdx<Table>) -> &mut Table {
        self.tables[idx.0 as usize].as_mut().expect("table was swept")
    }

    pub fn alloc_closure(&mut self, proto: usize, upvalues: Vec<HeapIdx<UpValue>>) -> HeapIdx<Closure> {
        self.bytes_estimate += 32 + upvalues.len() * 4;
        arena_alloc(
            &mut self.closures,
            &mut self.closures_free,
            Closure { proto, upvalues },
        )
    }

    pub fn closure(&self, idx: HeapIdx<Closure>) -> &Closure {
        self.closures[idx.0 as usize]
            .as_ref()
            .expect("closure was swept")
    }

    pub fn alloc_upvalue(&mut self, upval: UpValue) -> HeapIdx<UpValue> {
        self.bytes_estimate += 16;
        arena_alloc(&mut self.upvalues, &mut self.upvalues_free, upval)
    }

    pub fn upvalue(&self, idx: HeapIdx<UpValue>) -> &UpValue {
        self.upvalues[idx.0 as usize]
            .as_ref()
            .expect("upvalue was swept")
    }

    pub fn upvalue_mut(&mut self, idx: HeapIdx<UpValue>) -> &mut UpValue {
        self.upvalues[idx.0 as usize]
            .as_mut()
            .expect("upvalue was swept")
    }

    pub fn alloc_boxed_int(&mut self, val: i64) -> HeapIdx<i64> {
        self.bytes_estimate += 16;
        arena_alloc(&mut self.boxed_ints, &mut self.boxed_ints_free, val)
    }

    pub fn boxed_int(&self, idx: HeapIdx<i64>) -> i64 {
        self.boxed_ints[idx.0 as usize].expect("boxed int was swept")
    }

    pub fn alloc_userdata(&mut self, data: Box<dyn Any>) -> HeapIdx<UserData> {
        self.bytes_estimate += 48;
        arena_alloc(
            &mut self.userdata,
            &mut self.userdata_free,
            UserData {
                data,
                metatable: None,
            },
        )
    }

    pub fn userdata(&self, idx: HeapIdx<UserData>) -> &UserData {
        self.userdata[idx.0 as usize]
            .as_ref()
            .expect("userdata was swept")
    }

    pub fn userdata_mut(&mut self, idx: HeapIdx<UserData>) -> &mut UserData {
        self.userdata[idx.0 as usize]
            .as_mut()
            .expect("userdata was swept")
    }

    /// Rough live-byte estimate.
    pub fn bytes_estimate(&self) -> usize {
        self.bytes_estimate
    }

    // ---- Mark-sweep ----

    /// Reset mark state for a new cycle.
    pub fn begin_mark(&mut self) {
        let m = &mut self.marks;
        m.tables.clear();
        m.tables.resize(self.tables.len(), false);
        m.closures.clear();
        m.closures.resize(self.closures.len(), false);
        m.upvalues.clear();
        m.upvalues.resize(self.upvalues.len(), false);
        m.boxed_ints.clear();
        m.boxed_ints.resize(self.boxed_ints.len(), false);
        m.userdata.clear();
        m.userdata.resize(self.userdata.len(), false);
        m.gray_tables.clear();
        m.gray_closures.clear();
        m.gray_upvalues.clear();
        m.gray_userdata.clear();
    }

    /// Mark a root value. Non-leaf objects are queued for traversal.
    pub fn mark_value(&mut self, val: TValue) {
        if !val.is_heap() {
            return;
        }
        let (kind, idx) = match (val.heap_kind(), val.heap_index()) {
            (Some(k), Some(i)) => (k, i as usize),
            _ => return,
        };
        let m = &mut self.marks;
        match kind {
            HEAP_KIND_TABLE => {
                if idx < m.tables.len() && !m.tables[idx] {
                    m.tables[idx] = true;
                    m.gray_tables.push(idx as u32);
                }
            }
            HEAP_KIND_CLOSURE => {
                if idx < m.closures.len() && !m.closures[idx] {
                    m.closures[idx] = true;
                    m.gray_closures.push(idx as u32);
                }
            }
            HEAP_KIND_UPVALUE => {
                if idx < m.upvalues.len() && !m.upvalues[idx] {
                    m.upvalues[idx] = true;
                    m.gray_upvalues.push(idx as u32);
                }
            }
            HEAP_KIND_BOXED_INT => {
                if idx < m.boxed_ints.len() {
                    m.boxed_ints[idx] = true;
                }
            }
            HEAP_KIND_USERDATA => {
                if idx < m.userdata.len() && !m.userdata[idx] {
                    m.userdata[idx] = true;
                    m.gray_userdata.push(idx as u32);
                }
            }
            // Strings are interner-owned, natives registry-owned.
            _ => {}
        }
    }

    pub fn mark_table_idx(&mut self, idx: HeapIdx<Table>) {
        self.mark_value(TValue::from_table(idx));
    }

    pub fn mark_closure_idx(&mut self, idx: HeapIdx<Closure>) {
        self.mark_value(TValue::from_closure(idx));
    }

    pub fn mark_upvalue_idx(&mut self, idx: HeapIdx<UpValue>) {
        self.mark_value(TValue::from_upvalue(idx));
    }

    /// Drain the gray lists, marking children, until nothing is gray.
    pub fn propagate_marks(&mut self) {
        loop {
            if let Some(idx) = self.marks.gray_tables.pop() {
                let i = idx as usize;
                let mut children = Vec::new();
                let mut metatable = None;
                if let Some(table) = &self.tables[i] {
                    metatable = table.metatable;
                    for &v in table.array_values() {
                        if v.is_heap() {
                            children.push(v);
                        }
                    }
                    for (key, &v) in table.node_entries() {
                        if v.is_heap() {
                            children.push(v);
                        }
                        if let TableKey::Heap(bits) = key {
                            children.push(TValue::from_raw_bits(*bits));
                        }
                    }
                }
                if let Some(mt) = metatable {
                    self.mark_table_idx(mt);
                }
                for child in children {
                    self.mark_value(child);
                }
                continue;
            }
            if let Some(idx) = self.marks.gray_closures.pop() {
                let upvals = match &self.closures[idx as usize] {
                    Some(c) => c.upvalues.clone(),
                    None => Vec::new(),
                };
                for uv in upvals {
                    self.mark_upvalue_idx(uv);
                }
                continue;
            }
            if let Some(idx) = self.marks.gray_upvalues.pop() {
                // Open upvalues point into the stack, which is a root.
                if let Some(UpValue::Closed(val)) = &self.upvalues[idx as usize] {
                    let v = *val;
                    self.mark_value(v);
                }
                continue;
            }
            if let Some(idx) = self.marks.gray_userdata.pop() {
                let mt = self.userdata[idx as usize].as_ref().and_then(|u| u.metatable);
                if let Some(mt) = mt {
                    self.mark_table_idx(mt);
                }
                continue;
            }
            break;
        }
    }

    /// Free everything unmarked. Returns the number of objects swept.
    pub fn sweep(&mut self) -> usize {
        let mut swept = 0;
        let m = &self.marks;
        for i in 0..self.tables.len() {
            if self.tables[i].is_some() && i < m.tables.len() && !m.tables[i] {
                self.tables[i] = None;
                self.tables_free.push(i as u32);
                swept += 1;
            }
        }
        for i in 0..self.closures.len() {
            if self.closures[i].is_some() && i < m.closures.len() && !m.closures[i] {
                self.closures[i] = None;
                self.closures_free.push(i as u32);
                swept += 1;
            }
        }
        for i in 0..self.upvalues.len() {
            if self.upvalues[i].is_some() && i < m.upvalues.len() && !m.upvalues[i] {
                self.upvalues[i] = None;
                self.upvalues_free.push(i as u32);
                swept += 1;
            }
        }
        for i in 0..self.boxed_ints.len() {
            if self.boxed_ints[i].is_some() && i < m.boxed_ints.len() && !m.boxed_ints[i] {
                self.boxed_ints[i] = None;
                self.boxed_ints_free.push(i as u32);
                swept += 1;
            }
        }
        for i in 0..self.userdata.len() {
            if self.userdata[i].is_some() && i < m.userdata.len() && !m.userdata[i] {
                self.userdata[i] = None;
                self.userdata_free.push(i as u32);
                swept += 1;
            }
        }
        self.bytes_estimate = self.bytes_estimate.saturating_sub(swept * 32);
        swept
    }

    /// Live object count across all arenas (tests and diagnostics).
    pub fn live_objects(&self) -> usize {
        self.tables.iter().flatten().count()
            + self.closures.iter().flatten().count()
            + self.upvalues.iter().flatten().count()
            + self.boxed_ints.iter().flatten().count()
            + self.userdata.iter().flatten().count()
    }
}
