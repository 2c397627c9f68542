//! Hybrid array + hash table.
//!
//! Integer keys `1..=array.len()` live in a dense array part; everything
//! else lives in a chained-scatter hash part (power-of-two node vector,
//! main position = `hash & mask`, collisions chained through node `next`
//! links, colliding occupants relocated when they are not in their own
//! main position). Rebalancing between the two parts happens in
//! `grow_for`, which bins integer keys by magnitude and picks the largest
//! array size that would be more than half full.

use crate::heap::HeapIdx;
use crate::string::{StringId, StringInterner};
use crate::value::TValue;

/// A normalized hash-part key. Float keys with an integral value have
/// already been converted to `Integer`; NaN and nil never get this far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKey {
    Integer(i64),
    /// Non-integral float, by bit pattern.
    Float(u64),
    Boolean(bool),
    String(StringId),
    /// Any other heap value, keyed by identity (raw handle bits).
    Heap(u64),
}

/// One slot of the hash part. `key == None` means free; free slots carry
/// no chain link.
#[derive(Clone, Debug)]
struct Node {
    key: Option<TableKey>,
    hash: u32,
    value: TValue,
    next: Option<u32>,
}

impl Node {
    fn empty() -> Node {
        Node {
            key: None,
            hash: 0,
            value: TValue::nil(),
            next: None,
        }
    }
}

/// Minimum hash-part size after a rebalance that still needs hash slots.
const MIN_HASH_SIZE: usize = 8;

pub struct Table {
    /// Dense part: `array[i]` holds the value for key `i + 1`.
    array: Vec<TValue>,
    /// Chained-scatter part; length is zero or a power of two.
    nodes: Vec<Node>,
    /// Free-node search hint: all slots at `last_free..` are known used.
    last_free: usize,
    pub metatable: Option<HeapIdx<Table>>,
}

impl Table {
    pub fn new() -> Self {
        Table::with_capacity(0, 0)
    }

    /// Pre-sized constructor; the NEWTABLE opcode passes its B/C hints here.
    pub fn with_capacity(array_hint: usize, hash_hint: usize) -> Self {
        let nhash = if hash_hint == 0 {
            0
        } else {
            hash_hint.next_power_of_two().max(MIN_HASH_SIZE)
        };
        Table {
            array: vec![TValue::nil(); array_hint],
            nodes: vec![Node::empty(); nhash],
            last_free: nhash,
            metatable: None,
        }
    }

    // ---- Lookup ----

    /// Raw get: no metamethods. Absent keys read as nil.
    pub fn raw_get(&self, key: TValue, strings: &StringInterner) -> TValue {
        if let Some(i) = int_key_of(key) {
            return self.raw_geti(i);
        }
        match normalize_key(key) {
            Some(tk) => self.hash_get(&tk, key_hash(&tk, strings), Some(strings)),
            None => TValue::nil(),
        }
    }

    /// Integer-key fast path.
    pub fn raw_geti(&self, key: i64) -> TValue {
        if key >= 1 && (key as u64) <= self.array.len() as u64 {
            return self.array[(key - 1) as usize];
        }
        self.hash_get(&TableKey::Integer(key), int_hash(key), None)
    }

    /// String-key fast path (GETFIELD / GETTABUP).
    pub fn raw_get_str(&self, key: StringId, strings: &StringInterner) -> TValue {
        let tk = TableKey::String(key);
        self.hash_get(&tk, strings.get(key).hash(), Some(strings))
    }

    fn hash_get(&self, key: &TableKey, hash: u32, strings: Option<&StringInterner>) -> TValue {
        if self.nodes.is_empty() {
            return TValue::nil();
        }
        let mut pos = self.main_position(hash);
        loop {
            let node = &self.nodes[pos];
            if node_key_matches(node.key.as_ref(), key, strings) {
                return node.value;
            }
            match node.next {
                Some(n) => pos = n as usize,
                None => return TValue::nil(),
            }
        }
    }

    // ---- Mutation ----

    /// Raw set: no metamethods. Nil and NaN keys are rejected; a nil value
    /// deletes the key.
    pub fn raw_set(
        &mut self,
        key: TValue,
        value: TValue,
        strings: &StringInterner,
    ) -> Result<(), &'static str> {
        if key.is_nil() {
            return Err("table index is nil");
        }
        if let Some(f) = key.as_float() {
            if f.is_nan() {
                return Err("table index is NaN");
            }
        }
        if let Some(i) = int_key_of(key) {
            self.raw_seti(i, value);
            return Ok(());
        }
        let tk = normalize_key(key).expect("non-nil non-NaN key normalizes");
        self.hash_set(tk, key_hash(&tk, strings), value, Some(strings));
        Ok(())
    }

    /// Integer-key fast path. Appends at `len+1` extend the array and pull
    /// newly contiguous hash entries in behind them.
    pub fn raw_seti(&mut self, key: i64, value: TValue) {
        if key >= 1 {
            let idx = (key - 1) as u64;
            if idx < self.array.len() as u64 {
                self.array[idx as usize] = value;
                return;
            }
            if idx == self.array.len() as u64 && !value.is_nil() {
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }
        self.hash_set(TableKey::Integer(key), int_hash(key), value, None);
    }

    /// String-key fast path (SETFIELD / SETTABUP).
    pub fn raw_set_str(&mut self, key: StringId, value: TValue, strings: &StringInterner) {
        let tk = TableKey::String(key);
        self.hash_set(tk, strings.get(key).hash(), value, Some(strings));
    }

    // ---- Length ----

    /// A border: some `n >= 0` with `t[n]` non-nil and `t[n+1]` nil. The
    /// array part alone answers this; appends migrate contiguous hash keys
    /// into the array, so `t[array.len()+1]` is never hash-resident.
    pub fn length(&self) -> i64 {
        if self.array.is_empty() {
            return 0;
        }
        if !self.array[self.array.len() - 1].is_nil() {
            return self.array.len() as i64;
        }
        // Sparse array: binary-search a non-nil/nil boundary.
        let mut lo = 0usize;
        let mut hi = self.array.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    // ---- Traversal (collector, diagnostics) ----

    pub fn array_values(&self) -> &[TValue] {
        &self.array
    }

    pub fn node_entries(&self) -> impl Iterator<Item = (&TableKey, &TValue)> {
        self.nodes
            .iter()
            .filter_map(|n| n.key.as_ref().map(|k| (k, &n.value)))
    }

    /// Live entry count across both parts.
    pub fn entry_count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count()
            + self.nodes.iter().filter(|n| n.key.is_some()).count()
    }

    pub fn array_capacity(&self) -> usize {
        self.array.len()
    }

    pub fn hash_capacity(&self) -> usize {
        self.nodes.len()
    }

    // ---- Hash part internals ----

    fn main_position(&self, hash: u32) -> usize {
        debug_assert!(self.nodes.len().is_power_of_two());
        hash as usize & (self.nodes.len() - 1)
    }

    fn hash_set(
        &mut self,
        key: TableKey,
        hash: u32,
        value: TValue,
        strings: Option<&StringInterner>,
    ) {
        if self.nodes.is_empty() {
            if value.is_nil() {
                return;
            }
            self.insert_new(key, hash, value);
            return;
        }

        // Walk the chain from the main position, tracking the predecessor
        // so deletion can unlink.
        let mut prev: Option<usize> = None;
        let mut pos = self.main_position(hash);
        loop {
            if node_key_matches(self.nodes[pos].key.as_ref(), &key, strings) {
                if value.is_nil() {
                    self.unlink(pos, prev);
                } else {
                    self.nodes[pos].value = value;
                }
                return;
            }
            match self.nodes[pos].next {
                Some(n) => {
                    prev = Some(pos);
                    pos = n as usize;
                }
                None => break,
            }
        }

        if value.is_nil() {
            return; // deleting an absent key
        }
        self.insert_new(key, hash, value);
    }

    /// Remove the node at `pos`. A chained node is unlinked from its
    /// predecessor; a head node absorbs its successor instead so the chain
    /// stays rooted at the main position.
    fn unlink(&mut self, pos: usize, prev: Option<usize>) {
        match prev {
            Some(p) => {
                self.nodes[p].next = self.nodes[pos].next;
                self.nodes[pos] = Node::empty();
            }
            None => match self.nodes[pos].next {
                Some(succ) => {
                    let succ = succ as usize;
                    self.nodes[pos] = self.nodes[succ].clone();
                    self.nodes[succ] = Node::empty();
                }
                None => {
                    self.nodes[pos] = Node::empty();
                }
            },
        }
    }

    /// Insert a key known to be absent from the hash part. Rebalances and
    /// retries when no free node is left; the retry may land in the array
    /// part if the rebalance grew it over this key.
    fn insert_new(&mut self, key: TableKey, hash: u32, value: TValue) {
        if !self.nodes.is_empty() {
            let mp = self.main_position(hash);
            if self.nodes[mp].key.is_none() {
                self.nodes[mp] = Node {
                    key: Some(key),
                    hash,
                    value,
                    next: None,
                };
                return;
            }
            if let Some(free) = self.free_node() {
                let occupant_mp = self.main_position(self.nodes[mp].hash);
                if occupant_mp != mp {
                    // The occupant is a displaced member of another chain:
                    // move it to the free node and claim its slot.
                    let mut walk = occupant_mp;
                    while self.nodes[walk].next != Some(mp as u32) {
                        walk = self.nodes[walk]
                            .next
                            .expect("displaced node reachable from its main position")
                            as usize;
                    }
                    self.nodes[free] = self.nodes[mp].clone();
                    self.nodes[walk].next = Some(free as u32);
                    self.nodes[mp] = Node {
                        key: Some(key),
                        hash,
                        value,
                        next: None,
                    };
                } else {
                    // The occupant owns this slot: chain in right after it.
                    self.nodes[free] = Node {
                        key: Some(key),
                        hash,
                        value,
                        next: self.nodes[mp].next,
                    };
                    self.nodes[mp].next = Some(free as u32);
                }
                return;
            }
        }

        // No space: rebalance counting the pending key, then retry.
        self.grow_for(&key);
        if let TableKey::Integer(i) = key {
            if i >= 1 && (i as u64) <= self.array.len() as u64 {
                self.array[(i - 1) as usize] = value;
                return;
            }
            if i >= 1 && i as u64 == self.array.len() as u64 + 1 {
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }
        self.insert_new(key, hash, value);
    }

    fn free_node(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if self.nodes[self.last_free].key.is_none() {
                return Some(self.last_free);
            }
        }
        None
    }

    /// Pull `array.len()+1, +2, ...` out of the hash part after an append.
    fn migrate_from_hash(&mut self) {
        loop {
            let next_key = self.array.len() as i64 + 1;
            let tk = TableKey::Integer(next_key);
            let hash = int_hash(next_key);
            let v = self.hash_get(&tk, hash, None);
            if v.is_nil() {
                break;
            }
            self.hash_set(tk, hash, TValue::nil(), None);
            self.array.push(v);
        }
    }

    /// Rebalance both parts, making room for `pending` (a key about to be
    /// inserted).
    fn grow_for(&mut self, pending: &TableKey) {
        // Gather live entries.
        let mut entries: Vec<(TableKey, u32, TValue)> = Vec::new();
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                let k = (i + 1) as i64;
                entries.push((TableKey::Integer(k), int_hash(k), *v));
            }
        }
        for n in &self.nodes {
            if let Some(k) = n.key {
                entries.push((k, n.hash, n.value));
            }
        }

        // Bin positive integer keys by ceil(log2 k): bin b holds keys in
        // (2^(b-1), 2^b].
        let mut bins = [0usize; 64];
        let mut int_total = 0usize;
        {
            let mut count_int = |k: i64| {
                if k >= 1 {
                    bins[(64 - ((k - 1) as u64).leading_zeros()) as usize] += 1;
                    int_total += 1;
                }
            };
            for (k, _, _) in &entries {
                if let TableKey::Integer(i) = k {
                    count_int(*i);
                }
            }
            if let TableKey::Integer(i) = pending {
                count_int(*i);
            }
        }

        // Largest 2^i more than half occupied by integer keys <= 2^i.
        let mut new_array = 0usize;
        let mut in_array = 0usize;
        let mut acc = 0usize;
        let mut twotoi = 1usize;
        for bin in bins.iter().take(48) {
            if twotoi / 2 >= int_total {
                break;
            }
            acc += bin;
            if acc > twotoi / 2 {
                new_array = twotoi;
                in_array = acc;
            }
            twotoi <<= 1;
        }

        // Everything else, pending included, goes to the hash part.
        let remaining = entries.len() + 1 - in_array;
        let new_hash = if remaining == 0 {
            0
        } else {
            remaining.next_power_of_two().max(MIN_HASH_SIZE)
        };

        self.array = vec![TValue::nil(); new_array];
        self.nodes = vec![Node::empty(); new_hash];
        self.last_free = new_hash;

        for (k, h, v) in entries {
            match k {
                TableKey::Integer(i) if i >= 1 && (i as u64) <= new_array as u64 => {
                    self.array[(i - 1) as usize] = v;
                }
                _ => self.insert_new(k, h, v),
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.nodes.len()
        )
    }
}

fn node_key_matches(
    stored: Option<&TableKey>,
    probe: &TableKey,
    strings: Option<&StringInterner>,
) -> bool {
    match stored {
        Some(TableKey::String(a)) => match probe {
            TableKey::String(b) => match strings {
                // Content comparison covers non-interned long strings.
                Some(s) => s.bytes_eq(*a, *b),
                None => a == b,
            },
            _ => false,
        },
        Some(k) => k == probe,
        None => false,
    }
}

/// Integer view of a key value: inline integers directly, floats when they
/// are integral and in i64 range. (Boxed integers are normalized by the VM
/// before reaching the table.)
fn int_key_of(key: TValue) -> Option<i64> {
    if let Some(i) = key.as_integer() {
        return Some(i);
    }
    if let Some(f) = key.as_float() {
        if f.floor() == f && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
            return Some(f as i64);
        }
    }
    None
}

/// Normalize a non-nil, non-NaN value into a hash key.
fn normalize_key(key: TValue) -> Option<TableKey> {
    if key.is_nil() {
        return None;
    }
    if let Some(i) = int_key_of(key) {
        return Some(TableKey::Integer(i));
    }
    if let Some(f) = key.as_float() {
        if f.is_nan() {
            return None;
        }
        return Some(TableKey::Float(f.to_bits()));
    }
    if let Some(b) = key.as_bool() {
        return Some(TableKey::Boolean(b));
    }
    if let Some(sid) = key.as_string_id() {
        return Some(TableKey::String(sid));
    }
    if key.is_heap() || key.is_light_userdata() {
        return Some(TableKey::Heap(key.raw_bits()));
    }
    None
}

fn int_hash(i: i64) -> u32 {
    // Fibonacci scramble so sequential keys spread across the node vector.
    let h = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h >> 32) as u32
}

fn key_hash(key: &TableKey, strings: &StringInterner) -> u32 {
    match key {
        TableKey::Integer(i) => int_hash(*i),
        TableKey::Float(bits) => int_hash(*bits as i64),
        TableKey::Boolean(b) => *b as u32 + 1,
        TableKey::String(sid) => strings.get(*sid).hash(),
        TableKey::Heap(bits) => int_hash(*bits as i64),
    }
}
