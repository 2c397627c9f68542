//! Function prototypes: immutable compiled code plus debug info.

use crate::opcode::Instruction;
use nocta_core::string::StringId;

/// Header constants reserved for a future serialized chunk format. The
/// core neither reads nor writes files.
pub const CHUNK_MAGIC: u32 = 0x1C4C7561;
pub const CHUNK_VERSION: u8 = 0x10;

/// A constant-pool entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(StringId),
}

/// How a CLOSURE instruction finds one captured variable.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    /// Variable name, for diagnostics.
    pub name: Option<StringId>,
    /// True when the variable lives in the enclosing function's registers;
    /// false when it is one of the enclosing closure's own upvalues.
    pub in_stack: bool,
    /// Register index or enclosing-upvalue index, per `in_stack`.
    pub index: u8,
}

/// Debug interval for one local variable.
#[derive(Clone, Debug)]
pub struct LocalVar {
    pub name: StringId,
    /// First pc where the variable is live.
    pub start_pc: u32,
    /// First pc where the variable is dead.
    pub end_pc: u32,
}

/// Absolute line anchor for pcs whose delta does not fit in i8.
#[derive(Clone, Debug)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

/// An immutable compiled function body.
#[derive(Clone, Debug, Default)]
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Nested function bodies, indexed by CLOSURE's Bx.
    pub protos: Vec<Proto>,
    pub upvalues: Vec<UpvalDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    /// Registers this function needs; frames reserve exactly this many.
    pub max_stack_size: u8,
    /// Source name for error messages.
    pub source: Option<StringId>,

    // Debug info: per-instruction line deltas, with absolute anchors where
    // a delta overflows.
    pub line_info: Vec<i8>,
    pub abs_line_info: Vec<AbsLineInfo>,
    pub local_vars: Vec<LocalVar>,

    /// Line of the most recently emitted instruction.
    current_line: u32,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            max_stack_size: 2,
            ..Default::default()
        }
    }

    /// Append an instruction attributed to a source line; returns its pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        let pc = self.code.len();
        self.code.push(inst);
        let delta = line as i64 - self.current_line as i64;
        if let Ok(d) = i8::try_from(delta) {
            self.line_info.push(d);
        } else {
            self.line_info.push(0);
            self.abs_line_info.push(AbsLineInfo {
                pc: pc as u32,
                line,
            });
        }
        self.current_line = line;
        pc
    }

    /// Add a constant, reusing an existing equal entry.
    pub fn add_constant(&mut self, k: Constant) -> usize {
        for (i, existing) in self.constants.iter().enumerate() {
            if constants_equal(existing, &k) {
                return i;
            }
        }
        self.constants.push(k);
        self.constants.len() - 1
    }

    /// Source line of the instruction at `pc`, or 0 when unknown.
    pub fn line_for(&self, pc: usize) -> u32 {
        if pc >= self.line_info.len() {
            return 0;
        }
        // Anchors are sorted by pc; the closest one at or before pc gives
        // an absolute start, and no later anchor falls in the delta range.
        let (start, mut line) = match self
            .abs_line_info
            .iter()
            .rev()
            .find(|a| (a.pc as usize) <= pc)
        {
            Some(a) => (a.pc as usize + 1, a.line as i64),
            None => (0, 0),
        };
        for d in &self.line_info[start..pc + 1] {
            line += *d as i64;
        }
        line.max(0) as u32
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Mutable instruction access, for front-end backpatching.
    pub fn code_mut(&mut self, pc: usize) -> &mut Instruction {
        &mut self.code[pc]
    }
}

/// Constant-pool equality: floats compare by bits so a NaN constant still
/// deduplicates against itself.
fn constants_equal(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Nil, Constant::Nil) => true,
        (Constant::Boolean(x), Constant::Boolean(y)) => x == y,
        (Constant::Integer(x), Constant::Integer(y)) => x == y,
        (Constant::Float(x), Constant::Float(y)) => x.to_bits() == y.to_bits(),
        (Constant::String(x), Constant::String(y)) => x == y,
        _ => false,
    }
}
