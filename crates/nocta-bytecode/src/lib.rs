//! nocta bytecode: the instruction set, encoding, and function prototypes.
//!
//! This crate defines the interface between the VM and whatever front end
//! produces code for it. The front end itself (lexer, parser, code
//! generator) is a separate project; tests and hosts assemble [`proto::Proto`]
//! values directly.

pub mod disasm;
pub mod opcode;
pub mod proto;
