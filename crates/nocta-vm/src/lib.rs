//! nocta virtual machine: register-based bytecode interpreter.
//!
//! The host hands [`vm::Vm::load_main`] a resolved prototype graph (plus
//! the interner its constants reference), then drives execution with
//! [`vm::Vm::run`] or the protected [`vm::Vm::call`].

pub mod arith;
pub mod builtins;
pub mod callinfo;
pub mod coerce;
pub mod compare;
pub mod debug;
pub mod dispatch;
pub mod error;
pub mod metamethod;
pub mod vm;

pub use error::VmError;
pub use vm::Vm;
