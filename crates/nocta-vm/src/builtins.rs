//! The demonstrative base library: `print`, `assert`, and the error-raise
//! primitive `error`.

use crate::error::VmError;
use crate::vm::Vm;
use nocta_core::value::TValue;

/// Bind the base natives into the globals table.
pub fn install(vm: &mut Vm) {
    vm.register_native("print", native_print);
    vm.register_native("assert", native_assert);
    vm.register_native("error", native_error);
}

fn native_print(vm: &mut Vm, base: usize, nargs: usize) -> Result<usize, VmError> {
    let mut line = String::new();
    for i in 0..nargs {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&vm.format_value(vm.stack[base + i]));
    }
    println!("{line}");
    Ok(0)
}

/// `assert(v, message?)`: raises when `v` is falsy, otherwise returns all
/// its arguments unchanged.
fn native_assert(vm: &mut Vm, base: usize, nargs: usize) -> Result<usize, VmError> {
    if nargs == 0 {
        let msg = vm.new_string(b"bad argument #1 to 'assert' (value expected)");
        return Err(VmError::Value(msg));
    }
    let v = vm.stack[base];
    if v.is_falsy() {
        let msg = if nargs >= 2 {
            vm.stack[base + 1]
        } else {
            vm.new_string(b"assertion failed!")
        };
        return Err(VmError::Value(msg));
    }
    // arguments are already in result position
    Ok(nargs)
}

/// `error(v)`: raise any value.
fn native_error(vm: &mut Vm, base: usize, nargs: usize) -> Result<usize, VmError> {
    let v = if nargs > 0 {
        vm.stack[base]
    } else {
        TValue::nil()
    };
    Err(VmError::Value(v))
}
