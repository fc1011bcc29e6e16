use ast::Span;
use object::Value;

use crate::completion::{Completion, RuntimeError};
use crate::{EvalResult, Vm};

/// Fixnums are 62-bit; arithmetic past that range is an error rather
/// than a silent wrap.
fn fits_fixnum(n: i64) -> bool {
    (-(1i64 << 61)..(1i64 << 61)).contains(&n)
}

fn want_int(
    vm: &Vm,
    selector: &str,
    value: Value,
    index: usize,
    span: Span,
) -> Result<i64, Completion> {
    if value.is_fixnum() {
        // SAFETY: just checked.
        Ok(unsafe { value.to_i64() })
    } else {
        let position = if index == 0 {
            "the receiver".to_string()
        } else {
            format!("argument {index}")
        };
        Err(Completion::Error(RuntimeError::new(
            format!("{selector}: expected integer for {position}"),
            vm.current_file(),
            span,
        )))
    }
}

fn int2(
    vm: &Vm,
    selector: &str,
    receiver: Value,
    args: &[Value],
    span: Span,
) -> Result<(i64, i64), Completion> {
    let a = want_int(vm, selector, receiver, 0, span)?;
    let b = want_int(vm, selector, args[0], 1, span)?;
    Ok((a, b))
}

fn arith(
    vm: &Vm,
    selector: &str,
    span: Span,
    result: Option<i64>,
) -> Completion {
    match result {
        Some(n) if fits_fixnum(n) => Completion::Normal(Value::from_i64(n)),
        _ => Completion::Error(RuntimeError::new(
            format!("{selector}: integer overflow"),
            vm.current_file(),
            span,
        )),
    }
}

fn boolean(vm: &Vm, b: bool) -> Completion {
    Completion::Normal(if b {
        vm.world.well_known.true_obj
    } else {
        vm.world.well_known.false_obj
    })
}

pub fn int_add(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntAdd:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(arith(vm, "_IntAdd:", span, a.checked_add(b)))
}

pub fn int_sub(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntSub:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(arith(vm, "_IntSub:", span, a.checked_sub(b)))
}

pub fn int_mul(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntMul:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(arith(vm, "_IntMul:", span, a.checked_mul(b)))
}

pub fn int_div(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntDiv:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    if b == 0 {
        return Ok(Completion::Error(RuntimeError::new(
            "_IntDiv:: division by zero",
            vm.current_file(),
            span,
        )));
    }
    Ok(arith(vm, "_IntDiv:", span, a.checked_div(b)))
}

pub fn int_mod(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntMod:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    if b == 0 {
        return Ok(Completion::Error(RuntimeError::new(
            "_IntMod:: division by zero",
            vm.current_file(),
            span,
        )));
    }
    Ok(arith(vm, "_IntMod:", span, a.checked_rem(b)))
}

pub fn int_neg(vm: &mut Vm, recv: Value, _args: &[Value], span: Span) -> EvalResult {
    let a = match want_int(vm, "_IntNeg", recv, 0, span) {
        Ok(n) => n,
        Err(c) => return Ok(c),
    };
    Ok(arith(vm, "_IntNeg", span, a.checked_neg()))
}

pub fn int_eq(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntEq:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a == b))
}

pub fn int_ne(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntNe:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a != b))
}

pub fn int_lt(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntLt:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a < b))
}

pub fn int_le(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntLe:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a <= b))
}

pub fn int_gt(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntGt:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a > b))
}

pub fn int_ge(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match int2(vm, "_IntGe:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a >= b))
}

pub fn int_as_float(
    vm: &mut Vm,
    recv: Value,
    _args: &[Value],
    span: Span,
) -> EvalResult {
    let a = match want_int(vm, "_IntAsFloat", recv, 0, span) {
        Ok(n) => n,
        Err(c) => return Ok(c),
    };
    Ok(Completion::Normal(Value::from_f64(a as f64)))
}
