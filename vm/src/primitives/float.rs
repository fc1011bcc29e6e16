use ast::Span;
use object::Value;

use crate::completion::{Completion, RuntimeError};
use crate::{EvalResult, Vm};

fn want_float(
    vm: &Vm,
    selector: &str,
    value: Value,
    index: usize,
    span: Span,
) -> Result<f64, Completion> {
    if value.is_float() {
        // SAFETY: just checked.
        Ok(unsafe { value.to_f64() })
    } else {
        let position = if index == 0 {
            "the receiver".to_string()
        } else {
            format!("argument {index}")
        };
        Err(Completion::Error(RuntimeError::new(
            format!("{selector}: expected float for {position}"),
            vm.current_file(),
            span,
        )))
    }
}

fn float2(
    vm: &Vm,
    selector: &str,
    receiver: Value,
    args: &[Value],
    span: Span,
) -> Result<(f64, f64), Completion> {
    let a = want_float(vm, selector, receiver, 0, span)?;
    let b = want_float(vm, selector, args[0], 1, span)?;
    Ok((a, b))
}

fn boolean(vm: &Vm, b: bool) -> Completion {
    Completion::Normal(if b {
        vm.world.well_known.true_obj
    } else {
        vm.world.well_known.false_obj
    })
}

pub fn float_add(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatAdd:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(Completion::Normal(Value::from_f64(a + b)))
}

pub fn float_sub(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatSub:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(Completion::Normal(Value::from_f64(a - b)))
}

pub fn float_mul(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatMul:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(Completion::Normal(Value::from_f64(a * b)))
}

pub fn float_div(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatDiv:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(Completion::Normal(Value::from_f64(a / b)))
}

pub fn float_neg(vm: &mut Vm, recv: Value, _args: &[Value], span: Span) -> EvalResult {
    let a = match want_float(vm, "_FloatNeg", recv, 0, span) {
        Ok(f) => f,
        Err(c) => return Ok(c),
    };
    Ok(Completion::Normal(Value::from_f64(-a)))
}

pub fn float_sqrt(vm: &mut Vm, recv: Value, _args: &[Value], span: Span) -> EvalResult {
    let a = match want_float(vm, "_FloatSqrt", recv, 0, span) {
        Ok(f) => f,
        Err(c) => return Ok(c),
    };
    Ok(Completion::Normal(Value::from_f64(a.sqrt())))
}

pub fn float_eq(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatEq:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a == b))
}

pub fn float_lt(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatLt:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a < b))
}

pub fn float_le(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatLe:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a <= b))
}

pub fn float_gt(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatGt:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a > b))
}

pub fn float_ge(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let (a, b) = match float2(vm, "_FloatGe:", recv, args, span) {
        Ok(pair) => pair,
        Err(c) => return Ok(c),
    };
    Ok(boolean(vm, a >= b))
}
