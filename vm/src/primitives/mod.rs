use std::collections::HashMap;

use ast::Span;
use ::object::Value;

use crate::{EvalResult, Vm};

pub mod bytearray;
pub mod fixnum;
pub mod float;
pub mod object;

/// A built-in function: receives the VM, the receiver, the argument
/// slice, and the call-site span. May allocate — and must then refresh
/// any raw pointers taken before the allocation, rooting what it needs
/// through tracked references.
pub type PrimitiveFn = fn(&mut Vm, Value, &[Value], Span) -> EvalResult;

#[derive(Clone, Copy)]
pub struct PrimitiveDesc {
    /// The reserved `_`-selector this primitive answers to.
    pub name: &'static str,
    pub arity: u8,
    pub func: PrimitiveFn,
}

impl PrimitiveDesc {
    pub const fn new(name: &'static str, arity: u8, func: PrimitiveFn) -> Self {
        Self { name, arity, func }
    }
}

pub fn default_primitives() -> Vec<PrimitiveDesc> {
    vec![
        PrimitiveDesc::new("_IntAdd:", 1, fixnum::int_add),
        PrimitiveDesc::new("_IntSub:", 1, fixnum::int_sub),
        PrimitiveDesc::new("_IntMul:", 1, fixnum::int_mul),
        PrimitiveDesc::new("_IntDiv:", 1, fixnum::int_div),
        PrimitiveDesc::new("_IntMod:", 1, fixnum::int_mod),
        PrimitiveDesc::new("_IntNeg", 0, fixnum::int_neg),
        PrimitiveDesc::new("_IntEq:", 1, fixnum::int_eq),
        PrimitiveDesc::new("_IntNe:", 1, fixnum::int_ne),
        PrimitiveDesc::new("_IntLt:", 1, fixnum::int_lt),
        PrimitiveDesc::new("_IntLe:", 1, fixnum::int_le),
        PrimitiveDesc::new("_IntGt:", 1, fixnum::int_gt),
        PrimitiveDesc::new("_IntGe:", 1, fixnum::int_ge),
        PrimitiveDesc::new("_IntAsFloat", 0, fixnum::int_as_float),
        PrimitiveDesc::new("_FloatAdd:", 1, float::float_add),
        PrimitiveDesc::new("_FloatSub:", 1, float::float_sub),
        PrimitiveDesc::new("_FloatMul:", 1, float::float_mul),
        PrimitiveDesc::new("_FloatDiv:", 1, float::float_div),
        PrimitiveDesc::new("_FloatNeg", 0, float::float_neg),
        PrimitiveDesc::new("_FloatSqrt", 0, float::float_sqrt),
        PrimitiveDesc::new("_FloatEq:", 1, float::float_eq),
        PrimitiveDesc::new("_FloatLt:", 1, float::float_lt),
        PrimitiveDesc::new("_FloatLe:", 1, float::float_le),
        PrimitiveDesc::new("_FloatGt:", 1, float::float_gt),
        PrimitiveDesc::new("_FloatGe:", 1, float::float_ge),
        PrimitiveDesc::new("_Print", 0, object::print),
        PrimitiveDesc::new("_PrintLine", 0, object::print_line),
        PrimitiveDesc::new("_Identical:", 1, object::identical),
        PrimitiveDesc::new("_AddSlots:", 1, object::add_slots),
        PrimitiveDesc::new("_CurrentActivation", 0, object::current_activation),
        PrimitiveDesc::new("_BytesSize", 0, bytearray::bytes_size),
        PrimitiveDesc::new("_BytesConcat:", 1, bytearray::bytes_concat),
    ]
}

/// Selector → registry index, built once at startup.
pub fn registry_index(
    primitives: &[PrimitiveDesc],
) -> HashMap<&'static str, usize, ahash::RandomState> {
    primitives
        .iter()
        .enumerate()
        .map(|(index, desc)| (desc.name, index))
        .collect()
}
