use ast::Span;
use object::{
    byte_array_allocation_size, ByteArray, Header, ObjectType, Value,
};

use crate::alloc::alloc_byte_array;
use crate::completion::{Completion, RuntimeError};
use crate::{EvalResult, Vm};

fn want_bytes(
    vm: &Vm,
    selector: &str,
    value: Value,
    index: usize,
    span: Span,
) -> Result<(), Completion> {
    let ok = value.is_ref()
        // SAFETY: live reference.
        && unsafe { value.as_ref::<Header>() }.object_type()
            == ObjectType::ByteArray;
    if ok {
        Ok(())
    } else {
        let position = if index == 0 {
            "the receiver".to_string()
        } else {
            format!("argument {index}")
        };
        Err(Completion::Error(RuntimeError::new(
            format!("{selector}: expected a byte array for {position}"),
            vm.current_file(),
            span,
        )))
    }
}

pub fn bytes_size(vm: &mut Vm, recv: Value, _args: &[Value], span: Span) -> EvalResult {
    if let Err(c) = want_bytes(vm, "_BytesSize", recv, 0, span) {
        return Ok(c);
    }
    // SAFETY: verified byte array.
    let len = unsafe { recv.as_ref::<ByteArray>() }.len();
    Ok(Completion::Normal(Value::from_i64(len as i64)))
}

pub fn bytes_concat(
    vm: &mut Vm,
    recv: Value,
    args: &[Value],
    span: Span,
) -> EvalResult {
    if let Err(c) = want_bytes(vm, "_BytesConcat:", recv, 0, span) {
        return Ok(c);
    }
    if let Err(c) = want_bytes(vm, "_BytesConcat:", args[0], 1, span) {
        return Ok(c);
    }

    // SAFETY: both verified byte arrays.
    let total_len = unsafe {
        recv.as_ref::<ByteArray>().len() + args[0].as_ref::<ByteArray>().len()
    };

    let recv_handle = vm.heap.track(recv);
    let arg_handle = vm.heap.track(args[0]);
    let Vm { heap, world } = vm;
    if let Err(err) =
        heap.ensure_space(byte_array_allocation_size(total_len), world)
    {
        heap.untrack(arg_handle);
        heap.untrack(recv_handle);
        return Err(err);
    }

    let recv = heap.tracked(&recv_handle);
    let arg = heap.tracked(&arg_handle);
    // SAFETY: re-read after the reservation; the allocation below
    // cannot collect, so the borrowed byte slices stay valid.
    let value = unsafe {
        let mut bytes =
            Vec::with_capacity(total_len);
        bytes.extend_from_slice(recv.as_ref::<ByteArray>().bytes());
        bytes.extend_from_slice(arg.as_ref::<ByteArray>().bytes());
        alloc_byte_array(heap, world.well_known.byte_array_map, &bytes)
    };
    heap.untrack(arg_handle);
    heap.untrack(recv_handle);
    Ok(Completion::Normal(value))
}
