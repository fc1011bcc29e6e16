use std::rc::Rc;

use ast::Span;
use object::{
    map_allocation_size, ActivationObject, ByteArray, Header, Map, MapKind,
    ObjectType, Slot, SlotsObject, Value, NO_PRIMITIVE,
};

use crate::alloc::{alloc_activation_object, alloc_map};
use crate::completion::{Completion, RuntimeError};
use crate::{EvalResult, Vm};

/// Human-readable rendering used by `_Print` and error messages.
pub fn display_value(vm: &Vm, value: Value) -> String {
    if value.is_fixnum() {
        // SAFETY: just checked.
        return unsafe { value.to_i64() }.to_string();
    }
    if value.is_float() {
        // SAFETY: just checked.
        return unsafe { value.to_f64() }.to_string();
    }
    let wk = &vm.world.well_known;
    if value.identical(wk.nil) {
        return "nil".to_string();
    }
    if value.identical(wk.true_obj) {
        return "true".to_string();
    }
    if value.identical(wk.false_obj) {
        return "false".to_string();
    }
    if value.is_ref() {
        // SAFETY: live reference.
        let header: &Header = unsafe { value.as_ref() };
        return match header.object_type() {
            ObjectType::ByteArray => {
                let ba: &ByteArray = unsafe { value.as_ref() };
                String::from_utf8_lossy(unsafe { ba.bytes() }).into_owned()
            }
            ObjectType::Method => "a method".to_string(),
            ObjectType::Block => "a block".to_string(),
            ObjectType::Slots => "an object".to_string(),
            ObjectType::Activation => "an activation".to_string(),
            ObjectType::Map | ObjectType::Forward => "<internal>".to_string(),
        };
    }
    "<marker>".to_string()
}

pub fn print(vm: &mut Vm, recv: Value, _args: &[Value], _span: Span) -> EvalResult {
    print!("{}", display_value(vm, recv));
    Ok(Completion::Normal(recv))
}

pub fn print_line(
    vm: &mut Vm,
    recv: Value,
    _args: &[Value],
    _span: Span,
) -> EvalResult {
    println!("{}", display_value(vm, recv));
    Ok(Completion::Normal(recv))
}

pub fn identical(vm: &mut Vm, recv: Value, args: &[Value], _span: Span) -> EvalResult {
    let result = if recv.identical(args[0]) {
        vm.world.well_known.true_obj
    } else {
        vm.world.well_known.false_obj
    };
    Ok(Completion::Normal(result))
}

/// # Safety
///
/// The slot's name must reference a live byte array.
unsafe fn slot_name_bytes(slot: &Slot) -> &[u8] {
    let name: &ByteArray = slot.name.as_ref();
    name.bytes()
}

/// `receiver _AddSlots: additions` — re-point the receiver at a fresh
/// map extended with the additions' slots. An addition whose name an
/// existing constant slot already carries replaces that slot.
///
/// Only constant (and constant-parent) slots can be added: the
/// receiver's assignable-value array is allocated inline and cannot
/// grow after the fact.
pub fn add_slots(vm: &mut Vm, recv: Value, args: &[Value], span: Span) -> EvalResult {
    let additions = args[0];
    let file = vm.current_file();

    let object_type = |v: Value| -> Option<ObjectType> {
        if !v.is_ref() {
            return None;
        }
        // SAFETY: live reference.
        Some(unsafe { v.as_ref::<Header>() }.object_type())
    };

    if object_type(recv) != Some(ObjectType::Slots) {
        return Ok(Completion::Error(RuntimeError::new(
            "_AddSlots:: expected a slots object for the receiver",
            Rc::clone(&file),
            span,
        )));
    }
    if object_type(additions) != Some(ObjectType::Slots) {
        return Ok(Completion::Error(RuntimeError::new(
            "_AddSlots:: expected a slots object for argument 1",
            Rc::clone(&file),
            span,
        )));
    }

    // Validate before any allocation so no cleanup path is needed.
    let (old_count, add_count) = unsafe {
        let recv_map: &Map =
            (*(recv.ref_bits() as *const SlotsObject)).map.as_ref();
        let add_map: &Map =
            (*(additions.ref_bits() as *const SlotsObject)).map.as_ref();
        if add_map.assignable_slot_count() > 0 {
            return Ok(Completion::Error(RuntimeError::new(
                "_AddSlots:: cannot add assignable slots at runtime",
                Rc::clone(&file),
                span,
            )));
        }
        for addition in add_map.slots() {
            for existing in recv_map.slots() {
                if existing.hash() == addition.hash()
                    && slot_name_bytes(existing) == slot_name_bytes(addition)
                    && existing.is_mutable()
                {
                    return Ok(Completion::Error(RuntimeError::new(
                        "_AddSlots:: cannot replace an assignable slot",
                        Rc::clone(&file),
                        span,
                    )));
                }
            }
        }
        (recv_map.slot_count(), add_map.slot_count())
    };

    let recv_handle = vm.heap.track(recv);
    let add_handle = vm.heap.track(additions);

    let Vm { heap, world } = vm;
    let total = map_allocation_size(old_count + add_count);
    if let Err(err) = heap.ensure_space(total, world) {
        heap.untrack(add_handle);
        heap.untrack(recv_handle);
        return Err(err);
    }

    let recv = heap.tracked(&recv_handle);
    let additions = heap.tracked(&add_handle);
    let new_map;
    // SAFETY: both objects were re-read after the reservation; the
    // allocations below cannot collect.
    unsafe {
        let recv_obj = &mut *(recv.ref_bits() as *mut SlotsObject);
        let old_map: &Map = recv_obj.map.as_ref();
        let add_map: &Map =
            (*(additions.ref_bits() as *const SlotsObject)).map.as_ref();

        let mut slots: Vec<Slot> = old_map.slots().to_vec();
        for addition in add_map.slots() {
            match slots.iter_mut().find(|s| {
                s.hash() == addition.hash()
                    && slot_name_bytes(s) == slot_name_bytes(addition)
            }) {
                Some(existing) => *existing = *addition,
                None => slots.push(*addition),
            }
        }

        new_map = alloc_map(
            heap,
            world.well_known.map_map,
            MapKind::Slots,
            &slots,
            old_map.assignable_slot_count(),
            0,
            core::ptr::null_mut(),
            NO_PRIMITIVE,
        );
        recv_obj.map = new_map;
    }
    heap.write_barrier(recv, new_map);
    heap.untrack(add_handle);
    heap.untrack(recv_handle);
    Ok(Completion::Normal(recv))
}

/// Reify the running activation as a first-class object.
pub fn current_activation(
    vm: &mut Vm,
    _recv: Value,
    _args: &[Value],
    _span: Span,
) -> EvalResult {
    let Vm { heap, world } = vm;
    heap.ensure_space(size_of::<ActivationObject>(), world)?;
    let map = world.well_known.activation_map;
    let top_ref = world
        .activations
        .top_ref()
        .expect("no live activation during evaluation");
    let receiver = world
        .activations
        .top()
        .expect("no live activation during evaluation")
        .receiver;
    // SAFETY: space ensured; map and receiver were read after that.
    let value =
        unsafe { alloc_activation_object(heap, map, receiver, top_ref) };
    Ok(Completion::Normal(value))
}
