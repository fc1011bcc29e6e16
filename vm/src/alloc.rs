//! Raw object constructors.
//!
//! None of these collect: the caller must have reserved space with
//! [`Heap::ensure_space`] for the combined size of every allocation in
//! the sequence, and must treat all raw pointers saved before that
//! reservation as invalid.

use heap::Heap;
use object::{
    byte_array_allocation_size, init_map, map_allocation_size,
    slots_object_allocation_size, ActivationObject, ActivationRef, ByteArray,
    Header, Map, MapKind, MethodCode, ObjectType, Slot, SlotsObject, Value,
};

/// Allocate a [`Map`] with inline slots.
///
/// Takes ownership of `code` (a `Box::into_raw` pointer or null); maps
/// with code are registered for finalization.
///
/// # Safety
///
/// Space must be ensured. `map_map`, the slot names, and the slot
/// values must be valid tagged values.
#[allow(clippy::too_many_arguments)]
pub unsafe fn alloc_map(
    heap: &mut Heap,
    map_map: Value,
    kind: MapKind,
    slots: &[Slot],
    assignable_slot_count: u8,
    argument_slot_count: u8,
    code: *mut MethodCode,
    primitive: i64,
) -> Value {
    let size = map_allocation_size(slots.len() as u32);
    let ptr = heap.allocate(ObjectType::Map, size).as_ptr() as *mut Map;
    init_map(
        ptr,
        map_map,
        kind,
        slots,
        assignable_slot_count,
        argument_slot_count,
        code,
        primitive,
    );
    let value = Value::from_ptr(ptr);
    if !code.is_null() {
        heap.register_finalizable(value);
    }
    value
}

/// Allocate a slots-layout object (`Slots`, `Method`, or `Block`) with
/// inline assignable values.
///
/// # Safety
///
/// Space must be ensured. `map` must reference a [`Map`] whose
/// assignable-slot count equals `values.len()`.
pub unsafe fn alloc_slots_object(
    heap: &mut Heap,
    object_type: ObjectType,
    map: Value,
    values: &[Value],
) -> Value {
    debug_assert!(matches!(
        object_type,
        ObjectType::Slots | ObjectType::Method | ObjectType::Block
    ));
    let size = slots_object_allocation_size(values.len());
    let ptr = heap.allocate(object_type, size).as_ptr() as *mut SlotsObject;
    (*ptr).map = map;
    if !values.is_empty() {
        let dst = ptr.add(1) as *mut Value;
        core::ptr::copy_nonoverlapping(values.as_ptr(), dst, values.len());
    }
    Value::from_ptr(ptr)
}

/// Allocate a [`ByteArray`] holding `bytes`.
///
/// # Safety
///
/// Space must be ensured; `map` must be a valid tagged reference.
pub unsafe fn alloc_byte_array(
    heap: &mut Heap,
    map: Value,
    bytes: &[u8],
) -> Value {
    let size = byte_array_allocation_size(bytes.len());
    let ptr = heap.allocate(ObjectType::ByteArray, size).as_ptr();
    (ptr as *mut Header)
        .write(Header::with_aux(ObjectType::ByteArray, bytes.len() as u32));
    let ba = ptr as *mut ByteArray;
    (*ba).map = map;
    if !bytes.is_empty() {
        let dst = ba.add(1) as *mut u8;
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    }
    Value::from_ptr(ptr)
}

/// Allocate an [`ActivationObject`] reifying a live frame.
///
/// # Safety
///
/// Space must be ensured; `map` and `receiver` must be valid tagged
/// values.
pub unsafe fn alloc_activation_object(
    heap: &mut Heap,
    map: Value,
    receiver: Value,
    activation: ActivationRef,
) -> Value {
    let size = size_of::<ActivationObject>();
    let ptr =
        heap.allocate(ObjectType::Activation, size).as_ptr() as *mut ActivationObject;
    (*ptr).map = map;
    (*ptr).receiver = receiver;
    (*ptr).activation = activation;
    Value::from_ptr(ptr)
}
