//! World bootstrap: the map-of-maps, the singletons, the integer and
//! float traits with their primitive-backed methods, and the lobby.

use heap::{AllocationError, Heap, TrackedRef};
use object::{
    map_allocation_size, selector_hash, slots_object_allocation_size, Header,
    HeaderFlags, Map, MapKind, ObjectType, Slot, SlotFlags, SlotsObject,
    Value, NO_PRIMITIVE,
};

use crate::alloc::{alloc_map, alloc_slots_object};
use crate::Vm;

/// Selector → registry primitive, installed on the integer traits.
const FIXNUM_METHODS: &[(&str, &str)] = &[
    ("+", "_IntAdd:"),
    ("-", "_IntSub:"),
    ("*", "_IntMul:"),
    ("/", "_IntDiv:"),
    ("%", "_IntMod:"),
    ("negate", "_IntNeg"),
    ("=", "_IntEq:"),
    ("!=", "_IntNe:"),
    ("<", "_IntLt:"),
    ("<=", "_IntLe:"),
    (">", "_IntGt:"),
    (">=", "_IntGe:"),
    ("asFloat", "_IntAsFloat"),
];

const FLOAT_METHODS: &[(&str, &str)] = &[
    ("+", "_FloatAdd:"),
    ("-", "_FloatSub:"),
    ("*", "_FloatMul:"),
    ("/", "_FloatDiv:"),
    ("negate", "_FloatNeg"),
    ("sqrt", "_FloatSqrt"),
    ("=", "_FloatEq:"),
    ("<", "_FloatLt:"),
    ("<=", "_FloatLe:"),
    (">", "_FloatGt:"),
    (">=", "_FloatGe:"),
];

/// Allocate the well-known objects and populate the traits. Called
/// once from [`Vm::new`]; afterwards [`Vm::lobby`] is the root of the
/// world.
pub fn prepare_world(vm: &mut Vm) -> Result<(), AllocationError> {
    bootstrap_core(vm)?;
    install_traits(vm)?;
    install_lobby_constants(vm)?;
    Ok(())
}

fn bootstrap_core(vm: &mut Vm) -> Result<(), AllocationError> {
    let Vm { heap, world } = vm;

    // The map-of-maps describes itself.
    heap.ensure_space(map_allocation_size(0), world)?;
    // SAFETY: space ensured; the placeholder map pointer is patched
    // immediately after allocation.
    unsafe {
        let map_map = alloc_map(
            heap,
            Value::zero(),
            MapKind::Slots,
            &[],
            0,
            0,
            core::ptr::null_mut(),
            NO_PRIMITIVE,
        );
        (*(map_map.ref_bits() as *mut Map)).map = map_map;
        world.well_known.map_map = map_map;
    }

    // Shared maps for byte arrays and reified activations.
    heap.ensure_space(2 * map_allocation_size(0), world)?;
    // SAFETY: space ensured; map_map re-read after the reservation.
    unsafe {
        let map_map = world.well_known.map_map;
        world.well_known.byte_array_map = alloc_map(
            heap,
            map_map,
            MapKind::ByteArray,
            &[],
            0,
            0,
            core::ptr::null_mut(),
            NO_PRIMITIVE,
        );
        world.well_known.activation_map = alloc_map(
            heap,
            map_map,
            MapKind::Slots,
            &[],
            0,
            0,
            core::ptr::null_mut(),
            NO_PRIMITIVE,
        );
    }

    // Singletons, traits, and the lobby: six empty objects, each with
    // its own empty map.
    let unit = map_allocation_size(0) + slots_object_allocation_size(0);
    heap.ensure_space(6 * unit, world)?;

    /// # Safety
    ///
    /// Space for one empty map and one empty object must be ensured.
    unsafe fn empty_object(heap: &mut Heap, map_map: Value) -> Value {
        let map = alloc_map(
            heap,
            map_map,
            MapKind::Slots,
            &[],
            0,
            0,
            core::ptr::null_mut(),
            NO_PRIMITIVE,
        );
        alloc_slots_object(heap, ObjectType::Slots, map, &[])
    }

    // SAFETY: space ensured for all twelve allocations.
    unsafe {
        let map_map = world.well_known.map_map;
        world.well_known.nil = empty_object(heap, map_map);
        world.well_known.true_obj = empty_object(heap, map_map);
        world.well_known.false_obj = empty_object(heap, map_map);
        world.well_known.fixnum_traits = empty_object(heap, map_map);
        world.well_known.float_traits = empty_object(heap, map_map);
        world.well_known.lobby = empty_object(heap, map_map);
    }

    // Everything in the table is globally reachable.
    let wk = &world.well_known;
    for value in [
        wk.nil,
        wk.true_obj,
        wk.false_obj,
        wk.map_map,
        wk.byte_array_map,
        wk.activation_map,
        wk.fixnum_traits,
        wk.float_traits,
        wk.lobby,
    ] {
        // SAFETY: all just allocated and live.
        unsafe {
            (*(value.ref_bits() as *mut Header)).add_flag(HeaderFlags::GLOBAL);
        }
    }
    Ok(())
}

fn install_traits(vm: &mut Vm) -> Result<(), AllocationError> {
    let fixnum_traits = vm.world.well_known.fixnum_traits;
    let handle = vm.heap.track(fixnum_traits);
    let mut result = Ok(());
    for &(selector, primitive) in FIXNUM_METHODS {
        result = install_primitive_method(vm, &handle, selector, primitive);
        if result.is_err() {
            break;
        }
    }
    vm.heap.untrack(handle);
    result?;

    let float_traits = vm.world.well_known.float_traits;
    let handle = vm.heap.track(float_traits);
    let mut result = Ok(());
    for &(selector, primitive) in FLOAT_METHODS {
        result = install_primitive_method(vm, &handle, selector, primitive);
        if result.is_err() {
            break;
        }
    }
    vm.heap.untrack(handle);
    result
}

/// Give a script-visible name to each singleton.
fn install_lobby_constants(vm: &mut Vm) -> Result<(), AllocationError> {
    let lobby = vm.world.well_known.lobby;
    let lobby_handle = vm.heap.track(lobby);
    let mut result = Ok(());
    for name in ["nil", "true", "false"] {
        let value = match name {
            "nil" => vm.world.well_known.nil,
            "true" => vm.world.well_known.true_obj,
            _ => vm.world.well_known.false_obj,
        };
        let value_handle = vm.heap.track(value);
        result = install_constant(vm, &lobby_handle, name, &value_handle);
        vm.heap.untrack(value_handle);
        if result.is_err() {
            break;
        }
    }
    vm.heap.untrack(lobby_handle);
    result
}

/// Extend `target`'s map with a constant slot holding a fresh
/// primitive-backed method object.
fn install_primitive_method(
    vm: &mut Vm,
    target: &TrackedRef,
    selector: &str,
    primitive: &'static str,
) -> Result<(), AllocationError> {
    let index = *vm
        .world
        .primitive_index
        .get(primitive)
        .expect("primitive registered") as i64;
    let arity = vm.world.primitives[index as usize].arity;
    vm.intern(selector)?;

    let Vm { heap, world } = vm;
    let target_value = heap.tracked(target);
    // SAFETY: target is tracked and live.
    let old_count = unsafe {
        let object: &SlotsObject = target_value.as_ref();
        let map_value = object.map;
        map_value.as_ref::<Map>().slot_count()
    };

    let total = map_allocation_size(0)
        + slots_object_allocation_size(0)
        + map_allocation_size(old_count + 1);
    heap.ensure_space(total, world)?;

    // Everything re-read after the reservation; the three allocations
    // below cannot collect.
    let target_value = heap.tracked(target);
    let name = *world.interner.get(selector).expect("interned above");
    let hash = selector_hash(selector.as_bytes());
    let map_map = world.well_known.map_map;
    let new_map;
    // SAFETY: space ensured; all inputs are current.
    unsafe {
        let method_map = alloc_map(
            heap,
            map_map,
            MapKind::Method,
            &[],
            0,
            arity,
            core::ptr::null_mut(),
            index,
        );
        let method_object =
            alloc_slots_object(heap, ObjectType::Method, method_map, &[]);

        let target_object = &mut *(target_value.ref_bits() as *mut SlotsObject);
        let old_map_value = target_object.map;
        let old_map: &Map = old_map_value.as_ref();
        let mut slots: Vec<Slot> = old_map.slots().to_vec();
        slots.push(Slot::new(SlotFlags::NONE, hash, name, method_object));

        new_map = alloc_map(
            heap,
            map_map,
            old_map.kind(),
            &slots,
            old_map.assignable_slot_count(),
            old_map.argument_slot_count(),
            core::ptr::null_mut(),
            NO_PRIMITIVE,
        );
        target_object.map = new_map;
    }
    heap.write_barrier(target_value, new_map);
    Ok(())
}

/// Extend `target`'s map with a constant slot holding `value`.
fn install_constant(
    vm: &mut Vm,
    target: &TrackedRef,
    name: &str,
    value: &TrackedRef,
) -> Result<(), AllocationError> {
    vm.intern(name)?;

    let Vm { heap, world } = vm;
    let target_value = heap.tracked(target);
    // SAFETY: target is tracked and live.
    let old_count = unsafe {
        let object: &SlotsObject = target_value.as_ref();
        let map_value = object.map;
        map_value.as_ref::<Map>().slot_count()
    };

    heap.ensure_space(map_allocation_size(old_count + 1), world)?;

    let target_value = heap.tracked(target);
    let slot_value = heap.tracked(value);
    let name_value = *world.interner.get(name).expect("interned above");
    let hash = selector_hash(name.as_bytes());
    let map_map = world.well_known.map_map;
    let new_map;
    // SAFETY: space ensured; all inputs are current.
    unsafe {
        let target_object = &mut *(target_value.ref_bits() as *mut SlotsObject);
        let old_map_value = target_object.map;
        let old_map: &Map = old_map_value.as_ref();
        let mut slots: Vec<Slot> = old_map.slots().to_vec();
        slots.push(Slot::new(SlotFlags::NONE, hash, name_value, slot_value));

        new_map = alloc_map(
            heap,
            map_map,
            old_map.kind(),
            &slots,
            old_map.assignable_slot_count(),
            old_map.argument_slot_count(),
            core::ptr::null_mut(),
            NO_PRIMITIVE,
        );
        target_object.map = new_map;
    }
    heap.write_barrier(target_value, new_map);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::{CollectReason, HeapSettings};
    use object::{lookup, Intent, LookupResult};

    #[test]
    fn world_has_singletons_and_traits() {
        let vm = Vm::new(HeapSettings::default()).expect("bootstrap");
        let wk = &vm.world.well_known;
        for value in [
            wk.nil,
            wk.true_obj,
            wk.false_obj,
            wk.map_map,
            wk.byte_array_map,
            wk.fixnum_traits,
            wk.float_traits,
            wk.lobby,
        ] {
            assert!(value.is_ref());
        }
        assert!(!wk.nil.identical(wk.true_obj));
        assert!(!wk.true_obj.identical(wk.false_obj));
    }

    #[test]
    fn map_map_describes_itself() {
        let vm = Vm::new(HeapSettings::default()).expect("bootstrap");
        let map_map = vm.world.well_known.map_map;
        // SAFETY: live bootstrap object.
        let own_map = unsafe { map_map.as_ref::<Map>() }.map;
        assert!(own_map.identical(map_map));
    }

    #[test]
    fn fixnums_understand_arithmetic_selectors() {
        let vm = Vm::new(HeapSettings::default()).expect("bootstrap");
        let five = Value::from_i64(5);
        for &(selector, _) in FIXNUM_METHODS {
            let hash = selector_hash(selector.as_bytes());
            // SAFETY: bootstrap world is live.
            let found = unsafe {
                lookup(
                    five,
                    selector.as_bytes(),
                    hash,
                    Intent::Read,
                    &vm.world.well_known,
                )
            };
            assert!(
                matches!(found, LookupResult::Value { .. }),
                "fixnum should understand '{selector}'"
            );
        }
    }

    #[test]
    fn lobby_names_the_singletons() {
        let vm = Vm::new(HeapSettings::default()).expect("bootstrap");
        let wk = &vm.world.well_known;
        for (name, expected) in
            [("nil", wk.nil), ("true", wk.true_obj), ("false", wk.false_obj)]
        {
            let hash = selector_hash(name.as_bytes());
            // SAFETY: bootstrap world is live.
            let found = unsafe {
                lookup(wk.lobby, name.as_bytes(), hash, Intent::Read, wk)
            };
            match found {
                LookupResult::Value { value, .. } => {
                    assert!(value.identical(expected), "lobby {name}");
                }
                other => panic!("lobby must know '{name}', got {other:?}"),
            }
        }
    }

    #[test]
    fn bootstrap_survives_a_collection() {
        let mut vm = Vm::new(HeapSettings::default()).expect("bootstrap");
        let Vm { heap, world } = &mut vm;
        heap.collect_minor(world, CollectReason::EXPLICIT);

        // Traits still resolve after everything moved.
        let hash = selector_hash(b"+");
        // SAFETY: world is live.
        let found = unsafe {
            lookup(
                Value::from_i64(1),
                b"+",
                hash,
                Intent::Read,
                &vm.world.well_known,
            )
        };
        assert!(matches!(found, LookupResult::Value { .. }));
    }
}
