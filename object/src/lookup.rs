use crate::header::ObjectType;
use crate::map::Map;
use crate::objects::{ActivationObject, SlotsObject};
use crate::special::WellKnown;
use crate::Value;

/// Stack-allocated linked list for cycle detection.
///
/// Each node lives on a recursive call's stack frame and points to the
/// caller's node. Because every node outlives its callees, the raw
/// pointer chain is always valid for the duration of a lookup.
struct VisitedLink {
    value: Value,
    prev: *const VisitedLink,
}

impl VisitedLink {
    #[inline]
    fn contains(mut link: *const Self, target: Value) -> bool {
        while !link.is_null() {
            // SAFETY: all nodes are stack-allocated in the recursion
            // chain and remain valid for the duration of the lookup.
            let node = unsafe { &*link };
            if node.value.raw() == target.raw() {
                return true;
            }
            link = node.prev;
        }
        false
    }
}

/// What the caller wants from the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    /// Resolve a settable location. Never descends into parents: an
    /// assignment binds on the direct receiver only.
    Assign,
}

/// The result of a slot lookup.
#[derive(Debug, Clone, Copy)]
pub enum LookupResult {
    /// Selector was not found.
    None,
    /// Read hit: the resolved value.
    Value {
        /// The object that owns the slot (differs from the receiver
        /// when the slot was found via a parent link).
        holder: Value,
        value: Value,
    },
    /// Assign hit: a settable assignable-slot location.
    Assignable { holder: Value, index: usize },
}

/// The reserved selector that yields the traits object of an
/// immediate receiver.
const PARENT_SELECTOR: &[u8] = b"parent";

/// Look up `selector` on `receiver`.
///
/// Fixnum and float receivers forward to the corresponding traits
/// object; the reserved selector `parent` short-circuits to the traits
/// object itself. Object receivers search their map's slots in
/// declaration order and then recurse into parent slots, also in
/// declaration order — when a selector is reachable through several
/// parents, the **first match wins**. Cycles in the parent graph are
/// detected and treated as a miss past the cycle. Activation objects
/// are transparent: the search delegates to their reified receiver.
///
/// # Safety
///
/// - `receiver` must be a valid tagged value; if a reference, it and
///   everything reachable through maps and parent links must be live.
/// - `well_known` must contain valid tagged references.
/// - `hash` must be `selector_hash(selector)`.
pub unsafe fn lookup(
    receiver: Value,
    selector: &[u8],
    hash: u32,
    intent: Intent,
    well_known: &WellKnown,
) -> LookupResult {
    lookup_value(receiver, selector, hash, intent, well_known, core::ptr::null())
}

unsafe fn lookup_value(
    receiver: Value,
    selector: &[u8],
    hash: u32,
    intent: Intent,
    well_known: &WellKnown,
    visited: *const VisitedLink,
) -> LookupResult {
    if receiver.is_fixnum() || receiver.is_float() {
        if intent == Intent::Assign {
            return LookupResult::None;
        }
        let traits = if receiver.is_fixnum() {
            well_known.fixnum_traits
        } else {
            well_known.float_traits
        };
        if selector == PARENT_SELECTOR {
            return LookupResult::Value {
                holder: receiver,
                value: traits,
            };
        }
        if !traits.is_ref() {
            // Traits not installed (a half-built world).
            return LookupResult::None;
        }
        return lookup_value(traits, selector, hash, intent, well_known, visited);
    }

    debug_assert!(receiver.is_ref());

    let header: &crate::Header = receiver.as_ref();
    match header.object_type() {
        ObjectType::Slots
        | ObjectType::Method
        | ObjectType::Block
        | ObjectType::ByteArray => {
            // All four share the header + map prefix.
            let obj = &*(receiver.ref_bits() as *const SlotsObject);
            lookup_in_object(obj, receiver, selector, hash, intent, well_known, visited)
        }
        ObjectType::Activation => {
            // Transparent: delegate to the reified receiver.
            let act = &*(receiver.ref_bits() as *const ActivationObject);
            lookup_value(act.receiver, selector, hash, intent, well_known, visited)
        }
        ObjectType::Map | ObjectType::Forward => LookupResult::None,
    }
}

/// Compare a slot against the selector: hash first, name bytes second.
///
/// # Safety
///
/// The slot's name must reference a live byte array.
#[inline]
unsafe fn slot_matches(slot: &crate::Slot, selector: &[u8], hash: u32) -> bool {
    if slot.hash() != hash {
        return false;
    }
    let name: &crate::ByteArray = slot.name.as_ref();
    name.bytes() == selector
}

/// Search an object's map for the selector, then walk parent links.
#[allow(clippy::too_many_arguments)]
unsafe fn lookup_in_object(
    obj: &SlotsObject,
    obj_value: Value,
    selector: &[u8],
    hash: u32,
    intent: Intent,
    well_known: &WellKnown,
    visited: *const VisitedLink,
) -> LookupResult {
    // Cycle check.
    if VisitedLink::contains(visited, obj_value) {
        return LookupResult::None;
    }

    let map: &Map = obj.map.as_ref();
    let slots = map.slots();

    // Local scan in declaration order.
    for slot in slots.iter() {
        if !slot_matches(slot, selector, hash) {
            continue;
        }

        if slot.is_mutable() {
            let index = slot.assignable_index();
            return match intent {
                Intent::Read => LookupResult::Value {
                    holder: obj_value,
                    value: obj.value(index),
                },
                Intent::Assign => LookupResult::Assignable {
                    holder: obj_value,
                    index,
                },
            };
        }

        return match intent {
            Intent::Read => LookupResult::Value {
                holder: obj_value,
                value: slot.value,
            },
            // Constant slots are not settable.
            Intent::Assign => LookupResult::None,
        };
    }

    // Assignments bind on the direct receiver only.
    if intent == Intent::Assign {
        return LookupResult::None;
    }

    // Parent walk, also in declaration order; first match wins.
    let link = VisitedLink {
        value: obj_value,
        prev: visited,
    };

    for slot in slots.iter() {
        if !slot.is_parent() {
            continue;
        }

        let parent = if slot.is_mutable() {
            obj.value(slot.assignable_index())
        } else {
            slot.value
        };

        match lookup_value(parent, selector, hash, intent, well_known, &link) {
            LookupResult::None => continue,
            found => return found,
        }
    }

    LookupResult::None
}
