use std::rc::Rc;

use crate::header::{Header, HeaderFlags, ObjectType};
use crate::slot::Slot;
use crate::Value;

/// What shape of object a map describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MapKind {
    Slots = 0,
    Method,
    Block,
    ByteArray,
}

/// A weak reference to a frame on the activation stack.
///
/// Stored as an index plus the generation the slot had when the
/// reference was taken; the stack validates both on use, so a
/// reference to a popped frame simply fails instead of dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ActivationRef {
    pub index: u32,
    pub generation: u32,
}

const _: () = assert!(size_of::<ActivationRef>() == 8);

impl ActivationRef {
    pub const NULL: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.index == u32::MAX
    }
}

/// The heap-external code of a method or block: the statement list and
/// the context needed for error reports.
///
/// Owned by the map through a raw [`Box`] pointer and released exactly
/// once by the heap's finalizer when the map dies.
#[derive(Debug)]
pub struct MethodCode {
    pub statements: Rc<[ast::Statement]>,
    /// Defining script (file name), for traces.
    pub file: Rc<str>,
    /// Selector the method was installed under, or `(block)`.
    pub name: Rc<str>,
    pub span: ast::Span,
}

/// Sentinel for maps that activate a registry primitive instead of
/// interpreting statements.
pub const NO_PRIMITIVE: i64 = -1;

/// A hidden map (shape descriptor) shared by objects with identical
/// slot layout.
///
/// Layout in memory:
/// ```text
/// [Header 8B] [map: Value 8B]
/// [kind u8] [argument_slot_count u8] [assignable_slot_count u8] [pad u8] [slot_count u32]
/// [code: *mut MethodCode 8B] [primitive: i64 8B]
/// [parent_activation 8B] [nlr_target 8B]
/// [Slot_0 24B] [Slot_1 24B] ... [Slot_N-1 24B]
/// ```
///
/// The inline slots immediately follow the fixed fields. The `map`
/// field points to the map-of-maps. Method and block maps own `code`
/// and carry the `Finalize` header flag so the collector releases it;
/// block maps additionally record weak references to the activation
/// that created the block and to its non-local-return target.
#[repr(C)]
pub struct Map {
    pub header: Header,
    /// Tagged reference to this map's own map (→ the map-of-maps).
    pub map: Value,
    kind: u8,
    argument_slot_count: u8,
    assignable_slot_count: u8,
    _pad: u8,
    slot_count: u32,
    /// Owned statements for method/block maps; null otherwise.
    pub code: *mut MethodCode,
    /// Registry index for primitive-backed methods, or [`NO_PRIMITIVE`].
    pub primitive: i64,
    /// Block maps: the activation that created the block.
    pub parent_activation: ActivationRef,
    /// Block maps: the activation a `^` inside the block unwinds to.
    pub nlr_target: ActivationRef,
}

const _: () = assert!(size_of::<Map>() == 56);

/// An object may have at most this many assignable slots.
pub const MAX_ASSIGNABLE_SLOTS: usize = 255;

impl Map {
    #[inline(always)]
    pub fn kind(&self) -> MapKind {
        debug_assert!(self.kind <= MapKind::ByteArray as u8);
        unsafe { core::mem::transmute::<u8, MapKind>(self.kind) }
    }

    #[inline(always)]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[inline(always)]
    pub fn assignable_slot_count(&self) -> u8 {
        self.assignable_slot_count
    }

    #[inline(always)]
    pub fn argument_slot_count(&self) -> u8 {
        self.argument_slot_count
    }

    #[inline(always)]
    pub fn is_activatable(&self) -> bool {
        matches!(self.kind(), MapKind::Method | MapKind::Block)
    }

    #[inline(always)]
    pub fn is_primitive_method(&self) -> bool {
        self.primitive != NO_PRIMITIVE
    }

    /// The owned statements of a method/block map.
    ///
    /// # Safety
    ///
    /// `code` must either be null or point to a live boxed
    /// [`MethodCode`] (guaranteed between map creation and
    /// finalization).
    #[inline(always)]
    pub unsafe fn method_code(&self) -> Option<&MethodCode> {
        self.code.as_ref()
    }

    /// Release the owned code. Called exactly once by the heap's
    /// finalizer; idempotent.
    ///
    /// # Safety
    ///
    /// `code` must be null or a pointer produced by `Box::into_raw`
    /// that has not been released yet.
    pub unsafe fn release_code(&mut self) {
        if !self.code.is_null() {
            drop(Box::from_raw(self.code));
            self.code = core::ptr::null_mut();
        }
    }

    /// Byte size of the entire map including inline slots.
    #[inline(always)]
    pub fn byte_size(&self) -> usize {
        map_allocation_size(self.slot_count)
    }

    /// Pointer to the first inline slot.
    #[inline(always)]
    fn slots_ptr(&self) -> *const Slot {
        unsafe { (self as *const Map).add(1) as *const Slot }
    }

    /// Access the inline slot array.
    ///
    /// # Safety
    ///
    /// The memory after this `Map` must contain `slot_count` valid
    /// [`Slot`] entries.
    #[inline(always)]
    pub unsafe fn slots(&self) -> &[Slot] {
        core::slice::from_raw_parts(self.slots_ptr(), self.slot_count as usize)
    }

    /// Access a single inline slot by index.
    ///
    /// # Safety
    ///
    /// `index` must be `< slot_count` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn slot(&self, index: u32) -> &Slot {
        debug_assert!(index < self.slot_count);
        &*self.slots_ptr().add(index as usize)
    }
}

impl core::fmt::Debug for Map {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Map")
            .field("header", &self.header)
            .field("kind", &self.kind())
            .field("slot_count", &self.slot_count)
            .field("assignable_slot_count", &self.assignable_slot_count)
            .field("argument_slot_count", &self.argument_slot_count)
            .field("primitive", &self.primitive)
            .finish()
    }
}

/// Compute the total allocation size for a [`Map`] with `slot_count`
/// inline slots.
pub const fn map_allocation_size(slot_count: u32) -> usize {
    size_of::<Map>() + slot_count as usize * size_of::<Slot>()
}

/// Initialize a map at a raw allocation. The inline slot array is
/// copied from `slots`.
///
/// Maps with owned code receive the `Finalize` header flag; the caller
/// must also register such a map with the heap's finalizable list.
///
/// # Safety
///
/// `ptr` must point to at least `map_allocation_size(slots.len())`
/// bytes of writable memory whose header was initialized as
/// [`ObjectType::Map`]. `code` must be null or a `Box::into_raw`
/// pointer owned by this map from now on.
#[allow(clippy::too_many_arguments)]
pub unsafe fn init_map(
    ptr: *mut Map,
    map_map: Value,
    kind: MapKind,
    slots: &[Slot],
    assignable_slot_count: u8,
    argument_slot_count: u8,
    code: *mut MethodCode,
    primitive: i64,
) {
    let mut header = Header::new(ObjectType::Map);
    if !code.is_null() {
        header.add_flag(HeaderFlags::FINALIZE);
    }
    ptr.write(Map {
        header,
        map: map_map,
        kind: kind as u8,
        argument_slot_count,
        assignable_slot_count,
        _pad: 0,
        slot_count: slots.len() as u32,
        code,
        primitive,
        parent_activation: ActivationRef::NULL,
        nlr_target: ActivationRef::NULL,
    });
    if !slots.is_empty() {
        let slots_dst = ptr.add(1) as *mut Slot;
        core::ptr::copy_nonoverlapping(slots.as_ptr(), slots_dst, slots.len());
    }
}
