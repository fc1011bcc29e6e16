use crate::header::Header;
use crate::map::ActivationRef;
use crate::Value;

// ── SlotsObject ────────────────────────────────────────────────────

/// A regular object: a hidden map plus inline assignable-slot values.
///
/// ```text
/// [Header 8B] [map: Value 8B] [value_0 8B] [value_1 8B] ...
/// ```
///
/// Method and block objects share this exact layout — only the header
/// type differs — so one accessor type serves all three.
#[repr(C)]
pub struct SlotsObject {
    pub header: Header,
    /// Tagged reference to this object's [`Map`](crate::Map).
    pub map: Value,
}

const _: () = assert!(size_of::<SlotsObject>() == 16);

impl SlotsObject {
    /// Read the assignable value at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be below the map's assignable-slot count and the
    /// inline memory must be initialized.
    #[inline(always)]
    pub unsafe fn value(&self, index: usize) -> Value {
        let base = (self as *const Self).add(1) as *const Value;
        base.add(index).read()
    }

    /// Write the assignable value at `index`.
    ///
    /// The caller is responsible for the write barrier.
    ///
    /// # Safety
    ///
    /// Same bounds requirement as [`Self::value`]; no other references
    /// to the slot may exist.
    #[inline(always)]
    pub unsafe fn set_value(&mut self, index: usize, value: Value) {
        let base = (self as *mut Self).add(1) as *mut Value;
        base.add(index).write(value);
    }

    /// Access the whole assignable-value array.
    ///
    /// # Safety
    ///
    /// `count` must equal the map's assignable-slot count.
    #[inline(always)]
    pub unsafe fn values(&self, count: usize) -> &[Value] {
        let base = (self as *const Self).add(1) as *const Value;
        core::slice::from_raw_parts(base, count)
    }
}

/// Compute the total allocation size for a [`SlotsObject`] with
/// `value_count` inline values.
pub const fn slots_object_allocation_size(value_count: usize) -> usize {
    size_of::<SlotsObject>() + value_count * size_of::<Value>()
}

// ── ByteArray ──────────────────────────────────────────────────────

/// A variable-length byte buffer; strings and interned selector names.
///
/// ```text
/// [Header 8B, length in aux] [map: Value 8B] [byte_0] [byte_1] ...
/// ```
#[repr(C)]
pub struct ByteArray {
    pub header: Header,
    pub map: Value,
}

const _: () = assert!(size_of::<ByteArray>() == 16);

impl ByteArray {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.header.aux() as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` valid bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        let ptr = (self as *const ByteArray).add(1) as *const u8;
        core::slice::from_raw_parts(ptr, self.len())
    }
}

/// Allocation size for a [`ByteArray`] of `len` bytes, rounded up so
/// the allocator's bump pointer stays 8-byte aligned.
pub const fn byte_array_allocation_size(len: usize) -> usize {
    (size_of::<ByteArray>() + len + 7) & !7
}

// ── ActivationObject ───────────────────────────────────────────────

/// A live activation reified as a first-class object.
///
/// Transparent to lookup: searching it delegates to the reified
/// receiver. The weak [`ActivationRef`] goes stale when the frame is
/// popped; reflective primitives validate it on use.
#[repr(C)]
pub struct ActivationObject {
    pub header: Header,
    pub map: Value,
    pub receiver: Value,
    pub activation: ActivationRef,
}

const _: () = assert!(size_of::<ActivationObject>() == 32);
