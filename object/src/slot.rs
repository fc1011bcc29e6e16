use crate::Value;

/// Property flags for a slot within a [`Map`](crate::Map).
///
/// Stored in the low 16 bits of the slot's `meta` field; the high 32
/// bits hold the selector hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SlotFlags(pub u16);

impl SlotFlags {
    pub const NONE: Self = Self(0);

    /// Assignable slot. `value` stores the index into the owning
    /// object's assignable-value array (as a fixnum). Without this
    /// flag the slot is constant and `value` holds the value itself.
    pub const MUTABLE: Self = Self(1 << 0);

    /// Slot is a parent link — the lookup algorithm traverses it.
    pub const PARENT: Self = Self(1 << 1);

    /// Argument slot of a method or block: mutable, bound at
    /// activation time.
    pub const ARGUMENT: Self = Self(1 << 2);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

/// 32-bit FNV-1a over the selector bytes. Every slot caches this so a
/// lookup can reject non-matching slots without touching name bytes.
pub fn selector_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// A slot descriptor embedded inline in a [`Map`](crate::Map).
///
/// - `name`:  tagged reference to the interned name byte array.
/// - `meta`:  low 16 bits are [`SlotFlags`]; high 32 bits the name hash.
/// - `value`: the inline value for constant slots, or the assignable
///   index (as fixnum) for mutable and argument slots.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Slot {
    pub name: Value,
    pub meta: u64,
    pub value: Value,
}

const _: () = assert!(size_of::<Slot>() == 24);

impl Slot {
    #[inline(always)]
    pub fn new(flags: SlotFlags, hash: u32, name: Value, value: Value) -> Self {
        Self {
            name,
            meta: flags.0 as u64 | ((hash as u64) << 32),
            value,
        }
    }

    #[inline(always)]
    pub fn flags(&self) -> SlotFlags {
        SlotFlags(self.meta as u16)
    }

    #[inline(always)]
    pub fn hash(&self) -> u32 {
        (self.meta >> 32) as u32
    }

    #[inline(always)]
    pub fn is_mutable(&self) -> bool {
        self.flags().contains(SlotFlags::MUTABLE)
    }

    #[inline(always)]
    pub fn is_constant(&self) -> bool {
        !self.is_mutable()
    }

    #[inline(always)]
    pub fn is_parent(&self) -> bool {
        self.flags().contains(SlotFlags::PARENT)
    }

    #[inline(always)]
    pub fn is_argument(&self) -> bool {
        self.flags().contains(SlotFlags::ARGUMENT)
    }

    /// The assignable index of a mutable slot.
    ///
    /// # Safety
    ///
    /// The slot must be mutable (its `value` is an index fixnum).
    #[inline(always)]
    pub unsafe fn assignable_index(&self) -> usize {
        debug_assert!(self.is_mutable());
        self.value.to_i64() as usize
    }
}

impl core::fmt::Debug for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slot")
            .field("flags", &self.flags())
            .field("hash", &self.hash())
            .field("name", &self.name)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_distinguishes() {
        assert_eq!(selector_hash(b"x"), selector_hash(b"x"));
        assert_ne!(selector_hash(b"x"), selector_hash(b"y"));
        assert_ne!(selector_hash(b"add:With:"), selector_hash(b"add:"));
    }

    #[test]
    fn meta_packs_flags_and_hash() {
        let hash = selector_hash(b"counter");
        let slot = Slot::new(
            SlotFlags::MUTABLE.with(SlotFlags::PARENT),
            hash,
            Value::zero(),
            Value::from_i64(3),
        );
        assert!(slot.is_mutable());
        assert!(slot.is_parent());
        assert!(!slot.is_argument());
        assert!(!slot.is_constant());
        assert_eq!(slot.hash(), hash);
        assert_eq!(unsafe { slot.assignable_index() }, 3);
    }
}
