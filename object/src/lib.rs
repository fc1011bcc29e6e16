mod header;
mod lookup;
mod map;
mod objects;
mod slot;
mod special;
mod value;

pub use header::{Header, HeaderFlags, ObjectType};
pub use lookup::{lookup, Intent, LookupResult};
pub use map::{
    init_map, map_allocation_size, ActivationRef, Map, MapKind, MethodCode,
    MAX_ASSIGNABLE_SLOTS, NO_PRIMITIVE,
};
pub use objects::{
    byte_array_allocation_size, slots_object_allocation_size,
    ActivationObject, ByteArray, SlotsObject,
};
pub use slot::{selector_hash, Slot, SlotFlags};
pub use special::WellKnown;
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, (1 << 61) - 1, -(1 << 61)] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert!(!v.is_float());
            assert!(!v.is_marker());
            assert_eq!(unsafe { v.to_i64() }, n);
        }
    }

    #[test]
    fn fixnum_zero_is_zero_bits() {
        let v = Value::from_i64(0);
        assert_eq!(v.raw(), 0);
    }

    #[test]
    fn float_round_trip_clears_low_mantissa_bits() {
        for &f in &[0.0f64, 1.0, -1.5, 3.25, 1e300, -2.5e-17] {
            let v = Value::from_f64(f);
            assert!(v.is_float());
            assert!(!v.is_fixnum());
            assert!(!v.is_ref());
            let back = unsafe { v.to_f64() };
            let expected = f64::from_bits(f.to_bits() & !0b11);
            assert_eq!(back.to_bits(), expected.to_bits());
        }
        // A value whose low two mantissa bits are zero survives exactly.
        let exact = 7.5f64;
        assert_eq!(exact.to_bits() & 0b11, 0);
        assert_eq!(unsafe { Value::from_f64(exact).to_f64() }, exact);
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let ptr = &dummy as *const u64;
        let v = Value::from_ptr(ptr);
        assert!(v.is_ref());
        assert!(!v.is_fixnum());
        assert!(!v.is_float());
        assert!(!v.is_marker());
        assert_eq!(v.ref_bits(), ptr as u64);
    }

    #[test]
    fn header_word_reads_as_marker() {
        let hdr = Header::new(ObjectType::Slots);
        let raw = unsafe { *((&hdr) as *const Header as *const u64) };
        let v = Value::from_raw(raw);
        assert!(v.is_marker());
        assert!(!v.is_fixnum());
        assert!(!v.is_ref());
        assert!(!v.is_float());
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_object_type() {
        for &ty in &[
            ObjectType::Map,
            ObjectType::Slots,
            ObjectType::Method,
            ObjectType::Block,
            ObjectType::ByteArray,
            ObjectType::Activation,
            ObjectType::Forward,
        ] {
            let h = Header::new(ty);
            assert_eq!(h.object_type(), ty);
        }
    }

    #[test]
    fn header_forward_rewrite() {
        let mut h = Header::with_aux(ObjectType::ByteArray, 17);
        assert_eq!(h.aux(), 17);
        h.set_object_type(ObjectType::Forward);
        assert_eq!(h.object_type(), ObjectType::Forward);
    }

    #[test]
    fn header_flags() {
        let mut h = Header::new(ObjectType::Slots);
        assert!(!h.has_flag(HeaderFlags::REMEMBERED));

        h.add_flag(HeaderFlags::REMEMBERED);
        assert!(h.has_flag(HeaderFlags::REMEMBERED));

        h.add_flag(HeaderFlags::FINALIZE);
        assert!(h.has_flag(HeaderFlags::REMEMBERED));
        assert!(h.has_flag(HeaderFlags::FINALIZE));

        h.remove_flag(HeaderFlags::REMEMBERED);
        assert!(!h.has_flag(HeaderFlags::REMEMBERED));
        assert!(h.has_flag(HeaderFlags::FINALIZE));
    }

    #[test]
    fn header_age_saturates() {
        let mut h = Header::new(ObjectType::Map);
        assert_eq!(h.age(), 0);
        h.set_age(254);
        h.increment_age();
        h.increment_age();
        assert_eq!(h.age(), 255);
    }

    // ── Layout ─────────────────────────────────────────────────────

    #[test]
    fn map_allocation_sizes() {
        assert_eq!(map_allocation_size(0), 56);
        assert_eq!(map_allocation_size(1), 56 + 24);
        assert_eq!(map_allocation_size(3), 56 + 3 * 24);
    }

    #[test]
    fn slots_object_allocation_sizes() {
        assert_eq!(slots_object_allocation_size(0), 16);
        assert_eq!(slots_object_allocation_size(3), 16 + 3 * 8);
    }

    #[test]
    fn byte_array_allocation_size_is_aligned() {
        assert_eq!(byte_array_allocation_size(0), 16);
        assert_eq!(byte_array_allocation_size(1), 24);
        assert_eq!(byte_array_allocation_size(8), 24);
        assert_eq!(byte_array_allocation_size(9), 32);
    }
}
