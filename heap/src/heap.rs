//! Generational moving collector.
//!
//! Young generation: an eden bump region plus two survivor semispaces
//! scavenged Cheney-style; objects that survive enough scavenges are
//! promoted into a single old region, collected rarely by a sliding
//! mark-compact. Old-to-young references are recorded in a remembered
//! set through the write barrier.
//!
//! This crate is decoupled from any specific object model. Consumers
//! provide:
//! - A [`TraceFn`] to enumerate the `Value` edges of a heap object.
//! - A [`SizeFn`] returning an object's total byte size.
//! - A [`FinalizeFn`] run once when a finalizable object dies.
//! - A [`RootProvider`] supplying live roots at collection time.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::time::Instant;

use bitflags::bitflags;
use tracing::{debug, warn};

use object::{Header, HeaderFlags, ObjectType, Value};

use crate::system::{map_memory, round_to_pages, unmap_memory};

// ── Public API types ──────────────────────────────────────────────────

/// Function that traces all `Value` edges of a heap object.
///
/// Given a pointer to a heap object (whose first bytes are an
/// [`object::Header`]), the function must call `visitor` for every
/// [`Value`] field that may be a heap reference. The visitor may
/// mutate the value in place (relocation rewrites references this way).
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid header.
pub type TraceFn =
    unsafe fn(obj: *mut u8, visitor: &mut dyn FnMut(&mut Value));

/// Function that returns the total byte size of a heap object,
/// including the header, rounded to the allocator's 8-byte grain.
///
/// # Safety
///
/// `obj` must point to a valid heap object whose content has not yet
/// been overwritten by a forwarding reference.
pub type SizeFn = unsafe fn(obj: *const u8) -> usize;

/// Function invoked exactly once when an object carrying the
/// `Finalize` header flag dies; releases its heap-external state.
///
/// # Safety
///
/// `obj` points at the dead object's (still readable) memory.
pub type FinalizeFn = unsafe fn(obj: *mut u8);

/// Consumers implement this to provide GC roots.
///
/// Called at collection time to discover live roots from VM state
/// (activation stacks, well-known objects, interned names, evaluator
/// temporaries). The visitor receives `&mut Value` so relocation can
/// update roots in place.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

bitflags! {
    /// Why a collection cycle ran; carried in the cycle's log event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectReason: u8 {
        const EDEN_FULL    = 1 << 0;
        const OLD_PRESSURE = 1 << 1;
        const EXPLICIT     = 1 << 2;
    }
}

/// Raised when the heap cannot satisfy an allocation even after
/// collecting; aborts the running script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationError {
    pub requested: usize,
}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "out of memory: cannot allocate {} bytes", self.requested)
    }
}

impl std::error::Error for AllocationError {}

/// Configuration for the generational heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of the eden allocation region.
    pub eden_size: usize,
    /// Size of each of the two survivor semispaces.
    pub survivor_size: usize,
    /// Size of the old region.
    pub old_size: usize,
    /// Number of scavenges an object survives before promotion.
    pub promote_age: u8,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            eden_size: 1 << 20,      // 1 MiB
            survivor_size: 512 << 10, // 512 KiB
            old_size: 8 << 20,       // 8 MiB
            promote_age: 2,
        }
    }
}

impl HeapSettings {
    fn validate(&self) -> Result<(), &'static str> {
        if self.eden_size == 0 || self.survivor_size == 0 || self.old_size == 0
        {
            return Err("region sizes must be > 0");
        }
        if self.eden_size % 8 != 0
            || self.survivor_size % 8 != 0
            || self.old_size % 8 != 0
        {
            return Err("region sizes must be multiples of 8");
        }
        if self.promote_age == 0 {
            return Err("promote_age must be > 0");
        }
        Ok(())
    }
}

// ── Regions ───────────────────────────────────────────────────────────

/// A contiguous bump-allocated region carved out of the heap mapping.
#[derive(Debug, Clone, Copy)]
struct Region {
    start: *mut u8,
    end: *mut u8,
    top: *mut u8,
}

impl Region {
    fn new(start: *mut u8, size: usize) -> Self {
        Self {
            start,
            // SAFETY: start..start+size is within the heap mapping.
            end: unsafe { start.add(size) },
            top: start,
        }
    }

    #[inline(always)]
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start as u64 && addr < self.end as u64
    }

    #[inline(always)]
    fn free(&self) -> usize {
        self.end as usize - self.top as usize
    }

    #[inline(always)]
    fn used(&self) -> usize {
        self.top as usize - self.start as usize
    }

    #[inline(always)]
    fn bump(&mut self, size: usize) -> Option<*mut u8> {
        if self.free() < size {
            return None;
        }
        let ptr = self.top;
        // SAFETY: checked against end above.
        self.top = unsafe { self.top.add(size) };
        Some(ptr)
    }

    fn reset(&mut self) {
        self.top = self.start;
    }
}

// ── Tracked references ────────────────────────────────────────────────

/// An opaque handle into the heap's tracked-reference table.
///
/// Deliberately neither `Clone` nor `Copy`: every tracked reference
/// must be released exactly once via [`Heap::untrack`]. Leaked handles
/// are counted and reported when the heap is dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct TrackedRef {
    index: u32,
}

const FREE_TRACKED_SLOT: Value = Value::zero();

// ── Heap ──────────────────────────────────────────────────────────────

const ALLOC_ALIGN: usize = 8;

#[inline(always)]
const fn align_up(size: usize) -> usize {
    (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// The generational heap. Owns every object; single-threaded.
pub struct Heap {
    base: NonNull<u8>,
    mapped_size: usize,

    eden: Region,
    survivors: [Region; 2],
    /// Index of the survivor space currently holding objects.
    from: usize,
    old: Region,

    settings: HeapSettings,

    /// Old-space objects that may hold young references.
    remembered: Vec<Value>,
    /// Root slots handed out through [`TrackedRef`]s.
    tracked: Vec<Value>,
    tracked_free: Vec<u32>,
    tracked_live: usize,
    /// References to objects carrying the `Finalize` header flag.
    finalizable: Vec<Value>,

    trace: TraceFn,
    object_size: SizeFn,
    finalize: FinalizeFn,

    minor_collections: u64,
    major_collections: u64,
}

impl Heap {
    pub fn new(
        settings: HeapSettings,
        trace: TraceFn,
        object_size: SizeFn,
        finalize: FinalizeFn,
    ) -> Result<Self, &'static str> {
        settings.validate()?;

        let eden_size = round_to_pages(settings.eden_size);
        let survivor_size = round_to_pages(settings.survivor_size);
        let old_size = round_to_pages(settings.old_size);
        let mapped_size = eden_size + 2 * survivor_size + old_size;

        let base = map_memory(mapped_size).ok_or("heap mapping failed")?;
        let start = base.as_ptr();

        // SAFETY: the regions partition the fresh mapping.
        let (eden, survivor_a, survivor_b, old) = unsafe {
            (
                Region::new(start, eden_size),
                Region::new(start.add(eden_size), survivor_size),
                Region::new(start.add(eden_size + survivor_size), survivor_size),
                Region::new(start.add(eden_size + 2 * survivor_size), old_size),
            )
        };

        Ok(Self {
            base,
            mapped_size,
            eden,
            survivors: [survivor_a, survivor_b],
            from: 0,
            old,
            settings,
            remembered: Vec::new(),
            tracked: Vec::new(),
            tracked_free: Vec::new(),
            tracked_live: 0,
            finalizable: Vec::new(),
            trace,
            object_size,
            finalize,
            minor_collections: 0,
            major_collections: 0,
        })
    }

    // ── Region predicates ─────────────────────────────────────────

    #[inline]
    fn in_young(&self, addr: u64) -> bool {
        self.eden.contains(addr)
            || self.survivors[0].contains(addr)
            || self.survivors[1].contains(addr)
    }

    /// True for references into the old region.
    #[inline]
    pub fn in_old(&self, value: Value) -> bool {
        value.is_ref() && self.old.contains(value.ref_bits())
    }

    /// True for references into the young generation.
    #[inline]
    pub fn is_young(&self, value: Value) -> bool {
        value.is_ref() && self.in_young(value.ref_bits())
    }

    /// Spaces evacuated by a scavenge: eden plus the from-survivor.
    #[inline]
    fn in_evacuation_space(&self, addr: u64) -> bool {
        self.eden.contains(addr) || self.survivors[self.from].contains(addr)
    }

    pub fn minor_collections(&self) -> u64 {
        self.minor_collections
    }

    pub fn major_collections(&self) -> u64 {
        self.major_collections
    }

    // ── Allocation ────────────────────────────────────────────────

    /// Guarantee that the next `size` bytes of allocations fit in eden
    /// without collecting. Callers performing several allocations in
    /// sequence must call this once with the combined size — and must
    /// refresh any raw object pointers afterwards, since a collection
    /// may have moved everything.
    pub fn ensure_space(
        &mut self,
        size: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<(), AllocationError> {
        let size = align_up(size);
        if self.eden.free() >= size {
            return Ok(());
        }

        // A scavenge promotes at most everything currently young; make
        // sure old space can absorb that before starting one.
        let young_used = self.eden.used() + self.survivors[self.from].used();
        if self.old.free() < young_used {
            self.collect_major(roots, CollectReason::OLD_PRESSURE);
        }

        self.collect_minor(roots, CollectReason::EDEN_FULL);

        if self.eden.free() >= size {
            Ok(())
        } else {
            Err(AllocationError { requested: size })
        }
    }

    /// Bump-allocate `size` bytes in eden and stamp a fresh header of
    /// the given type. Never collects and never moves existing
    /// objects; the space must have been reserved with
    /// [`Self::ensure_space`]. The memory after the header is zeroed;
    /// the caller must fully initialize the object before the next
    /// `ensure_space`.
    pub fn allocate(
        &mut self,
        object_type: ObjectType,
        size: usize,
    ) -> NonNull<u8> {
        let size = align_up(size);
        let ptr = self
            .eden
            .bump(size)
            .expect("allocate() without ensure_space()");
        // SAFETY: ptr..ptr+size is fresh eden memory.
        unsafe {
            ptr.write_bytes(0, size);
            (ptr as *mut Header).write(Header::new(object_type));
            NonNull::new_unchecked(ptr)
        }
    }

    /// Record an object whose `Finalize` flag is set; its
    /// [`FinalizeFn`] runs once when the object dies.
    pub fn register_finalizable(&mut self, value: Value) {
        debug_assert!(value.is_ref());
        self.finalizable.push(value);
    }

    // ── Tracked references ────────────────────────────────────────

    /// Register `value` as a root and return a handle that survives
    /// collections. Must be released with [`Self::untrack`].
    pub fn track(&mut self, value: Value) -> TrackedRef {
        let index = match self.tracked_free.pop() {
            Some(index) => {
                self.tracked[index as usize] = value;
                index
            }
            None => {
                self.tracked.push(value);
                (self.tracked.len() - 1) as u32
            }
        };
        self.tracked_live += 1;
        TrackedRef { index }
    }

    /// Current location of a tracked value.
    pub fn tracked(&self, handle: &TrackedRef) -> Value {
        self.tracked[handle.index as usize]
    }

    pub fn set_tracked(&mut self, handle: &TrackedRef, value: Value) {
        self.tracked[handle.index as usize] = value;
    }

    pub fn untrack(&mut self, handle: TrackedRef) {
        self.tracked[handle.index as usize] = FREE_TRACKED_SLOT;
        self.tracked_free.push(handle.index);
        self.tracked_live -= 1;
    }

    pub fn live_tracked(&self) -> usize {
        self.tracked_live
    }

    // ── Write barrier ─────────────────────────────────────────────

    /// Must run for every store of `stored` into a field of
    /// `container`: records old-to-young edges so the next scavenge
    /// visits the container.
    pub fn write_barrier(&mut self, container: Value, stored: Value) {
        if !self.in_old(container) || !self.is_young(stored) {
            return;
        }
        // SAFETY: container is a live old-space object.
        let header =
            unsafe { &mut *(container.ref_bits() as *mut Header) };
        if header.has_flag(HeaderFlags::REMEMBERED) {
            return;
        }
        header.add_flag(HeaderFlags::REMEMBERED);
        self.remembered.push(container);
    }

    fn remember(&mut self, container: Value) {
        // SAFETY: container is a live old-space object.
        let header =
            unsafe { &mut *(container.ref_bits() as *mut Header) };
        if !header.has_flag(HeaderFlags::REMEMBERED) {
            header.add_flag(HeaderFlags::REMEMBERED);
            self.remembered.push(container);
        }
    }

    // ── Minor collection (scavenge) ───────────────────────────────

    /// Copy the live young generation into the other survivor space,
    /// promoting objects past the age threshold into old space.
    pub fn collect_minor(
        &mut self,
        roots: &mut dyn RootProvider,
        reason: CollectReason,
    ) {
        let started = Instant::now();
        let young_before = self.eden.used() + self.survivors[self.from].used();
        let to = 1 - self.from;
        debug_assert_eq!(self.survivors[to].used(), 0, "to-space not empty");

        let old_scan_start = self.old.top;

        // Roots: provider, tracked table, remembered set.
        roots.visit_roots(&mut |slot| {
            *slot = self.forward_value(*slot);
        });

        for i in 0..self.tracked.len() {
            let value = self.tracked[i];
            self.tracked[i] = self.forward_value(value);
        }

        let remembered = std::mem::take(&mut self.remembered);
        for container in remembered {
            // SAFETY: old-space containers do not move in a scavenge.
            unsafe {
                (*(container.ref_bits() as *mut Header))
                    .remove_flag(HeaderFlags::REMEMBERED);
            }
            let any_young =
                self.scavenge_fields(container.ref_bits() as *mut u8);
            if any_young {
                self.remember(container);
            }
        }

        // Cheney scan: walk the to-space copies and the freshly
        // promoted tail of old space until no new objects appear.
        let mut scan = self.survivors[to].start;
        let mut old_scan = old_scan_start;
        loop {
            let mut progressed = false;
            while scan < self.survivors[to].top {
                // SAFETY: scan walks fully copied objects.
                let size = unsafe { (self.object_size)(scan) };
                self.scavenge_fields(scan);
                // SAFETY: objects are contiguous in to-space.
                scan = unsafe { scan.add(size) };
                progressed = true;
            }
            while old_scan < self.old.top {
                // SAFETY: old_scan walks fully copied objects.
                let size = unsafe { (self.object_size)(old_scan) };
                let any_young = self.scavenge_fields(old_scan);
                if any_young {
                    self.remember(Value::from_ptr(old_scan));
                }
                // SAFETY: objects are contiguous in old space.
                old_scan = unsafe { old_scan.add(size) };
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        // Finalization: young entries that were not forwarded died.
        let finalizable = std::mem::take(&mut self.finalizable);
        let mut kept = Vec::with_capacity(finalizable.len());
        for entry in finalizable {
            let addr = entry.ref_bits();
            if !self.in_evacuation_space(addr) {
                kept.push(entry);
                continue;
            }
            // SAFETY: evacuated spaces are not yet reset; headers are
            // still readable.
            let header = unsafe { &*(addr as *const Header) };
            if header.object_type() == ObjectType::Forward {
                let fwd = unsafe { *((addr + 8) as *const Value) };
                kept.push(fwd);
            } else {
                unsafe { (self.finalize)(addr as *mut u8) };
            }
        }
        self.finalizable = kept;

        self.eden.reset();
        self.survivors[self.from].reset();
        self.from = to;
        self.minor_collections += 1;

        debug!(
            target: "heap",
            ?reason,
            young_before,
            survivor_used = self.survivors[self.from].used(),
            old_used = self.old.used(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "minor collection"
        );
    }

    /// Forward one value: copy its target out of the evacuation space
    /// if it has not been copied yet, and return the new reference.
    fn forward_value(&mut self, value: Value) -> Value {
        if !value.is_ref() {
            return value;
        }
        let addr = value.ref_bits();
        if !self.in_evacuation_space(addr) {
            return value;
        }
        let ptr = addr as *mut u8;
        // SAFETY: the evacuation space holds valid objects until reset.
        let header = unsafe { &mut *(ptr as *mut Header) };
        if header.object_type() == ObjectType::Forward {
            // SAFETY: the word after a Forward header is the new ref.
            return unsafe { *(ptr.add(8) as *const Value) };
        }

        // SAFETY: content is still intact; size must be taken before
        // the forwarding reference overwrites the first words.
        let size = unsafe { (self.object_size)(ptr) };
        header.increment_age();
        let age = header.age();

        let to = 1 - self.from;
        let dest = if age > self.settings.promote_age {
            self.old.bump(size)
        } else {
            match self.survivors[to].bump(size) {
                Some(dest) => Some(dest),
                None => self.old.bump(size),
            }
        };
        let dest = dest.expect(
            "old space exhausted during scavenge; ensure_space invariant broken",
        );

        // SAFETY: dest has `size` fresh bytes; ranges are disjoint.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, dest, size);
        }
        let forwarded = Value::from_ptr(dest);
        header.set_object_type(ObjectType::Forward);
        // SAFETY: the object is at least 16 bytes (header + one word).
        unsafe {
            *(ptr.add(8) as *mut Value) = forwarded;
        }
        forwarded
    }

    /// Forward all fields of `ptr`; returns true when any field still
    /// refers into the young generation afterwards.
    fn scavenge_fields(&mut self, ptr: *mut u8) -> bool {
        let trace = self.trace;
        let mut any_young = false;
        // SAFETY: ptr is a live object; the visitor rewrites fields to
        // their forwarded locations.
        unsafe {
            trace(ptr, &mut |field: &mut Value| {
                *field = self.forward_value(*field);
                if self.is_young(*field) {
                    any_young = true;
                }
            });
        }
        any_young
    }

    // ── Major collection (mark-compact over old space) ────────────

    /// Sliding mark-compact of the old region. Young objects are
    /// treated as roots and their references into old space are
    /// rewritten; nothing young moves.
    pub fn collect_major(
        &mut self,
        roots: &mut dyn RootProvider,
        reason: CollectReason,
    ) {
        let started = Instant::now();
        let old_before = self.old.used();

        let old_start = self.old.start as u64;
        let old_top = self.old.top as u64;

        fn mark(
            old_start: u64,
            old_top: u64,
            marked: &mut HashSet<u64>,
            work: &mut Vec<u64>,
            v: Value,
        ) {
            if v.is_ref()
                && v.ref_bits() >= old_start
                && v.ref_bits() < old_top
                && marked.insert(v.ref_bits())
            {
                work.push(v.ref_bits());
            }
        }

        // Object layouts are snapshotted up front: once references are
        // rewritten (phase 3) and objects slide (phase 4), sizes that
        // depend on reading a map pointer can no longer be trusted.
        let mut old_layout: Vec<(u64, usize)> = Vec::new();
        let mut cursor = self.old.start;
        while (cursor as u64) < old_top {
            // SAFETY: old space is a dense sequence of intact objects.
            let size = unsafe { (self.object_size)(cursor) };
            old_layout.push((cursor as u64, size));
            cursor = unsafe { cursor.add(size) };
        }
        let mut young_objects: Vec<*mut u8> = Vec::new();
        self.walk_young(|ptr| young_objects.push(ptr));

        // Phase 1: mark old objects reachable from roots, the tracked
        // table, and the young generation.
        let mut marked: HashSet<u64> = HashSet::new();
        let mut work: Vec<u64> = Vec::new();
        let trace = self.trace;

        roots.visit_roots(&mut |slot| {
            mark(old_start, old_top, &mut marked, &mut work, *slot)
        });
        for &value in &self.tracked {
            mark(old_start, old_top, &mut marked, &mut work, value);
        }
        for &ptr in &young_objects {
            // SAFETY: young objects are live and intact.
            unsafe {
                trace(ptr, &mut |field| {
                    mark(old_start, old_top, &mut marked, &mut work, *field)
                })
            };
        }
        while let Some(addr) = work.pop() {
            // SAFETY: marked addresses are live old objects.
            unsafe {
                trace(addr as *mut u8, &mut |field| {
                    mark(old_start, old_top, &mut marked, &mut work, *field)
                })
            };
        }

        // Phase 2: compute sliding forwarding addresses.
        let mut forwarding: HashMap<u64, u64> = HashMap::new();
        let mut new_top = self.old.start;
        for &(addr, size) in &old_layout {
            if marked.contains(&addr) {
                forwarding.insert(addr, new_top as u64);
                // SAFETY: new_top trails the layout cursor.
                new_top = unsafe { new_top.add(size) };
            }
        }

        // Phase 3: rewrite references in roots, the tracked table, the
        // young generation, live old objects, and heap bookkeeping.
        {
            let rewrite = |v: &mut Value| {
                if v.is_ref() {
                    if let Some(&new_addr) = forwarding.get(&v.ref_bits()) {
                        *v = Value::from_ptr(new_addr as *const u8);
                    }
                }
            };

            roots.visit_roots(&mut |slot| rewrite(slot));
            for value in self.tracked.iter_mut() {
                rewrite(value);
            }
            for &ptr in &young_objects {
                // SAFETY: young objects do not move in a major cycle.
                unsafe { trace(ptr, &mut |field| rewrite(field)) };
            }
            for &addr in &marked {
                // SAFETY: still at the old location; fields intact.
                unsafe { trace(addr as *mut u8, &mut |field| rewrite(field)) };
            }

            self.remembered.retain(|v| marked.contains(&v.ref_bits()));
            for value in self.remembered.iter_mut() {
                rewrite(value);
            }

            let finalizable = std::mem::take(&mut self.finalizable);
            let mut kept = Vec::with_capacity(finalizable.len());
            for mut entry in finalizable {
                let addr = entry.ref_bits();
                if addr >= old_start && addr < old_top {
                    if marked.contains(&addr) {
                        rewrite(&mut entry);
                        kept.push(entry);
                    } else {
                        // SAFETY: dead object, memory still readable.
                        unsafe { (self.finalize)(addr as *mut u8) };
                    }
                } else {
                    kept.push(entry);
                }
            }
            self.finalizable = kept;
        }

        // Phase 4: slide marked objects down. Moving in address order
        // keeps every destination at or below its source.
        for &(addr, size) in &old_layout {
            if let Some(&new_addr) = forwarding.get(&addr) {
                if new_addr != addr {
                    // SAFETY: destination trails the source; `copy`
                    // tolerates the potential overlap.
                    unsafe {
                        std::ptr::copy(
                            addr as *const u8,
                            new_addr as *mut u8,
                            size,
                        );
                    }
                }
            }
        }
        self.old.top = new_top;
        self.major_collections += 1;

        debug!(
            target: "heap",
            ?reason,
            old_before,
            old_after = self.old.used(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "major collection"
        );
    }

    /// Visit every object currently in the young generation.
    fn walk_young(&self, mut f: impl FnMut(*mut u8)) {
        for region in [&self.eden, &self.survivors[self.from]] {
            let mut cursor = region.start;
            while cursor < region.top {
                // SAFETY: regions are dense sequences of objects.
                let size = unsafe { (self.object_size)(cursor) };
                f(cursor);
                cursor = unsafe { cursor.add(size) };
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.tracked_live > 0 {
            warn!(
                target: "heap",
                leaked = self.tracked_live,
                "tracked references leaked at heap shutdown"
            );
        }
        // The whole world dies with the heap; release external state.
        let finalizable = std::mem::take(&mut self.finalizable);
        for entry in finalizable {
            // SAFETY: the mapping is still intact here.
            unsafe { (self.finalize)(entry.ref_bits() as *mut u8) };
        }
        unmap_memory(self.base, self.mapped_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::byte_array_allocation_size;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal test object model: `Slots` objects are pairs of two
    /// values, `ByteArray`s are leaves with their length in aux.
    #[repr(C)]
    struct Pair {
        header: Header,
        a: Value,
        b: Value,
    }

    unsafe fn test_trace(obj: *mut u8, visitor: &mut dyn FnMut(&mut Value)) {
        let header = &*(obj as *const Header);
        if header.object_type() == ObjectType::Slots {
            let pair = &mut *(obj as *mut Pair);
            visitor(&mut pair.a);
            visitor(&mut pair.b);
        }
    }

    unsafe fn test_size(obj: *const u8) -> usize {
        let header = &*(obj as *const Header);
        match header.object_type() {
            ObjectType::Slots => size_of::<Pair>(),
            ObjectType::ByteArray => {
                byte_array_allocation_size(header.aux() as usize)
            }
            other => unreachable!("unexpected object type {other:?}"),
        }
    }

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn test_finalize(_obj: *mut u8) {
        FINALIZED.fetch_add(1, Ordering::Relaxed);
    }

    // Tests that assert on finalizer counts get their own counter and
    // finalize hook; the default `FINALIZED` is shared by every heap
    // in this module and tests run in parallel.
    static FINALIZED_ONCE: AtomicUsize = AtomicUsize::new(0);

    unsafe fn finalize_once_counter(_obj: *mut u8) {
        FINALIZED_ONCE.fetch_add(1, Ordering::Relaxed);
    }

    static FINALIZED_MOVED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn finalize_moved_counter(_obj: *mut u8) {
        FINALIZED_MOVED.fetch_add(1, Ordering::Relaxed);
    }

    fn small_heap_with_finalizer(finalize: FinalizeFn) -> Heap {
        let settings = HeapSettings {
            eden_size: 64 << 10,
            survivor_size: 32 << 10,
            old_size: 256 << 10,
            promote_age: 2,
        };
        Heap::new(settings, test_trace, test_size, finalize).unwrap()
    }

    struct NoRoots;
    impl RootProvider for NoRoots {
        fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
    }

    fn small_heap() -> Heap {
        let settings = HeapSettings {
            eden_size: 64 << 10,
            survivor_size: 32 << 10,
            old_size: 256 << 10,
            promote_age: 2,
        };
        Heap::new(settings, test_trace, test_size, test_finalize).unwrap()
    }

    fn alloc_leaf(heap: &mut Heap, fill: u8, len: usize) -> Value {
        let size = byte_array_allocation_size(len);
        heap.ensure_space(size, &mut NoRoots).unwrap();
        let ptr = heap.allocate(ObjectType::ByteArray, size);
        unsafe {
            (ptr.as_ptr() as *mut Header)
                .write(Header::with_aux(ObjectType::ByteArray, len as u32));
            let bytes = ptr.as_ptr().add(16);
            for i in 0..len {
                bytes.add(i).write(fill);
            }
        }
        Value::from_ptr(ptr.as_ptr())
    }

    fn alloc_pair(heap: &mut Heap, a: Value, b: Value) -> Value {
        // a and b must be rooted by the caller across this call.
        let ptr = heap.allocate(ObjectType::Slots, size_of::<Pair>());
        unsafe {
            let pair = ptr.as_ptr() as *mut Pair;
            (*pair).a = a;
            (*pair).b = b;
        }
        Value::from_ptr(ptr.as_ptr())
    }

    unsafe fn leaf_bytes(value: Value) -> Vec<u8> {
        let header = &*(value.ref_bits() as *const Header);
        let len = header.aux() as usize;
        let ptr = (value.ref_bits() as *const u8).add(16);
        core::slice::from_raw_parts(ptr, len).to_vec()
    }

    // ── Tests ──────────────────────────────────────────────────────

    #[test]
    fn allocation_requires_ensure_space() {
        let mut heap = small_heap();
        let v = alloc_leaf(&mut heap, 0x5A, 100);
        assert!(heap.is_young(v));
        assert_eq!(unsafe { leaf_bytes(v) }, vec![0x5A; 100]);
    }

    #[test]
    fn oversized_allocation_fails_cleanly() {
        let mut heap = small_heap();
        let err = heap
            .ensure_space(1 << 30, &mut NoRoots)
            .expect_err("must not fit");
        assert_eq!(err.requested, 1 << 30);
    }

    #[test]
    fn scavenge_preserves_tracked_contents() {
        let mut heap = small_heap();
        let leaf = alloc_leaf(&mut heap, 0x17, 33);
        let handle = heap.track(leaf);
        let before = heap.tracked(&handle);

        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);

        let after = heap.tracked(&handle);
        assert_ne!(before.raw(), after.raw(), "object must have moved");
        assert!(heap.is_young(after));
        assert_eq!(unsafe { leaf_bytes(after) }, vec![0x17; 33]);
        heap.untrack(handle);
    }

    #[test]
    fn scavenge_follows_object_graphs() {
        let mut heap = small_heap();
        let leaf = alloc_leaf(&mut heap, 0x44, 8);
        let leaf_handle = heap.track(leaf);
        heap.ensure_space(size_of::<Pair>(), &mut NoRoots).unwrap();
        let leaf = heap.tracked(&leaf_handle);
        let pair = alloc_pair(&mut heap, leaf, Value::from_i64(7));
        let pair_handle = heap.track(pair);
        heap.untrack(leaf_handle);

        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);

        let pair = heap.tracked(&pair_handle);
        let (a, b) = unsafe {
            let p = &*(pair.ref_bits() as *const Pair);
            (p.a, p.b)
        };
        assert!(a.is_ref());
        assert_eq!(unsafe { leaf_bytes(a) }, vec![0x44; 8]);
        assert_eq!(unsafe { b.to_i64() }, 7);
        heap.untrack(pair_handle);
    }

    #[test]
    fn unreachable_objects_are_dropped() {
        let mut heap = small_heap();
        let _garbage = alloc_leaf(&mut heap, 0xFF, 1000);
        let keep = alloc_leaf(&mut heap, 0x01, 10);
        let handle = heap.track(keep);

        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);

        // Only the tracked leaf survives in the survivor space.
        let survivor_used = heap.survivors[heap.from].used();
        assert_eq!(survivor_used, byte_array_allocation_size(10));
        heap.untrack(handle);
    }

    #[test]
    fn objects_promote_after_age_threshold() {
        let mut heap = small_heap();
        let leaf = alloc_leaf(&mut heap, 0x2B, 24);
        let handle = heap.track(leaf);

        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        assert!(heap.is_young(heap.tracked(&handle)));
        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        assert!(heap.is_young(heap.tracked(&handle)));
        // Third scavenge pushes the age past the threshold of 2.
        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        let promoted = heap.tracked(&handle);
        assert!(heap.in_old(promoted));
        assert_eq!(unsafe { leaf_bytes(promoted) }, vec![0x2B; 24]);
        heap.untrack(handle);
    }

    #[test]
    fn write_barrier_keeps_young_store_alive() {
        let mut heap = small_heap();
        // Build a pair and promote it to old space.
        heap.ensure_space(size_of::<Pair>(), &mut NoRoots).unwrap();
        let pair =
            alloc_pair(&mut heap, Value::from_i64(0), Value::from_i64(0));
        let pair_handle = heap.track(pair);
        for _ in 0..3 {
            heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        }
        let pair = heap.tracked(&pair_handle);
        assert!(heap.in_old(pair));

        // Store a fresh young leaf into the old pair.
        let leaf = alloc_leaf(&mut heap, 0x77, 12);
        unsafe {
            (*(pair.ref_bits() as *mut Pair)).a = leaf;
        }
        heap.write_barrier(pair, leaf);

        // The leaf has no other root; the barrier alone must keep it.
        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);

        let pair = heap.tracked(&pair_handle);
        let a = unsafe { (*(pair.ref_bits() as *const Pair)).a };
        assert!(a.is_ref());
        assert_eq!(unsafe { leaf_bytes(a) }, vec![0x77; 12]);
        heap.untrack(pair_handle);
    }

    #[test]
    fn finalizer_runs_exactly_once() {
        let mut heap = small_heap_with_finalizer(finalize_once_counter);
        let doomed = alloc_leaf(&mut heap, 0x00, 4);
        unsafe {
            (*(doomed.ref_bits() as *mut Header))
                .add_flag(HeaderFlags::FINALIZE);
        }
        heap.register_finalizable(doomed);

        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        assert_eq!(FINALIZED_ONCE.load(Ordering::Relaxed), 1);
        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        assert_eq!(FINALIZED_ONCE.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn finalizable_survivor_is_tracked_through_moves() {
        let mut heap = small_heap_with_finalizer(finalize_moved_counter);
        let leaf = alloc_leaf(&mut heap, 0x09, 4);
        unsafe {
            (*(leaf.ref_bits() as *mut Header))
                .add_flag(HeaderFlags::FINALIZE);
        }
        heap.register_finalizable(leaf);
        let handle = heap.track(leaf);

        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        assert_eq!(FINALIZED_MOVED.load(Ordering::Relaxed), 0);
        assert_eq!(
            heap.finalizable[0].raw(),
            heap.tracked(&handle).raw(),
            "finalizable entry must follow the moved object"
        );

        heap.untrack(handle);
        heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        assert_eq!(FINALIZED_MOVED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn major_collection_compacts_old_space() {
        let mut heap = small_heap();

        // Promote one keeper and a batch of garbage into old space.
        let keep = alloc_leaf(&mut heap, 0x33, 40);
        let keep_handle = heap.track(keep);
        let mut garbage_handles = Vec::new();
        for _ in 0..8 {
            let g = alloc_leaf(&mut heap, 0xEE, 512);
            garbage_handles.push(heap.track(g));
        }
        for _ in 0..3 {
            heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        }
        assert!(heap.in_old(heap.tracked(&keep_handle)));
        for handle in garbage_handles {
            heap.untrack(handle);
        }

        let old_before = heap.old.used();
        heap.collect_major(&mut NoRoots, CollectReason::EXPLICIT);
        let old_after = heap.old.used();

        assert!(old_after < old_before, "compaction must reclaim space");
        let keep = heap.tracked(&keep_handle);
        assert!(heap.in_old(keep));
        assert_eq!(unsafe { leaf_bytes(keep) }, vec![0x33; 40]);
        heap.untrack(keep_handle);
    }

    #[test]
    fn major_collection_rewrites_young_to_old_edges() {
        let mut heap = small_heap();

        // Garbage first so it lands below the keeper in old space and
        // compaction has to slide the keeper down.
        let garbage = alloc_leaf(&mut heap, 0xAA, 2048);
        let garbage_handle = heap.track(garbage);
        let keep = alloc_leaf(&mut heap, 0x66, 16);
        let keep_handle = heap.track(keep);
        for _ in 0..3 {
            heap.collect_minor(&mut NoRoots, CollectReason::EXPLICIT);
        }
        heap.untrack(garbage_handle);

        heap.ensure_space(size_of::<Pair>(), &mut NoRoots).unwrap();
        let keep = heap.tracked(&keep_handle);
        let pair = alloc_pair(&mut heap, keep, Value::from_i64(1));
        let pair_handle = heap.track(pair);
        heap.untrack(keep_handle);

        heap.collect_major(&mut NoRoots, CollectReason::EXPLICIT);

        let pair = heap.tracked(&pair_handle);
        let a = unsafe { (*(pair.ref_bits() as *const Pair)).a };
        assert!(heap.in_old(a));
        assert_eq!(unsafe { leaf_bytes(a) }, vec![0x66; 16]);
        heap.untrack(pair_handle);
    }

    #[test]
    fn tracked_slots_are_reused() {
        let mut heap = small_heap();
        let a = alloc_leaf(&mut heap, 1, 1);
        let h1 = heap.track(a);
        assert_eq!(heap.live_tracked(), 1);
        heap.untrack(h1);
        assert_eq!(heap.live_tracked(), 0);
        let b = alloc_leaf(&mut heap, 2, 1);
        let h2 = heap.track(b);
        assert_eq!(heap.live_tracked(), 1);
        heap.untrack(h2);
    }

    #[test]
    fn gc_stress_loop_preserves_long_lived_object() {
        let mut heap = small_heap();
        let keeper = alloc_leaf(&mut heap, 0x42, 64);
        let handle = heap.track(keeper);

        for i in 0..10_000u32 {
            let _short_lived =
                alloc_leaf(&mut heap, (i & 0xFF) as u8, 48);
        }

        let keeper = heap.tracked(&handle);
        assert_eq!(unsafe { leaf_bytes(keeper) }, vec![0x42; 64]);
        assert!(heap.minor_collections() > 0, "stress must trigger GC");
        heap.untrack(handle);
    }
}
