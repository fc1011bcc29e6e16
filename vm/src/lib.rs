pub mod activation;
pub mod alloc;
pub mod completion;
pub mod driver;
pub mod interpreter;
pub mod primitives;
pub mod world;

use std::collections::HashMap;
use std::rc::Rc;

use heap::{AllocationError, Heap, HeapSettings, RootProvider};
use object::{
    ActivationObject, ByteArray, Header, Map, ObjectType, Slot, SlotsObject,
    Value, WellKnown,
};

use crate::activation::ActivationStack;
use crate::completion::Completion;
use crate::primitives::PrimitiveDesc;

/// The evaluator's result type: a [`Completion`] for everything the
/// language can observe, or an [`AllocationError`] that aborts the
/// script.
pub type EvalResult = Result<Completion, AllocationError>;

/// The virtual machine: the heap plus all mutator-side state.
///
/// `heap` and `world` are separate fields so that collection entry
/// points can borrow the heap mutably while handing `world` over as
/// the [`RootProvider`].
pub struct Vm {
    pub heap: Heap,
    pub world: WorldState,
}

/// Everything the collector must see as roots, plus the primitive
/// registry.
pub struct WorldState {
    pub well_known: WellKnown,
    /// Interned selector and string names: Rust string → byte array.
    pub interner: HashMap<String, Value, ahash::RandomState>,
    pub activations: ActivationStack,
    /// Rooted evaluator temporaries (receivers and arguments mid-send).
    pub scratch: Vec<Value>,
    pub primitives: Vec<PrimitiveDesc>,
    pub primitive_index: HashMap<&'static str, usize, ahash::RandomState>,
}

impl RootProvider for WorldState {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.well_known.visit(visitor);
        for value in self.interner.values_mut() {
            visitor(value);
        }
        self.activations.visit(visitor);
        for value in self.scratch.iter_mut() {
            visitor(value);
        }
    }
}

#[derive(Debug)]
pub enum VmInitError {
    Heap(&'static str),
    Allocation(AllocationError),
}

impl std::fmt::Display for VmInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmInitError::Heap(msg) => write!(f, "heap setup failed: {msg}"),
            VmInitError::Allocation(err) => write!(f, "bootstrap failed: {err}"),
        }
    }
}

impl std::error::Error for VmInitError {}

impl Vm {
    /// Create a heap and bootstrap the world: the map-of-maps, `nil`,
    /// `true`, `false`, the integer and float traits with their
    /// primitive-backed methods, and the empty lobby.
    pub fn new(settings: HeapSettings) -> Result<Self, VmInitError> {
        let heap = Heap::new(settings, trace_object, object_size, finalize_object)
            .map_err(VmInitError::Heap)?;
        let primitives = primitives::default_primitives();
        let primitive_index = primitives::registry_index(&primitives);
        let mut vm = Self {
            heap,
            world: WorldState {
                well_known: WellKnown::empty(),
                interner: HashMap::default(),
                activations: ActivationStack::new(),
                scratch: Vec::new(),
                primitives,
                primitive_index,
            },
        };
        world::prepare_world(&mut vm).map_err(VmInitError::Allocation)?;
        Ok(vm)
    }

    /// The root object of the world.
    pub fn lobby(&self) -> Value {
        self.world.well_known.lobby
    }

    /// Intern `name` as a byte array; repeated calls return the same
    /// object.
    pub fn intern(&mut self, name: &str) -> Result<Value, AllocationError> {
        if let Some(&value) = self.world.interner.get(name) {
            return Ok(value);
        }
        let Vm { heap, world } = self;
        let size = object::byte_array_allocation_size(name.len());
        heap.ensure_space(size, world)?;
        let map = world.well_known.byte_array_map;
        // SAFETY: space ensured; the shared byte-array map is valid.
        let value = unsafe { alloc::alloc_byte_array(heap, map, name.as_bytes()) };
        world.interner.insert(name.to_string(), value);
        Ok(value)
    }

    /// File name of the code currently executing, for error reports.
    pub fn current_file(&self) -> Rc<str> {
        self.world
            .activations
            .top()
            .map(|frame| Rc::clone(&frame.file))
            .unwrap_or_else(|| Rc::from("<vm>"))
    }

    /// The current `self`: the top activation's receiver.
    pub fn current_self(&self) -> Value {
        self.world
            .activations
            .top()
            .map(|frame| frame.receiver)
            .unwrap_or(self.world.well_known.lobby)
    }
}

// ── Object tracing for the collector ──────────────────────────────────

/// If `ptr` points at an already-moved object, return the forwarding
/// destination stored after its header; otherwise `ptr` itself.
///
/// Needed while scanning: a slots object's size depends on its map,
/// and the map may have been moved (and its old first words
/// overwritten) before the slots object is reached.
///
/// # Safety
///
/// `ptr` must point at memory holding a valid [`Header`].
unsafe fn resolve_forwarded(ptr: *const u8) -> *const u8 {
    let header = &*(ptr as *const Header);
    if header.object_type() == ObjectType::Forward {
        (*(ptr.add(8) as *const Value)).ref_bits() as *const u8
    } else {
        ptr
    }
}

/// Trace all `Value` edges of a heap object for the collector.
///
/// Counts derived from a field are always read *before* the visitor
/// rewrites that field: during reference rewriting the new location
/// may not hold the object yet.
///
/// # Safety
///
/// `obj` must point to a valid heap object with a valid [`Header`].
pub unsafe fn trace_object(obj: *mut u8, visitor: &mut dyn FnMut(&mut Value)) {
    let header = &*(obj as *const Header);
    match header.object_type() {
        ObjectType::Slots | ObjectType::Method | ObjectType::Block => {
            let so = &mut *(obj as *mut SlotsObject);
            let count = if so.map.is_ref() {
                let map = resolve_forwarded(so.map.ref_bits() as *const u8)
                    as *const Map;
                (*map).assignable_slot_count() as usize
            } else {
                0
            };
            visitor(&mut so.map);
            let values = (obj as *mut Value).add(2);
            for i in 0..count {
                visitor(&mut *values.add(i));
            }
        }
        ObjectType::Map => {
            let map = &mut *(obj as *mut Map);
            let count = map.slot_count() as usize;
            visitor(&mut map.map);
            let slots = (obj as *mut Map).add(1) as *mut Slot;
            for i in 0..count {
                let slot = &mut *slots.add(i);
                visitor(&mut slot.name);
                // Mutable slots store a fixnum index here; the visitor
                // ignores non-references.
                visitor(&mut slot.value);
            }
        }
        ObjectType::ByteArray => {
            visitor(&mut (*(obj as *mut ByteArray)).map);
        }
        ObjectType::Activation => {
            let act = &mut *(obj as *mut ActivationObject);
            visitor(&mut act.map);
            visitor(&mut act.receiver);
        }
        ObjectType::Forward => {}
    }
}

/// Total byte size of a heap object, matching the allocation sizes.
///
/// # Safety
///
/// `obj` must point to a valid heap object whose first payload word is
/// intact (not yet overwritten by a forwarding reference).
pub unsafe fn object_size(obj: *const u8) -> usize {
    let header = &*(obj as *const Header);
    match header.object_type() {
        ObjectType::Slots | ObjectType::Method | ObjectType::Block => {
            let so = &*(obj as *const SlotsObject);
            let map =
                resolve_forwarded(so.map.ref_bits() as *const u8) as *const Map;
            object::slots_object_allocation_size(
                (*map).assignable_slot_count() as usize,
            )
        }
        ObjectType::Map => {
            object::map_allocation_size((*(obj as *const Map)).slot_count())
        }
        ObjectType::ByteArray => {
            object::byte_array_allocation_size(header.aux() as usize)
        }
        ObjectType::Activation => size_of::<ActivationObject>(),
        ObjectType::Forward => {
            unreachable!("size taken after forwarding reference was written")
        }
    }
}

/// Release the heap-external state of a dying object: a method or
/// block map drops its owned statements.
///
/// # Safety
///
/// `obj` points at the dead object's still-readable memory.
pub unsafe fn finalize_object(obj: *mut u8) {
    let header = &*(obj as *const Header);
    if header.object_type() == ObjectType::Map {
        (*(obj as *mut Map)).release_code();
    }
}
