mod heap;
mod system;

pub use heap::{
    AllocationError, CollectReason, FinalizeFn, Heap, HeapSettings,
    RootProvider, SizeFn, TraceFn, TrackedRef,
};
pub use system::{map_memory, round_to_pages, unmap_memory, OS_PAGE_SIZE};
