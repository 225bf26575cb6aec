pub mod frame;
pub mod pool;

pub use frame::{Buffer, BufferFlags, BufferOrigin, ClientHandle, Plane, PlaneData};
pub use pool::{Allocator, BufferPool, EntryState, MmapAllocator, PoolCensus, SlotId};
