pub mod async_queue;
pub mod sorted_map;
pub mod sorted_set;

pub use async_queue::{
    deferred, AsyncQueue, DelayedOperation, Deferred, ManualDriver, Pending, QueueRunner, TimerId,
};
pub use sorted_map::SortedMap;
pub use sorted_set::SortedSet;
