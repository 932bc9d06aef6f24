//! The task processor: worker threads, run queue and overload control.

// Used wherever we rely on SmallVec to store entries on stack first.
// Prevent most heap allocations. Threads have 2 MB stack size by default and so
// far the largest thing we store here is a 16 byte (task, epoch) pair.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

mod builder;
pub use builder::Builder;

mod counter;
pub use counter::ProcessorStats;

mod processor;
pub use processor::TaskProcessor;

mod queue;

mod settings;
pub use settings::{OverloadAction, ProcessorSettings};

pub(crate) mod shared;

pub(crate) mod spawn;
pub use spawn::{SpawnBuilder, spawn, spawn_builder, spawn_critical};

mod ticker;

mod worker;

#[cfg(test)]
mod tests;
