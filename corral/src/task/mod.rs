//! Tasks: the unit of concurrent work of a [`TaskProcessor`].
//!
//! [`TaskProcessor`]: crate::runtime::TaskProcessor

mod cancel;
pub use self::cancel::{CancellationReason, CancellationToken, TaskCancellationBlocker};

pub(crate) mod context;

pub mod current;

mod handle;
pub use self::handle::TaskWithResult;

pub mod id;
pub use self::id::Id;

mod local;
pub use self::local::TaskLocal;

pub(crate) mod payload;

pub(crate) mod sleep_state;

mod state;
pub use self::state::{Importance, TaskState};

#[cfg(test)]
mod tests;
