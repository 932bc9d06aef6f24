use std::any::Any;
use std::fmt;

/// Makes a `Send` value `Sync` by only ever handing out `&mut` access to it.
///
/// Used to carry panic payloads (`Box<dyn Any + Send>`) inside error types
/// that must be `Send + Sync` to flow through `anyhow`.
pub(crate) struct SyncWrapper<T> {
    value: T,
}

// Safety: no `&T` is ever produced, so sharing `&SyncWrapper<T>` across
// threads cannot expose `T` to concurrent access.
unsafe impl<T: Send> Sync for SyncWrapper<T> {}

impl<T> SyncWrapper<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { value }
    }

    pub(crate) fn into_inner(self) -> T {
        self.value
    }
}

impl SyncWrapper<Box<dyn Any + Send>> {
    /// Best effort extraction of a panic message.
    pub(crate) fn panic_message(&mut self) -> Option<&str> {
        let payload = &mut self.value;
        if let Some(s) = payload.downcast_mut::<&'static str>() {
            return Some(s);
        }
        payload.downcast_mut::<String>().map(|s| s.as_str())
    }
}

impl<T> fmt::Debug for SyncWrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncWrapper").finish_non_exhaustive()
    }
}
