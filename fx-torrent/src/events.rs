use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use crate::{stats::DownloadStatus, stream::StreamState, torrent::TorrentState};

// Events published by a torrent to its listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {

    StateChanged { old: TorrentState, new: TorrentState },

    // Published every status interval.
    DownloadStatus(DownloadStatus),

    // A piece passed verification, published once per piece.
    PieceFinished(usize),

    Error(String),

}

// Events published by a stream to its listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {

    StateChanged { old: StreamState, new: StreamState },

    // Preparation pieces are verified and reads can start.
    Ready,

    Error(String),

}

// Returned on subscribe, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

impl std::fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "callback#{}", self.0)
    }
}

// Unique across all registries so a handle can never remove someone else's listener.
static NEXT_CALLBACK: AtomicU64 = AtomicU64::new(1);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

// Registry of listeners, a panicking listener is logged and skipped.
pub struct Callbacks<E> {
    callbacks: Mutex<Vec<(CallbackHandle, Callback<E>)>>,
}

impl<E> Callbacks<E> {

    pub fn new() -> Self {
        Self { callbacks: Mutex::new(Vec::new()) }
    }

    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> CallbackHandle {
        let handle = CallbackHandle(NEXT_CALLBACK.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, Arc::new(callback)));
        handle
    }

    // Returns false if the handle wasn't registered here.
    pub fn remove(&self, handle: CallbackHandle) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        let len = callbacks.len();
        callbacks.retain(|(h, _)| *h != handle);
        callbacks.len() != len
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Listeners run outside the lock so they may subscribe or unsubscribe.
    pub fn invoke(&self, event: &E) {
        let callbacks: Vec<(CallbackHandle, Callback<E>)> = self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (handle, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!("listener {} panicked", handle);
            }
        }
    }
}

impl<E> Default for Callbacks<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Callbacks<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use super::*;

    #[test]
    fn test_invoke_and_remove() {
        let callbacks: Callbacks<usize> = Callbacks::new();
        let sum = Arc::new(AtomicUsize::new(0));
        let s = sum.clone();
        let handle = callbacks.add(move |n| { s.fetch_add(*n, Ordering::SeqCst); });

        callbacks.invoke(&3);
        assert_eq!(sum.load(Ordering::SeqCst), 3);

        assert!(callbacks.remove(handle));
        assert!(!callbacks.remove(handle));
        callbacks.invoke(&3);
        assert_eq!(sum.load(Ordering::SeqCst), 3);
        assert!(callbacks.is_empty());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let callbacks: Callbacks<TorrentEvent> = Callbacks::new();
        let calls = Arc::new(AtomicUsize::new(0));
        callbacks.add(|_| panic!("listener failure"));
        let c = calls.clone();
        callbacks.add(move |_| { c.fetch_add(1, Ordering::SeqCst); });

        callbacks.invoke(&TorrentEvent::PieceFinished(0));
        callbacks.invoke(&TorrentEvent::PieceFinished(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(callbacks.len(), 2);
    }
}
