//! Callback user-data routing.
//!
//! The engine wants a `void*` with every registered callback and hands it
//! back on each invocation. Instead of aliasing an object address with a
//! pointer whose lifetime is implicit, the worker hands out small integer
//! ids and keeps this side table from id to `(document, view)`. The
//! trampolines resolve the id on every event and drop the event when the
//! target is gone; ids are never reused within a process lifetime.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError, Weak};

use crate::document::Document;

/// The pseudo view id used for document-global callbacks and broadcast
/// queue entries.
pub const BROADCAST_VIEW_ID: i32 = -1;

/// An opaque identifier handed to the engine as callback user-data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Encodes the id as an engine user-data pointer.
    #[must_use]
    pub fn as_user_data(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }

    /// Recovers the id from an engine user-data pointer.
    #[must_use]
    pub fn from_user_data(data: *mut c_void) -> Self {
        Self(data as usize as u64)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// What a callback id resolves to.
#[derive(Clone)]
pub struct CallbackTarget {
    /// The owning document; upgraded per event.
    pub document: Weak<Document>,
    /// The view the callback is scoped to, or [`BROADCAST_VIEW_ID`].
    pub view_id: i32,
}

/// The process-wide id table.
#[derive(Default)]
pub struct Router {
    targets: Mutex<HashMap<u64, CallbackTarget>>,
    next: AtomicU64,
}

/// Returns the process-wide router.
pub fn router() -> &'static Router {
    static ROUTER: OnceLock<Router> = OnceLock::new();
    ROUTER.get_or_init(Router::default)
}

impl Router {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CallbackTarget>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a target and returns its id. Ids start at 1 so the
    /// engine never sees a null user-data pointer.
    pub fn register(&self, target: CallbackTarget) -> CallbackId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, target);
        CallbackId(id)
    }

    /// Removes a target; unknown ids are ignored.
    pub fn unregister(&self, id: CallbackId) {
        self.lock().remove(&id.0);
    }

    /// Looks up the target for an id, if it is still registered.
    #[must_use]
    pub fn resolve(&self, id: CallbackId) -> Option<CallbackTarget> {
        self.lock().get(&id.0).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolve_unregister() {
        let router = Router::default();
        let id = router.register(CallbackTarget {
            document: Weak::new(),
            view_id: 3,
        });
        let target = router.resolve(id).expect("registered target");
        assert_eq!(target.view_id, 3);

        router.unregister(id);
        assert!(router.resolve(id).is_none());
        // Unregistering again is harmless.
        router.unregister(id);
    }

    #[test]
    fn test_dead_document_resolves_to_no_upgrade() {
        let router = Router::default();
        let id = router.register(CallbackTarget {
            document: Weak::new(),
            view_id: BROADCAST_VIEW_ID,
        });
        let target = router.resolve(id).expect("registered target");
        assert!(target.document.upgrade().is_none());
    }

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let router = Router::default();
        let first = router.register(CallbackTarget {
            document: Weak::new(),
            view_id: 0,
        });
        let second = router.register(CallbackTarget {
            document: Weak::new(),
            view_id: 1,
        });
        assert_ne!(first, second);
        assert!(!first.as_user_data().is_null());
    }

    #[test]
    fn test_user_data_round_trip() {
        let router = Router::default();
        let id = router.register(CallbackTarget {
            document: Weak::new(),
            view_id: 9,
        });
        let raw = id.as_user_data();
        assert_eq!(CallbackId::from_user_data(raw), id);
    }
}
