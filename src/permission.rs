use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures::future::{self, BoxFuture, FutureExt};

/// Asks the platform for sensor access. Called once per session start.
pub trait PermissionGate: Send + Sync {
    fn check_and_request(&self) -> BoxFuture<'_, bool>;
}

/// Gate with a fixed answer that can be flipped at runtime
#[derive(Debug)]
pub struct StaticPermissionGate {
    granted: AtomicBool,
    requests: AtomicU32,
}

impl StaticPermissionGate {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            requests: AtomicU32::new(0),
        }
    }

    pub fn denying() -> Self {
        Self::new(false)
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    /// How many times the gate has been asked
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PermissionGate for StaticPermissionGate {
    fn check_and_request(&self) -> BoxFuture<'_, bool> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        future::ready(self.granted.load(Ordering::SeqCst)).boxed()
    }
}
