// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Counter-based mutual exclusion for the shared cipher engine.
//!
//! This is not a blocking mutex. The cipher and the neighbor table are
//! touched from both the cooperative post-processing worker and from radio
//! ISR context; per §5 and §9 the two never preempt each other, but a
//! *reentrant* call on the same logical path (e.g. the post-processing
//! worker already mid-encrypt when an ISR's code path tries to use the same
//! cipher instance) must fail closed rather than spin or block, since
//! there is nothing to yield to on a single core.

use core::sync::atomic::{AtomicBool, Ordering};

/// A non-blocking, fail-closed exclusion lock.
///
/// `try_acquire` either returns a guard or `None`; there is no blocking
/// variant. Dropping the guard releases the lock.
pub struct CipherLock {
    held: AtomicBool,
}

impl CipherLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Attempt to acquire the lock without blocking.
    ///
    /// Returns `None` immediately on contention — the caller (typically an
    /// ISR-path framer or strobe step) must drop the frame it was
    /// processing rather than wait, per §4.5.5 ("table/key mutex held on
    /// ISR path: drop, do not block").
    pub fn try_acquire(&self) -> Option<CipherGuard<'_>> {
        let acquired = self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|()| CipherGuard { lock: self });
        if acquired.is_none() {
            log::warn!("cipher lock contended, dropping caller rather than blocking");
        }
        acquired
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl Default for CipherLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard released on drop.
pub struct CipherGuard<'a> {
    lock: &'a CipherLock,
}

impl Drop for CipherGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
