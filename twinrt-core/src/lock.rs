//! Reentrant lock keyed by causal-chain token
//!
//! Unlike a thread-recursive mutex, ownership belongs to a logical request
//! ([`RequestId`]) rather than a thread or task. A request that already holds
//! the lock may acquire it again without blocking, which lets a message
//! cycle pass through the same actor several times within one chain. Any
//! other request waits until the holder's depth returns to zero.
//!
//! Nesting is capped: once a chain is `max_stack_depth` deep, further
//! acquisitions fail immediately with [`LockError::MaxStackDepthExceeded`].

use crate::config::DEFAULT_MAX_STACK_DEPTH;
use crate::error::LockError;
use crate::types::RequestId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct ActiveRequest {
    request: Option<RequestId>,
    depth: usize,
    permit: Option<OwnedSemaphorePermit>,
}

/// Mutual exclusion that is reentrant for one request id
#[derive(Debug)]
pub struct ReEntryLock {
    permits: Arc<Semaphore>,
    active: Mutex<ActiveRequest>,
    max_stack_depth: usize,
}

impl ReEntryLock {
    /// Create a lock. A zero depth falls back to the default of 12.
    pub fn new(max_stack_depth: usize) -> Self {
        let max_stack_depth = if max_stack_depth == 0 {
            DEFAULT_MAX_STACK_DEPTH
        } else {
            max_stack_depth
        };

        Self {
            permits: Arc::new(Semaphore::new(1)),
            active: Mutex::new(ActiveRequest::default()),
            max_stack_depth,
        }
    }

    /// Acquire the lock on behalf of `request`.
    ///
    /// Re-acquisition by the active request never blocks; it only deepens
    /// the stack. The returned guard releases one level when dropped.
    pub async fn lock(&self, request: &RequestId) -> Result<ReEntryGuard<'_>, LockError> {
        if let Some(guard) = self.try_reenter(request)? {
            return Ok(guard);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LockError::Closed)?;

        let mut active = self.active.lock();
        active.request = Some(request.clone());
        active.depth = 1;
        active.permit = Some(permit);
        tracing::trace!(request_id = %request, "reentry lock acquired");

        Ok(ReEntryGuard { lock: self })
    }

    /// Nest one level deeper if `request` is the active holder.
    ///
    /// Returns `Ok(None)` when some other request (or nobody) holds the lock.
    pub fn try_reenter(&self, request: &RequestId) -> Result<Option<ReEntryGuard<'_>>, LockError> {
        let mut active = self.active.lock();
        if active.request.as_ref() != Some(request) {
            return Ok(None);
        }

        if active.depth >= self.max_stack_depth {
            return Err(LockError::MaxStackDepthExceeded {
                max: self.max_stack_depth,
            });
        }

        active.depth += 1;
        Ok(Some(ReEntryGuard { lock: self }))
    }

    /// Current nesting depth (0 when free)
    pub fn depth(&self) -> usize {
        self.active.lock().depth
    }

    /// The request currently holding the lock
    pub fn active_request(&self) -> Option<RequestId> {
        self.active.lock().request.clone()
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    fn release(&self) {
        let permit = {
            let mut active = self.active.lock();
            active.depth = active.depth.saturating_sub(1);
            if active.depth == 0 {
                active.request = None;
                active.permit.take()
            } else {
                None
            }
        };

        // Released outside the state mutex so a waiter can record itself.
        drop(permit);
    }
}

impl Default for ReEntryLock {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STACK_DEPTH)
    }
}

/// One level of ownership of a [`ReEntryLock`]
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ReEntryGuard<'a> {
    lock: &'a ReEntryLock,
}

impl ReEntryGuard<'_> {
    /// Release this level explicitly
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for ReEntryGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
