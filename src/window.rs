//! Lifecycle of the per-node shared-memory window used to stage
//! node-local gather results.
//!
//! One window serves the node-local group for its whole lifetime: it is
//! allocated on first use, reused while large enough, reallocated
//! (fence, free, allocate) when a call needs more room, and freed
//! exactly once at shutdown. Freeing is collective and fenced by the
//! backend; *when* it is safe to free is the caller's phase-sequencing
//! contract, not something this manager can enforce.

use tracing::debug;

use crate::backend::{CommContext, CommScope, WindowHandle, WindowRegion};
use crate::error::{QuorumError, Result};
use crate::types::Rank;

struct ActiveWindow {
    handle: WindowHandle,
    /// Total staging capacity in bytes across the node-local group.
    capacity: usize,
}

#[derive(Default)]
pub struct SharedWindowManager {
    window: Option<ActiveWindow>,
}

impl SharedWindowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of the live window, if one is allocated.
    pub fn handle(&self) -> Option<WindowHandle> {
        self.window.as_ref().map(|w| w.handle)
    }

    /// Make sure a window with at least `total_bytes` of staging
    /// capacity exists on `scope`, allocating or growing as needed.
    ///
    /// Collective over `scope`: every member must call with the same
    /// `total_bytes` in the same call sequence. Node-local rank 0
    /// contributes the whole region; other ranks contribute zero bytes,
    /// so the staged data lives in one contiguous rank-0 region that
    /// every sibling can read.
    pub fn ensure(
        &mut self,
        ctx: &CommContext,
        scope: CommScope,
        total_bytes: usize,
        element_size: usize,
        local_rank: Rank,
    ) -> Result<WindowHandle> {
        if let Some(active) = &self.window {
            if active.capacity >= total_bytes {
                return Ok(active.handle);
            }
            // Too small: fence out readers, release, fall through to a
            // fresh allocation.
            debug!(
                old = active.capacity,
                needed = total_bytes,
                "shared window too small, reallocating"
            );
            ctx.free_shared_window(active.handle, scope)?;
            self.window = None;
        }

        let my_bytes = if local_rank == 0 { total_bytes } else { 0 };
        let handle = ctx.allocate_shared_window(my_bytes, element_size, scope)?;
        debug!(capacity = total_bytes, "shared window allocated");
        self.window = Some(ActiveWindow {
            handle,
            capacity: total_bytes,
        });
        Ok(handle)
    }

    /// Region of `rank` within the live window. Must come after
    /// `ensure` and before any use of the region.
    pub fn query(&self, ctx: &CommContext, rank: Rank) -> Result<WindowRegion> {
        let active = self.window.as_ref().ok_or(QuorumError::WindowNotAllocated)?;
        ctx.query_shared_window(active.handle, rank)
    }

    /// Release the window at node-local group shutdown. Collective over
    /// `scope`; the backend fences before freeing. Idempotent: a second
    /// call is a no-op, so the window is freed exactly once.
    pub fn shutdown(&mut self, ctx: &CommContext, scope: CommScope) -> Result<()> {
        if let Some(active) = self.window.take() {
            debug!(capacity = active.capacity, "shared window freed");
            ctx.free_shared_window(active.handle, scope)?;
        }
        Ok(())
    }
}
