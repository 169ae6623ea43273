//! Editor session: one open resource at a time
//!
//! Switching resources never reuses a controller. The old controller gets a
//! best-effort `Switch` flush and is detached; a fresh one is spawned for the
//! new resource with its acknowledged fingerprint seeded from the loaded
//! snapshot. Timers belong to the controller that armed them, so none can
//! fire against the new resource.

use crate::remote::SnapshotSource;
use crate::save_controller::{SaveEnvironment, SaveHandle};
use crate::save_state::FlushTrigger;
use crate::types::ResourceId;
use ferry_resilience::SyncError;
use std::sync::Arc;

/// Owns the controller of the currently open resource
#[derive(Debug)]
pub struct EditorSession {
    env: SaveEnvironment,
    current: Option<SaveHandle>,
}

impl EditorSession {
    /// Session with nothing open
    #[must_use]
    pub fn new(env: SaveEnvironment) -> Self {
        Self { env, current: None }
    }

    /// Open `resource`, flushing and detaching whatever was open
    ///
    /// Returns the handle of the new controller; the previous one keeps
    /// running until its flush settles.
    ///
    /// # Errors
    /// `SyncError::Validation` if the new snapshot cannot be serialized; the
    /// previous resource is still flushed and detached in that case
    pub fn open(
        &mut self,
        resource: ResourceId,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<SaveHandle, SyncError> {
        if let Some(previous) = self.current.take() {
            tracing::debug!(from = %previous.resource_id(), to = %resource, "switching resource");
            previous.flush(FlushTrigger::Switch);
            previous.detach();
        }

        let handle = SaveHandle::spawn(resource, source, self.env.clone())?;
        self.current = Some(handle.clone());
        Ok(handle)
    }

    /// Handle of the open resource
    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<&SaveHandle> {
        self.current.as_ref()
    }

    /// Tear down the open controller
    ///
    /// Returns the detached handle so the caller can await
    /// [`SaveHandle::finished`].
    pub fn close(&mut self) -> Option<SaveHandle> {
        let handle = self.current.take()?;
        handle.teardown();
        Some(handle)
    }

    /// Environment shared by this session's controllers
    #[inline]
    #[must_use]
    pub fn environment(&self) -> &SaveEnvironment {
        &self.env
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.teardown();
        }
    }
}
