//! Out-of-band control of a running engine: [`EngineHandle::stop`]

use tokio::sync::mpsc::Sender;

/// Control messages sent out-of-band to a running engine's event loop.
pub(crate) enum Control {
    /// Stop the loop at the next iteration boundary and reset its working set.
    Stop,
}

/// A handle to a spawned or running engine's event loop.
///
/// Dropping the handle also stops the loop: [`stop`](EngineHandle::stop) is
/// best-effort and non-blocking, so it is safe to call from any context,
/// including a signal handler or a `Drop` impl of your own.
pub struct EngineHandle {
    pub(crate) control: Sender<Control>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish()
    }
}

impl EngineHandle {
    /// Signal the engine to stop. Returns immediately; the loop exits at its
    /// next iteration boundary and abandons any outstanding send/confirm
    /// handles.
    pub fn stop(&self) {
        let _ = self.control.try_send(Control::Stop);
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.control.try_send(Control::Stop);
    }
}
