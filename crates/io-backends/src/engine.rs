use port_engine::ProcessScope;

/// The owner of a backend: supplies the process callback and receives
/// session notifications.
///
/// `process` and every notification after `start` are invoked on the
/// process thread. Rate and size notifications issued by `start` itself run
/// on the caller's thread before the process thread exists.
pub trait AudioEngine: Send {
    /// Processes one period. An error halts the backend.
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> anyhow::Result<()>;

    fn sample_rate_changed(&mut self, _sample_rate: u32) {}

    fn buffer_size_changed(&mut self, _frames: u32) {}

    fn freewheel(&mut self, _onoff: bool) {}

    fn xrun(&mut self) {}

    /// The session failed; `stop` followed by `start` recovers.
    fn halted(&mut self, _reason: &str) {}

    /// Port latencies changed. Delivered in pairs: `applied == false` before
    /// the new ranges are published, then `applied == true` after.
    fn latency_changed(&mut self, _applied: bool) {}

    fn ports_registered(&mut self) {}

    fn graph_reordered(&mut self) {}

    fn connection_changed(&mut self, _a: &str, _b: &str, _connected: bool) {}
}

/// Engine that leaves all routing to port connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentEngine;

impl AudioEngine for SilentEngine {
    fn process(&mut self, _scope: &mut ProcessScope<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}
