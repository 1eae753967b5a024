//! Background load collaborators for sampling scenarios.

use std::sync::Arc;

use tracing::debug;

use crate::device::sim::SimDevice;

/// Creates background GPU activity while a stream samples.
pub trait LoadGenerator: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// No background activity.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoad;

impl LoadGenerator for NoLoad {
    fn start(&self) {}
    fn stop(&self) {}
}

/// Makes the simulated device interleave context-switch reports with its
/// timer reports.
pub struct ContextSwitchLoad {
    device: Arc<SimDevice>,
    every: u32,
}

impl ContextSwitchLoad {
    /// One context switch after every `every` timer reports.
    pub fn new(device: Arc<SimDevice>, every: u32) -> Self {
        Self { device, every }
    }
}

impl LoadGenerator for ContextSwitchLoad {
    fn start(&self) {
        debug!(every = self.every, "Starting context switch load");
        self.device.set_context_switch_every(self.every);
    }

    fn stop(&self) {
        debug!("Stopping context switch load");
        self.device.set_context_switch_every(0);
    }
}

/// Runs `f` with `load` active, stopping it afterwards even if `f` panics.
pub fn with_load<T>(load: &dyn LoadGenerator, f: impl FnOnce() -> T) -> T {
    struct Stop<'a>(&'a dyn LoadGenerator);

    impl Drop for Stop<'_> {
        fn drop(&mut self) {
            self.0.stop();
        }
    }

    load.start();
    let _stop = Stop(load);
    f()
}
