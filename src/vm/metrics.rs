use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Methods analyzed and prepared for execution
    pub methods_prepared: AtomicU64,
    /// Call sites resolved on the slow path and rewritten into cached calls
    pub call_site_resolutions: AtomicU64,
    /// Calls dispatched through a cached call-site node
    pub node_invocations: AtomicU64,
    /// Backward branches that polled the OSR counter
    pub osr_polls: AtomicU64,
    /// Times a backward-branch counter reached the OSR threshold
    pub osr_triggers: AtomicU64,
    /// Guest exceptions raised, implicit faults and `throw` alike
    pub faults_raised: AtomicU64,
    /// Guest exceptions that entered a catch handler
    pub faults_caught: AtomicU64,
    /// Finally handlers entered, by `leave` or by unwinding
    pub finally_blocks_run: AtomicU64,
}

/// A point-in-time copy of [`RuntimeMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub methods_prepared: u64,
    pub call_site_resolutions: u64,
    pub node_invocations: u64,
    pub osr_polls: u64,
    pub osr_triggers: u64,
    pub faults_raised: u64,
    pub faults_caught: u64,
    pub finally_blocks_run: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_method_prepared(&self) {
        self.methods_prepared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_site_resolution(&self) {
        self.call_site_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_invocation(&self) {
        self.node_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_osr_poll(&self, triggered: bool) {
        self.osr_polls.fetch_add(1, Ordering::Relaxed);
        if triggered {
            self.osr_triggers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fault(&self) {
        self.faults_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_catch(&self) {
        self.faults_caught.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finally(&self) {
        self.finally_blocks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            methods_prepared: self.methods_prepared.load(Ordering::Relaxed),
            call_site_resolutions: self.call_site_resolutions.load(Ordering::Relaxed),
            node_invocations: self.node_invocations.load(Ordering::Relaxed),
            osr_polls: self.osr_polls.load(Ordering::Relaxed),
            osr_triggers: self.osr_triggers.load(Ordering::Relaxed),
            faults_raised: self.faults_raised.load(Ordering::Relaxed),
            faults_caught: self.faults_caught.load(Ordering::Relaxed),
            finally_blocks_run: self.finally_blocks_run.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_osr_poll_counts_triggers_separately() {
        let metrics = RuntimeMetrics::new();
        metrics.record_osr_poll(false);
        metrics.record_osr_poll(true);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.osr_polls, 2);
        assert_eq!(snapshot.osr_triggers, 1);
    }
}
