//! Optional profiler event stream (C8).
//!
//! Disabled by default: [`Profiler::disabled`] is a zero-cost no-op so the
//! step executor doesn't need to branch on whether profiling is active.
//! When attached via [`crate::ApiCrawler::enable_profiler`], each step
//! execution emits a `Start`/`End` pair on a buffered `mpsc` channel with a
//! hierarchical id so a consumer can reconstruct the step tree's timing
//! without polling. Before/after context snapshots are attached to `End`
//! only when a profiler is attached, since snapshotting is a deep clone of
//! the shared context value and otherwise pure overhead.

use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ProfilerEvent {
    Start { id: u64, parent_id: Option<u64>, step_kind: String, location: String },
    End {
        id: u64,
        duration_ms: u64,
        outcome: StepOutcome,
        context_before: Option<Value>,
        context_after: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Ok,
    Error(String),
}

#[derive(Clone)]
pub struct Profiler {
    sender: Option<mpsc::Sender<ProfilerEvent>>,
    next_id: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl Profiler {
    pub fn disabled() -> Self {
        Self { sender: None, next_id: Default::default() }
    }

    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ProfilerEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { sender: Some(tx), next_id: Default::default() }, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn start(&self, id: u64, parent_id: Option<u64>, step_kind: &str, location: &str) {
        if let Some(tx) = &self.sender {
            let _ = tx.try_send(ProfilerEvent::Start {
                id,
                parent_id,
                step_kind: step_kind.to_string(),
                location: location.to_string(),
            });
        }
    }

    pub fn end(
        &self,
        id: u64,
        duration_ms: u64,
        outcome: StepOutcome,
        context_before: Option<Value>,
        context_after: Option<Value>,
    ) {
        if let Some(tx) = &self.sender {
            let _ = tx.try_send(ProfilerEvent::End { id, duration_ms, outcome, context_before, context_after });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_profiler_emits_nothing() {
        let profiler = Profiler::disabled();
        assert!(!profiler.is_enabled());
        profiler.start(0, None, "request", "steps[0]");
    }

    #[tokio::test]
    async fn enabled_profiler_delivers_start_and_end() {
        let (profiler, mut rx) = Profiler::new(8);
        let id = profiler.next_id();
        profiler.start(id, None, "request", "steps[0]");
        profiler.end(id, 12, StepOutcome::Ok, None, None);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProfilerEvent::Start { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ProfilerEvent::End { .. }));
    }
}
