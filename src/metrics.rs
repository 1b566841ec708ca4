use std::time::Instant;
use tracing::trace;

// Counters and timings are emitted as trace events under `syllabus.metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(target = "syllabus.metrics", route, "requests_total_inc");
}

pub fn fetch_outcome(kind: &'static str, fallback: bool, persisted: usize) {
    trace!(
        target = "syllabus.metrics",
        kind,
        fallback,
        persisted = persisted as u64,
        "ai_fetch_total_inc"
    );
}

/// Reports how long a pipeline stage ran when dropped.
pub struct StageTimer {
    stage: &'static str,
    started: Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str) -> Self {
        Self {
            stage,
            started: Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        trace!(
            target = "syllabus.metrics",
            stage = self.stage,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stage_elapsed"
        );
    }
}
