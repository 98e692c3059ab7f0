use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Orchestrator state a timed operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Admission,
    Resolving,
    Running,
    Serializing,
    Teardown,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admission => "admission",
            Self::Resolving => "resolving",
            Self::Running => "running",
            Self::Serializing => "serializing",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StageOp {
    ts: String,
    stage: Stage,
    duration_ms: u64,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Per-request stage timings. Owned by the orchestrator for one request and
/// emitted as a single event when the request is done.
pub struct RequestTelemetry {
    request_id: Uuid,
    started: Instant,
    ops: Vec<StageOp>,
}

impl RequestTelemetry {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            started: Instant::now(),
            ops: Vec::new(),
        }
    }

    pub fn record(&mut self, stage: Stage, duration: Duration, success: bool, error: Option<&str>) {
        self.ops.push(StageOp {
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            stage,
            duration_ms: duration.as_millis() as u64,
            success,
            error: error.map(String::from),
        });
    }

    pub fn ops(&self) -> &[StageOp] {
        &self.ops
    }

    /// Emit the collected timings. `outcome` is `success` or an error kind.
    pub fn finish(self, outcome: &str) {
        let ops = serde_json::to_string(&self.ops).unwrap_or_default();
        info!(
            request_id = %self.request_id,
            outcome,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            stages = %ops,
            "request done"
        );
    }
}
