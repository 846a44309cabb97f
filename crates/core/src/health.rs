//! Health evaluation of a cluster session against SLA rules.
//!
//! Evaluation never fails: it only reads counters and produces a verdict.

use crate::cluster::session::{SessionSnapshot, SessionStatus};
use crate::config::HealthSettings;
use crate::error::{DistError, Result};
use crate::metrics::MetricsCollector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// SLA thresholds a session is gated on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlaConfig {
    pub allow_idle: bool,
    pub max_unhealthy: u32,
    /// `restarted / max(running, 1)` above this fails; unbounded by default
    #[serde(with = "unbounded")]
    pub max_restart_rate: f64,
}

/// Infinite limits are written as `null`, which JSON can represent
mod unbounded {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            allow_idle: false,
            max_unhealthy: 0,
            max_restart_rate: f64::INFINITY,
        }
    }
}

/// SLA values passed on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlaOverrides {
    pub allow_idle: Option<bool>,
    pub max_unhealthy: Option<u32>,
    pub max_restart_rate: Option<f64>,
}

impl SlaConfig {
    /// Resolve each threshold: override, then application settings, then default.
    pub fn resolve(overrides: &SlaOverrides, settings: &HealthSettings) -> Self {
        let default = Self::default();
        Self {
            allow_idle: overrides
                .allow_idle
                .or(settings.allow_idle)
                .unwrap_or(default.allow_idle),
            max_unhealthy: overrides
                .max_unhealthy
                .or(settings.max_unhealthy)
                .unwrap_or(default.max_unhealthy),
            max_restart_rate: overrides
                .max_restart_rate
                .or(settings.max_restart_rate)
                .unwrap_or(default.max_restart_rate),
        }
    }
}

/// Health payload of a session, computed fresh per query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: SessionStatus,
    pub workers: Vec<String>,
    pub pending: Vec<String>,
    pub workers_running_count: u32,
    pub workers_unhealthy_count: u32,
    pub workers_restarted_count: u32,
    pub app: String,
    pub target: String,
}

impl HealthReport {
    /// Report for an application with no session at all
    pub fn idle(app: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Idle,
            workers: Vec::new(),
            pending: Vec::new(),
            workers_running_count: 0,
            workers_unhealthy_count: 0,
            workers_restarted_count: 0,
            app: app.into(),
            target: target.into(),
        }
    }

    pub fn restart_rate(&self) -> f64 {
        self.workers_restarted_count as f64 / self.workers_running_count.max(1) as f64
    }
}

impl From<&SessionSnapshot> for HealthReport {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            status: snapshot.status,
            workers: snapshot.worker_addresses(),
            pending: snapshot.pending.clone(),
            workers_running_count: snapshot.counters.running,
            workers_unhealthy_count: snapshot.counters.unhealthy,
            workers_restarted_count: snapshot.counters.restarted,
            app: snapshot.app.clone(),
            target: snapshot.target.clone(),
        }
    }
}

/// Outcome of the health gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Pass,
    UnhealthyExceeded,
    StatusFailed,
    IdleNotAllowed,
    RestartRateExceeded,
}

impl HealthVerdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::UnhealthyExceeded => 2,
            Self::StatusFailed => 3,
            Self::IdleNotAllowed => 4,
            Self::RestartRateExceeded => 5,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Apply the SLA rules in order; the first failing rule decides.
pub fn evaluate(report: &HealthReport, sla: &SlaConfig) -> HealthVerdict {
    if report.workers_unhealthy_count > sla.max_unhealthy {
        return HealthVerdict::UnhealthyExceeded;
    }
    if matches!(report.status, SessionStatus::Error | SessionStatus::Degraded) {
        return HealthVerdict::StatusFailed;
    }
    if report.status == SessionStatus::Idle && !sla.allow_idle {
        return HealthVerdict::IdleNotAllowed;
    }
    if report.restart_rate() > sla.max_restart_rate {
        return HealthVerdict::RestartRateExceeded;
    }
    HealthVerdict::Pass
}

/// Report, SLA and verdict together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthOutcome {
    #[serde(flatten)]
    pub report: HealthReport,
    pub verdict: HealthVerdict,
    pub exit_code: i32,
    pub reason: String,
    pub sla: SlaConfig,
}

impl HealthOutcome {
    pub fn new(report: HealthReport, sla: SlaConfig) -> Self {
        let verdict = evaluate(&report, &sla);
        let reason = match verdict {
            HealthVerdict::Pass => "healthy".to_string(),
            HealthVerdict::UnhealthyExceeded => format!(
                "{} unhealthy workers exceed the limit of {}",
                report.workers_unhealthy_count, sla.max_unhealthy
            ),
            HealthVerdict::StatusFailed => format!("session status is {}", report.status),
            HealthVerdict::IdleNotAllowed => "session is idle and idle is not allowed".to_string(),
            HealthVerdict::RestartRateExceeded => format!(
                "restart rate {:.3} exceeds {}",
                report.restart_rate(),
                sla.max_restart_rate
            ),
        };
        tracing::debug!("Health of {}: {:?} ({})", report.app, verdict, reason);

        Self {
            exit_code: verdict.exit_code(),
            report,
            verdict,
            reason,
            sla,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }

    pub fn render(&self, format: HealthFormat) -> Result<String> {
        match format {
            HealthFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            HealthFormat::Prometheus => Ok(self.prometheus()),
        }
    }

    /// Text exposition: one gauge per counter plus the gate result
    fn prometheus(&self) -> String {
        let metrics = MetricsCollector::new();
        let labels = BTreeMap::from([
            ("app".to_string(), self.report.app.clone()),
            ("target".to_string(), self.report.target.clone()),
        ]);

        metrics.describe("dagfleet_workers_running_count", "Workers currently running");
        metrics.set_gauge(
            "dagfleet_workers_running_count",
            self.report.workers_running_count as f64,
            labels.clone(),
        );
        metrics.describe("dagfleet_workers_unhealthy_count", "Workers that failed to launch");
        metrics.set_gauge(
            "dagfleet_workers_unhealthy_count",
            self.report.workers_unhealthy_count as f64,
            labels.clone(),
        );
        metrics.describe("dagfleet_workers_restarted_count", "Workers relaunched after a failure");
        metrics.set_gauge(
            "dagfleet_workers_restarted_count",
            self.report.workers_restarted_count as f64,
            labels.clone(),
        );

        let mut gate_labels = labels;
        gate_labels.insert("status".to_string(), self.report.status.to_string());
        metrics.describe("dagfleet_health_gate_pass", "1 when the session passes its SLA");
        metrics.set_gauge(
            "dagfleet_health_gate_pass",
            if self.passed() { 1.0 } else { 0.0 },
            gate_labels,
        );

        metrics.render_prometheus()
    }

    /// Write the rendered report to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path, format: HealthFormat) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render(format)?)?;
        tracing::info!("Health report written to {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthFormat {
    #[default]
    Json,
    Prometheus,
}

impl FromStr for HealthFormat {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prometheus" | "prom" => Ok(Self::Prometheus),
            other => Err(DistError::config(format!(
                "unknown health format '{other}' (expected json or prometheus)"
            ))),
        }
    }
}
