use common::HealthConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::degradation::{GracefulDegradationManager, ServiceLevel};
use super::lock;

#[derive(Debug, Default)]
struct SourceWindow {
    outcomes: VecDeque<bool>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Rolling health of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub source: String,
    pub score: f64,
    pub success_rate: f64,
    pub samples: usize,
    pub consecutive_failures: u32,
    pub level: ServiceLevel,
    pub last_error: Option<String>,
}

/// Records per-source outcomes and periodically pushes their service level into the
/// degradation manager.
pub struct HealthMonitor {
    config: HealthConfig,
    degradation: Arc<GracefulDegradationManager>,
    sources: Mutex<HashMap<String, SourceWindow>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, degradation: Arc<GracefulDegradationManager>) -> Self {
        Self {
            config,
            degradation,
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, source: &str) {
        self.record(source, true, None);
    }

    pub fn record_failure(&self, source: &str, error: &str) {
        self.record(source, false, Some(error));
    }

    fn record(&self, source: &str, ok: bool, error: Option<&str>) {
        let window = self.config.window.max(1);
        let mut sources = lock(&self.sources);
        let entry = sources.entry(source.to_string()).or_default();
        entry.outcomes.push_back(ok);
        while entry.outcomes.len() > window {
            entry.outcomes.pop_front();
        }
        if ok {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
            entry.last_error = error.map(str::to_string);
        }
    }

    /// Success rate over the window, penalised by 0.2 per consecutive failure down to a 0.1 factor.
    fn evaluate(&self, source: &str, window: &SourceWindow) -> HealthRecord {
        let samples = window.outcomes.len();
        let successes = window.outcomes.iter().filter(|ok| **ok).count();
        let success_rate = if samples == 0 {
            1.0
        } else {
            successes as f64 / samples as f64
        };
        let penalty = (1.0 - 0.2 * window.consecutive_failures as f64).max(0.1);
        let score = success_rate * penalty;
        let level = if score >= self.config.healthy_threshold {
            ServiceLevel::Healthy
        } else if score >= self.config.degraded_threshold {
            ServiceLevel::Degraded
        } else {
            ServiceLevel::Unavailable
        };
        HealthRecord {
            source: source.to_string(),
            score,
            success_rate,
            samples,
            consecutive_failures: window.consecutive_failures,
            level,
            last_error: window.last_error.clone(),
        }
    }

    pub fn health_of(&self, source: &str) -> Option<HealthRecord> {
        let sources = lock(&self.sources);
        sources.get(source).map(|w| self.evaluate(source, w))
    }

    /// Computes every source's record and updates the degradation manager for sources
    /// with enough samples.
    pub fn aggregate(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = {
            let sources = lock(&self.sources);
            sources.iter().map(|(name, w)| self.evaluate(name, w)).collect()
        };
        records.sort_by(|a, b| a.source.cmp(&b.source));
        for record in &records {
            if record.samples >= self.config.min_samples {
                let reason = format!("health score {:.2}", record.score);
                self.degradation.set_level(&record.source, record.level, &reason);
            }
        }
        debug!(sources = records.len(), "health aggregated");
        records
    }

    /// Aggregates on an interval until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.aggregate();
                    }
                    _ = shutdown.cancelled() => {
                        info!("health monitor stopping");
                        break;
                    }
                }
            }
        })
    }
}
