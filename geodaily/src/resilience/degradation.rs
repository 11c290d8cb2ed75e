use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{info, warn};

use super::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceLevel {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTransition {
    pub component: String,
    pub from: ServiceLevel,
    pub to: ServiceLevel,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DegradationState {
    levels: HashMap<String, ServiceLevel>,
    history: Vec<LevelTransition>,
}

/// Tracks the service level of named components so callers can fall back instead of blocking.
#[derive(Debug, Default)]
pub struct GracefulDegradationManager {
    state: Mutex<DegradationState>,
}

impl GracefulDegradationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown components are assumed healthy.
    pub fn level(&self, component: &str) -> ServiceLevel {
        lock(&self.state)
            .levels
            .get(component)
            .copied()
            .unwrap_or(ServiceLevel::Healthy)
    }

    /// Sets the level and returns whether it changed.
    pub fn set_level(&self, component: &str, level: ServiceLevel, reason: &str) -> bool {
        let mut state = lock(&self.state);
        let from = state
            .levels
            .insert(component.to_string(), level)
            .unwrap_or(ServiceLevel::Healthy);
        if from == level {
            return false;
        }
        if level > from {
            warn!(component, ?from, to = ?level, reason, "component degraded");
        } else {
            info!(component, ?from, to = ?level, reason, "component recovered");
        }
        state.history.push(LevelTransition {
            component: component.to_string(),
            from,
            to: level,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        true
    }

    /// Callers should use their fallback rather than attempt the component.
    pub fn should_fallback(&self, component: &str) -> bool {
        self.level(component) == ServiceLevel::Unavailable
    }

    pub fn levels(&self) -> BTreeMap<String, ServiceLevel> {
        lock(&self.state)
            .levels
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn history(&self) -> Vec<LevelTransition> {
        lock(&self.state).history.clone()
    }
}
