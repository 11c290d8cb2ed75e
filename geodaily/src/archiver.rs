//! Audit records for every analysis stage input and output.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::models::Provenance;
use crate::resilience::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    RelevanceScreening,
    CategoryAnalysis,
    StrategicSelection,
    ContentGeneration,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::RelevanceScreening,
        Stage::CategoryAnalysis,
        Stage::StrategicSelection,
        Stage::ContentGeneration,
    ];

    /// 1-based position in the pipeline
    pub fn index(self) -> u8 {
        match self {
            Stage::RelevanceScreening => 1,
            Stage::CategoryAnalysis => 2,
            Stage::StrategicSelection => 3,
            Stage::ContentGeneration => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::RelevanceScreening => "relevance_screening",
            Stage::CategoryAnalysis => "category_analysis",
            Stage::StrategicSelection => "strategic_selection",
            Stage::ContentGeneration => "content_generation",
        }
    }
}

/// Sink for stage records. Implementations must not block the pipeline for long; callers log
/// failures and continue.
#[async_trait::async_trait]
pub trait Archiver: Send + Sync {
    async fn archive_stage_input(
        &self,
        run_id: &str,
        stage: Stage,
        cluster_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;

    async fn archive_stage_output(
        &self,
        run_id: &str,
        stage: Stage,
        cluster_id: &str,
        payload: &serde_json::Value,
        cost: f64,
        tokens: u64,
        provenance: Provenance,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub run_id: String,
    pub stage: Stage,
    pub stage_index: u8,
    pub cluster_id: String,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
    pub cost: f64,
    pub tokens: u64,
    pub provenance: Option<Provenance>,
    pub recorded_at: DateTime<Utc>,
}

/// Keeps records in memory; the binary writes them out at the end of a run.
#[derive(Debug, Default)]
pub struct MemoryArchiver {
    records: Mutex<Vec<ArchiveRecord>>,
}

impl MemoryArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ArchiveRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait::async_trait]
impl Archiver for MemoryArchiver {
    async fn archive_stage_input(
        &self,
        run_id: &str,
        stage: Stage,
        cluster_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        lock(&self.records).push(ArchiveRecord {
            run_id: run_id.to_string(),
            stage,
            stage_index: stage.index(),
            cluster_id: cluster_id.to_string(),
            kind: RecordKind::Input,
            payload: payload.clone(),
            cost: 0.0,
            tokens: 0,
            provenance: None,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn archive_stage_output(
        &self,
        run_id: &str,
        stage: Stage,
        cluster_id: &str,
        payload: &serde_json::Value,
        cost: f64,
        tokens: u64,
        provenance: Provenance,
    ) -> Result<()> {
        lock(&self.records).push(ArchiveRecord {
            run_id: run_id.to_string(),
            stage,
            stage_index: stage.index(),
            cluster_id: cluster_id.to_string(),
            kind: RecordKind::Output,
            payload: payload.clone(),
            cost,
            tokens,
            provenance: Some(provenance),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
