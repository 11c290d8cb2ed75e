//! Four-stage analysis of story clusters.
//!
//! Each cluster moves Pending → Screened → Analyzed → Selected → Completed, or ends
//! Dropped (screening), NotSelected (selection) or Skipped (deadline or cancellation). Stages 1, 2
//! and 4 call the analysis service through [`CallGateway`]; any failure there switches
//! that cluster's stage to a deterministic heuristic and tags the result.

pub mod category;
pub mod gateway;
pub mod generation;
pub mod screening;
pub mod selection;

pub use gateway::{CallGateway, CallSuccess, Guards};

use common::{AnalysisConfig, SourceWeights};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archiver::{Archiver, Stage};
use crate::error::FallbackReason;
use crate::models::{AiAnalysis, ArticleCluster, Provenance, StoryCategory};
use category::CategoryAnalysis;
use generation::GeneratedContent;
use screening::ScreeningResult;
use selection::Candidate;

/// A stage result tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Real { payload: T, cost: f64, tokens: u64 },
    Mock { payload: T, reason: FallbackReason },
    Degraded { payload: T, reason: FallbackReason },
}

impl<T> Outcome<T> {
    pub fn fallback(payload: T, reason: FallbackReason) -> Self {
        match reason.provenance() {
            Provenance::Mock => Outcome::Mock { payload, reason },
            _ => Outcome::Degraded { payload, reason },
        }
    }

    pub fn payload(&self) -> &T {
        match self {
            Outcome::Real { payload, .. } | Outcome::Mock { payload, .. } | Outcome::Degraded { payload, .. } => {
                payload
            }
        }
    }

    pub fn into_payload(self) -> T {
        match self {
            Outcome::Real { payload, .. } | Outcome::Mock { payload, .. } | Outcome::Degraded { payload, .. } => {
                payload
            }
        }
    }

    pub fn provenance(&self) -> Provenance {
        match self {
            Outcome::Real { .. } => Provenance::Real,
            Outcome::Mock { .. } => Provenance::Mock,
            Outcome::Degraded { .. } => Provenance::Degraded,
        }
    }

    pub fn reason(&self) -> Option<&FallbackReason> {
        match self {
            Outcome::Real { .. } => None,
            Outcome::Mock { reason, .. } | Outcome::Degraded { reason, .. } => Some(reason),
        }
    }
}

/// Money and tokens spent on one call, including calls whose reply was unusable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Spend {
    cost: f64,
    tokens: u64,
}

impl std::ops::AddAssign for Spend {
    fn add_assign(&mut self, other: Spend) {
        self.cost += other.cost;
        self.tokens += other.tokens;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Pending,
    Screened,
    Analyzed,
    Selected,
    Completed,
    Dropped,
    NotSelected,
    Skipped,
}

impl ClusterState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClusterState::Completed | ClusterState::Dropped | ClusterState::NotSelected | ClusterState::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disposition {
    pub cluster_id: String,
    pub state: ClusterState,
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: Stage,
    pub input: usize,
    pub output: usize,
    pub real: usize,
    pub mock: usize,
    pub degraded: usize,
    pub cost: f64,
    pub tokens: u64,
    pub duration_ms: u64,
}

impl StageStats {
    fn new(stage: Stage, input: usize) -> Self {
        Self {
            stage,
            input,
            output: 0,
            real: 0,
            mock: 0,
            degraded: 0,
            cost: 0.0,
            tokens: 0,
            duration_ms: 0,
        }
    }

    fn record(&mut self, provenance: Provenance, spend: Spend) {
        match provenance {
            Provenance::Real => self.real += 1,
            Provenance::Mock => self.mock += 1,
            Provenance::Degraded => self.degraded += 1,
        }
        self.cost += spend.cost;
        self.tokens += spend.tokens;
    }

    fn finish(&mut self, started: Instant) {
        self.duration_ms = started.elapsed().as_millis() as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Empty,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Story {
    pub cluster: ArticleCluster,
    pub analysis: AiAnalysis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub stories: Vec<Story>,
    pub dispositions: Vec<Disposition>,
    pub stages: Vec<StageStats>,
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// Per-cluster bookkeeping for one run.
struct Ledger {
    states: Vec<ClusterState>,
    details: Vec<Option<String>>,
    provenance: Vec<Provenance>,
    spend: Vec<Spend>,
}

impl Ledger {
    fn new(len: usize) -> Self {
        Self {
            states: vec![ClusterState::Pending; len],
            details: vec![None; len],
            provenance: vec![Provenance::Real; len],
            spend: vec![Spend::default(); len],
        }
    }

    fn charge(&mut self, i: usize, provenance: Provenance, spend: Spend) {
        self.provenance[i] = self.provenance[i].worst(provenance);
        self.spend[i] += spend;
    }

    fn in_state(&self, state: ClusterState) -> Vec<usize> {
        (0..self.states.len()).filter(|&i| self.states[i] == state).collect()
    }

    fn skip_unfinished(&mut self, halt: Halt) -> usize {
        let mut skipped = 0;
        for (state, detail) in self.states.iter_mut().zip(self.details.iter_mut()) {
            if !state.is_terminal() {
                *state = ClusterState::Skipped;
                *detail = Some(halt.as_str().to_string());
                skipped += 1;
            }
        }
        skipped
    }
}

fn category_rank(category: StoryCategory) -> u8 {
    match category {
        StoryCategory::Strategic => 0,
        StoryCategory::Economic => 1,
        StoryCategory::Security => 2,
        StoryCategory::Regional => 3,
    }
}

/// Why a run stopped before every cluster reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Deadline,
    Cancelled,
}

impl Halt {
    fn as_str(self) -> &'static str {
        match self {
            Halt::Deadline => "run deadline reached",
            Halt::Cancelled => "run cancelled",
        }
    }
}

/// Collects stream items until it ends, the deadline passes or `cancel` fires.
/// In-flight work is dropped on a halt.
async fn drain<S: Stream>(
    stream: S,
    deadline: Instant,
    cancel: &CancellationToken,
) -> (Vec<S::Item>, Option<Halt>) {
    futures::pin_mut!(stream);
    let mut done = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return (done, Some(Halt::Cancelled)),
            next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                Ok(Some(item)) => done.push(item),
                Ok(None) => return (done, None),
                Err(_) => return (done, Some(Halt::Deadline)),
            },
        }
    }
}

pub struct MultiStageAnalyzer {
    config: AnalysisConfig,
    weights: SourceWeights,
    gateway: CallGateway,
    archiver: Arc<dyn Archiver>,
}

impl MultiStageAnalyzer {
    pub fn new(
        config: AnalysisConfig,
        weights: SourceWeights,
        gateway: CallGateway,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            config,
            weights,
            gateway,
            archiver,
        }
    }

    /// Runs all four stages over `clusters`, which are expected in ranked order.
    pub async fn run(&self, clusters: Vec<ArticleCluster>) -> RunReport {
        self.run_until_cancelled(clusters, &CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but stops early once `cancel` fires. Finished work is kept
    /// and the rest is reported as Skipped.
    pub async fn run_until_cancelled(&self, clusters: Vec<ArticleCluster>, cancel: &CancellationToken) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let rid = run_id.as_str();
        let deadline = Instant::now() + Duration::from_secs(self.config.run_timeout_seconds);
        info!(run_id = %run_id, clusters = clusters.len(), "analysis run started");

        let mut ledger = Ledger::new(clusters.len());
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut halted: Option<Halt> = None;

        // Stage 1
        let started = Instant::now();
        let mut stats = StageStats::new(Stage::RelevanceScreening, clusters.len());
        let mut screenings: Vec<Option<ScreeningResult>> = vec![None; clusters.len()];
        let work = stream::iter(clusters.iter().enumerate())
            .map(|(i, cluster)| async move { (i, self.screen(rid, cluster).await) })
            .buffer_unordered(self.concurrency());
        let (done, halt) = drain(work, deadline, cancel).await;
        for (i, (outcome, spend)) in done {
            stats.record(outcome.provenance(), spend);
            ledger.charge(i, outcome.provenance(), spend);
            let result = outcome.into_payload();
            if result.overall >= self.config.screening_threshold {
                ledger.states[i] = ClusterState::Screened;
                stats.output += 1;
                screenings[i] = Some(result);
            } else {
                ledger.states[i] = ClusterState::Dropped;
                ledger.details[i] = Some(format!(
                    "screening score {:.1} below {:.1}",
                    result.overall, self.config.screening_threshold
                ));
            }
        }
        halted = halted.or(halt);
        stats.finish(started);
        info!(passed = stats.output, screened = stats.input, "relevance screening complete");
        stages.push(stats);

        // Stage 2
        let started = Instant::now();
        let mut analyses: Vec<Option<CategoryAnalysis>> = vec![None; clusters.len()];
        let mut queue = if halted.is_some() { Vec::new() } else { ledger.in_state(ClusterState::Screened) };
        queue.sort_by_key(|&i| (category_rank(clusters[i].category()), i));
        let mut stats = StageStats::new(Stage::CategoryAnalysis, queue.len());
        let mut partitions: Vec<(StoryCategory, usize)> = Vec::new();
        for &i in &queue {
            match partitions.last_mut() {
                Some((category, count)) if *category == clusters[i].category() => *count += 1,
                _ => partitions.push((clusters[i].category(), 1)),
            }
        }
        for (category, count) in &partitions {
            debug!(category = category.as_str(), clusters = count, "category partition");
        }
        let inputs: Vec<(usize, &ScreeningResult)> = queue
            .iter()
            .filter_map(|&i| screenings[i].as_ref().map(|s| (i, s)))
            .collect();
        let work = stream::iter(inputs)
            .map(|(i, screening)| {
                let cluster = &clusters[i];
                async move { (i, self.analyze(rid, cluster, screening).await) }
            })
            .buffer_unordered(self.concurrency());
        let (done, halt) = drain(work, deadline, cancel).await;
        for (i, (outcome, spend)) in done {
            stats.record(outcome.provenance(), spend);
            ledger.charge(i, outcome.provenance(), spend);
            ledger.states[i] = ClusterState::Analyzed;
            stats.output += 1;
            analyses[i] = Some(outcome.into_payload());
        }
        halted = halted.or(halt);
        stats.finish(started);
        info!(analyzed = stats.output, "category analysis complete");
        stages.push(stats);

        // Stage 3
        let started = Instant::now();
        let candidates: Vec<Candidate> = if halted.is_some() {
            Vec::new()
        } else {
            ledger
                .in_state(ClusterState::Analyzed)
                .into_iter()
                .filter_map(|i| {
                    analyses[i].as_ref().map(|a| Candidate {
                        cluster_id: clusters[i].id().to_string(),
                        position: i,
                        content_type: a.content_type,
                        scores: a.scores,
                    })
                })
                .collect()
        };
        let mut stats = StageStats::new(Stage::StrategicSelection, candidates.len());
        self.archive_input(rid, Stage::StrategicSelection, "selection", &to_json(&candidates))
            .await;
        let picked = selection::select(&candidates, self.config.target_stories, self.config.breaking_news_ratio);
        self.archive_output(
            rid,
            Stage::StrategicSelection,
            "selection",
            &to_json(&picked),
            Spend::default(),
            Provenance::Real,
        )
        .await;
        let index_of = |id: &str| clusters.iter().position(|c| c.id() == id);
        let mut selected = Vec::with_capacity(picked.selected.len());
        for id in &picked.selected {
            if let Some(i) = index_of(id) {
                ledger.states[i] = ClusterState::Selected;
                selected.push(i);
            }
        }
        for id in &picked.not_selected {
            if let Some(i) = index_of(id) {
                ledger.states[i] = ClusterState::NotSelected;
                ledger.details[i] = Some("ranked below the selected stories".to_string());
            }
        }
        stats.output = selected.len();
        stats.finish(started);
        info!(selected = stats.output, candidates = stats.input, relaxed = picked.relaxed, "strategic selection complete");
        stages.push(stats);

        // Stage 4
        let started = Instant::now();
        let mut stats = StageStats::new(Stage::ContentGeneration, selected.len());
        let mut generated: Vec<Option<GeneratedContent>> = vec![None; clusters.len()];
        let inputs: Vec<(usize, &CategoryAnalysis)> = selected
            .iter()
            .filter_map(|&i| analyses[i].as_ref().map(|a| (i, a)))
            .collect();
        let work = stream::iter(inputs)
            .map(|(i, analysis)| {
                let cluster = &clusters[i];
                async move { (i, self.generate(rid, cluster, analysis).await) }
            })
            .buffer_unordered(self.concurrency());
        let (done, halt) = drain(work, deadline, cancel).await;
        for (i, (outcome, spend)) in done {
            stats.record(outcome.provenance(), spend);
            ledger.charge(i, outcome.provenance(), spend);
            ledger.states[i] = ClusterState::Completed;
            stats.output += 1;
            generated[i] = Some(outcome.into_payload());
        }
        halted = halted.or(halt);
        stats.finish(started);
        info!(completed = stats.output, "content generation complete");
        stages.push(stats);

        if let Some(halt) = halted {
            let skipped = ledger.skip_unfinished(halt);
            warn!(run_id = %run_id, skipped, reason = halt.as_str(), "analysis run halted");
        }

        let mut stories = Vec::with_capacity(selected.len());
        for &i in &selected {
            let (Some(content), Some(analysis)) = (generated[i].take(), analyses[i].as_ref()) else {
                continue;
            };
            let cluster = &clusters[i];
            let spend = ledger.spend[i];
            let ai = AiAnalysis {
                cluster_id: cluster.id().to_string(),
                story_title: content.story_title,
                why_important: content.why_important,
                what_overlooked: content.what_overlooked,
                prediction: content.prediction,
                content_type: analysis.content_type,
                scores: content.scores,
                sources: cluster.urls(),
                confidence: content.confidence,
                cost_incurred: spend.cost,
                tokens_used: spend.tokens,
                provenance: ledger.provenance[i],
            }
            .normalized();
            stories.push(Story {
                cluster: cluster.clone(),
                analysis: ai,
            });
        }

        let dispositions = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| Disposition {
                cluster_id: c.id().to_string(),
                state: ledger.states[i],
                provenance: ledger.provenance[i],
                detail: ledger.details[i].take(),
            })
            .collect();
        let total_cost: f64 = stages.iter().map(|s| s.cost).sum();
        let total_tokens: u64 = stages.iter().map(|s| s.tokens).sum();
        let status = if let Some(halt) = halted {
            match halt {
                Halt::Deadline => RunStatus::TimedOut,
                Halt::Cancelled => RunStatus::Cancelled,
            }
        } else if stories.is_empty() {
            RunStatus::Empty
        } else {
            RunStatus::Completed
        };
        info!(
            run_id = %run_id,
            status = ?status,
            stories = stories.len(),
            total_cost,
            total_tokens,
            "analysis run finished"
        );
        RunReport {
            run_id,
            status,
            stories,
            dispositions,
            stages,
            total_cost,
            total_tokens,
        }
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    fn average_quality(&self, cluster: &ArticleCluster) -> f64 {
        let members = cluster.members();
        if members.is_empty() {
            return 0.0;
        }
        members.iter().map(|a| a.weighted_quality(&self.weights)).sum::<f64>() / members.len() as f64
    }

    async fn screen(&self, run_id: &str, cluster: &ArticleCluster) -> (Outcome<ScreeningResult>, Spend) {
        let stage = Stage::RelevanceScreening;
        self.archive_input(run_id, stage, cluster.id(), &to_json(cluster)).await;
        let result = self
            .attempt(stage, cluster.id(), screening::prompt(cluster), screening::parse, || {
                screening::heuristic(cluster, self.average_quality(cluster))
            })
            .await;
        self.archive_outcome(run_id, stage, cluster.id(), &result).await;
        result
    }

    async fn analyze(
        &self,
        run_id: &str,
        cluster: &ArticleCluster,
        screening: &ScreeningResult,
    ) -> (Outcome<CategoryAnalysis>, Spend) {
        let stage = Stage::CategoryAnalysis;
        let input = serde_json::json!({
            "cluster_id": cluster.id(),
            "category": cluster.category(),
            "screening": screening,
        });
        self.archive_input(run_id, stage, cluster.id(), &input).await;
        let result = self
            .attempt(stage, cluster.id(), category::prompt(cluster, screening), category::parse, || {
                category::heuristic(cluster, screening)
            })
            .await;
        self.archive_outcome(run_id, stage, cluster.id(), &result).await;
        result
    }

    async fn generate(
        &self,
        run_id: &str,
        cluster: &ArticleCluster,
        analysis: &CategoryAnalysis,
    ) -> (Outcome<GeneratedContent>, Spend) {
        let stage = Stage::ContentGeneration;
        let input = serde_json::json!({
            "cluster_id": cluster.id(),
            "main_title": cluster.main_article().title,
            "analysis": analysis,
        });
        self.archive_input(run_id, stage, cluster.id(), &input).await;
        let result = self
            .attempt(stage, cluster.id(), generation::prompt(cluster, analysis), generation::parse, || {
                generation::heuristic(cluster, analysis)
            })
            .await;
        self.archive_outcome(run_id, stage, cluster.id(), &result).await;
        result
    }

    /// One guarded call, falling back to `heuristic` on any failure or unusable reply.
    async fn attempt<T, P, H>(
        &self,
        stage: Stage,
        cluster_id: &str,
        prompt: String,
        parse: P,
        heuristic: H,
    ) -> (Outcome<T>, Spend)
    where
        P: FnOnce(&str) -> Result<T, String>,
        H: FnOnce() -> T,
    {
        match self.gateway.call(stage.as_str(), prompt).await {
            Ok(success) => {
                let spend = Spend {
                    cost: success.cost,
                    tokens: success.tokens,
                };
                match parse(&success.content) {
                    Ok(payload) => (
                        Outcome::Real {
                            payload,
                            cost: spend.cost,
                            tokens: spend.tokens,
                        },
                        spend,
                    ),
                    Err(e) => {
                        warn!(stage = stage.as_str(), cluster = cluster_id, error = %e, "unusable analysis reply; using heuristic");
                        (Outcome::fallback(heuristic(), FallbackReason::Malformed(e)), spend)
                    }
                }
            }
            Err(reason) => {
                debug!(stage = stage.as_str(), cluster = cluster_id, reason = %reason, "using heuristic");
                (Outcome::fallback(heuristic(), reason), Spend::default())
            }
        }
    }

    async fn archive_input(&self, run_id: &str, stage: Stage, cluster_id: &str, payload: &Value) {
        if let Err(e) = self.archiver.archive_stage_input(run_id, stage, cluster_id, payload).await {
            warn!(stage = stage.as_str(), cluster = cluster_id, error = %e, "failed to archive stage input");
        }
    }

    async fn archive_output(
        &self,
        run_id: &str,
        stage: Stage,
        cluster_id: &str,
        payload: &Value,
        spend: Spend,
        provenance: Provenance,
    ) {
        if let Err(e) = self
            .archiver
            .archive_stage_output(run_id, stage, cluster_id, payload, spend.cost, spend.tokens, provenance)
            .await
        {
            warn!(stage = stage.as_str(), cluster = cluster_id, error = %e, "failed to archive stage output");
        }
    }

    async fn archive_outcome<T: Serialize>(
        &self,
        run_id: &str,
        stage: Stage,
        cluster_id: &str,
        (outcome, spend): &(Outcome<T>, Spend),
    ) {
        let mut payload = to_json(outcome.payload());
        if let (Some(reason), Value::Object(map)) = (outcome.reason(), &mut payload) {
            map.insert("fallback_reason".to_string(), Value::String(reason.to_string()));
        }
        self.archive_output(run_id, stage, cluster_id, &payload, *spend, outcome.provenance())
            .await;
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::{MemoryArchiver, RecordKind};
    use crate::cost::{CostController, MemoryLedgerStore};
    use crate::llm::{LlmError, LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
    use crate::models::{Article, ContentType, SourceCategory};
    use crate::resilience::{CircuitBreakerRegistry, GracefulDegradationManager, RateLimiterRegistry, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use common::{CircuitBreakerConfig, CostConfig, RateLimitsConfig, RetryConfig};

    /// Answers each stage with a fixed reply, picked from the prompt's task line.
    struct Scripted {
        category_reply: String,
    }

    #[async_trait::async_trait]
    impl LlmProvider for Scripted {
        fn endpoint(&self) -> &str {
            "analysis"
        }

        async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
            let content = if request.prompt.starts_with("Task: relevance_screening") {
                r#"{"overall": 8, "geopolitical_relevance": 8, "urgency": 7, "source_quality": 8, "content_richness": 7}"#
                    .to_string()
            } else if request.prompt.starts_with("Task: category_analysis") {
                self.category_reply.clone()
            } else {
                r#"{"story_title": "Headline", "why_important": "Because it matters.", "what_overlooked": "Supply lines.",
                    "prediction": "Talks resume.", "scores": {"urgency": 7, "scope": 6, "novelty": 5, "credibility": 8, "impact": 8},
                    "confidence": 0.9}"#
                    .to_string()
            };
            Ok(LlmResponse {
                content,
                usage: UsageMetadata {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                    total_tokens: 150,
                },
                model: "scripted".to_string(),
            })
        }
    }

    const GOOD_CATEGORY: &str = r#"{"category_score": 8, "urgency": 7, "scope": 6, "novelty": 5, "credibility": 8, "impact": 8, "content_type": "analysis"}"#;

    fn clusters(n: usize) -> Vec<ArticleCluster> {
        let at = Utc.with_ymd_and_hms(2024, 10, 1, 6, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let article = Article::new(
                    "wire",
                    SourceCategory::ThinkTank,
                    format!("Story number {}", i),
                    format!("https://w.test/{}", i),
                    at,
                )
                .with_relevance(2.0);
                ArticleCluster::new(
                    format!("cluster_{:03}", i),
                    vec![article],
                    0,
                    10.0 - i as f64,
                    StoryCategory::Strategic,
                    ContentType::BreakingNews,
                    i,
                )
                .unwrap()
            })
            .collect()
    }

    async fn analyzer(provider: Option<Arc<dyn LlmProvider>>, archiver: Arc<MemoryArchiver>) -> MultiStageAnalyzer {
        let cost = CostController::open(CostConfig::default(), Arc::new(MemoryLedgerStore::new()))
            .await
            .unwrap();
        let guards = Guards {
            cost,
            breakers: Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            retry: RetryPolicy::new(RetryConfig {
                base_delay_ms: 1,
                jitter: false,
                ..RetryConfig::default()
            }),
            limiter: Arc::new(RateLimiterRegistry::new(RateLimitsConfig::default())),
            degradation: Arc::new(GracefulDegradationManager::new()),
            health: None,
        };
        let gateway = CallGateway::new(provider, guards, 800, 0.3);
        MultiStageAnalyzer::new(AnalysisConfig::default(), SourceWeights::default(), gateway, archiver)
    }

    #[test]
    fn outcome_fallback_tags_by_reason() {
        let mock = Outcome::fallback(1, FallbackReason::NoProvider);
        assert_eq!(mock.provenance(), Provenance::Mock);
        let degraded = Outcome::fallback(1, FallbackReason::Malformed("x".into()));
        assert_eq!(degraded.provenance(), Provenance::Degraded);
        assert!(degraded.reason().is_some());
        assert_eq!(degraded.into_payload(), 1);
    }

    #[tokio::test]
    async fn scripted_provider_yields_real_analyses() {
        let archiver = Arc::new(MemoryArchiver::new());
        let provider: Arc<dyn LlmProvider> = Arc::new(Scripted {
            category_reply: GOOD_CATEGORY.to_string(),
        });
        let report = analyzer(Some(provider), archiver.clone()).await.run(clusters(2)).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stories.len(), 2);
        for story in &report.stories {
            assert_eq!(story.analysis.provenance, Provenance::Real);
            assert_eq!(story.analysis.tokens_used, 450);
            assert_eq!(story.analysis.content_type, ContentType::Analysis);
            assert_eq!(story.analysis.confidence, 0.9);
        }
        assert_eq!(report.total_tokens, 900);
        assert!(report.total_cost > 0.0);

        let records = archiver.records();
        assert!(records.iter().all(|r| r.run_id == report.run_id));
        let inputs = records.iter().filter(|r| r.kind == RecordKind::Input).count();
        let outputs = records.iter().filter(|r| r.kind == RecordKind::Output).count();
        assert_eq!(inputs, 7);
        assert_eq!(outputs, 7);
    }

    #[tokio::test]
    async fn missing_provider_falls_back_to_mock() {
        let archiver = Arc::new(MemoryArchiver::new());
        let report = analyzer(None, archiver).await.run(clusters(3)).await;

        assert_eq!(report.total_cost, 0.0);
        assert!(!report.stories.is_empty());
        for story in &report.stories {
            assert_eq!(story.analysis.provenance, Provenance::Mock);
            assert_eq!(story.analysis.cost_incurred, 0.0);
        }
        assert_eq!(report.stages[0].mock, 3);
    }

    #[tokio::test]
    async fn malformed_stage_reply_degrades_only_that_stage() {
        let archiver = Arc::new(MemoryArchiver::new());
        let provider: Arc<dyn LlmProvider> = Arc::new(Scripted {
            category_reply: "I cannot answer in JSON today.".to_string(),
        });
        let report = analyzer(Some(provider), archiver.clone()).await.run(clusters(1)).await;

        assert_eq!(report.stories.len(), 1);
        let analysis = &report.stories[0].analysis;
        assert_eq!(analysis.provenance, Provenance::Degraded);
        assert_eq!(analysis.tokens_used, 450);
        assert_eq!(report.stages[1].degraded, 1);
        assert_eq!(report.stages[0].real, 1);
        assert_eq!(report.stages[3].real, 1);

        let stage_two = archiver
            .records()
            .into_iter()
            .find(|r| r.stage == Stage::CategoryAnalysis && r.kind == RecordKind::Output)
            .expect("stage 2 output archived");
        assert_eq!(stage_two.provenance, Some(Provenance::Degraded));
        assert!(stage_two.payload.get("fallback_reason").is_some());
    }

    #[tokio::test]
    async fn empty_input_reports_empty_run() {
        let archiver = Arc::new(MemoryArchiver::new());
        let report = analyzer(None, archiver).await.run(Vec::new()).await;
        assert_eq!(report.status, RunStatus::Empty);
        assert!(report.stories.is_empty());
        assert_eq!(report.stages.len(), 4);
    }
}
