//! Task routing with deterministic provider fallback.
//!
//! Every task kind maps to exactly one primary provider. When the primary
//! fails, the remaining providers are tried in one fixed global order that is
//! the same for every task kind, one at a time, each at most once.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::adapters::{ProviderError, ProviderId};

/// Broad category of a task, which decides its primary provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Creative,
    Analytical,
    Processing,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 3] = [
        TaskCategory::Creative,
        TaskCategory::Analytical,
        TaskCategory::Processing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creative => "creative",
            Self::Analytical => "analytical",
            Self::Processing => "processing",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of AI requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    // Creative
    GenerateTitle,
    GenerateDescription,
    GenerateHook,
    GenerateIdeas,
    ChatResponse,

    // Analytical
    AnalyzeVideo,
    AnalyzeChannel,
    AnalyzePerformance,
    CompareVideos,
    ExplainMetrics,

    // Processing
    ClassifyContent,
    ExtractTags,
    ScoreTitle,
    QuickSummary,
}

impl TaskKind {
    pub const ALL: [TaskKind; 14] = [
        TaskKind::GenerateTitle,
        TaskKind::GenerateDescription,
        TaskKind::GenerateHook,
        TaskKind::GenerateIdeas,
        TaskKind::ChatResponse,
        TaskKind::AnalyzeVideo,
        TaskKind::AnalyzeChannel,
        TaskKind::AnalyzePerformance,
        TaskKind::CompareVideos,
        TaskKind::ExplainMetrics,
        TaskKind::ClassifyContent,
        TaskKind::ExtractTags,
        TaskKind::ScoreTitle,
        TaskKind::QuickSummary,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn category(&self) -> TaskCategory {
        use TaskKind::*;
        match self {
            GenerateTitle | GenerateDescription | GenerateHook | GenerateIdeas | ChatResponse => {
                TaskCategory::Creative
            }
            AnalyzeVideo | AnalyzeChannel | AnalyzePerformance | CompareVideos | ExplainMetrics => {
                TaskCategory::Analytical
            }
            ClassifyContent | ExtractTags | ScoreTitle | QuickSummary => TaskCategory::Processing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateTitle => "generate_title",
            Self::GenerateDescription => "generate_description",
            Self::GenerateHook => "generate_hook",
            Self::GenerateIdeas => "generate_ideas",
            Self::ChatResponse => "chat_response",
            Self::AnalyzeVideo => "analyze_video",
            Self::AnalyzeChannel => "analyze_channel",
            Self::AnalyzePerformance => "analyze_performance",
            Self::CompareVideos => "compare_videos",
            Self::ExplainMetrics => "explain_metrics",
            Self::ClassifyContent => "classify_content",
            Self::ExtractTags => "extract_tags",
            Self::ScoreTitle => "score_title",
            Self::QuickSummary => "quick_summary",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RoutingError::UnknownTask(s.to_string()))
    }
}

/// Errors building routing tables
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Unknown task kind: {0}")]
    UnknownTask(String),

    #[error("Task kind {0} has no primary provider")]
    MissingTask(TaskKind),

    #[error("Task kind {0} is mapped more than once")]
    DuplicateTask(TaskKind),

    #[error("Fallback order lists {0} more than once")]
    DuplicateProvider(ProviderId),

    #[error("Fallback order is missing {0}")]
    MissingProvider(ProviderId),
}

/// Total mapping from task kind to primary provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    primary: [ProviderId; TaskKind::COUNT],
}

impl RoutingTable {
    /// Creative → Claude, analytical → OpenAI, processing → Gemini
    pub fn standard() -> Self {
        Self::by_category(ProviderId::Claude, ProviderId::OpenAi, ProviderId::Gemini)
    }

    /// One provider per category
    pub fn by_category(creative: ProviderId, analytical: ProviderId, processing: ProviderId) -> Self {
        let primary = TaskKind::ALL.map(|kind| match kind.category() {
            TaskCategory::Creative => creative,
            TaskCategory::Analytical => analytical,
            TaskCategory::Processing => processing,
        });
        Self { primary }
    }

    /// Build from explicit entries; every kind must appear exactly once
    pub fn from_entries(
        entries: impl IntoIterator<Item = (TaskKind, ProviderId)>,
    ) -> Result<Self, RoutingError> {
        let mut slots: [Option<ProviderId>; TaskKind::COUNT] = [None; TaskKind::COUNT];

        for (kind, provider) in entries {
            let slot = &mut slots[kind.index()];
            if slot.is_some() {
                return Err(RoutingError::DuplicateTask(kind));
            }
            *slot = Some(provider);
        }

        let mut primary = [ProviderId::Claude; TaskKind::COUNT];
        for kind in TaskKind::ALL {
            primary[kind.index()] = slots[kind.index()].ok_or(RoutingError::MissingTask(kind))?;
        }

        Ok(Self { primary })
    }

    pub fn primary(&self, kind: TaskKind) -> ProviderId {
        self.primary[kind.index()]
    }

    /// All entries, in task-kind order
    pub fn entries(&self) -> impl Iterator<Item = (TaskKind, ProviderId)> + '_ {
        TaskKind::ALL.into_iter().map(|k| (k, self.primary(k)))
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Fixed, total, duplicate-free order over providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackOrder {
    order: Vec<ProviderId>,
}

impl FallbackOrder {
    /// Claude, OpenAI, Gemini
    pub fn standard() -> Self {
        Self {
            order: ProviderId::ALL.to_vec(),
        }
    }

    pub fn new(order: Vec<ProviderId>) -> Result<Self, RoutingError> {
        for (i, provider) in order.iter().enumerate() {
            if order[..i].contains(provider) {
                return Err(RoutingError::DuplicateProvider(*provider));
            }
        }
        for provider in ProviderId::ALL {
            if !order.contains(&provider) {
                return Err(RoutingError::MissingProvider(provider));
            }
        }
        Ok(Self { order })
    }

    pub fn as_slice(&self) -> &[ProviderId] {
        &self.order
    }

    /// The global order with `tried` removed, relative order preserved
    pub fn without(&self, tried: &[ProviderId]) -> Vec<ProviderId> {
        self.order
            .iter()
            .copied()
            .filter(|p| !tried.contains(p))
            .collect()
    }
}

impl Default for FallbackOrder {
    fn default() -> Self {
        Self::standard()
    }
}

/// A failed attempt against one provider
#[derive(Debug)]
pub struct ProviderFailure {
    pub provider: ProviderId,
    pub error: ProviderError,
}

/// Every provider in the chain failed
#[derive(Debug, Error)]
#[error("All providers exhausted for task {task}: {}", summarize(.failures))]
pub struct AllProvidersExhausted {
    pub task: TaskKind,
    /// One entry per attempted provider, in attempt order
    pub failures: Vec<ProviderFailure>,
}

impl AllProvidersExhausted {
    pub fn attempted(&self) -> Vec<ProviderId> {
        self.failures.iter().map(|f| f.provider).collect()
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.provider, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Successful resolution and the failures that preceded it
#[derive(Debug)]
pub struct Resolution<T> {
    pub provider: ProviderId,
    pub output: T,
    pub failures: Vec<ProviderFailure>,
}

impl<T> Resolution<T> {
    /// Whether a provider other than the primary produced the output
    pub fn fell_back(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Maps task kinds to providers and drives the fallback chain
#[derive(Debug, Clone, Default)]
pub struct TaskRouter {
    table: RoutingTable,
    fallback: FallbackOrder,
}

impl TaskRouter {
    pub fn new(table: RoutingTable, fallback: FallbackOrder) -> Self {
        Self { table, fallback }
    }

    /// Primary provider for `kind`
    pub fn route(&self, kind: TaskKind) -> ProviderId {
        self.table.primary(kind)
    }

    /// Providers still to try after `tried`
    pub fn fallback_chain(&self, tried: &[ProviderId]) -> Vec<ProviderId> {
        self.fallback.without(tried)
    }

    /// Full attempt order for `kind`: primary, then its fallback chain
    pub fn plan(&self, kind: TaskKind) -> Vec<ProviderId> {
        let primary = self.route(kind);
        let mut plan = vec![primary];
        plan.extend(self.fallback_chain(&[primary]));
        plan
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn fallback_order(&self) -> &FallbackOrder {
        &self.fallback
    }

    /// Run `execute` against the primary, then each fallback in turn
    ///
    /// Attempts are strictly sequential. The first success wins; if every
    /// provider fails the error carries each provider's failure in order.
    pub async fn resolve_with_fallback<T, F, Fut>(
        &self,
        kind: TaskKind,
        mut execute: F,
    ) -> Result<Resolution<T>, AllProvidersExhausted>
    where
        F: FnMut(ProviderId) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut failures: Vec<ProviderFailure> = Vec::new();
        let mut tried: Vec<ProviderId> = Vec::new();
        let mut next = Some(self.route(kind));

        while let Some(provider) = next {
            tried.push(provider);

            match execute(provider).await {
                Ok(output) => {
                    if !failures.is_empty() {
                        info!(task = %kind, %provider, failed = failures.len(), "Fallback provider succeeded");
                    }
                    return Ok(Resolution {
                        provider,
                        output,
                        failures,
                    });
                }
                Err(error) => {
                    warn!(task = %kind, %provider, error = %error, "Provider attempt failed");
                    failures.push(ProviderFailure { provider, error });
                }
            }

            next = self.fallback_chain(&tried).into_iter().next();
        }

        Err(AllProvidersExhausted {
            task: kind,
            failures,
        })
    }
}
