//! AI completion dispatch: task routing on top of the provider registry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::adapters::{CompletionOptions, ProviderId, ProviderRegistry};

use super::router::{AllProvidersExhausted, TaskCategory, TaskKind, TaskRouter};

/// An AI request; immutable once built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,

    /// Main input (video title, transcript, question, ...)
    pub input: String,

    /// Optional supporting context (channel niche, prior metrics, ...)
    #[serde(default)]
    pub context: Option<String>,

    #[serde(default)]
    pub options: CompletionOptions,
}

impl Task {
    pub fn new(kind: TaskKind, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
            context: None,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Prompt text sent to the provider
    pub fn prompt(&self) -> String {
        match &self.context {
            Some(context) if !context.trim().is_empty() => {
                format!("{}\n\nContext:\n{}", self.input, context)
            }
            _ => self.input.clone(),
        }
    }

    /// Options with the category's system prompt filled in
    pub fn effective_options(&self) -> CompletionOptions {
        let mut options = self.options.clone();
        if options.system_prompt.is_none() {
            options.system_prompt = Some(system_prompt_for(self.kind.category()).to_string());
        }
        options
    }
}

/// Default system prompt per task category
pub fn system_prompt_for(category: TaskCategory) -> &'static str {
    match category {
        TaskCategory::Creative => {
            "You are a creative YouTube content strategist. Write engaging, \
             original copy that fits the creator's voice and audience."
        }
        TaskCategory::Analytical => {
            "You are a YouTube analytics expert. Interpret metrics carefully, \
             explain causes, and give concrete, data-backed recommendations."
        }
        TaskCategory::Processing => {
            "You are a precise content classifier. Answer with the requested \
             format only, without commentary."
        }
    }
}

/// Generated text and where it came from
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub text: String,
    pub provider: ProviderId,
    /// True when the primary provider failed and a fallback answered
    pub fell_back: bool,
}

/// Runs tasks through the router against the provider registry
pub struct AiDispatcher {
    router: TaskRouter,
    registry: Arc<ProviderRegistry>,
}

impl AiDispatcher {
    pub fn new(router: TaskRouter, registry: Arc<ProviderRegistry>) -> Self {
        Self { router, registry }
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Complete `task`, falling back across providers on failure
    #[instrument(skip(self, task), fields(task = %task.kind))]
    pub async fn complete(&self, task: &Task) -> Result<Completion, AllProvidersExhausted> {
        let prompt = task.prompt();
        let options = task.effective_options();

        let resolution = self
            .router
            .resolve_with_fallback(task.kind, |provider| {
                let registry = Arc::clone(&self.registry);
                let prompt = &prompt;
                let options = &options;
                async move { registry.complete(provider, prompt, options).await }
            })
            .await?;

        Ok(Completion {
            fell_back: resolution.fell_back(),
            provider: resolution.provider,
            text: resolution.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ProviderError;

    #[test]
    fn test_prompt_includes_context() {
        let task = Task::new(TaskKind::GenerateTitle, "Video about sourdough")
            .with_context("Channel niche: home baking");
        assert_eq!(
            task.prompt(),
            "Video about sourdough\n\nContext:\nChannel niche: home baking"
        );
        assert_eq!(Task::new(TaskKind::ScoreTitle, "x").prompt(), "x");
    }

    #[test]
    fn test_category_system_prompt_unless_overridden() {
        let task = Task::new(TaskKind::AnalyzeChannel, "stats");
        assert_eq!(
            task.effective_options().system_prompt.as_deref(),
            Some(system_prompt_for(TaskCategory::Analytical))
        );

        let custom = task.with_options(CompletionOptions {
            system_prompt: Some("Be brief".to_string()),
            ..Default::default()
        });
        assert_eq!(custom.effective_options().system_prompt.as_deref(), Some("Be brief"));
    }

    #[tokio::test]
    async fn test_no_configured_provider_exhausts_chain() {
        let dispatcher = AiDispatcher::new(TaskRouter::default(), Arc::new(ProviderRegistry::empty()));
        let err = dispatcher
            .complete(&Task::new(TaskKind::CompareVideos, "a vs b"))
            .await
            .unwrap_err();

        assert_eq!(
            err.attempted(),
            vec![ProviderId::OpenAi, ProviderId::Claude, ProviderId::Gemini]
        );
        assert!(err
            .failures
            .iter()
            .all(|f| matches!(f.error, ProviderError::Unconfigured(_))));
    }
}
