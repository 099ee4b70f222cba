//! Configuration for vidcore.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VIDCORE_HOME, ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY)
//! 2. Config file (.vidcore/config.yaml)
//! 3. Defaults (~/.vidcore)
//!
//! Config file discovery:
//! - Searches current directory and parents for .vidcore/config.yaml
//! - Paths in config file are relative to the .vidcore/ directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{ProviderId, ProviderRegistry, ProviderSettings};
use crate::core::{BackoffStrategy, FallbackOrder, PolicyTable, RoutingTable, TaskRouter};
use crate::domain::QueueName;
use crate::realtime::RealtimeSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".vidcore";
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Per-queue policy overrides
    #[serde(default)]
    pub queues: HashMap<QueueName, QueueOverride>,
    #[serde(default)]
    pub realtime: RealtimeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .vidcore/)
    pub home: Option<String>,
    /// Job journal file (relative to .vidcore/)
    pub journal: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    pub timeout_seconds: Option<u64>,
    pub claude: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub gemini: Option<ProviderConfig>,
}

impl ProvidersConfig {
    fn get(&self, id: ProviderId) -> Option<&ProviderConfig> {
        match id {
            ProviderId::Claude => self.claude.as_ref(),
            ProviderId::OpenAi => self.openai.as_ref(),
            ProviderId::Gemini => self.gemini.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

/// Primary provider per task category, plus the global fallback order
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    pub creative: Option<ProviderId>,
    pub analytical: Option<ProviderId>,
    pub processing: Option<ProviderId>,
    pub fallback: Option<Vec<ProviderId>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueOverride {
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffStrategy>,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
    pub concurrency: Option<usize>,
    pub timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the state directory
    pub home: PathBuf,
    /// Job journal location
    pub journal: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Credentials, endpoints and default models per provider
    pub providers: HashMap<ProviderId, ProviderSettings>,
    /// Upper bound on a single provider call
    pub provider_timeout: Duration,
    pub routing: RoutingTable,
    pub fallback: FallbackOrder,
    pub policies: PolicyTable,
    pub realtime: RealtimeSettings,
}

impl ResolvedConfig {
    pub fn router(&self) -> TaskRouter {
        TaskRouter::new(self.routing.clone(), self.fallback.clone())
    }

    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new(&self.providers, self.provider_timeout)
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file_from(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_config_file_from(&cwd)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file, environment and defaults
///
/// `env` stands in for `std::env::var` so resolution can be tested.
fn resolve(
    file: Option<(&Path, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let (config_path, config) = match file {
        Some((path, config)) => (Some(path), Some(config)),
        None => (None, None),
    };
    // Relative paths in the file are anchored at .vidcore/
    let config_dir = config_path.and_then(Path::parent).unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env("VIDCORE_HOME") {
        PathBuf::from(env_home)
    } else if let Some(home_path) = config.as_ref().and_then(|c| c.paths.home.as_deref()) {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let journal = config
        .as_ref()
        .and_then(|c| c.paths.journal.as_deref())
        .map(|p| resolve_path(config_dir, p))
        .unwrap_or_else(|| home.join("jobs.jsonl"));

    let providers_config = config.as_ref().map(|c| c.providers.clone()).unwrap_or_default();
    let providers = ProviderId::ALL
        .into_iter()
        .map(|id| {
            let file_entry = providers_config.get(id).cloned().unwrap_or_default();
            let settings = ProviderSettings {
                api_key: env(id.credential_env()).or(file_entry.api_key),
                base_url: file_entry.base_url,
                model: file_entry.model,
            };
            (id, settings)
        })
        .collect();

    let provider_timeout = Duration::from_secs(
        providers_config
            .timeout_seconds
            .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS),
    );
    if provider_timeout.is_zero() {
        anyhow::bail!("providers.timeout_seconds must be greater than zero");
    }

    let routing_config = config.as_ref().map(|c| c.routing.clone()).unwrap_or_default();
    let routing = RoutingTable::by_category(
        routing_config.creative.unwrap_or(ProviderId::Claude),
        routing_config.analytical.unwrap_or(ProviderId::OpenAi),
        routing_config.processing.unwrap_or(ProviderId::Gemini),
    );
    let fallback = match routing_config.fallback {
        Some(order) => FallbackOrder::new(order).context("Invalid routing.fallback")?,
        None => FallbackOrder::standard(),
    };

    let mut policies = PolicyTable::standard();
    if let Some(config) = &config {
        for (queue, overrides) in &config.queues {
            let policy = apply_override(policies.get(*queue).clone(), overrides);
            policies
                .set(*queue, policy)
                .with_context(|| format!("Invalid policy for queue {}", queue))?;
        }
    }

    let realtime = config.as_ref().map(|c| c.realtime.clone()).unwrap_or_default();

    Ok(ResolvedConfig {
        home,
        journal,
        config_file: config_path.map(Path::to_path_buf),
        providers,
        provider_timeout,
        routing,
        fallback,
        policies,
        realtime,
    })
}

fn apply_override(mut policy: crate::core::QueuePolicy, overrides: &QueueOverride) -> crate::core::QueuePolicy {
    if let Some(max_attempts) = overrides.max_attempts {
        policy.max_attempts = max_attempts;
    }
    if let Some(backoff) = overrides.backoff {
        policy.backoff = backoff;
    }
    if let Some(keep) = overrides.remove_on_complete {
        policy.remove_on_complete = keep;
    }
    if let Some(keep) = overrides.remove_on_fail {
        policy.remove_on_fail = keep;
    }
    if let Some(concurrency) = overrides.concurrency {
        policy.concurrency = concurrency;
    }
    if let Some(secs) = overrides.timeout_seconds {
        policy.timeout = Duration::from_secs(secs);
    }
    policy
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_path = find_config_file();
    let file = match &config_path {
        Some(path) => Some((path.as_path(), load_config_file(path)?)),
        None => None,
    };

    resolve(file, |key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the vidcore state directory
pub fn vidcore_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the job journal path ($VIDCORE_HOME/jobs.jsonl unless configured)
pub fn journal_path() -> Result<PathBuf> {
    Ok(config()?.journal.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskKind;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse(yaml: &str) -> ConfigFile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, no_env, PathBuf::from("/home/test/.vidcore")).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/test/.vidcore"));
        assert_eq!(config.journal, PathBuf::from("/home/test/.vidcore/jobs.jsonl"));
        assert!(config.config_file.is_none());
        assert_eq!(config.provider_timeout, Duration::from_secs(60));
        assert_eq!(config.routing, RoutingTable::standard());
        assert_eq!(config.policies, PolicyTable::standard());
        assert!(config.providers.values().all(|p| p.api_key.is_none()));
    }

    #[test]
    fn test_env_key_overrides_file() {
        let file = parse(
            r#"
version: "1.0"
providers:
  timeout_seconds: 20
  claude:
    api_key: from-file
    model: claude-3-opus-latest
  gemini:
    api_key: gemini-file
"#,
        );
        let env = |key: &str| match key {
            "ANTHROPIC_API_KEY" => Some("from-env".to_string()),
            "GEMINI_API_KEY" => Some("   ".to_string()),
            _ => None,
        };

        let path = PathBuf::from("/proj/.vidcore/config.yaml");
        let config = resolve(Some((path.as_path(), file)), env, PathBuf::from("/h")).unwrap();

        let claude = &config.providers[&ProviderId::Claude];
        assert_eq!(claude.api_key.as_deref(), Some("from-env"));
        assert_eq!(claude.model.as_deref(), Some("claude-3-opus-latest"));
        // Blank env values do not shadow the file
        assert_eq!(
            config.providers[&ProviderId::Gemini].api_key.as_deref(),
            Some("gemini-file")
        );
        assert_eq!(config.provider_timeout, Duration::from_secs(20));
        assert_eq!(config.config_file, Some(path));
    }

    #[test]
    fn test_queue_and_routing_overrides() {
        let file = parse(
            r#"
version: "1.0"
routing:
  creative: gemini
  fallback: [gemini, claude, openai]
queues:
  notifications:
    max_attempts: 4
    concurrency: 8
  video-process:
    backoff:
      type: fixed
      delay_ms: 1000
    timeout_seconds: 600
realtime:
  session_cookie: vc_session
"#,
        );

        let path = PathBuf::from("/proj/.vidcore/config.yaml");
        let config = resolve(Some((path.as_path(), file)), no_env, PathBuf::from("/h")).unwrap();

        assert_eq!(config.routing.primary(TaskKind::GenerateTitle), ProviderId::Gemini);
        assert_eq!(config.routing.primary(TaskKind::AnalyzeChannel), ProviderId::OpenAi);
        assert_eq!(
            config.fallback.as_slice(),
            &[ProviderId::Gemini, ProviderId::Claude, ProviderId::OpenAi]
        );

        let notifications = config.policies.get(QueueName::Notifications);
        assert_eq!(notifications.max_attempts, 4);
        assert_eq!(notifications.concurrency, 8);
        assert_eq!(notifications.backoff, BackoffStrategy::Fixed { delay_ms: 60_000 });

        let video = config.policies.get(QueueName::VideoProcess);
        assert_eq!(video.backoff, BackoffStrategy::Fixed { delay_ms: 1000 });
        assert_eq!(video.timeout, Duration::from_secs(600));

        assert_eq!(config.realtime.session_cookie, "vc_session");
        assert_eq!(config.realtime.connection_buffer, 256);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let file = parse(
            r#"
version: "1.0"
queues:
  scheduler:
    max_attempts: 0
"#,
        );
        let path = PathBuf::from("/proj/.vidcore/config.yaml");
        assert!(resolve(Some((path.as_path(), file)), no_env, PathBuf::from("/h")).is_err());

        let file = parse(
            r#"
version: "1.0"
routing:
  fallback: [claude, claude, gemini]
"#,
        );
        assert!(resolve(Some((path.as_path(), file)), no_env, PathBuf::from("/h")).is_err());
    }

    #[test]
    fn test_config_file_discovery_and_paths() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: state
  journal: /var/lib/vidcore/jobs.jsonl
"#
        )
        .unwrap();

        let found = find_config_file_from(&nested).unwrap();
        assert_eq!(found, config_path);

        let parsed = load_config_file(&found).unwrap();
        assert_eq!(parsed.version, "1.0");

        let config = resolve(Some((found.as_path(), parsed)), no_env, PathBuf::from("/h")).unwrap();
        assert_eq!(config.home, config_dir.join("state"));
        assert_eq!(config.journal, PathBuf::from("/var/lib/vidcore/jobs.jsonl"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
