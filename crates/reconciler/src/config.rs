//! Controller configuration and the workflow catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use playop_core::ParamSet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::variables::Environment;

/// Parameter carrying the workflow's requested operation.
pub const ACTION_PARAM: &str = "action";

/// Action used when nothing else sets one.
pub const DEFAULT_ACTION: &str = "install";

/// Configuration for the reconciliation controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Number of concurrent reconciliation workers.
    pub workers: usize,
    /// Ceiling after which a workflow is killed.
    #[serde(with = "duration_ms")]
    pub workflow_timeout: Duration,
    /// Backoff between attempts on a busy resource.
    pub busy_backoff: RetryPolicy,
    /// Retry budget for status persistence.
    pub status_retry: RetryPolicy,
    /// Retry budget for secret lookups.
    pub secret_retry: RetryPolicy,
    /// Lines retained by the shared log channel.
    pub log_capacity: usize,
    /// Lines of workflow output quoted in a failure message.
    pub excerpt_lines: usize,
    /// Interval between full resyncs. Zero disables periodic resync.
    #[serde(with = "duration_ms")]
    pub resync_interval: Duration,
    /// Idle gate entries older than this are dropped.
    #[serde(with = "duration_ms")]
    pub idle_lock_ttl: Duration,
    /// Secret store connection.
    pub vault: VaultConfig,
    /// Workflow definition per resource kind.
    pub workflows: BTreeMap<String, WorkflowDefinition>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            workflow_timeout: Duration::from_secs(30 * 60),
            busy_backoff: RetryPolicy::busy(),
            status_retry: RetryPolicy::default(),
            secret_retry: RetryPolicy::default(),
            log_capacity: 10_000,
            excerpt_lines: 20,
            resync_interval: Duration::from_secs(300),
            idle_lock_ttl: Duration::from_secs(3600),
            vault: VaultConfig::default(),
            workflows: BTreeMap::new(),
        }
    }
}

impl ReconcilerConfig {
    /// Create a new builder.
    pub fn builder() -> ReconcilerConfigBuilder {
        ReconcilerConfigBuilder::default()
    }

    /// Defaults overridden from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a `PLAYOP_` variable holds an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env(&Environment::from_process())
    }

    /// Load configuration from a TOML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;

        if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("failed to parse {}: {e}", path.display())))
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("failed to parse {}: {e}", path.display())))
        }
    }

    /// Apply `PLAYOP_*` overrides from an environment snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable does not parse.
    pub fn with_env(mut self, env: &Environment) -> Result<Self> {
        if let Some(v) = env.get("PLAYOP_WORKERS") {
            self.workers = parse_number("PLAYOP_WORKERS", v)?;
        }
        if let Some(v) = env.get("PLAYOP_WORKFLOW_TIMEOUT_MS") {
            self.workflow_timeout = Duration::from_millis(parse_number("PLAYOP_WORKFLOW_TIMEOUT_MS", v)?);
        }
        if let Some(v) = env.get("PLAYOP_RESYNC_INTERVAL_MS") {
            self.resync_interval = Duration::from_millis(parse_number("PLAYOP_RESYNC_INTERVAL_MS", v)?);
        }
        if let Some(v) = env.get("PLAYOP_LOG_CAPACITY") {
            self.log_capacity = parse_number("PLAYOP_LOG_CAPACITY", v)?;
        }
        if let Some(v) = env.get("PLAYOP_VAULT_ADDR").or_else(|| env.get("VAULT_ADDR")) {
            let url = Url::parse(v)
                .map_err(|e| Error::invalid_config(format!("invalid vault address '{v}': {e}")))?;
            self.vault.address = Some(url);
        }
        if let Some(v) = env.get("PLAYOP_VAULT_TOKEN_FILE") {
            self.vault.token_file = Some(PathBuf::from(v));
        }
        Ok(self)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.workflow_timeout.is_zero() {
            return Err(Error::invalid_config("workflow_timeout must be positive"));
        }
        for (kind, workflow) in &self.workflows {
            workflow
                .validate()
                .map_err(|reason| Error::invalid_config(format!("workflow for kind '{kind}': {reason}")))?;
        }
        Ok(())
    }

    /// Workflow registered for a resource kind.
    #[must_use]
    pub fn workflow_for(&self, kind: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(kind)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(format!("{name} must be a number, got '{value}'")))
}

/// Secret store connection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Base URL of the secret store. Unset disables secret references.
    pub address: Option<Url>,
    /// File holding the bearer token, consulted when `VAULT_TOKEN` is unset.
    pub token_file: Option<PathBuf>,
}

/// An external workflow and the rules for building its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowDefinition {
    /// Executable to launch.
    pub program: String,
    /// Arguments placed before the playbook.
    pub args: Vec<String>,
    /// Playbook path passed after `args`. Empty omits it.
    pub playbook: String,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Lowest-precedence parameter values.
    pub defaults: ParamSet,
    /// Keys that must resolve to a value.
    pub required: Vec<String>,
    /// Keys for which an empty string counts as absent.
    pub secret_fields: Vec<String>,
    /// Parameter key to environment variable bindings.
    pub env_bindings: BTreeMap<String, String>,
    /// Accepted values of the `action` parameter. Empty accepts anything.
    pub allowed_actions: Vec<String>,
    /// Action run when a resource is deleted.
    pub finalize_action: String,
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self {
            program: "ansible-playbook".to_string(),
            args: Vec::new(),
            playbook: String::new(),
            working_dir: None,
            defaults: ParamSet::new(),
            required: Vec::new(),
            secret_fields: Vec::new(),
            env_bindings: BTreeMap::new(),
            allowed_actions: vec![DEFAULT_ACTION.to_string(), "uninstall".to_string()],
            finalize_action: "uninstall".to_string(),
        }
    }
}

impl WorkflowDefinition {
    /// Definition running `playbook` through `ansible-playbook`.
    pub fn playbook(playbook: impl Into<String>) -> Self {
        Self {
            playbook: playbook.into(),
            ..Self::default()
        }
    }

    /// Set the program.
    #[must_use]
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set a default value.
    #[must_use]
    pub fn default_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<playop_core::ParamValue>,
    ) -> Self {
        self.defaults.insert(key, value);
        self
    }

    /// Mark a key required.
    #[must_use]
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    /// Mark a key secret-bearing.
    #[must_use]
    pub fn secret(mut self, key: impl Into<String>) -> Self {
        self.secret_fields.push(key.into());
        self
    }

    /// Bind a key to an environment variable override.
    #[must_use]
    pub fn bind_env(mut self, key: impl Into<String>, var: impl Into<String>) -> Self {
        self.env_bindings.insert(key.into(), var.into());
        self
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.program.trim().is_empty() {
            return Err("program must not be empty".to_string());
        }
        if !self.allowed_actions.is_empty() && !self.allowed_actions.contains(&self.finalize_action) {
            return Err(format!(
                "finalize_action '{}' is not an allowed action",
                self.finalize_action
            ));
        }
        Ok(())
    }
}

/// Builder for [`ReconcilerConfig`].
#[derive(Debug, Default)]
pub struct ReconcilerConfigBuilder {
    config: ReconcilerConfig,
}

impl ReconcilerConfigBuilder {
    /// Set the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the workflow timeout ceiling.
    #[must_use]
    pub const fn workflow_timeout(mut self, timeout: Duration) -> Self {
        self.config.workflow_timeout = timeout;
        self
    }

    /// Set the busy backoff policy.
    #[must_use]
    pub fn busy_backoff(mut self, policy: RetryPolicy) -> Self {
        self.config.busy_backoff = policy;
        self
    }

    /// Set the status retry policy.
    #[must_use]
    pub fn status_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.status_retry = policy;
        self
    }

    /// Set the secret lookup retry policy.
    #[must_use]
    pub fn secret_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.secret_retry = policy;
        self
    }

    /// Set the resync interval.
    #[must_use]
    pub const fn resync_interval(mut self, interval: Duration) -> Self {
        self.config.resync_interval = interval;
        self
    }

    /// Set the idle lock TTL.
    #[must_use]
    pub const fn idle_lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.idle_lock_ttl = ttl;
        self
    }

    /// Register the workflow for a kind.
    #[must_use]
    pub fn workflow(mut self, kind: impl Into<String>, workflow: WorkflowDefinition) -> Self {
        self.config.workflows.insert(kind.into(), workflow);
        self
    }

    /// Build and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is inconsistent.
    pub fn build(self) -> Result<ReconcilerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serialization helper for Duration as milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
