use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{ConfigError, models::PrPolicy};

/// Default location of the optional config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "fanout.yml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub github: GitHubConfig,
    pub trigger: TriggerConfig,
    pub pipeline: PipelineConfig,
    pub check: CheckConfig,
    pub store: StoreConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubConfig {
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Override for GitHub Enterprise installations.
    pub api_url: Option<String>,
    pub base_branch: String,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self { token: None, api_url: None, base_branch: "main".to_string(), webhook_secret: None }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub required_label: String,
    pub front_matter_key: String,
    pub accepted_actions: Vec<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            required_label: "ai-doc-gen".to_string(),
            front_matter_key: "integrations".to_string(),
            accepted_actions: ["opened", "labeled", "edited", "reopened"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workflow_name: String,
    pub check_key: String,
    pub check_command: String,
    pub summary_key: String,
    pub summary_command: String,
    /// Glob of result documents uploaded by every check instance. Empty disables uploads.
    pub artifact_paths: String,
    /// Run before the summary command to fetch the uploaded documents. Empty disables it.
    pub artifact_download: String,
    /// Name of the secret holding the GitHub token. Only the name ever reaches the pipeline.
    pub token_secret: String,
    /// Agent targeting rules copied onto every step (e.g. `queue: docs`).
    pub agents: std::collections::BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workflow_name: "Integration checks".to_string(),
            check_key: "check".to_string(),
            check_command: "fanout check".to_string(),
            summary_key: "summary".to_string(),
            summary_command: "fanout summary".to_string(),
            artifact_paths: "results/**/*".to_string(),
            artifact_download: "buildkite-agent artifact download \"results/**/*\" .".to_string(),
            token_secret: "GITHUB_TOKEN".to_string(),
            agents: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Local directory or git URL holding the integrations. Empty means the
    /// triggering repository on GitHub.
    pub source: String,
    /// Branch or tag to check out when `source` is a git repository.
    pub source_ref: Option<String>,
    /// Scratch directory for clones.
    pub workdir: PathBuf,
    /// Directory inside the source where each integration lives.
    pub integrations_dir: String,
    /// Validation command; the integration directory is the working directory.
    pub validator: Vec<String>,
    /// Optional remediation command run after validation.
    pub fix_command: Vec<String>,
    pub pr_policy: PrPolicy,
    pub create_pr: bool,
    pub branch_prefix: String,
    pub pr_title_prefix: String,
    pub git_name: String,
    pub git_email: String,
    pub timeouts: StageTimeouts,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            source_ref: None,
            workdir: PathBuf::from("work"),
            integrations_dir: "integrations".to_string(),
            validator: Vec::new(),
            fix_command: Vec::new(),
            pr_policy: PrPolicy::default(),
            create_pr: true,
            branch_prefix: "fanout".to_string(),
            pr_title_prefix: "[fanout]".to_string(),
            git_name: "fanout-bot".to_string(),
            git_email: "fanout-bot@users.noreply.github.com".to_string(),
            timeouts: StageTimeouts::default(),
        }
    }
}

impl CheckConfig {
    /// `create_pr = false` overrides whatever policy is configured.
    pub fn effective_pr_policy(&self) -> PrPolicy {
        if self.create_pr { self.pr_policy } else { PrPolicy::Never }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub acquire_secs: u64,
    pub validate_secs: u64,
    pub publish_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self { Self { acquire_secs: 600, validate_secs: 1800, publish_secs: 300 } }
}

impl StageTimeouts {
    pub fn acquire(&self) -> Duration { Duration::from_secs(self.acquire_secs) }

    pub fn validate(&self) -> Duration { Duration::from_secs(self.validate_secs) }

    pub fn publish(&self) -> Duration { Duration::from_secs(self.publish_secs) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub results_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self { Self { results_dir: PathBuf::from("results") } }
}

/// Per-run parameters, normally supplied by the CI environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub issue_number: Option<u64>,
    pub issue_url: Option<String>,
    pub repository: Option<String>,
    pub integration: Option<String>,
    pub integrations: Vec<String>,
    pub run_id: Option<String>,
    pub job_id: Option<String>,
}

impl RunConfig {
    pub fn require_issue_number(&self) -> Result<u64, ConfigError> {
        self.issue_number.ok_or(ConfigError::Missing("ISSUE_NUMBER"))
    }

    pub fn require_issue_url(&self) -> Result<&str, ConfigError> {
        non_empty(self.issue_url.as_deref(), "ISSUE_URL")
    }

    pub fn require_repository(&self) -> Result<&str, ConfigError> {
        non_empty(self.repository.as_deref(), "REPOSITORY")
    }

    pub fn require_integration(&self) -> Result<&str, ConfigError> {
        non_empty(self.integration.as_deref(), "INTEGRATION")
    }

    pub fn require_integrations(&self) -> Result<&[String], ConfigError> {
        if self.integrations.is_empty() {
            return Err(ConfigError::Missing("INTEGRATIONS"));
        }
        Ok(&self.integrations)
    }
}

fn non_empty<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, ConfigError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid { name, reason: format!("expected a boolean, got {other:?}") }),
    }
}

/// Split a list given as a single parameter. Commas, whitespace and newlines all separate.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load the YAML config file. An explicit path must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        if !required && !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let file = File::open(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_yaml::from_reader(BufReader::new(file))
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Overlay environment-style parameters. `lookup` is usually `std::env::var(..).ok()`;
    /// empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where F: Fn(&str) -> Option<String> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ISSUE_NUMBER") {
            let number = v.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                name: "ISSUE_NUMBER",
                reason: e.to_string(),
            })?;
            self.run.issue_number = Some(number);
        }
        if let Some(v) = get("ISSUE_URL") {
            self.run.issue_url = Some(v);
        }
        if let Some(v) = get("REPOSITORY") {
            self.run.repository = Some(v);
        }
        if let Some(v) = get("INTEGRATION") {
            self.run.integration = Some(v);
        }
        if let Some(v) = get("INTEGRATIONS") {
            self.run.integrations = split_list(&v);
        }
        if let Some(v) = get("RUN_ID").or_else(|| get("BUILDKITE_BUILD_ID")) {
            self.run.run_id = Some(v);
        }
        if let Some(v) = get("JOB_ID").or_else(|| get("BUILDKITE_JOB_ID")) {
            self.run.job_id = Some(v);
        }
        if let Some(v) = get("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }
        if let Some(v) = get("WEBHOOK_SECRET") {
            self.github.webhook_secret = Some(v);
        }
        if let Some(v) = get("BASE_BRANCH") {
            self.github.base_branch = v;
        }
        if let Some(v) = get("REQUIRED_LABEL") {
            self.trigger.required_label = v;
        }
        if let Some(v) = get("WORKFLOW_NAME") {
            self.pipeline.workflow_name = v;
        }
        if let Some(v) = get("BRANCH_PREFIX") {
            self.check.branch_prefix = v;
        }
        if let Some(v) = get("PR_TITLE_PREFIX") {
            self.check.pr_title_prefix = v;
        }
        if let Some(v) = get("CREATE_PR") {
            self.check.create_pr = parse_bool("CREATE_PR", &v)?;
        }
        if let Some(v) = get("PR_POLICY") {
            self.check.pr_policy = v.trim().parse().map_err(|()| ConfigError::Invalid {
                name: "PR_POLICY",
                reason: format!("unknown policy {v:?}"),
            })?;
        }
        if let Some(v) = get("GIT_USER_NAME") {
            self.check.git_name = v;
        }
        if let Some(v) = get("GIT_USER_EMAIL") {
            self.check.git_email = v;
        }
        if let Some(v) = get("RESULTS_DIR") {
            self.store.results_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        non_empty(self.github.token.as_deref(), "GITHUB_TOKEN")
    }
}
