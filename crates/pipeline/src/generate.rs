//! Fan-out pipeline generation.
//!
//! The generated document has exactly two steps: a check step templated over a
//! matrix of integration names, and a summary step that waits for every check
//! instance and runs even when some of them failed.

use std::collections::BTreeMap;

use fanout_core::{
    config::PipelineConfig,
    models::{IssueContext, WorkItem},
};
use serde::Serialize;

/// Placeholder substituted with the current matrix value by the CI system.
pub const MATRIX_PLACEHOLDER: &str = "{{matrix}}";

pub const ENV_ISSUE_NUMBER: &str = "ISSUE_NUMBER";
pub const ENV_ISSUE_URL: &str = "ISSUE_URL";
pub const ENV_REPOSITORY: &str = "REPOSITORY";
pub const ENV_INTEGRATION: &str = "INTEGRATION";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("no integrations to check")]
    EmptyWorkItems,
    #[error("integration name {0:?} is not a safe path component")]
    UnsafeName(String),
    #[error("context field {0} is empty")]
    MissingContext(&'static str),
    #[error("failed to serialize pipeline: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSpec {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub label: String,
    pub key: String,
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_dependency_failure: bool,
    pub env: BTreeMap<String, String>,
    /// Names of secrets the step may read. Values are resolved by the agent, never inlined.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, String>,
    /// Files uploaded when the step ends, whatever its outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_paths: Option<String>,
}

/// One concrete job of the pipeline, with the matrix value substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub step_key: String,
    pub index: usize,
    pub env: BTreeMap<String, String>,
}

impl PipelineSpec {
    pub fn to_yaml(&self) -> Result<String, GenerationError> { Ok(serde_yaml::to_string(self)?) }

    pub fn step(&self, key: &str) -> Option<&Step> { self.steps.iter().find(|s| s.key == key) }

    /// Expand the matrix of `key` into its instances, in matrix order.
    pub fn instances(&self, key: &str) -> Vec<Instance> {
        let Some(step) = self.step(key) else {
            return Vec::new();
        };
        let Some(matrix) = &step.matrix else {
            return vec![Instance { step_key: step.key.clone(), index: 0, env: step.env.clone() }];
        };
        matrix
            .iter()
            .enumerate()
            .map(|(index, value)| Instance {
                step_key: step.key.clone(),
                index,
                env: step
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.replace(MATRIX_PLACEHOLDER, value)))
                    .collect(),
            })
            .collect()
    }
}

pub fn generate(
    work_items: &[WorkItem],
    context: &IssueContext,
    config: &PipelineConfig,
) -> Result<PipelineSpec, GenerationError> {
    if work_items.is_empty() {
        return Err(GenerationError::EmptyWorkItems);
    }
    if let Some(item) = work_items.iter().find(|item| !item.is_path_safe()) {
        return Err(GenerationError::UnsafeName(item.name.clone()));
    }
    if context.issue_url.trim().is_empty() {
        return Err(GenerationError::MissingContext("issue_url"));
    }
    if context.repository.trim().is_empty() {
        return Err(GenerationError::MissingContext("repository"));
    }

    let issue_number = context.issue_number.to_string();
    let secrets = vec![config.token_secret.clone()];

    let check = Step {
        label: format!("{}: {MATRIX_PLACEHOLDER}", config.workflow_name),
        key: config.check_key.clone(),
        commands: vec![config.check_command.clone()],
        matrix: Some(work_items.iter().map(|item| item.name.clone()).collect()),
        depends_on: None,
        allow_dependency_failure: false,
        env: BTreeMap::from([
            (ENV_ISSUE_NUMBER.to_string(), issue_number.clone()),
            (ENV_ISSUE_URL.to_string(), context.issue_url.clone()),
            (ENV_REPOSITORY.to_string(), context.repository.clone()),
            (ENV_INTEGRATION.to_string(), MATRIX_PLACEHOLDER.to_string()),
        ]),
        secrets: secrets.clone(),
        agents: config.agents.clone(),
        artifact_paths: non_empty(&config.artifact_paths),
    };
    let summary = Step {
        label: format!("{}: summary", config.workflow_name),
        key: config.summary_key.clone(),
        commands: non_empty(&config.artifact_download)
            .into_iter()
            .chain([config.summary_command.clone()])
            .collect(),
        matrix: None,
        depends_on: Some(config.check_key.clone()),
        allow_dependency_failure: true,
        env: BTreeMap::from([
            (ENV_ISSUE_NUMBER.to_string(), issue_number),
            (ENV_REPOSITORY.to_string(), context.repository.clone()),
        ]),
        secrets,
        agents: config.agents.clone(),
        artifact_paths: None,
    };
    tracing::info!(
        "Generated pipeline for issue #{} with {} check instances",
        context.issue_number,
        work_items.len()
    );
    Ok(PipelineSpec { steps: vec![check, summary] })
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}
