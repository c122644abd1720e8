use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::util::is_path_safe;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Issue,
    PullRequest,
    Unknown,
}

/// An inbound notification, decoded once and never modified afterwards.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub action: String,
    pub issue_number: Option<u64>,
    pub issue_url: Option<String>,
    pub repository_full_name: Option<String>,
    pub labels: BTreeSet<String>,
    pub raw_body: String,
}

impl TriggerEvent {
    pub fn has_label(&self, label: &str) -> bool { self.labels.contains(label) }
}

/// One integration to check. The name is not validated on construction; the
/// pipeline generator refuses names that are not path-safe.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem {
    pub name: String,
}

impl WorkItem {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into() } }

    pub fn is_path_safe(&self) -> bool { is_path_safe(&self.name) }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.name) }
}

/// Context shared by every job of a run.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct IssueContext {
    pub issue_number: u64,
    pub issue_url: String,
    pub repository: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Passed,
    Failed,
    NotFound,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
        }
    }

    pub fn is_terminal(&self) -> bool { !matches!(self, Self::Running) }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "not_found" => Ok(Self::NotFound),
            _ => Err(()),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "Running",
            Self::Passed => "Passed",
            Self::Failed => "Failed",
            Self::NotFound => "Not found",
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Result of one external command invocation within a job.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub message: String,
}

impl CheckEntry {
    pub fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self { name: name.into(), status, message: message.into() }
    }
}

/// The per-integration result document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub integration: String,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildkite_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub checks: Vec<CheckEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_output: Option<String>,
}

impl JobResult {
    pub fn new(
        integration: impl Into<String>,
        issue_number: Option<u64>,
        job_id: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            integration: integration.into(),
            status: JobStatus::Running,
            start_time: now,
            end_time: None,
            buildkite_job_id: job_id,
            issue_number,
            message: None,
            checks: Vec::new(),
            pr_url: None,
            pr_branch: None,
            check_output: None,
        }
    }

    /// Record a pull request. Returns false if one was already recorded.
    pub fn set_pr(&mut self, url: String, branch: String) -> bool {
        if self.pr_url.is_some() {
            return false;
        }
        self.pr_url = Some(url);
        self.pr_branch = Some(branch);
        true
    }

    /// Move to a terminal status. Returns false (and changes nothing) if already terminal.
    pub fn finish(&mut self, status: JobStatus, message: String, now: OffsetDateTime) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.message = Some(message);
        self.end_time = Some(now);
        true
    }

    pub fn check(&self, name: &str) -> Option<&CheckEntry> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Aggregate view over all job results of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub not_found: usize,
    pub results: Vec<JobResult>,
}

/// When a check instance should attempt to open a pull request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrPolicy {
    #[default]
    OnFailure,
    OnSuccess,
    Always,
    Never,
}

impl PrPolicy {
    pub const fn variants() -> &'static [Self] {
        &[Self::OnFailure, Self::OnSuccess, Self::Always, Self::Never]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnFailure => "on-failure",
            Self::OnSuccess => "on-success",
            Self::Always => "always",
            Self::Never => "never",
        }
    }

    pub fn applies(&self, passed: bool) -> bool {
        match self {
            Self::OnFailure => !passed,
            Self::OnSuccess => passed,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

impl FromStr for PrPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::variants().iter().copied().find(|v| v.as_str() == s).ok_or(())
    }
}

impl fmt::Display for PrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}
