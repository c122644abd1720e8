//! Decoding of inbound GitHub event payloads into [`TriggerEvent`]s.

use std::collections::BTreeSet;

use fanout_core::models::{TriggerEvent, TriggerKind};
use serde::Deserialize;

use crate::extract_github_url;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is missing required field {0}")]
    MissingField(&'static str),
}

#[derive(Deserialize)]
struct RawPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    issue: Option<RawIssue>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
    #[serde(default)]
    repository: Option<RawRepository>,
}

#[derive(Deserialize)]
struct RawIssue {
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    /// Present when the "issue" is really a pull request (issue_comment events).
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Named { name: String },
    Plain(String),
}

impl RawLabel {
    fn into_name(self) -> String {
        match self {
            Self::Named { name } | Self::Plain(name) => name,
        }
    }
}

#[derive(Deserialize)]
struct RawRepository {
    #[serde(default)]
    full_name: Option<String>,
}

/// Decode a raw webhook payload.
///
/// Only structural problems are errors. Whether the event is acceptable is decided later
/// by the gate, so an unrelated event still decodes (as [`TriggerKind::Unknown`] or
/// [`TriggerKind::PullRequest`]).
pub fn parse_trigger_event(data: &[u8]) -> Result<TriggerEvent, PayloadError> {
    let raw: RawPayload = serde_json::from_slice(data)?;
    let action = raw.action.unwrap_or_default();
    let repository_full_name =
        raw.repository.and_then(|r| r.full_name).filter(|name| !name.trim().is_empty());

    if raw.pull_request.is_some() {
        return Ok(TriggerEvent {
            kind: TriggerKind::PullRequest,
            action,
            issue_number: None,
            issue_url: None,
            repository_full_name,
            labels: BTreeSet::new(),
            raw_body: String::new(),
        });
    }

    let Some(issue) = raw.issue else {
        return Ok(TriggerEvent {
            kind: TriggerKind::Unknown,
            action,
            issue_number: None,
            issue_url: None,
            repository_full_name,
            labels: BTreeSet::new(),
            raw_body: String::new(),
        });
    };

    let kind =
        if issue.pull_request.is_some() { TriggerKind::PullRequest } else { TriggerKind::Issue };
    let issue_number = issue.number;
    if kind == TriggerKind::Issue && issue_number.is_none() {
        return Err(PayloadError::MissingField("issue.number"));
    }
    let repository_full_name = repository_full_name.or_else(|| {
        let url = issue.html_url.as_deref()?;
        extract_github_url(url).map(|(owner, repo)| format!("{owner}/{repo}"))
    });
    Ok(TriggerEvent {
        kind,
        action,
        issue_number,
        issue_url: issue.html_url,
        repository_full_name,
        labels: issue.labels.into_iter().map(RawLabel::into_name).collect(),
        raw_body: issue.body.unwrap_or_default(),
    })
}
