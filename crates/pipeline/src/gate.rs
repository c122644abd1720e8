//! Decide whether an inbound event starts a run, and with which integrations.

use std::fmt;

use fanout_core::{
    config::TriggerConfig,
    models::{IssueContext, TriggerEvent, TriggerKind, WorkItem},
};
use fanout_github::payload::{PayloadError, parse_trigger_event};

use crate::frontmatter::{self, FrontMatterError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Accept { work_items: Vec<WorkItem>, context: IssueContext },
    Reject { reason: RejectReason },
}

/// Why an event was ignored. Rejection is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotAnIssue(TriggerKind),
    UnsupportedAction(String),
    MissingLabel(String),
    NoFrontMatter,
    InvalidFrontMatter(FrontMatterError),
    NoWorkItems,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnIssue(kind) => write!(f, "event is not an issue event ({kind:?})"),
            Self::UnsupportedAction(action) => write!(f, "action {action:?} is not handled"),
            Self::MissingLabel(label) => write!(f, "issue is not labeled {label:?}"),
            Self::NoFrontMatter => f.write_str("no front-matter block found in issue body"),
            Self::InvalidFrontMatter(e) => write!(f, "front-matter could not be read: {e}"),
            Self::NoWorkItems => f.write_str("front-matter lists no integrations"),
        }
    }
}

/// Evaluate a raw payload. Errors only for payloads that cannot be decoded, or for accepted
/// events missing the context every job needs.
pub fn evaluate_payload(
    payload: &[u8],
    config: &TriggerConfig,
) -> Result<GateDecision, PayloadError> {
    let event = parse_trigger_event(payload)?;
    evaluate(&event, config)
}

pub fn evaluate(event: &TriggerEvent, config: &TriggerConfig) -> Result<GateDecision, PayloadError> {
    let reject = |reason| Ok(GateDecision::Reject { reason });

    if event.kind != TriggerKind::Issue {
        return reject(RejectReason::NotAnIssue(event.kind));
    }
    if !config.accepted_actions.iter().any(|a| *a == event.action) {
        return reject(RejectReason::UnsupportedAction(event.action.clone()));
    }
    if !event.has_label(&config.required_label) {
        return reject(RejectReason::MissingLabel(config.required_label.clone()));
    }
    let Some(block) = frontmatter::extract_block(&event.raw_body) else {
        return reject(RejectReason::NoFrontMatter);
    };
    let names = match frontmatter::parse_list(
        &block,
        &config.front_matter_key,
        &frontmatter::default_parsers(),
    ) {
        Ok(names) => names,
        Err(e) => return reject(RejectReason::InvalidFrontMatter(e)),
    };
    if names.is_empty() {
        return reject(RejectReason::NoWorkItems);
    }

    let issue_number = event.issue_number.ok_or(PayloadError::MissingField("issue.number"))?;
    let issue_url = event
        .issue_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .ok_or(PayloadError::MissingField("issue.html_url"))?;
    let repository = event
        .repository_full_name
        .clone()
        .ok_or(PayloadError::MissingField("repository.full_name"))?;
    Ok(GateDecision::Accept {
        work_items: names.into_iter().map(WorkItem::new).collect(),
        context: IssueContext { issue_number, issue_url, repository },
    })
}
