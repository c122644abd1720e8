//! One check instance: seed the result document, acquire the integration, validate it,
//! optionally open a pull request, and finalize.

use std::path::Path;

use anyhow::{Context, Result, bail};
use fanout_core::{
    ConfigError,
    models::{CheckEntry, CheckStatus, IssueContext, JobResult, JobStatus, WorkItem},
    util::{join_normalized, now, truncate_text},
};
use fanout_github::RepoName;
use fanout_store::{DocumentKey, ResultStore, StoreEvent};

use crate::{
    JobContext,
    process::{command_name, run_command},
    publisher::{PrPublisher, PrRequest, PrResult, branch_name},
};

pub const CHECK_EXISTS: &str = "exists";
pub const CHECK_FIX: &str = "fix";
pub const CHECK_PR: &str = "pr_creation";

pub const ABNORMAL_TERMINATION: &str = "Abnormal termination";

/// GitHub rejects bodies over 65536 characters.
const MAX_PR_OUTPUT: usize = 60_000;

/// Input of one check instance.
#[derive(Debug, Clone)]
pub struct CheckJob {
    pub integration: WorkItem,
    pub context: IssueContext,
    /// CI job identifier. Also used as the instance part of the document key.
    pub job_id: Option<String>,
}

#[derive(Debug)]
pub struct CheckOutcome {
    pub key: DocumentKey,
    pub result: JobResult,
    /// Mirrors the validator when it ran, 1 otherwise.
    pub exit_code: i32,
}

struct StageOutcome {
    status: JobStatus,
    message: String,
    exit_code: i32,
}

/// Marks the document failed unless [`Finalizer::finish`] ran first. Runs on every exit
/// path, including panics and the future being dropped mid-await.
struct Finalizer<'a> {
    store: &'a ResultStore,
    key: &'a DocumentKey,
    done: bool,
}

impl Finalizer<'_> {
    /// Write the terminal status. Until that succeeds, dropping still marks the document failed.
    fn finish(&mut self, status: JobStatus, message: String) -> Result<JobResult> {
        let result = self.store.finish(self.key, status, message)?;
        self.done = true;
        Ok(result)
    }
}

impl Drop for Finalizer<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::error!(key = %self.key, "Check ended without finalizing, marking failed");
        if let Err(e) =
            self.store.finish(self.key, JobStatus::Failed, ABNORMAL_TERMINATION.to_string())
        {
            tracing::error!(key = %self.key, "Failed to finalize result document: {e:#}");
        }
    }
}

/// Run a check instance to completion.
///
/// Errors only when the instance could not start (missing configuration, document could
/// not be created) or could not be finalized. Anything failing in between still ends in
/// a terminal document.
pub async fn run_check(ctx: &JobContext, job: &CheckJob) -> Result<CheckOutcome> {
    if ctx.config.check.validator.is_empty() {
        return Err(ConfigError::Missing("check.validator").into());
    }
    let integration = &job.integration.name;
    let instance = job.job_id.clone().unwrap_or_else(instance_id);
    let key = DocumentKey::new(integration, &instance);
    let seed = JobResult::new(
        integration.clone(),
        Some(job.context.issue_number),
        job.job_id.clone(),
        now(),
    );
    ctx.store.create(&key, &seed).context("Failed to seed result document")?;
    tracing::info!(integration = %integration, key = %key, "Starting check");

    let mut finalizer = Finalizer { store: &ctx.store, key: &key, done: false };
    let checkout = ctx.config.check.workdir.join(key.as_str());
    let stages = run_stages(ctx, job, &key, &checkout).await;
    ctx.source.release(&checkout, ctx.config.check.timeouts.acquire()).await;
    let (status, message, exit_code) = match stages {
        Ok(outcome) => (outcome.status, outcome.message, outcome.exit_code),
        Err(e) => {
            tracing::error!(integration = %integration, "Check aborted: {e:#}");
            (JobStatus::Failed, format!("{ABNORMAL_TERMINATION}: {e:#}"), 1)
        }
    };
    let result = finalizer.finish(status, message)?;
    tracing::info!(integration = %integration, status = %result.status, "Check finished");
    drop(finalizer);
    Ok(CheckOutcome { key, result, exit_code })
}

async fn run_stages(
    ctx: &JobContext,
    job: &CheckJob,
    key: &DocumentKey,
    checkout: &Path,
) -> Result<StageOutcome> {
    let check = &ctx.config.check;
    let name = &job.integration.name;
    if !job.integration.is_path_safe() {
        bail!("Integration name {name:?} is not a safe path component");
    }

    let root = ctx
        .source
        .acquire(checkout, check.timeouts.acquire())
        .await
        .context("Failed to acquire source")?;
    let resource = join_normalized(&root, Path::new(&check.integrations_dir).join(name));
    if !resource.is_dir() {
        let message = format!("Integration {name} not found in {}", check.integrations_dir);
        tracing::warn!(integration = %name, "{message}");
        ctx.store.append_check(
            key,
            CheckEntry::new(CHECK_EXISTS, CheckStatus::Failed, message.clone()),
        )?;
        return Ok(StageOutcome { status: JobStatus::NotFound, message, exit_code: 1 });
    }
    ctx.store.append_check(
        key,
        CheckEntry::new(CHECK_EXISTS, CheckStatus::Passed, resource.display().to_string()),
    )?;

    let envs = [
        ("INTEGRATION", name.clone()),
        ("ISSUE_NUMBER", job.context.issue_number.to_string()),
        ("ISSUE_URL", job.context.issue_url.clone()),
        ("REPOSITORY", job.context.repository.clone()),
    ];
    let validator = command_name(&check.validator);
    let (passed, exit_code, output) =
        match run_command(&check.validator, &resource, &envs, check.timeouts.validate()).await {
            Ok(out) => (out.success(), out.exit_code(), out.output),
            Err(e) => (false, 1, format!("{e:#}")),
        };
    tracing::info!(integration = %name, exit_code, "Validation {}", if passed { "passed" } else { "failed" });
    let status = if passed { CheckStatus::Passed } else { CheckStatus::Failed };
    let event = StoreEvent::CheckAppended { name: validator.clone(), status };
    let full_output = output.clone();
    ctx.store.update(key, event, |doc| {
        doc.checks.push(CheckEntry::new(validator, status, output.clone()));
        doc.check_output = Some(output);
    })?;

    if !check.fix_command.is_empty() {
        let (status, message) =
            match run_command(&check.fix_command, &resource, &envs, check.timeouts.validate()).await
            {
                Ok(out) if out.success() => (CheckStatus::Passed, out.output),
                Ok(out) => (CheckStatus::Failed, out.output),
                Err(e) => (CheckStatus::Failed, format!("{e:#}")),
            };
        ctx.store.append_check(key, CheckEntry::new(CHECK_FIX, status, message))?;
    }

    let mut message = if passed {
        "Validation passed".to_string()
    } else {
        format!("Validation failed with exit code {exit_code}")
    };
    let policy = check.effective_pr_policy();
    if !policy.applies(passed) {
        let reason = format!("not requested by PR policy {policy}");
        ctx.store.append_check(key, CheckEntry::new(CHECK_PR, CheckStatus::Skipped, reason))?;
    } else {
        let branch = branch_name(&check.branch_prefix, name, job.context.issue_number, now());
        match publish_pr(ctx, job, &resource, &branch, passed, &full_output).await {
            PrResult::Skipped => {
                let entry = CheckEntry::new(CHECK_PR, CheckStatus::Skipped, "No changes to commit");
                ctx.store.append_check(key, entry)?;
            }
            PrResult::Created { url } => {
                tracing::info!(integration = %name, "Opened pull request {url}");
                ctx.store.append_check(key, CheckEntry::new(CHECK_PR, CheckStatus::Passed, &url))?;
                message = format!("{message}; opened {url}");
                let event = StoreEvent::FieldSet { field: "pr_url".to_string() };
                ctx.store.update(key, event, |doc| {
                    doc.set_pr(url, branch);
                })?;
            }
            PrResult::Failed { message: error } => {
                let entry = CheckEntry::new(CHECK_PR, CheckStatus::Failed, error);
                ctx.store.append_check(key, entry)?;
            }
        }
    }

    let status = if passed { JobStatus::Passed } else { JobStatus::Failed };
    Ok(StageOutcome { status, message, exit_code })
}

async fn publish_pr(
    ctx: &JobContext,
    job: &CheckJob,
    resource: &Path,
    branch: &str,
    passed: bool,
    output: &str,
) -> PrResult {
    let check = &ctx.config.check;
    let name = &job.integration.name;
    let issue = job.context.issue_number;
    let repo = match job.context.repository.parse::<RepoName>() {
        Ok(repo) => repo,
        Err(e) => return PrResult::Failed { message: format!("{e:#}") },
    };
    let kind = if passed { "enhance" } else { "fix" };
    let title = format!("{} {kind}: {name} (#{issue})", check.pr_title_prefix);
    let commit_message = format!("{kind}({name}): automated changes for #{issue}");
    let body = format!(
        "Automated {kind} for integration `{name}`, requested in {}.\n\n\
         Validation {}.\n\n\
         <details>\n<summary>Validator output</summary>\n\n```\n{}\n```\n</details>\n",
        job.context.issue_url,
        if passed { "passed" } else { "failed" },
        truncate_text(output.trim_end(), MAX_PR_OUTPUT),
    );
    let publisher = PrPublisher {
        vcs: ctx.vcs.as_ref(),
        forge: ctx.forge.as_ref(),
        repo: &repo,
        base_branch: &ctx.config.github.base_branch,
    };
    let request = PrRequest {
        resource_path: resource,
        branch,
        commit_message: &commit_message,
        title: &title,
        body: &body,
    };
    let timeout = check.timeouts.publish();
    match tokio::time::timeout(timeout, publisher.publish(&request)).await {
        Ok(result) => result,
        Err(_) => PrResult::Failed { message: format!("Timed out after {}s", timeout.as_secs()) },
    }
}

fn instance_id() -> String {
    format!("{}-{}-{:04x}", std::process::id(), now().unix_timestamp(), rand::random::<u16>())
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc, time::Duration};

    use fanout_core::{config::Config, models::PrPolicy};

    use super::*;
    use crate::{
        git::Source,
        publisher::tests::{FakeForge, FakeVcs},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: JobContext,
        vcs: Arc<FakeVcs>,
        forge: Arc<FakeForge>,
    }

    fn fixture(validator: &str, policy: PrPolicy, changes: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("integrations/bar")).unwrap();
        let mut config = Config::default();
        config.check.validator = sh(validator);
        config.check.pr_policy = policy;
        config.check.workdir = dir.path().join("work");
        let vcs = Arc::new(FakeVcs { changes, ..Default::default() });
        let forge = Arc::new(FakeForge::default());
        let ctx = JobContext {
            config: Arc::new(config),
            store: Arc::new(ResultStore::open(dir.path().join("results")).unwrap()),
            source: Arc::new(Source::Local(source)),
            vcs: vcs.clone(),
            forge: forge.clone(),
        };
        Fixture { _dir: dir, ctx, vcs, forge }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn job(name: &str) -> CheckJob {
        CheckJob {
            integration: WorkItem::new(name),
            context: IssueContext {
                issue_number: 7,
                issue_url: "https://github.com/acme/docs/issues/7".to_string(),
                repository: "acme/docs".to_string(),
            },
            job_id: Some("job-1".to_string()),
        }
    }

    fn check_names(result: &JobResult) -> Vec<&str> {
        result.checks.iter().map(|c| c.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_not_found() {
        let f = fixture("exit 0", PrPolicy::Always, true);
        let outcome = run_check(&f.ctx, &job("foo")).await.unwrap();
        assert_eq!(outcome.result.status, JobStatus::NotFound);
        assert_eq!(outcome.result.integration, "foo");
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(check_names(&outcome.result), ["exists"]);
        assert_eq!(outcome.result.checks[0].status, CheckStatus::Failed);
        assert!(outcome.result.end_time.is_some());
        assert!(f.vcs.log.lock().unwrap().is_empty());
        assert_eq!(f.forge.pulls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_without_changes() {
        let mut f = fixture("echo broken link; exit 2", PrPolicy::OnFailure, false);
        Arc::get_mut(&mut f.ctx.config).unwrap().check.fix_command = sh("echo fixed nothing");
        let outcome = run_check(&f.ctx, &job("bar")).await.unwrap();
        let result = &outcome.result;
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, 2);
        assert_eq!(check_names(result), ["exists", "sh", "fix", "pr_creation"]);
        assert_eq!(result.check("sh").unwrap().status, CheckStatus::Failed);
        assert_eq!(result.check("pr_creation").unwrap().status, CheckStatus::Skipped);
        assert_eq!(result.check_output.as_deref(), Some("broken link\n"));
        assert_eq!(result.pr_url, None);
        assert_eq!(result.message.as_deref(), Some("Validation failed with exit code 2"));

        // The stored document matches what was returned
        let stored = f.ctx.store.load(&outcome.key).unwrap().unwrap();
        assert_eq!(&stored, result);
    }

    #[tokio::test]
    async fn test_passed_with_pull_request() {
        let f = fixture("echo ok", PrPolicy::Always, true);
        let outcome = run_check(&f.ctx, &job("bar")).await.unwrap();
        let result = &outcome.result;
        assert_eq!(result.status, JobStatus::Passed);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(result.check("pr_creation").unwrap().status, CheckStatus::Passed);
        let url = result.pr_url.as_deref().unwrap();
        assert!(url.starts_with("https://github.com/acme/docs/pull/1"));
        let branch = result.pr_branch.as_deref().unwrap();
        assert!(branch.starts_with("fanout/bar-7-"));
        assert!(url.ends_with(branch));

        let events: Vec<_> =
            f.ctx.store.events(&outcome.key).unwrap().into_iter().map(|e| e.event).collect();
        assert_eq!(events.first(), Some(&StoreEvent::Created));
        assert_eq!(events.last(), Some(&StoreEvent::Finished { status: JobStatus::Passed }));
        assert!(events.contains(&StoreEvent::FieldSet { field: "pr_url".to_string() }));
    }

    #[tokio::test]
    async fn test_policy_skips_pull_request() {
        let f = fixture("exit 1", PrPolicy::OnSuccess, true);
        let outcome = run_check(&f.ctx, &job("bar")).await.unwrap();
        let entry = outcome.result.check("pr_creation").unwrap();
        assert_eq!(entry.status, CheckStatus::Skipped);
        assert!(entry.message.contains("on-success"));
        assert!(f.vcs.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validator_killed() {
        let f = fixture("kill -9 $$", PrPolicy::Never, false);
        let outcome = run_check(&f.ctx, &job("bar")).await.unwrap();
        assert_eq!(outcome.result.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn test_validator_timeout() {
        let mut f = fixture("echo started; sleep 5", PrPolicy::Never, false);
        Arc::get_mut(&mut f.ctx.config).unwrap().check.timeouts.validate_secs = 1;
        let outcome = run_check(&f.ctx, &job("bar")).await.unwrap();
        assert_eq!(outcome.result.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.result.end_time.is_some());
        let entry = outcome.result.check("sh").unwrap();
        assert_eq!(entry.status, CheckStatus::Failed);
        assert_eq!(entry.message, "sh timed out after 1s");
        assert_eq!(outcome.result.message.as_deref(), Some("Validation failed with exit code 1"));
    }

    #[test]
    fn test_finalizer_retries_after_failed_finish() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let key = DocumentKey::new("bar", "job-1");

        let mut finalizer = Finalizer { store: &store, key: &key, done: false };
        // No document yet, so the final write fails
        assert!(finalizer.finish(JobStatus::Passed, "ok".to_string()).is_err());
        assert!(!finalizer.done);

        store.create(&key, &JobResult::new("bar", Some(7), None, now())).unwrap();
        drop(finalizer);
        let result = store.load(&key).unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.message.as_deref(), Some(ABNORMAL_TERMINATION));

        let other = DocumentKey::new("baz", "job-2");
        store.create(&other, &JobResult::new("baz", Some(7), None, now())).unwrap();
        let mut finalizer = Finalizer { store: &store, key: &other, done: false };
        finalizer.finish(JobStatus::Passed, "ok".to_string()).unwrap();
        drop(finalizer);
        assert_eq!(store.load(&other).unwrap().unwrap().status, JobStatus::Passed);
    }

    #[tokio::test]
    async fn test_dropped_mid_validation_is_finalized() {
        let f = fixture("sleep 5", PrPolicy::Never, false);
        let job = job("bar");
        let run = tokio::time::timeout(Duration::from_millis(200), run_check(&f.ctx, &job)).await;
        assert!(run.is_err());

        let key = DocumentKey::new("bar", "job-1");
        let result = f.ctx.store.load(&key).unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.message.as_deref(), Some(ABNORMAL_TERMINATION));
        assert!(result.end_time.is_some());
        assert_eq!(check_names(&result), ["exists"]);
    }

    #[tokio::test]
    async fn test_setup_failures() {
        let f = fixture("exit 0", PrPolicy::Never, false);
        let outcome = run_check(&f.ctx, &job("../bar")).await.unwrap();
        assert_eq!(outcome.result.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.result.message.unwrap().starts_with(ABNORMAL_TERMINATION));

        // A second instance with the same job id cannot reuse the document
        assert!(run_check(&f.ctx, &job("../bar")).await.is_err());

        let mut f = fixture("exit 0", PrPolicy::Never, false);
        Arc::get_mut(&mut f.ctx.config).unwrap().check.validator.clear();
        let err = run_check(&f.ctx, &job("bar")).await.unwrap_err();
        assert!(err.to_string().contains("check.validator"));
        assert!(f.ctx.store.list().unwrap().is_empty());
    }
}
