pub mod git;
pub mod process;
pub mod publisher;
pub mod runner;
pub mod summary;

use std::sync::Arc;

use anyhow::{Context, Result};
use fanout_core::{
    config::Config,
    models::{IssueContext, WorkItem},
};
use fanout_pipeline::{PipelineSpec, generate::ENV_INTEGRATION};
use fanout_store::ResultStore;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    git::{Source, Vcs},
    publisher::Forge,
    runner::{CheckJob, run_check},
    summary::{Summary, summarize},
};

/// Shared context available to every check instance.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<Config>,
    /// Documents of the current run only, see [`ResultStore::for_run`].
    pub store: Arc<ResultStore>,
    pub source: Arc<Source>,
    pub vcs: Arc<dyn Vcs>,
    pub forge: Arc<dyn Forge>,
}

/// Identifier used to key the summary comment: the configured run id, or the issue.
pub fn run_id(config: &Config, issue_number: u64) -> String {
    config.run.run_id.clone().unwrap_or_else(|| format!("issue-{issue_number}"))
}

/// Execute a generated pipeline locally.
///
/// Every instance of the check step runs as its own task, at most `concurrency` at a time.
/// The summary is produced only after all of them have finished, whatever their outcome.
/// Documents left in the run's store by an earlier attempt are moved aside first, so the
/// summary covers exactly the instances of this attempt.
pub async fn run_pipeline(
    ctx: &JobContext,
    spec: &PipelineSpec,
    context: &IssueContext,
    run_id: &str,
    concurrency: Option<usize>,
) -> Result<Summary> {
    ctx.store.supersede()?;
    let instances = spec.instances(&ctx.config.pipeline.check_key);
    tracing::info!("Running {} check instances", instances.len());
    let sem = Arc::new(Semaphore::new(concurrency.unwrap_or(instances.len()).max(1)));
    let mut set = JoinSet::new();
    for instance in instances {
        let Some(name) = instance.env.get(ENV_INTEGRATION) else {
            tracing::warn!("Instance {} has no {ENV_INTEGRATION}", instance.index);
            continue;
        };
        let job = CheckJob {
            integration: WorkItem::new(name.clone()),
            context: context.clone(),
            job_id: Some(format!("{run_id}-{}", instance.index)),
        };
        let ctx = ctx.clone();
        let sem = sem.clone();
        set.spawn(async move {
            let _permit = sem.acquire().await;
            let outcome = run_check(&ctx, &job).await;
            (job, outcome)
        });
    }
    while let Some(result) = set.join_next().await {
        match result {
            Ok((_, Ok(outcome))) => {
                tracing::info!(
                    "Instance {} finished: {} (exit code {})",
                    outcome.key,
                    outcome.result.status,
                    outcome.exit_code
                );
            }
            Ok((job, Err(e))) => {
                tracing::error!(integration = %job.integration, "Check could not run: {e:?}");
            }
            Err(e) => {
                tracing::error!("Check task failed: {e:?}");
            }
        }
    }
    summarize(&ctx.store, run_id).context("Failed to summarize results")
}
