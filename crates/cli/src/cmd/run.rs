use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use argp::FromArgs;
use fanout_core::{
    config::Config,
    models::{PrPolicy, WorkItem},
};
use fanout_github::RepoName;
use fanout_jobs::{run_id, run_pipeline, summary::publish};
use fanout_pipeline::{GateDecision, evaluate_payload, generate};

use crate::util::{issue_context, job_context, native_path, read_input};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Gate, generate and run every check locally, then summarize.
#[argp(subcommand, name = "run")]
pub struct Args {
    #[argp(option, short = 'p', from_str_fn(native_path))]
    /// payload file; without it the integrations come from $INTEGRATIONS
    payload: Option<PathBuf>,
    #[argp(option, short = 'j')]
    /// maximum number of checks running at once
    concurrency: Option<usize>,
    #[argp(option)]
    /// local directory or git URL holding the integrations
    source: Option<String>,
    #[argp(switch)]
    /// print the summary without posting it
    no_publish: bool,
}

pub async fn run(args: Args, mut config: Config) -> Result<ExitCode> {
    if let Some(source) = args.source {
        config.check.source = source;
    }
    let (work_items, context) = match &args.payload {
        Some(path) => match evaluate_payload(&read_input(Some(path))?, &config.trigger)? {
            GateDecision::Accept { work_items, context } => (work_items, context),
            GateDecision::Reject { reason } => {
                tracing::info!("Event rejected: {reason}");
                return Ok(ExitCode::SUCCESS);
            }
        },
        None => {
            let names = config.run.require_integrations()?;
            (names.iter().map(|n| WorkItem::new(n.as_str())).collect(), issue_context(&config)?)
        }
    };
    let spec = generate(&work_items, &context, &config.pipeline)?;

    let needs_token = !args.no_publish || config.check.effective_pr_policy() != PrPolicy::Never;
    let token = if needs_token {
        Some(config.require_token()?.to_string())
    } else {
        config.github.token.clone()
    };
    let run_id = run_id(&config, context.issue_number);
    let ctx = job_context(config, &context.repository, token.as_deref(), &run_id)?;
    let summary = run_pipeline(&ctx, &spec, &context, &run_id, args.concurrency).await?;
    print!("{}", summary.markdown);

    if !args.no_publish {
        let repo: RepoName = context.repository.parse()?;
        if let Err(e) =
            publish(ctx.forge.as_ref(), &repo, context.issue_number, &run_id, &summary.markdown)
                .await
        {
            tracing::error!("Failed to publish summary comment: {e:?}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
