use std::process::ExitCode;

use anyhow::Result;
use argp::FromArgs;
use fanout_core::{
    config::Config,
    models::{PrPolicy, WorkItem},
};
use fanout_jobs::{
    run_id,
    runner::{CheckJob, run_check},
};

use crate::util::{exit_code, issue_context, job_context};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Check one integration and record the result document.
#[argp(subcommand, name = "check")]
pub struct Args {
    #[argp(option, short = 'i')]
    /// integration to check (default: $INTEGRATION)
    integration: Option<String>,
    #[argp(option)]
    /// local directory or git URL holding the integrations
    source: Option<String>,
}

pub async fn run(args: Args, mut config: Config) -> Result<ExitCode> {
    if let Some(source) = args.source {
        config.check.source = source;
    }
    let integration = match args.integration {
        Some(integration) => integration,
        None => config.run.require_integration()?.to_string(),
    };
    let context = issue_context(&config)?;
    let token = if config.check.effective_pr_policy() == PrPolicy::Never {
        config.github.token.clone()
    } else {
        Some(config.require_token()?.to_string())
    };
    let job_id = config.run.job_id.clone();
    let run_id = run_id(&config, context.issue_number);
    let ctx = job_context(config, &context.repository, token.as_deref(), &run_id)?;
    let job = CheckJob { integration: WorkItem::new(integration), context, job_id };
    let outcome = run_check(&ctx, &job).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.result)?);
    Ok(exit_code(outcome.exit_code))
}
