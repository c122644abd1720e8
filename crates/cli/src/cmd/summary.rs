use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use argp::FromArgs;
use fanout_core::config::Config;
use fanout_github::{GitHub, RepoName};
use fanout_jobs::{
    run_id,
    summary::{publish, summarize},
};
use fanout_store::ResultStore;

use crate::util::{native_path, write_output};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Aggregate every result document and post the summary to the issue.
#[argp(subcommand, name = "summary")]
pub struct Args {
    #[argp(switch)]
    /// print the summary without posting it
    no_publish: bool,
    #[argp(option, short = 'o', from_str_fn(native_path))]
    /// write the markdown summary to output file
    output: Option<PathBuf>,
}

pub async fn run(args: Args, config: &Config) -> Result<ExitCode> {
    let issue_number = config.run.require_issue_number()?;
    let target = if args.no_publish {
        None
    } else {
        let repo: RepoName = config.run.require_repository()?.parse()?;
        Some((repo, GitHub::new(&config.github, Some(config.require_token()?))?))
    };
    let run_id = run_id(config, issue_number);
    let store = ResultStore::open(&config.store.results_dir)?.for_run(&run_id)?;
    let summary = summarize(&store, &run_id)?;
    write_output(args.output.as_deref(), &summary.markdown)?;

    if let Some((repo, github)) = target {
        // Failures are reported in the comment; only a missing report fails the process
        if let Err(e) = publish(&github, &repo, issue_number, &run_id, &summary.markdown).await {
            tracing::error!("Failed to publish summary comment: {e:?}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
