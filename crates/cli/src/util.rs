use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use fanout_core::{config::Config, models::IssueContext};
use fanout_github::GitHub;
use fanout_jobs::{
    JobContext,
    git::{Git, Source},
};
use fanout_store::ResultStore;

// For argp::FromArgs
pub fn native_path(value: &str) -> Result<PathBuf, String> { Ok(PathBuf::from(value)) }

/// Read a file, or stdin when no path (or `-`) is given.
pub fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) if path != Path::new("-") => {
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        }
        _ => {
            let mut data = Vec::new();
            std::io::stdin().read_to_end(&mut data).context("Failed to read stdin")?;
            Ok(data)
        }
    }
}

/// Write to a file, or print to stdout when no path is given.
pub fn write_output(path: Option<&Path>, contents: &str) -> Result<()> {
    match path {
        Some(path) => fs::write(path, contents)
            .with_context(|| format!("Failed to write output file '{}'", path.display())),
        None => {
            print!("{contents}");
            Ok(())
        }
    }
}

/// The issue context supplied through configuration, every field required.
pub fn issue_context(config: &Config) -> Result<IssueContext> {
    Ok(IssueContext {
        issue_number: config.run.require_issue_number()?,
        issue_url: config.run.require_issue_url()?.to_string(),
        repository: config.run.require_repository()?.to_string(),
    })
}

/// Everything a check instance needs, with the store scoped to `run_id`.
pub fn job_context(
    config: Config,
    repository: &str,
    token: Option<&str>,
    run_id: &str,
) -> Result<JobContext> {
    let source = Source::resolve(&config.check, &config.github.base_branch, repository, token)?;
    let store = ResultStore::open(&config.store.results_dir)?.for_run(run_id)?;
    let github = GitHub::new(&config.github, token)?;
    let git = Git::new(&config.check);
    Ok(JobContext {
        config: Arc::new(config),
        store: Arc::new(store),
        source: Arc::new(source),
        vcs: Arc::new(git),
        forge: Arc::new(github),
    })
}

pub fn exit_code(code: i32) -> ExitCode { ExitCode::from(u8::try_from(code).unwrap_or(1)) }
