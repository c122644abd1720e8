mod cmd;
mod util;

use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use argp::FromArgs;
use fanout_core::config::Config;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Fan out integration checks requested in GitHub issues.
struct TopLevel {
    #[argp(option, short = 'c', from_str_fn(util::native_path))]
    /// config file (default: fanout.yml when present)
    config: Option<PathBuf>,
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Gate(cmd::gate::Args),
    Generate(cmd::generate::Args),
    Check(cmd::check::Args),
    Summary(cmd::summary::Args),
    Run(cmd::run::Args),
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // Logs go to stderr; stdout carries pipelines and summaries
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter))
        .init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: TopLevel) -> Result<ExitCode> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok())?;
    match args.command {
        SubCommand::Gate(args) => cmd::gate::run(args, &config),
        SubCommand::Generate(args) => cmd::generate::run(args, &config),
        SubCommand::Check(args) => cmd::check::run(args, config).await,
        SubCommand::Summary(args) => cmd::summary::run(args, &config).await,
        SubCommand::Run(args) => cmd::run::run(args, config).await,
    }
}
