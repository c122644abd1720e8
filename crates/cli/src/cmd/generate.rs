use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use argp::FromArgs;
use fanout_core::{config::Config, models::WorkItem};
use fanout_pipeline::generate;

use crate::util::{issue_context, native_path, write_output};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Generate the fan-out pipeline from $INTEGRATIONS and the issue parameters.
#[argp(subcommand, name = "generate")]
pub struct Args {
    #[argp(option, short = 'o', from_str_fn(native_path))]
    /// write the pipeline to output file
    output: Option<PathBuf>,
}

pub fn run(args: Args, config: &Config) -> Result<ExitCode> {
    let context = issue_context(config)?;
    let work_items: Vec<WorkItem> =
        config.run.require_integrations()?.iter().map(|name| WorkItem::new(name.as_str())).collect();
    let spec = generate(&work_items, &context, &config.pipeline)?;
    write_output(args.output.as_deref(), &spec.to_yaml()?)?;
    Ok(ExitCode::SUCCESS)
}
