use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use argp::FromArgs;
use fanout_core::config::Config;
use fanout_github::webhook::verify_signature;
use fanout_pipeline::{GateDecision, evaluate_payload, generate};

use crate::util::{native_path, read_input, write_output};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Evaluate a webhook payload and print the fan-out pipeline if it is accepted.
#[argp(subcommand, name = "gate")]
pub struct Args {
    #[argp(option, short = 'p', from_str_fn(native_path))]
    /// payload file (default: stdin)
    payload: Option<PathBuf>,
    #[argp(option, short = 's')]
    /// X-Hub-Signature-256 header value
    signature: Option<String>,
    #[argp(option, short = 'o', from_str_fn(native_path))]
    /// write the pipeline to output file
    output: Option<PathBuf>,
}

pub fn run(args: Args, config: &Config) -> Result<ExitCode> {
    let payload = read_input(args.payload.as_deref())?;
    if let Some(secret) = &config.github.webhook_secret {
        let header = args
            .signature
            .as_deref()
            .context("A webhook secret is configured but no signature was given")?;
        verify_signature(secret, header, &payload).context("Payload signature check failed")?;
    }
    match evaluate_payload(&payload, &config.trigger).context("Failed to read trigger payload")? {
        GateDecision::Reject { reason } => {
            tracing::info!("Event rejected: {reason}");
        }
        GateDecision::Accept { work_items, context } => {
            tracing::info!(
                issue = context.issue_number,
                "Event accepted with {} integrations",
                work_items.len()
            );
            let spec = generate(&work_items, &context, &config.pipeline)?;
            write_output(args.output.as_deref(), &spec.to_yaml()?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
