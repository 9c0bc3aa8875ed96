//! Run command - executes a pipeline document.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::Style;
use serde::Serialize;
use tracing::warn;

use flowline_pipeline::{EventBus, PipelineEvent, PipelineFile, RunOptions, VariableStore};

use super::Context;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Pipeline document (*.intent.json)
    pub pipeline: PathBuf,

    /// Seed a variable, usable as ${var:NAME} (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Start at this step id instead of the first step
    #[arg(long, value_name = "STEP_ID")]
    pub from: Option<String>,

    /// Route every step without executing commands
    #[arg(long)]
    pub dry_run: bool,
}

/// Run summary for JSON output.
#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: String,
    pipeline: String,
    status: String,
    steps_executed: usize,
}

pub(crate) fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let pipeline = PipelineFile::from_file(&args.pipeline)
        .with_context(|| format!("cannot load {}", args.pipeline.display()))?;
    for warning in pipeline.validate()? {
        warn!(pipeline = %pipeline.name, "{}", warning);
    }

    let events = Arc::new(EventBus::new());
    let json_output = ctx.json_output;
    events.subscribe(move |event| print_event(event, json_output));

    let runner = Arc::new(ctx.runner(events));
    let mut options = RunOptions::default()
        .with_variables(args.vars.into_iter().collect::<VariableStore>())
        .with_dry_run(args.dry_run || ctx.config.runner().dry_run);
    if let Some(step) = args.from {
        options = options.from_step(step);
    }

    let canceller = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling run");
                runner.cancel();
            }
        })
    };
    let outcome = runner.run(&pipeline, options).await;
    canceller.abort();
    let outcome = outcome?;

    if json_output {
        let summary = RunSummary {
            run_id: outcome.run_id.clone(),
            pipeline: pipeline.name.clone(),
            status: outcome.status.to_string(),
            steps_executed: outcome.steps_executed,
        };
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        let style = if outcome.is_success() {
            Style::new().green()
        } else {
            Style::new().red()
        };
        println!();
        println!(
            "  {} {} ({} steps)",
            style.apply_to("●"),
            style.apply_to(outcome.status.to_string()).bold(),
            outcome.steps_executed
        );
    }

    if !outcome.is_success() {
        bail!("pipeline '{}' finished with status {}", pipeline.name, outcome.status);
    }
    Ok(())
}

fn print_event(event: &PipelineEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }

    let dim = Style::new().dim();
    match event {
        PipelineEvent::PipelineStart { pipeline, run_id, .. } => {
            println!(
                "{} {}",
                Style::new().bold().apply_to(&pipeline.name),
                dim.apply_to(run_id)
            );
        }
        PipelineEvent::StepStart {
            index,
            step_id,
            intent,
            ..
        } => {
            println!(
                "  {} {} {}",
                dim.apply_to(format!("[{}]", index)),
                step_id.as_deref().unwrap_or("-"),
                dim.apply_to(intent)
            );
        }
        PipelineEvent::StepEnd { success: false, index, .. } => {
            println!(
                "  {} {}",
                dim.apply_to(format!("[{}]", index)),
                Style::new().red().apply_to("failed")
            );
        }
        PipelineEvent::PipelinePause { .. } => println!("  {}", dim.apply_to("paused")),
        PipelineEvent::PipelineResume { .. } => println!("  {}", dim.apply_to("resumed")),
        _ => {}
    }
}
