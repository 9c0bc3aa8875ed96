//! Check command - validates and compiles a pipeline without running it.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::Style;
use serde::Serialize;

use flowline_pipeline::{
    CapabilityRegistry, Intent, PipelineFile, StepKind, TERMINAL_RUN, UserMapping, VariableStore,
    apply_default_cwd, compile_step,
};
use flowline_trigger::{TriggerDefaults, TriggerDefinition, TriggerSettings};

use super::Context;

/// Arguments for the check command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Pipeline document (*.intent.json)
    pub pipeline: PathBuf,
}

/// Per-step result.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct StepReport {
    index: usize,
    id: Option<String>,
    intent: String,
    ok: bool,
    /// Commands the step routes to, or the error.
    detail: String,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    pipeline: String,
    warnings: Vec<String>,
    steps: Vec<StepReport>,
}

/// Run the check command.
pub async fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let pipeline = PipelineFile::from_file(&args.pipeline)
        .with_context(|| format!("cannot load {}", args.pipeline.display()))?;
    let warnings = pipeline.validate()?;

    let registry = ctx.registry();
    let mappings = ctx.user_mappings();
    let defaults = TriggerSettings::from_config(&ctx.config, &ctx.base).defaults;

    let steps: Vec<StepReport> = pipeline
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let result = check_step(&args.pipeline, index, step, ctx, &registry, &mappings, &defaults);
            StepReport {
                index,
                id: step.id.clone(),
                intent: step.intent.clone(),
                ok: result.is_ok(),
                detail: result.unwrap_or_else(|e| e),
            }
        })
        .collect();
    let failed = steps.iter().filter(|s| !s.ok).count();

    if ctx.json_output {
        let report = CheckReport {
            pipeline: pipeline.name.clone(),
            warnings,
            steps,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let dim = Style::new().dim();
        let green = Style::new().green();
        let red = Style::new().red();
        let yellow = Style::new().yellow();

        println!();
        println!("{}", Style::new().bold().apply_to(&pipeline.name));
        println!("{}", dim.apply_to("─".repeat(40)));
        for step in &steps {
            let mark = if step.ok {
                green.apply_to("✓")
            } else {
                red.apply_to("✗")
            };
            println!(
                "  {} {} {} {}",
                mark,
                dim.apply_to(format!("[{}]", step.index)),
                step.id.as_deref().unwrap_or(&step.intent),
                dim.apply_to(&step.detail)
            );
        }
        for warning in &warnings {
            println!("  {} {}", yellow.apply_to("!"), warning);
        }
        println!();
    }

    if failed > 0 {
        bail!("{} of {} steps failed to compile", failed, pipeline.steps.len());
    }
    Ok(())
}

/// Compile one step the way the runner would, against an empty variable
/// store. Returns a routing description or the error text.
fn check_step(
    path: &std::path::Path,
    index: usize,
    step: &Intent,
    ctx: &Context,
    registry: &CapabilityRegistry,
    mappings: &[UserMapping],
    defaults: &TriggerDefaults,
) -> std::result::Result<String, String> {
    let kind = StepKind::parse(step).map_err(|e| e.to_string())?;
    match kind {
        StepKind::Trigger(_) => {
            return match TriggerDefinition::from_step(path, index, step, defaults) {
                Ok(Some(def)) => Ok(format!("trigger: {}", def.spec.describe())),
                Ok(None) => Ok("trigger (disabled)".to_string()),
                Err(e) => Err(e.to_string()),
            };
        }
        ref k if k.is_control_flow() => return Ok("control flow".to_string()),
        _ => {}
    }

    let prepared = if step.intent == TERMINAL_RUN {
        Intent {
            payload: apply_default_cwd(&step.payload, &ctx.workspace_root),
            ..step.clone()
        }
    } else {
        step.clone()
    };
    let compiled = compile_step(&prepared, &VariableStore::new(), &ctx.workspace_root)
        .map_err(|e| e.to_string())?;

    let routes: Vec<String> = registry
        .resolve(&compiled, mappings)
        .iter()
        .map(|r| {
            if r.is_fallback() {
                format!("{} (unregistered)", r.command)
            } else {
                r.command.clone()
            }
        })
        .collect();
    Ok(format!("→ {}", routes.join(", ")))
}
