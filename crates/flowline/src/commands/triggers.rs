//! Triggers command - lists triggers declared under the trigger root.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use tracing::warn;

use flowline_pipeline::PipelineFile;
use flowline_trigger::{TriggerInfo, TriggerSettings, discover_pipelines, scan_document};

use super::Context;

/// Arguments for the triggers command.
#[derive(Args, Debug)]
pub struct TriggersArgs {
    /// Also list steps that failed to register
    #[arg(long)]
    pub show_rejected: bool,
}

/// Run the triggers command.
pub async fn run(args: TriggersArgs, ctx: &Context) -> Result<()> {
    let settings = TriggerSettings::from_config(&ctx.config, &ctx.base);

    let mut found: Vec<TriggerInfo> = Vec::new();
    let mut rejected: Vec<String> = Vec::new();
    for path in discover_pipelines(&settings.trigger_root) {
        let pipeline = match PipelineFile::from_file(&path) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable pipeline");
                continue;
            }
        };
        let (defs, errors) = scan_document(&path, &pipeline, &settings.defaults);
        found.extend(defs.iter().map(TriggerInfo::from));
        rejected.extend(
            errors
                .into_iter()
                .map(|e| format!("{}: {}", path.display(), e)),
        );
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!(
        "{} {}",
        style("Triggers").bold(),
        dim.apply_to(settings.trigger_root.display())
    );
    println!("{}", dim.apply_to("─".repeat(40)));
    if found.is_empty() {
        println!("  {}", dim.apply_to("none"));
    }
    for info in &found {
        println!(
            "  {:<8} {:<32} {}",
            Style::new().cyan().apply_to(info.kind),
            info.id,
            dim.apply_to(&info.detail)
        );
    }
    if args.show_rejected || ctx.verbose {
        for message in &rejected {
            println!("  {} {}", Style::new().red().apply_to("✗"), message);
        }
    } else if !rejected.is_empty() {
        println!(
            "  {}",
            dim.apply_to(format!("{} rejected (use --show-rejected)", rejected.len()))
        );
    }
    println!();
    Ok(())
}
