//! Serve command - runs the trigger manager until interrupted.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use tracing::{info, warn};

use flowline_pipeline::EventBus;
use flowline_trigger::{RunnerInvoker, TriggerManager, TriggerSettings};

use super::Context;

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Webhook port (overrides config; 0 picks a free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Route triggered steps without executing commands
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let mut settings = TriggerSettings::from_config(&ctx.config, &ctx.base);
    if let Some(port) = args.port {
        settings.webhook_port = port;
    }

    let runner = Arc::new(ctx.runner(Arc::new(EventBus::new())));
    let invoker = RunnerInvoker::new(runner).with_dry_run(args.dry_run || ctx.config.runner().dry_run);
    let manager = TriggerManager::new(settings, Arc::new(invoker));

    if let Err(e) = manager.start().await {
        warn!(error = %e, "file watching unavailable; triggers refresh only at startup");
    }

    let registrations = manager.registrations();
    let addr = manager.webhook_addr();
    if ctx.json_output {
        let status = serde_json::json!({
            "triggers": registrations,
            "webhookAddr": addr.map(|a| a.to_string()),
        });
        println!("{}", serde_json::to_string(&status)?);
    } else {
        let dim = Style::new().dim();
        println!();
        println!("{}", style("Flowline trigger manager").bold());
        println!("{}", dim.apply_to("─".repeat(40)));
        println!(
            "  {} {}",
            dim.apply_to("Workspace:"),
            manager.settings().workspace_root.display()
        );
        println!("  {} {}", dim.apply_to("Triggers:"), registrations.len());
        if let Some(addr) = addr {
            println!("  {} http://{}", dim.apply_to("Webhooks:"), addr);
        }
        println!();
        println!("  {}", dim.apply_to("Press Ctrl-C to stop"));
        println!();
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}
