//! WebGrade - grade websites with third-party analysis services
//!
//! Runs security analyses (SSL Labs, Mozilla Observatory) on a target,
//! normalizes the provider's grade to 0-100 and notifies the configured
//! listeners. Analyses run from the command line or through the HTTP API.
//!
//! Exit codes:
//!   0 - Success (threshold reached, or no threshold given)
//!   1 - Runtime error (invalid input, provider failure, timeout, etc.)
//!   2 - Analysis succeeded but the threshold was not reached

mod cli;
mod config;
mod error;
mod grade;
mod loader;
mod models;
mod modules;
mod orchestrator;
mod polling;
mod providers;
mod report;
mod server;

use anyhow::{Context, Result};
use cli::{AnalyzeArgs, Args, Command, ServeArgs};
use config::{Config, CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use orchestrator::Orchestrator;
use polling::AnalysisContext;
use server::{CorsConfig, ServerEvent};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig = args.command {
        return handle_init_config();
    }

    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(&args, &config);

    info!("WebGrade v{}", env!("CARGO_PKG_VERSION"));
    match source {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => debug!("No config file found, using defaults"),
    }
    debug!("Arguments: {:?}", args);

    let outcome = match &args.command {
        Command::Analyze(analyze) => run_analyze(&args, analyze, &config).await,
        Command::Serve(serve) => run_serve(serve, &config).await,
        Command::Modules => list_modules(&config),
        Command::InitConfig => Ok(0),
    };

    match outcome {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .webgrade.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to enable listeners, tune polling, and more.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, config: &Config) {
    let level = if config.general.verbose && !args.quiet {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Load configuration from `--config`, the default file, or defaults.
fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    if let Some(ref config_path) = args.config {
        return Ok((Config::load(config_path)?, Some(config_path.clone())));
    }

    match Config::load_default()? {
        Some(config) => Ok((config, Some(PathBuf::from(CONFIG_FILE)))),
        None => Ok((Config::default(), None)),
    }
}

/// Run one analysis, print it, notify listeners. Returns exit code (0 or 2).
async fn run_analyze(args: &Args, analyze: &AnalyzeArgs, config: &Config) -> Result<i32> {
    let orchestrator = Orchestrator::new(Arc::new(loader::load_registry(config)?));

    let provider_config = analyze.provider_config()?;
    let filter = analyze.listener_filter()?;
    orchestrator.validate_filter(&filter)?;
    let threshold = analyze.threshold.or(config.analysis.threshold);

    let mut ctx = AnalysisContext::new();
    if let Some(seconds) = config.analysis.timeout_seconds {
        ctx = ctx.with_timeout(Duration::from_secs(seconds));
    }
    let (ctx, cancel) = ctx.cancellable();

    let spinner = if args.quiet {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Running {} analysis...", analyze.module));
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    };

    let analysis = orchestrator.run_analysis(&analyze.module, &provider_config, threshold, &ctx);
    tokio::pin!(analysis);

    let result = loop {
        tokio::select! {
            result = &mut analysis => break result,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling the analysis");
                cancel.cancel();
            }
        }
    };

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    if let Err(error::RunError::Analysis(ref e)) = result {
        if e.is_timeout() {
            warn!(
                "Gave up after {} poll(s); raise [polling] max_attempts or --timeout to wait longer",
                e.attempts().unwrap_or(0)
            );
        }
    }
    let report = Arc::new(result?);

    println!("{}", report::summary_line(&report));

    if let Some(ref output) = analyze.output {
        report::write_json_report(&report, output)?;
        println!("📄 Report saved to: {}", output.display());
    }

    let (outcomes, interrupted) = run_to_completion(
        orchestrator.notify(Arc::clone(&report), &filter),
        tokio::signal::ctrl_c(),
    )
    .await;
    let outcomes = outcomes?;
    if interrupted {
        info!("Listener notifications finished after interrupt");
    }
    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    for outcome in &outcomes {
        if let Err(ref e) = outcome.result {
            eprintln!("⚠️  {}", e);
        }
    }
    if !outcomes.is_empty() {
        info!("Notified {} listener(s), {} failed", outcomes.len(), failed);
    }

    if report.is_threshold_reached() == Some(false) {
        eprintln!("\n⛔ Threshold not reached. Failing (exit code 2).");
        return Ok(2);
    }

    Ok(0)
}

/// Drive `work` to completion. The first `interrupt` is reported but
/// never abandons `work`; returns whether one was seen.
async fn run_to_completion<F, I>(work: F, interrupt: I) -> (F::Output, bool)
where
    F: Future,
    I: Future,
{
    tokio::pin!(work);
    tokio::pin!(interrupt);
    let mut interrupted = false;

    loop {
        tokio::select! {
            output = &mut work => return (output, interrupted),
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                warn!("Interrupted, waiting for listener notifications already in flight");
            }
        }
    }
}

/// Start a server module and run it until Ctrl-C.
async fn run_serve(serve: &ServeArgs, config: &Config) -> Result<i32> {
    let registry = loader::load_registry(config)?;
    let server = registry.server(&serve.module)?;

    let cors = if config.server.cors_origins.is_empty() {
        None
    } else {
        Some(CorsConfig::new(config.server.cors_origins.clone()))
    };

    let mut handle = server
        .start_server(
            registry.analysis_modules(),
            registry.listeners(),
            config.server.port,
            cors,
        )
        .await?;
    debug!("Server bound to {}", handle.local_addr());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = handle.next_event() => match event {
                Some(ServerEvent::Listening(addr)) => println!("🚀 Listening on http://{}", addr),
                Some(ServerEvent::Error(message)) => warn!("Server error: {}", message),
                None => break,
            },
        }
    }

    handle.shutdown().await;
    Ok(0)
}

/// Print the registered modules.
fn list_modules(config: &Config) -> Result<i32> {
    let registry = loader::load_registry(config)?;
    if registry.is_empty() {
        println!("No modules registered.");
        return Ok(0);
    }

    println!("{:<14} {:<10} SERVICE", "ID", "KIND");
    for descriptor in registry.descriptors() {
        println!(
            "{:<14} {:<10} {}",
            descriptor.id,
            descriptor.kind.to_string(),
            descriptor.service.name
        );
    }

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_does_not_abandon_notifications() {
        let work = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "notified"
        };
        let interrupt = tokio::time::sleep(Duration::from_secs(1));

        let (output, interrupted) = run_to_completion(work, interrupt).await;
        assert_eq!(output, "notified");
        assert!(interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_without_interrupt() {
        let (output, interrupted) =
            run_to_completion(async { 3 }, std::future::pending::<()>()).await;
        assert_eq!(output, 3);
        assert!(!interrupted);
    }
}
