//! sc - Safety Center
//!
//! CLI entry point: runs the service or talks to a running one.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use safetycenter::cli::{CatalogCommand, Cli, Command, IssueCommand, OutputFormat, get_log_path};
use safetycenter::config::Config;
use safetycenter::daemon;
use safetycenter::domain::{
    AggregatedView, ErrorDetails, SafetyEvent, SeverityLevel, SourceCatalog, SourceReport,
};
use safetycenter::events::{ScEvent, spawn_event_logger};
use safetycenter::ipc::{self, ScClient};
use safetycenter::listeners::ListenerUpdate;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let socket_path = cli.socket.clone().unwrap_or_else(|| daemon::socket_path(&config));
    let client = ScClient::with_socket_path(socket_path.clone()).for_user(cli.user);

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve => run_daemon(&config, socket_path).await,
        Command::Ping => cmd_ping(&client).await,
        Command::Status { format } => cmd_status(&client, format).await,
        Command::Push {
            source,
            package,
            title,
            summary,
            severity,
            json,
            clear,
            event,
            broadcast_id,
        } => {
            let report = if clear {
                None
            } else if let Some(path) = json {
                let content = fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
                Some(serde_json::from_str::<SourceReport>(&content).context("Failed to parse report JSON")?)
            } else {
                Some(match title {
                    Some(title) => SourceReport::with_status(title, summary, severity),
                    None => SourceReport::default(),
                })
            };
            let event = SafetyEvent {
                refresh_broadcast_id: broadcast_id,
                ..SafetyEvent::new(event)
            };
            cmd_push(&client.as_package(Some(package)), &source, report, event).await
        }
        Command::Get {
            source,
            package,
            format,
        } => cmd_get(&client.as_package(Some(package)), &source, format).await,
        Command::Error {
            source,
            package,
            message,
        } => {
            client
                .as_package(Some(package))
                .report_error(&source, ErrorDetails::new(message))
                .await?;
            println!("{} Error reported for {}", "✓".green(), source);
            Ok(())
        }
        Command::Refresh { reason } => {
            match client.refresh(reason).await? {
                Some(ticket) => println!(
                    "{} Refresh {} sent to {} source(s)",
                    "✓".green(),
                    ticket.broadcast_id.cyan(),
                    ticket.sources
                ),
                None => println!("{} Refresh not started (service disabled or user absent)", "!".yellow()),
            }
            Ok(())
        }
        Command::View { format } => cmd_view(&client, format).await,
        Command::Watch => cmd_watch(&client).await,
        Command::Listen { package } => cmd_listen(&client.as_package(Some(package))).await,
        Command::Issue { command } => match command {
            IssueCommand::Dismiss { issue } => {
                client.dismiss_issue(&issue).await?;
                println!("{} Dismissed {}", "✓".green(), issue);
                Ok(())
            }
            IssueCommand::Act { issue, action } => {
                client.execute_action(&issue, &action).await?;
                println!("{} Requested {} on {}", "✓".green(), action, issue);
                Ok(())
            }
        },
        Command::Catalog { command } => cmd_catalog(&client, command).await,
        Command::Clear => {
            client.clear_all().await?;
            println!("{} Cleared all data", "✓".green());
            Ok(())
        }
    }
}

/// Run the service until SIGINT or SIGTERM
async fn run_daemon(config: &Config, socket_path: PathBuf) -> Result<()> {
    debug!(?socket_path, "run_daemon: called");
    info!("Safety center starting...");

    let service = daemon::build_service(config).await;
    let core = service.core.clone();
    let logger = spawn_event_logger(core.bus());

    let listener = ipc::create_listener_at(&socket_path)?;
    info!(?socket_path, "IPC socket listening");
    println!("Listening on {}", socket_path.display());

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let server = tokio::spawn(ipc::serve(listener, core.clone(), shutdown_rx));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("SIGHUP received - reloading source catalog");
                    match &config.service.catalog_path {
                        Some(path) => {
                            let reloaded = core.reload_catalog(path).await;
                            info!(reloaded, "Catalog reload finished");
                        }
                        None => warn!("No catalog-path configured; nothing to reload"),
                    }
                }
                _ = sigint.recv() => {
                    warn!("SIGINT received");
                    break;
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received");
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("Safety center shutting down...");
    let _ = shutdown_tx.send(()).await;
    let _ = server.await;
    ipc::cleanup_socket(&socket_path);
    logger.abort();
    service.shutdown();
    info!("Safety center stopped");
    Ok(())
}

async fn cmd_ping(client: &ScClient) -> Result<()> {
    if !client.socket_exists() {
        println!("Safety center is not running (no socket)");
        return Ok(());
    }
    match client.ping().await {
        Ok(version) => {
            println!("Safety center is alive and responsive");
            println!("Version: {}", version);
        }
        Err(e) => {
            println!("Socket exists but the service is not responding");
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn cmd_status(client: &ScClient, format: OutputFormat) -> Result<()> {
    let enabled = client.is_enabled().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "enabled": enabled })),
        OutputFormat::Text => {
            let state = if enabled { "enabled".green() } else { "disabled".red() };
            println!("Safety center: {}", state);
        }
    }
    Ok(())
}

async fn cmd_push(client: &ScClient, source: &str, report: Option<SourceReport>, event: SafetyEvent) -> Result<()> {
    let clearing = report.is_none();
    client.push_report(source, report, event).await?;
    if clearing {
        println!("{} Cleared data for {}", "✓".green(), source);
    } else {
        println!("{} Pushed report for {}", "✓".green(), source.cyan());
    }
    Ok(())
}

async fn cmd_get(client: &ScClient, source: &str, format: OutputFormat) -> Result<()> {
    let report = client.read_report(source).await?;
    match (format, report) {
        (OutputFormat::Json, report) => println!("{}", serde_json::to_string_pretty(&report)?),
        (OutputFormat::Text, None) => println!("No data for {}", source),
        (OutputFormat::Text, Some(report)) => {
            if let Some(status) = &report.status {
                println!("{} [{}] {}", status.title.bold(), severity_label(status.severity), status.summary);
            }
            for issue in &report.issues {
                println!("  - {} [{}] {}", issue.id, severity_label(issue.severity), issue.title);
            }
        }
    }
    Ok(())
}

async fn cmd_view(client: &ScClient, format: OutputFormat) -> Result<()> {
    let view = client.get_view().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => print_view(&view),
    }
    Ok(())
}

async fn cmd_watch(client: &ScClient) -> Result<()> {
    let mut subscription = client.watch().await?;
    println!("Watching for changes (Ctrl+C to stop)");
    while let Some(update) = subscription.next().await? {
        match update {
            ListenerUpdate::Data { view } => {
                println!("{}", "--- view changed ---".dimmed());
                print_view(&view);
            }
            ListenerUpdate::Error { details } => println!("{} {}", "Source error:".red(), details.message),
        }
    }
    println!("Service closed the connection");
    Ok(())
}

async fn cmd_listen(client: &ScClient) -> Result<()> {
    let mut requests = client.watch_requests().await?;
    println!("Listening for source requests (Ctrl+C to stop)");
    while let Some(event) = requests.next().await? {
        match event {
            ScEvent::RefreshRequested {
                broadcast_id,
                reason,
                source_id,
                ..
            } => println!("{} {} ({}, broadcast {})", "refresh".cyan(), source_id, reason, broadcast_id),
            ScEvent::IssueActionRequested {
                issue_key, action_id, ..
            } => println!("{} {} on {}", "action".yellow(), action_id, issue_key),
        }
    }
    println!("Service closed the connection");
    Ok(())
}

async fn cmd_catalog(client: &ScClient, command: CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::Show => match client.get_config().await? {
            Some(catalog) => print!("{}", serde_yaml::to_string(&catalog)?),
            None => println!("No catalog loaded"),
        },
        CatalogCommand::Override { path } => {
            let catalog = SourceCatalog::load(&path).context(format!("Failed to load {}", path.display()))?;
            client.set_config_override(catalog).await?;
            println!("{} Catalog override set from {}", "✓".green(), path.display());
        }
        CatalogCommand::Reset => {
            client.clear_config_override().await?;
            println!("{} Catalog override cleared", "✓".green());
        }
    }
    Ok(())
}

fn print_view(view: &AggregatedView) {
    println!(
        "{} [{}] {}",
        view.status.title.bold(),
        severity_label(view.status.severity),
        view.status.summary
    );
    for entry in &view.entries {
        println!(
            "  {} (user {}): {} [{}]",
            entry.source_id.cyan(),
            entry.user_id,
            entry.title,
            severity_label(entry.severity)
        );
    }
    for issue in &view.issues {
        println!("  ! {} {} [{}]", issue.key, issue.title, severity_label(issue.severity));
        for action in &issue.actions {
            println!("      -> {} ({})", action.label, action.id);
        }
    }
}

fn severity_label(severity: SeverityLevel) -> colored::ColoredString {
    let label = severity.to_string();
    match severity {
        SeverityLevel::Unspecified => label.dimmed(),
        SeverityLevel::Information => label.green(),
        SeverityLevel::Recommendation => label.yellow(),
        SeverityLevel::CriticalWarning => label.red().bold(),
    }
}
