//! sg - scatter-gather request CLI
//!
//! Entry point for publishing requests, running responders and serving the broker.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use scattergather::broker::Broker;
use scattergather::cli::{Cli, Command, ConnectArgs, normalize_args};
use scattergather::collector::{GatherRequest, PrintSink, ReplyCollector};
use scattergather::config::Config;
use scattergather::responder::Responder;
use scattergather::server::BrokerServer;
use scattergather::transport::{Credentials, RemoteTransport, RemoteTransportConfig, Transport};

fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scattergather")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Log to file; stdout and stderr belong to replies
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(log_dir.join("sg.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Req {
            subject,
            payload,
            duration,
            max,
            headers,
            connect,
        } => cmd_req(&config, &subject, payload, duration, max, headers, &connect).await,
        Command::Reply {
            subject,
            response,
            delay_ms,
            name,
            connect,
        } => cmd_reply(&config, &subject, response, delay_ms, name, &connect).await,
        Command::Serve { listen, auth_token } => cmd_serve(&config, listen, auth_token).await,
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        warn!("Ctrl+C received");
    }

    Ok(())
}

/// Watch that flips to true on the first shutdown signal
fn shutdown_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => {
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handlers");
                // Keep the sender alive so receivers never see a spurious close
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

/// Connect to the broker server named by the flags or the config
async fn connect(config: &Config, args: &ConnectArgs, name: &str) -> Result<RemoteTransport> {
    let mut remote = RemoteTransportConfig::from(&config.client);
    remote.name = name.to_string();
    if let Some(server) = &args.server {
        remote.server = server.clone();
    }
    remote.credentials = Credentials::resolve(args.creds.as_deref(), args.nkey.as_deref())?;

    let server = remote.server.clone();
    RemoteTransport::connect(remote)
        .await
        .context(format!("Failed to connect to {}", server))
}

/// Publish a request and print every reply as it arrives
async fn cmd_req(
    config: &Config,
    subject: &str,
    payload: String,
    duration: Option<u64>,
    max: Option<usize>,
    headers: Vec<(String, String)>,
    args: &ConnectArgs,
) -> Result<()> {
    let max_replies = max.unwrap_or(config.client.max_replies);
    let window = duration.map(Duration::from_secs).unwrap_or_else(|| config.client.reply_window());
    if max_replies == 0 {
        return Err(eyre!("--max must be at least 1"));
    }

    let transport = Arc::new(connect(config, args, &config.client.name).await?);
    let collector =
        ReplyCollector::new(transport.clone()).with_signal_capacity(config.client.signal_capacity);

    let request = headers.into_iter().fold(
        GatherRequest::new(subject, payload)
            .max_replies(max_replies)
            .window(window),
        |request, (name, value)| request.header(name, value),
    );

    let sink = Arc::new(PrintSink::new(Instant::now()));
    let result = collector.gather(request, sink, Some(shutdown_watch())).await;
    transport.close().await;

    let report = result.context(format!("Request on {} failed", subject))?;
    info!(
        received = report.received,
        max_replies = report.max_replies,
        state = %report.state,
        elapsed = ?report.elapsed,
        "Request complete"
    );
    Ok(())
}

/// Answer requests on a subject until interrupted
async fn cmd_reply(
    config: &Config,
    subject: &str,
    response: String,
    delay_ms: Option<u64>,
    name: Option<String>,
    args: &ConnectArgs,
) -> Result<()> {
    let name = name.unwrap_or_else(|| subject.to_string());
    let delay = Duration::from_millis(delay_ms.unwrap_or(config.responder.delay_ms));

    let transport: Arc<RemoteTransport> = Arc::new(connect(config, args, &name).await?);
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let mut responder = Responder::new(dyn_transport, subject, response)
        .with_name(name.clone())
        .with_delay(delay);

    println!("{} service {} on {}...", "Starting".green(), name.cyan(), subject.cyan());
    responder.start().await.context("Failed to start responder")?;
    println!(
        "{} service {} with ID {} (Ctrl+C to halt)",
        "Started".green(),
        name.cyan(),
        responder.id()
    );

    wait_for_shutdown().await?;

    println!("\n{} service {}...", "Halting".yellow(), name.cyan());
    if let Err(e) = responder.stop().await {
        warn!(error = %e, "Failed to stop responder cleanly");
    }
    transport.close().await;
    println!(
        "{} service {} with ID {} after {} responses",
        "Stopped".green(),
        name.cyan(),
        responder.id(),
        responder.served()
    );
    Ok(())
}

/// Run the broker server until interrupted
async fn cmd_serve(config: &Config, listen: Option<String>, auth_token: Option<String>) -> Result<()> {
    let mut server_config = config.server.clone();
    if let Some(listen) = listen {
        server_config.listen = listen;
    }
    if auth_token.is_some() {
        server_config.auth_token = auth_token;
    }

    let (broker, broker_task) = Broker::spawn(server_config.broker_config());
    let server = BrokerServer::bind(&server_config, broker.clone()).await?;
    let addr = server.local_addr()?;

    println!(
        "{} broker {} on {} (Ctrl+C to halt)",
        "Serving".green(),
        server.server_id(),
        addr.to_string().cyan()
    );

    let shutdown = shutdown_watch();
    server.run(shutdown).await?;

    let metrics = broker.metrics().await?;
    broker.shutdown().await?;
    let _ = broker_task.await;

    println!(
        "{} after {} published, {} delivered, {} undeliverable",
        "Stopped".green(),
        metrics.published,
        metrics.delivered,
        metrics.undeliverable
    );
    Ok(())
}
