use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    sync::Mutex,
};

use ask_broker::{
    config::{
        resolve_port, AskCommand, Cli, Commands, ProbeCommand, RespondCommand, ServeCommand,
    },
    launcher::{BrokerLauncher, ExternalBroker, ProcessLauncher},
    liveness::{broker_url, probe, ProbeOutcome},
    requester::RequesterClient,
    responder::{ConnectionManager, Presenter, ResponderConfig},
    server::{bind_or_detect, serve, BindOutcome, Broker},
    state::ConnectionState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Serve(cmd) => run_serve(cmd).await,
        Commands::Probe(cmd) => run_probe(cmd).await,
        Commands::Ask(cmd) => run_ask(cmd).await,
        Commands::Respond(cmd) => run_respond(cmd).await,
    }
}

fn init_tracing(default_level: &str) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run_serve(cmd: ServeCommand) -> Result<()> {
    let port = resolve_port(cmd.port);
    let probe_timeout = Duration::from_millis(cmd.probe_timeout_ms);
    let listener = match bind_or_detect(port, probe_timeout).await? {
        BindOutcome::Bound(listener) => listener,
        BindOutcome::AlreadyRunning => {
            eprintln!("[agent-ask-broker] broker already running on port {port}");
            return Ok(());
        }
    };

    eprintln!("[agent-ask-broker] listening on {}", broker_url(port));
    serve(
        listener,
        Broker::new(),
        Duration::from_millis(cmd.sweep_interval_ms),
        shutdown_signal(),
    )
    .await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_probe(cmd: ProbeCommand) -> Result<()> {
    let port = resolve_port(cmd.port);
    let outcome = probe(port, Duration::from_millis(cmd.probe_timeout_ms)).await;
    let report = match &outcome {
        ProbeOutcome::Broker => json!({"port": port, "status": "broker"}),
        ProbeOutcome::Foreign { detail } => {
            json!({"port": port, "status": "foreign", "detail": detail})
        }
        ProbeOutcome::Unreachable { detail } => {
            json!({"port": port, "status": "unreachable", "detail": detail})
        }
    };
    println!("{report}");
    if outcome == ProbeOutcome::Broker {
        Ok(())
    } else {
        Err(anyhow::anyhow!("no broker answering on port {port}"))
    }
}

async fn run_ask(cmd: AskCommand) -> Result<()> {
    let port = resolve_port(cmd.port);
    let payload: Value =
        serde_json::from_str(&cmd.payload).unwrap_or_else(|_| Value::String(cmd.payload.clone()));

    let client = RequesterClient::connect(&broker_url(port), &cmd.workspace).await?;
    let workspace = client
        .wait_paired(Duration::from_millis(cmd.pair_timeout_ms))
        .await?;
    tracing::info!(workspace = %workspace, "asking paired responder");

    let answer = client.ask(&cmd.kind, payload, cmd.timeout_ms).await;
    client.close();
    let answer = answer.context("request failed")?;
    println!("{answer}");
    Ok(())
}

/// Presents each request as one JSON line on stdout and takes the next stdin
/// line as the answer.
struct StdioPresenter {
    input: Arc<Mutex<Lines<BufReader<Stdin>>>>,
}

impl Presenter for StdioPresenter {
    fn present(&self, input_kind: &str, payload: Value) -> BoxFuture<'static, Result<Value>> {
        let input = self.input.clone();
        let prompt = json!({"inputKind": input_kind, "payload": payload}).to_string();
        Box::pin(async move {
            let mut input = input.lock().await;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(prompt.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            let line = input
                .next_line()
                .await?
                .context("stdin closed before an answer was given")?;
            Ok::<Value, anyhow::Error>(
                serde_json::from_str(&line).unwrap_or(Value::String(line)),
            )
        })
    }
}

async fn run_respond(cmd: RespondCommand) -> Result<()> {
    let port = resolve_port(cmd.port);
    let mut config = ResponderConfig::new(port, &cmd.workspace);
    config.pairing_timeout = Duration::from_millis(cmd.pairing_timeout_ms);

    let launcher: Arc<dyn BrokerLauncher> = if cmd.no_launch {
        Arc::new(ExternalBroker)
    } else {
        Arc::new(ProcessLauncher::current_exe()?)
    };
    let presenter = StdioPresenter {
        input: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
    };
    let manager = ConnectionManager::new(config, launcher, Arc::new(presenter));

    manager.enable().await;
    let snapshot = manager.snapshot();
    if snapshot.state != ConnectionState::Paired {
        manager.shutdown().await;
        return Err(anyhow::anyhow!(
            "responder did not pair: {}",
            snapshot.reason.unwrap_or_else(|| snapshot.state.to_string())
        ));
    }
    eprintln!(
        "[agent-ask-broker] paired on {}",
        manager.paired_workspace().unwrap_or_default()
    );

    let mut states = manager.subscribe();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = states.wait_for(|s| s.state != ConnectionState::Paired) => {
            tracing::warn!(reason = ?manager.snapshot().reason, "responder left paired state");
        }
    }
    manager.shutdown().await;
    Ok(())
}
