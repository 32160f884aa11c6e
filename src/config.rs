use clap::{Args, Parser, Subcommand};

pub const DEFAULT_PORT: u16 = 3890;
pub const PORT_ENV: &str = "ASK_BROKER_PORT";

#[derive(Debug, Parser)]
#[command(name = "agent-ask-broker")]
#[command(about = "Routes agent questions to the editor window working on the same project")]
pub struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the broker.
    Serve(ServeCommand),
    /// Report whether our broker answers on the port.
    Probe(ProbeCommand),
    /// Ask one question as a requester and print the answer.
    Ask(AskCommand),
    /// Answer questions for a workspace from stdin, one JSON line each.
    Respond(RespondCommand),
}

#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Port to listen on (default: $ASK_BROKER_PORT or 3890)
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value_t = 30_000)]
    pub sweep_interval_ms: u64,

    #[arg(long, default_value_t = 1_500)]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct ProbeCommand {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value_t = 1_500)]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct AskCommand {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value = ".")]
    pub workspace: String,

    /// Input kind understood by the responder, e.g. "confirm" or "text".
    #[arg(long)]
    pub kind: String,

    /// JSON payload; anything that is not valid JSON is sent as a string.
    #[arg(long, default_value = "null")]
    pub payload: String,

    #[arg(long, default_value_t = 30_000)]
    pub pair_timeout_ms: u64,

    /// Have the broker expire the request after this long.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RespondCommand {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value = ".")]
    pub workspace: String,

    #[arg(long, default_value_t = 30_000)]
    pub pairing_timeout_ms: u64,

    /// Never start a broker; fail if none is running.
    #[arg(long, default_value_t = false)]
    pub no_launch: bool,
}

/// Port from the flag, then `$ASK_BROKER_PORT`, then the default.
pub fn resolve_port(flag: Option<u16>) -> u16 {
    port_from(flag, std::env::var(PORT_ENV).ok().as_deref())
}

fn port_from(flag: Option<u16>, env_value: Option<&str>) -> u16 {
    if let Some(port) = flag {
        return port;
    }
    match env_value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(raw) => match raw.parse() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!(
                    target = "ask_broker::config",
                    value = %raw,
                    "ignoring invalid {PORT_ENV}"
                );
                DEFAULT_PORT
            }
        },
        None => DEFAULT_PORT,
    }
}
