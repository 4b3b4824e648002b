//! CLI command definitions and subcommands

use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Long flags that are also accepted with a single dash
const SINGLE_DASH_FLAGS: [&str; 2] = ["creds", "nkey"];

/// sg - scatter-gather requests over a pub/sub broker
#[derive(Parser)]
#[command(
    name = "sg",
    about = "Publish a request and gather replies from every responder",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Publish a request and print replies until max count or the window closes
    Req {
        /// Subject to publish on
        subject: String,

        /// Request payload
        payload: String,

        /// Reply window in seconds
        #[arg(short = 'd', long = "duration", value_name = "SECS")]
        duration: Option<u64>,

        /// Maximum number of replies to wait for
        #[arg(short = 'm', long = "max", value_name = "COUNT")]
        max: Option<usize>,

        /// Request header as name:value (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Answer every request on a subject until interrupted
    Reply {
        /// Subject to listen on
        subject: String,

        /// Response payload
        response: String,

        /// Delay before each response in milliseconds
        #[arg(long, value_name = "MS")]
        delay_ms: Option<u64>,

        /// Name sent in the Responder header
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Run the broker server until interrupted
    Serve {
        /// Listen address (host:port)
        #[arg(short, long)]
        listen: Option<String>,

        /// Token clients must present
        #[arg(long)]
        auth_token: Option<String>,
    },
}

/// Broker connection options shared by client subcommands
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Broker server address (host:port)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Credentials file (also -creds)
    #[arg(long, value_name = "FILE", conflicts_with = "nkey")]
    pub creds: Option<PathBuf>,

    /// NKey seed file (also -nkey)
    #[arg(long, value_name = "FILE")]
    pub nkey: Option<PathBuf>,
}

/// Rewrite `-creds` and `-nkey` to their double-dash spelling before clap sees them
///
/// Without this, clap reads `-creds FILE` as the short `-c` flag with value `reds`.
/// Arguments after `--` are left alone.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut normalized = Vec::new();
    let mut positional_only = false;
    for arg in args.into_iter().map(Into::into) {
        if positional_only {
            normalized.push(arg);
            continue;
        }
        if arg == "--" {
            positional_only = true;
            normalized.push(arg);
            continue;
        }
        let rewritten = arg.to_str().and_then(single_dash_to_long);
        normalized.push(rewritten.map(OsString::from).unwrap_or(arg));
    }
    normalized
}

fn single_dash_to_long(arg: &str) -> Option<String> {
    let flag = arg.strip_prefix('-')?;
    if flag.starts_with('-') {
        return None;
    }
    let name = flag.split_once('=').map_or(flag, |(name, _)| name);
    SINGLE_DASH_FLAGS.contains(&name).then(|| format!("-{}", arg))
}

/// Parse `name:value`; whitespace around both parts is trimmed
pub fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("header '{}' is not in name:value form", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header '{}' has an empty name", s));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
