use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use slipstream::config::{self, RtcOptions, TurnServer};
use slipstream::transfer::progress::human_bytes;
use slipstream::transfer::session::{self, ReceiveConfig, SendConfig};
use slipstream::transfer::{ConsentPolicy, ReceiveOutcome};

#[derive(Parser)]
#[command(
    name = "slipstream",
    about = "Peer-to-peer file transfer over WebRTC data channels",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a room and send files to the peer that joins it
    Send {
        /// Files to send, in transfer order
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Use the web-compatible single-channel protocol even against a
        /// terminal peer
        #[arg(long)]
        single_channel: bool,

        #[command(flatten)]
        network: NetworkArgs,
    },
    /// Join a room and receive the files offered there
    Receive {
        /// Room identifier shown by the sender
        #[arg(value_name = "ROOM_ID")]
        room_id: String,

        /// Directory to write received files into
        #[arg(long, short = 'o', default_value = ".", value_name = "DIR")]
        output_dir: PathBuf,

        /// Accept the transfer without prompting
        #[arg(long, short = 'y')]
        yes: bool,

        #[command(flatten)]
        network: NetworkArgs,
    },
    /// Run the signaling hub
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8787", value_name = "ADDR")]
        bind: SocketAddr,
    },
}

#[derive(Args)]
struct NetworkArgs {
    /// Signaling endpoint (also SLIPSTREAM_SIGNAL_URL)
    #[arg(long, value_name = "URL")]
    signal_url: Option<String>,

    /// STUN server, repeatable; replaces the defaults
    #[arg(long = "stun", value_name = "URL")]
    stun: Vec<String>,

    /// TURN server, repeatable
    #[arg(long = "turn", value_name = "URL")]
    turn: Vec<String>,

    /// Username for the TURN servers
    #[arg(long, default_value = "", value_name = "USER")]
    turn_user: String,

    /// Credential for the TURN servers
    #[arg(long, default_value = "", value_name = "PASS")]
    turn_pass: String,

    /// Only connect through a TURN relay
    #[arg(long)]
    force_relay: bool,
}

impl NetworkArgs {
    fn rtc_options(&self) -> RtcOptions {
        let mut rtc = RtcOptions::default();
        if !self.stun.is_empty() {
            rtc.stun = self.stun.clone();
        }
        rtc.turn = self
            .turn
            .iter()
            .map(|url| TurnServer {
                url: url.clone(),
                username: self.turn_user.clone(),
                credential: self.turn_pass.clone(),
            })
            .collect();
        rtc.force_relay = self.force_relay;
        rtc
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("slipstream: error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Send {
            files,
            single_channel,
            network,
        } => {
            let config = SendConfig {
                signal_url: config::signal_url(network.signal_url.clone()),
                rtc: network.rtc_options(),
                force_single_channel: single_channel,
            };
            let summary = session::send_files(config, &files).await?;
            println!(
                "Sent {} file(s), {} in {:.1?}",
                summary.files,
                human_bytes(summary.bytes),
                summary.elapsed
            );
        }
        Command::Receive {
            room_id,
            output_dir,
            yes,
            network,
        } => {
            let config = ReceiveConfig {
                signal_url: config::signal_url(network.signal_url.clone()),
                rtc: network.rtc_options(),
                output_dir,
                consent: if yes {
                    ConsentPolicy::Accept
                } else {
                    ConsentPolicy::Prompt
                },
            };
            let report = session::receive_files(config, &room_id).await?;
            match report.outcome {
                ReceiveOutcome::Declined => println!("Transfer declined."),
                ReceiveOutcome::Completed(paths) => println!(
                    "Received {} file(s), {} in {:.1?}",
                    paths.len(),
                    human_bytes(report.bytes),
                    report.elapsed
                ),
            }
        }
        Command::Serve { bind } => {
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("bind {bind}"))?;
            slipstream::server::serve(listener).await?;
        }
    }
    Ok(())
}
