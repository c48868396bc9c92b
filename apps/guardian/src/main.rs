use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use extension_bus::LocalBus;
use guardian_core::Guardian;
use guardian_core::config::{GuardianConfig, parse_ice_servers};
use guardian_core::telemetry;
use tokio::io::{AsyncBufReadExt, BufReader};
use transport_webrtc::RtcConnector;

#[derive(Parser, Debug)]
#[command(
    name = "guardian",
    about = "Pair with a remote signer over WebRTC and relay signing calls to it",
    version
)]
struct Cli {
    #[arg(long, global = true, help = "Comma-separated ICE server urls (host candidates only when empty)")]
    ice_servers: Option<String>,

    #[arg(long, global = true, help = "Base url of the shareable offer link")]
    pairing_url: Option<String>,

    #[arg(long, global = true, value_name = "MS", help = "Deadline for each remote call")]
    rpc_timeout_ms: Option<u64>,

    #[arg(long, global = true, value_name = "MS", help = "How long to wait for the link after the answer")]
    connect_timeout_ms: Option<u64>,

    #[arg(long, global = true, help = "Log filter directive, overrides RUST_LOG")]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Negotiate a session, read the signer's answer from stdin and fetch its public key.
    Pair {
        #[arg(long, help = "Discard any existing session before offering")]
        refresh: bool,
        #[arg(long, help = "Print the raw offer SDP as well as the link")]
        print_sdp: bool,
    },
    /// Print a fresh offer link and exit.
    Offer,
}

impl Cli {
    fn apply(&self, config: &mut GuardianConfig) {
        if let Some(raw) = &self.ice_servers {
            config.ice_servers = parse_ice_servers(raw);
        }
        if let Some(url) = &self.pairing_url {
            config.pairing_url = url.clone();
        }
        if let Some(ms) = self.rpc_timeout_ms {
            config.rpc_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(filter) = &self.log_filter {
            config.log_filter = filter.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = GuardianConfig::from_env();
    cli.apply(&mut config);
    telemetry::init_tracing(&config.log_filter).context("failed to install tracing")?;

    let connector = Arc::new(RtcConnector::new(config.ice_servers.clone()));
    let guardian = Guardian::new(config, connector, Arc::new(LocalBus::new()));

    let result = match cli.command {
        Command::Offer => offer(&guardian).await,
        Command::Pair { refresh, print_sdp } => pair(&guardian, refresh, print_sdp).await,
    };
    guardian.shutdown().await;
    result
}

async fn offer(guardian: &Guardian) -> anyhow::Result<()> {
    let offer = guardian
        .pairing()
        .fetch_offer(true)
        .await
        .context("failed to produce an offer")?;
    println!("{}", offer.link);
    Ok(())
}

async fn pair(guardian: &Guardian, refresh: bool, print_sdp: bool) -> anyhow::Result<()> {
    let pairing = guardian.pairing();
    let offer = pairing
        .fetch_offer(refresh)
        .await
        .context("failed to produce an offer")?;
    println!("Open this link on the signer:\n\n{}\n", offer.link);
    if print_sdp {
        println!("{}", offer.sdp);
    }

    eprintln!("Paste the answer SDP, then an empty line:");
    let answer = read_answer().await?;
    if answer.is_empty() {
        bail!("no answer provided");
    }
    pairing
        .submit_answer(&answer)
        .await
        .context("pairing did not complete")?;

    let _relay = guardian.spawn_relay();
    let bridge = guardian.page_bridge(guardian.config().options_url());
    let pubkey = bridge
        .get_public_key()
        .await
        .context("signer did not return a public key")?;
    println!("paired with {pubkey}");
    Ok(())
}

async fn read_answer() -> anyhow::Result<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sdp = String::new();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        sdp.push_str(line);
        sdp.push_str("\r\n");
    }
    if !sdp.is_empty() && !sdp.starts_with("v=") {
        // Accept the percent-encoded form the signer app shares as well.
        if let Ok(decoded) = urlencoding::decode(sdp.trim()) {
            return Ok(decoded.into_owned());
        }
    }
    Ok(sdp)
}
