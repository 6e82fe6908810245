use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use earshot::session::{
    generate_token, parse_shareable_link, ConnectionRegistry, LocalIdentity, MediaGate,
    NegotiationEngine, PeerState, RtcTransport, ToneCapture,
};
use earshot::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "earshot")]
#[command(about = "Pairwise audio calls with hand-relayed WebRTC signaling", long_about = None)]
struct Cli {
    /// Override the configured nickname
    #[arg(long, global = true)]
    nickname: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an invite link, then read the answer token from stdin
    Host,
    /// Join from an invite link and print the answer token to relay back
    Join {
        /// The shareable link (or bare fragment) received from the host
        link: String,
    },
    /// Decode an invite link or answer token and show its contents
    Inspect {
        /// Shareable link or bare payload token
        input: String,
    },
}

struct Call {
    config: Config,
    engine: NegotiationEngine,
    gate: MediaGate,
    registry: Arc<ConnectionRegistry>,
}

fn setup(nickname: Option<String>) -> Result<Call> {
    let mut config = Config::load()?;
    if let Some(nickname) = nickname {
        config.identity.nickname = nickname;
    }

    let session_config = config.session_config();
    let registry = ConnectionRegistry::new();
    let transport = Arc::new(RtcTransport::new(session_config.stun_servers.clone()));
    let identity = LocalIdentity::new(config.identity.nickname.clone());
    let engine = NegotiationEngine::new(
        transport,
        registry.clone(),
        identity,
        session_config,
    );
    let gate = MediaGate::new(registry.clone(), Arc::new(ToneCapture::default()));

    Ok(Call {
        config,
        engine,
        gate,
        registry,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Host => run_host(setup(cli.nickname)?).await,
        Commands::Join { link } => run_join(setup(cli.nickname)?, &link).await,
        Commands::Inspect { input } => run_inspect(&input),
    }
}

async fn run_host(mut call: Call) -> Result<()> {
    let connection_token = generate_token();
    let link = call
        .engine
        .create_offer(&connection_token)
        .await
        .context("Failed to create offer")?;

    println!("Invite link (send this to your peer):");
    println!("  {}", link);
    println!();
    println!("Paste the answer token below:");

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .context("Failed to read answer token")?;
    let answer = answer.trim();
    if answer.is_empty() {
        return Err(anyhow!("No answer token given"));
    }

    call.engine
        .complete_connection(&connection_token, answer)
        .await
        .context("Failed to complete connection")?;

    finish_call(&mut call).await
}

async fn run_join(mut call: Call, link: &str) -> Result<()> {
    let (connection_token, offer) = parse_shareable_link(link)
        .ok_or_else(|| anyhow!("Not a valid invite link"))?;
    println!(
        "Joining {} (connection {})",
        offer.nickname, connection_token
    );

    let answer_token = call
        .engine
        .process_offer(&connection_token, offer)
        .await
        .context("Failed to process offer")?;

    println!("Answer token (relay this back to the host):");
    println!("  {}", answer_token);

    finish_call(&mut call).await
}

/// Shared tail of both roles: start sharing audio, remember the peer,
/// report liveness until interrupted.
async fn finish_call(call: &mut Call) -> Result<()> {
    for peer_id in call.registry.peer_ids().await {
        call.gate
            .start_sharing(&peer_id)
            .await
            .context("Failed to start sharing audio")?;
    }

    for status in call.registry.statuses().await {
        call.config
            .remember_peer(&status.peer_id, &status.nickname, None);
    }
    call.config.save()?;

    println!("Press Ctrl+C to hang up.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                for status in call.registry.statuses().await {
                    println!(
                        "  {} ({}): {}{}",
                        status.nickname,
                        &status.peer_id[..8.min(status.peer_id.len())],
                        status.state,
                        if status.is_sharing { ", sharing audio" } else { "" }
                    );
                    if status.state == PeerState::Failed {
                        println!("  Connection failed; ask your peer for a fresh invite.");
                    }
                }
            }
        }
    }

    call.engine.shutdown().await;
    println!("Call ended.");
    Ok(())
}

fn run_inspect(input: &str) -> Result<()> {
    let payload = match parse_shareable_link(input) {
        Some((token, payload)) => {
            println!("Connection token: {}", token);
            payload
        }
        None => earshot::session::decode(input).context("Not a link or payload token")?,
    };

    println!("Kind: {:?}", payload.kind);
    println!("Peer: {} ({})", payload.nickname, payload.peer_id);
    println!("Sent at: {} (unix)", payload.timestamp);
    println!("Candidates: {}", payload.candidates.len());
    if let Some(token) = &payload.connection_token {
        println!("Correlates to: {}", token);
    }
    if !payload.metadata.capabilities.is_empty() {
        println!(
            "Capabilities: {}",
            payload
                .metadata
                .capabilities
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}
