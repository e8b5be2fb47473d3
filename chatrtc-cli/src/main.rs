//! ChatRTC CLI Application

use anyhow::{Context, Result};
use chatrtc_core::prelude::*;
use chatrtc_core::{ChatTextCodec, DeviceAccess, SignalingCodec, SyntheticDevices, WebRtcPeerFactory};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON call configuration file
    #[arg(short, long, env = "CHATRTC_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between two in-process participants
    Demo {
        /// Calling participant
        #[arg(long, default_value = "alice")]
        caller: String,

        /// Called participant
        #[arg(long, default_value = "bob")]
        callee: String,

        /// Chat session id (random if omitted)
        #[arg(long)]
        session: Option<String>,

        /// Refuse camera access on the caller side
        #[arg(long)]
        deny_camera: bool,

        /// Use host candidates only
        #[arg(long)]
        no_stun: bool,

        /// How long to keep the call up once connected
        #[arg(long, default_value = "5")]
        duration_secs: u64,
    },

    /// Show how a chat line decodes
    Decode {
        /// Chat line
        payload: String,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatrtc=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            caller,
            callee,
            session,
            deny_camera,
            no_stun,
            duration_secs,
        } => {
            let mut config = config;
            if no_stun {
                config.ice_servers.clear();
            }
            let session = session.unwrap_or_else(generate_session_name);
            handle_demo(
                config,
                &session,
                &caller,
                &callee,
                deny_camera,
                Duration::from_secs(duration_secs),
            )
            .await?;
        }
        Commands::Decode { payload } => handle_decode(&payload),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CallConfig> {
    let Some(path) = path else {
        return Ok(CallConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = CallConfig::from_json_str(&json)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

async fn handle_demo(
    config: CallConfig,
    session: &str,
    caller: &str,
    callee: &str,
    deny_camera: bool,
    hold: Duration,
) -> Result<()> {
    println!("💬 Chat session: {session}");
    let room = ChatRoom::new();

    let caller_devices = Arc::new(SyntheticDevices::new());
    if deny_camera {
        caller_devices.set_camera(DeviceAccess::Denied);
    }
    let alice = CallController::builder(caller, session, Arc::new(room.join(caller)))
        .with_config(config.clone())
        .with_devices(caller_devices)
        .with_peer_factory(Arc::new(WebRtcPeerFactory::new()))
        .with_remote(callee)
        .build()?;
    let bob = CallController::builder(callee, session, Arc::new(room.join(callee)))
        .with_config(config)
        .with_peer_factory(Arc::new(WebRtcPeerFactory::new()))
        .with_remote(caller)
        .build()?;

    let mut alice_events = alice.subscribe();
    let bob_events = bob.subscribe();
    alice.spawn();
    bob.spawn();
    tokio::spawn(auto_answer(bob.clone(), bob_events));

    let call_id = alice.start(callee).await?;
    println!("📞 {caller} is calling {callee} ({call_id})");

    let phase = wait_for_outcome(caller, &mut alice_events, Duration::from_secs(30)).await;
    if phase == CallPhase::Active {
        println!("✅ Connected, holding the call for {}s", hold.as_secs());
        tokio::time::sleep(hold).await;
        alice.end().await;
    } else {
        println!("❌ Call did not connect: {phase:?}");
        alice.end().await;
    }

    // Let the hang-up reach the other side
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("📴 {caller}: {:?} | {callee}: {:?}", alice.phase(), bob.phase());
    Ok(())
}

/// Accept every incoming call and print what happens
async fn auto_answer(controller: CallController, mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::IncomingCall { from, .. }) => {
                println!("🔔 {} has an incoming call from {from}", controller.local_id());
                if let Err(e) = controller.accept().await {
                    tracing::error!("Accept failed: {}", e);
                }
            }
            Ok(event) => print_event(controller.local_id().as_str(), &event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event stream lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Print `who`'s events until the call is Active or over
async fn wait_for_outcome(
    who: &str,
    events: &mut broadcast::Receiver<CallEvent>,
    timeout: Duration,
) -> CallPhase {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(who, &event);
                    if let CallEvent::PhaseChanged { phase, .. } = event {
                        if phase == CallPhase::Active || phase.is_terminal() {
                            return phase;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return CallPhase::Failed,
            },
            () = &mut deadline => {
                tracing::warn!("Timed out waiting for the call to connect");
                return CallPhase::Failed;
            }
        }
    }
}

fn print_event(who: &str, event: &CallEvent) {
    match event {
        CallEvent::PhaseChanged { phase, .. } => println!("   {who}: phase {phase:?}"),
        CallEvent::ConnectionStateChanged { state } => println!("   {who}: connection {state:?}"),
        CallEvent::RemoteStreamAdded { stream_id } => println!("   {who}: remote stream {stream_id}"),
        CallEvent::Notice(Notice::Error { message, .. }) => println!("⚠️  {who}: {message}"),
        CallEvent::Notice(Notice::Warning { message }) => println!("   {who}: {message}"),
        CallEvent::Notice(Notice::Success { message }) => println!("   {who}: {message}"),
        other => tracing::debug!("{}: {:?}", who, other),
    }
}

fn handle_decode(payload: &str) {
    match ChatTextCodec::default().decode(payload) {
        Ok(message) => println!("{message:#?}"),
        Err(e) => println!("Not decoded: {e}"),
    }
}

fn generate_session_name() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let words: Vec<&str> = (0..3).map(|_| WORDS[rng.gen_range(0..WORDS.len())]).collect();
    format!("chat-{}", words.join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_demo_flags() {
        let cli = Cli::try_parse_from(["chatrtc", "demo", "--no-stun", "--duration-secs", "1"])
            .unwrap();
        match cli.command {
            Commands::Demo {
                caller,
                no_stun,
                duration_secs,
                deny_camera,
                ..
            } => {
                assert_eq!(caller, "alice");
                assert!(no_stun);
                assert!(!deny_camera);
                assert_eq!(duration_secs, 1);
            }
            _ => panic!("expected demo"),
        }
    }

    #[test]
    fn test_session_name_shape() {
        let name = generate_session_name();
        assert!(name.starts_with("chat-"));
        assert_eq!(name.split('-').count(), 4);
    }

    #[test]
    fn test_missing_config_defaults() {
        assert_eq!(load_config(None).unwrap(), CallConfig::default());
    }
}
