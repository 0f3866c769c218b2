//! Homestay Chat
//!
//! Terminal client for Homestay conversations: chat with a host or guest
//! and place voice or video calls from the command line.

mod commands;

use anyhow::Context;
use clap::Parser;
use commands::{Input, HELP};
use homestay_realtime::{CallEngine, CallEvent, ChatMessage, ClientConfig, Identity, RealtimeClient};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Chat and call in a Homestay conversation
#[derive(Parser, Debug)]
#[command(name = "homestay-chat")]
#[command(version)]
struct Cli {
    /// User id to sign in as
    #[arg(long, env = "HOMESTAY_USER")]
    user: String,

    /// Bearer token sent on CONNECT
    #[arg(long, env = "HOMESTAY_TOKEN")]
    token: Option<String>,

    /// Conversation to join
    #[arg(long)]
    conversation: String,

    /// JSON config file; defaults apply when it does not exist
    #[arg(long, default_value = "homestay.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "homestay_chat=info,homestay_realtime=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting Homestay Chat v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::load(&cli.config)
        .with_context(|| format!("loading config from {:?}", cli.config))?;
    tracing::info!("Broker: {}", config.socket_url);

    let client = RealtimeClient::new(config)?;
    watch_connection(&client);
    client.chat().on_message_received(|message| {
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M"),
            message.sender_id,
            message.content
        );
    });

    let mut identity = Identity::new(&cli.user);
    if let Some(token) = cli.token {
        identity = identity.with_token(token);
    }
    client.sign_in(identity);
    client.tracker().join_conversation(&cli.conversation)?;

    let engine = client.native_call_engine();
    tokio::spawn(print_call_events(engine.events()));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if !handle_input(&client, &engine, &cli.user, &cli.conversation, Input::parse(&line)).await {
            break;
        }
    }

    client.sign_out().await;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_input(
    client: &RealtimeClient,
    engine: &CallEngine,
    user: &str,
    conversation: &str,
    input: Input,
) -> bool {
    let result = match input {
        Input::Empty => Ok(()),
        Input::Message(text) => {
            let message = ChatMessage::compose(conversation, user, text);
            client.chat().send_message(&message).await
        }
        Input::Call { video } => engine.start_call(video).await,
        Input::Accept => engine.accept_call().await,
        Input::Reject => engine.reject_call().await,
        Input::Hangup => engine.end_call().await,
        Input::Mute => engine.toggle_mute().await.map(|muted| {
            println!("* microphone {}", if muted { "muted" } else { "on" });
        }),
        Input::Camera => engine.toggle_camera().await.map(|off| {
            println!("* camera {}", if off { "off" } else { "on" });
        }),
        Input::Help => {
            println!("{}", HELP);
            Ok(())
        }
        Input::Unknown(command) => {
            println!("* unknown command /{}, try /help", command);
            Ok(())
        }
        Input::Quit => return false,
    };

    match result {
        Err(e) if e.is_transport() => {
            tracing::warn!("Broker unavailable: {}", e);
            println!("* not delivered, broker unavailable ({})", e);
        }
        Err(e) => println!("* {}", e),
        Ok(()) => {}
    }
    true
}

fn watch_connection(client: &RealtimeClient) {
    let mut states = client.transport().watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!("* connection {:?}", state);
        }
    });
}

async fn print_call_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::StateChanged(state)) => println!("* call {:?}", state),
            Ok(CallEvent::IncomingCall { title, body, .. }) => {
                println!("* {}: {} (/accept or /reject)", title, body)
            }
            Ok(CallEvent::RemoteTrack(track)) => println!("* receiving {}", track.kind()),
            Ok(CallEvent::Error(message)) => println!("* call error: {}", message),
            Ok(CallEvent::Summary(summary)) => println!("* {}", summary.message_text()),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} call events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
