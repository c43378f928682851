use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{load_settings, ChatClient, ClientEvent};
use shared::domain::{ConversationId, UserId};

#[derive(Parser, Debug)]
struct Args {
    /// Conversation to open.
    #[arg(long)]
    conversation_id: i64,
    /// Message body to send after history loads.
    #[arg(long)]
    message: Option<String>,
    /// Counterpart user to watch for presence changes.
    #[arg(long)]
    track_user: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings();
    let client = ChatClient::new(settings)?;
    client.connect();
    if !client.wait_until_open(Duration::from_secs(10)).await {
        bail!("channel did not open; check CHAT__SERVER_URL and CHAT__BEARER_TOKEN");
    }

    let conversation_id = ConversationId(args.conversation_id);
    let mut events = client.subscribe_events();

    if let Some(user_id) = args.track_user {
        client.track_presence(UserId(user_id)).await;
    }

    client.load_history(conversation_id).await?;
    for message in client.messages(conversation_id).await {
        println!(
            "[{}] {:?}: {}",
            message.sent_at.format("%H:%M:%S"),
            message.sender_id,
            message.body
        );
    }
    client.mark_seen(conversation_id).await;

    if let Some(body) = args.message {
        let sent = client.send_message(conversation_id, body, Vec::new()).await;
        println!("sent optimistically as {:?}", sent.key);
    }

    loop {
        match events.recv().await {
            Ok(ClientEvent::MessageAppended(message))
                if message.conversation_id == conversation_id =>
            {
                println!(
                    "[{}] {:?}: {}",
                    message.sent_at.format("%H:%M:%S"),
                    message.sender_id,
                    message.body
                );
                client.mark_seen(conversation_id).await;
            }
            Ok(ClientEvent::MessageConfirmed(message)) => {
                println!("delivered: {:?}", message.key);
            }
            Ok(ClientEvent::MessageFailed { key, .. }) => {
                println!("failed to deliver: {key:?}");
            }
            Ok(ClientEvent::PresenceChanged(update)) => {
                println!(
                    "{:?} is now {}",
                    update.user_id,
                    if update.online { "online" } else { "offline" }
                );
            }
            Ok(ClientEvent::Disconnected) => println!("connection lost, retrying..."),
            Ok(ClientEvent::Connected) => println!("connected"),
            Ok(_) => {}
            Err(err) => bail!("event stream closed: {err}"),
        }
    }
}
