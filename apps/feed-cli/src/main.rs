mod cli;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use feed_api::memory::InMemoryFeedApi;
use feed_api::FeedApiClient;
use feed_proto::{ChatMessage, NotificationRecord};
use feed_realtime::{
    ChannelKind, ChatConversation, ConnectionState, NotificationFeed, RealtimeConfig,
    RealtimeSession, SessionApis, UpvoteController,
};
use push_transport::{LocalBroker, PushTransport};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

#[derive(Debug, Deserialize)]
struct ReplayFrame {
    destination: String,
    body: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init_tracing(
        cli.log_filter
            .as_deref()
            .unwrap_or(telemetry::DEFAULT_FILTER),
    );
    let config = RealtimeConfig::from_env();
    run(cli, config).await
}

async fn run(cli: Cli, config: RealtimeConfig) -> Result<()> {
    let user = cli.account.user;
    let base = cli
        .account
        .api_base
        .clone()
        .unwrap_or_else(|| config.api_base.clone());
    let mut client = FeedApiClient::new(base);
    if let Some(token) = cli.account.token.clone() {
        client = client.with_token(token);
    }
    let api = Arc::new(client);
    info!(user, api_base = %api.base_url(), "feed-cli starting");

    match cli.command {
        Commands::Notifications { pages, json } => {
            let feed = NotificationFeed::new(user, api, config.notification_page_size);
            feed.load_initial().await?;
            for _ in 1..pages {
                if feed.load_more().await? == 0 && !feed.snapshot().has_more {
                    break;
                }
            }
            let view = feed.snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&view.items)?);
            } else {
                print_notifications(&view.items);
                println!(
                    "unread: {}{}",
                    view.unread_count,
                    if view.has_more { " (more available)" } else { "" }
                );
            }
        }
        Commands::MarkRead { id } => {
            let feed = NotificationFeed::new(user, api, config.notification_page_size);
            feed.load_initial().await?;
            feed.mark_read(id).await?;
            println!("unread: {}", feed.unread_count());
        }
        Commands::ReadAll => {
            let feed = NotificationFeed::new(user, api, config.notification_page_size);
            feed.load_initial().await?;
            feed.mark_all_read().await?;
            println!("unread: {}", feed.unread_count());
        }
        Commands::Respond { id, decline } => {
            let feed = NotificationFeed::new(user, api, config.notification_page_size);
            feed.load_initial().await?;
            feed.respond_to_request(id, !decline)
                .await
                .with_context(|| format!("responding to request {id}"))?;
            println!(
                "{} request {id}; unread: {}",
                if decline { "declined" } else { "accepted" },
                feed.unread_count()
            );
        }
        Commands::History { buddy, older } => {
            let chat = ChatConversation::new(user, buddy, api, config.chat_history_limit);
            chat.load_initial().await?;
            for _ in 0..older {
                if chat.load_older().await? == 0 {
                    break;
                }
            }
            print_messages(&chat.snapshot().messages);
        }
        Commands::Send { buddy, message } => {
            let chat = ChatConversation::new(user, buddy, api, config.chat_history_limit);
            let sent = chat.send(&message).await?;
            println!("sent {} at {}", sent.id, sent.timestamp);
        }
        Commands::Upvote { topic } => {
            let upvotes = UpvoteController::new(user, api);
            upvotes.refresh(std::slice::from_ref(&topic)).await?;
            let result = upvotes.toggle(&topic).wait().await;
            let state = upvotes.state(&topic);
            println!(
                "{topic}: {} upvotes{}",
                state.count,
                if state.user_has_upvoted { " (yours included)" } else { "" }
            );
            result?;
        }
        Commands::Upvotes { topics } => {
            let upvotes = UpvoteController::new(user, api);
            upvotes.refresh(&topics).await?;
            for topic in &topics {
                let state = upvotes.state(topic);
                println!(
                    "{topic}: {}{}",
                    state.count,
                    if state.user_has_upvoted { " *" } else { "" }
                );
            }
        }
        Commands::Replay { file, buddy } => replay(user, config, &file, buddy).await?,
    }
    Ok(())
}

/// Offline session: in-process broker and backend, fed from a file.
async fn replay(
    user: i64,
    config: RealtimeConfig,
    file: &std::path::Path,
    buddy: Option<i64>,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let frames = raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<ReplayFrame>(line)
                .with_context(|| format!("line {} is not a push frame", index + 1))
        })
        .collect::<Result<Vec<_>>>()?;

    let broker = LocalBroker::new();
    let transport: Arc<dyn PushTransport> = Arc::new(broker.clone());
    let session = RealtimeSession::new(
        user,
        config,
        transport,
        SessionApis::from_backend(InMemoryFeedApi::new()),
    );
    let feed = session.open_notifications().await?;
    let chat = match buddy {
        Some(buddy) => Some(session.open_chat(buddy).await?),
        None => None,
    };
    wait_connected(&session, ChannelKind::Notifications).await?;
    if chat.is_some() {
        wait_connected(&session, ChannelKind::Chat).await?;
    }

    for frame in &frames {
        let delivered = broker.push(&frame.destination, serde_json::to_vec(&frame.body)?);
        if delivered == 0 {
            warn!(destination = %frame.destination, "no subscriber for frame");
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view = feed.snapshot();
    print_notifications(&view.items);
    println!("unread: {}", view.unread_count);
    if let Some(chat) = chat {
        print_messages(&chat.snapshot().messages);
    }
    session.shutdown();
    Ok(())
}

async fn wait_connected(session: &RealtimeSession, channel: ChannelKind) -> Result<()> {
    for _ in 0..100 {
        if session.connection_state(channel) == ConnectionState::Connected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("{channel} channel did not connect")
}

fn print_notifications(items: &[NotificationRecord]) {
    for record in items {
        println!(
            "[{}] {:<6} {:?} {} {}",
            record.id,
            if record.is_unread() { "UNREAD" } else { "read" },
            record.kind,
            record.timestamp,
            record.message
        );
    }
}

fn print_messages(messages: &[ChatMessage]) {
    for message in messages {
        println!(
            "{} {} -> {}: {}",
            message.timestamp, message.sender_id, message.recipient_id, message.content
        );
    }
}
