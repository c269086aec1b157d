use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    event_stream, load_settings, ChannelConfig, ChannelEvent, CollectionConfig,
    CollectionController, CredentialProvider, FetchOutcome, HttpCollectionEndpoint, NoCredentials,
    RealtimeChannel, StaticToken,
};
use futures::StreamExt;
use serde_json::Value;
use shared::domain::{MessageKind, SortDirection};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
struct Cli {
    /// TOML settings file; `APP__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bearer token sent to the API and the realtime endpoint.
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Page through a remote collection.
    Browse {
        /// Collection endpoint; defaults to `collection_url` from settings.
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        desc: bool,
        /// Additional pages to append after the first one.
        #[arg(long, default_value_t = 0)]
        more: usize,
    },
    /// Join a channel, print its traffic and send stdin lines.
    Chat {
        #[arg(long)]
        channel: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    let credentials: Arc<dyn CredentialProvider> = match cli.token {
        Some(token) => Arc::new(StaticToken(token)),
        None => Arc::new(NoCredentials),
    };

    match cli.command {
        Command::Browse {
            url,
            search,
            sort,
            desc,
            more,
        } => {
            let url = url
                .or_else(|| settings.collection_url.clone())
                .ok_or_else(|| anyhow!("no collection url given (--url or collection_url)"))?;
            let url = Url::parse(&url).with_context(|| format!("invalid collection url {url}"))?;
            let endpoint = Arc::new(HttpCollectionEndpoint::new(url, credentials));
            let collection = CollectionController::<Value>::from_endpoint(
                endpoint,
                CollectionConfig {
                    initial_search: search,
                    initial_sort: sort.map(|field| {
                        let direction = if desc {
                            SortDirection::Desc
                        } else {
                            SortDirection::Asc
                        };
                        (field, direction)
                    }),
                    ..CollectionConfig::from_settings(&settings)
                },
            );

            collection.refresh().await?;
            for _ in 0..more {
                if collection.load_more().await? == FetchOutcome::Skipped {
                    break;
                }
            }

            let snapshot = collection.snapshot().await;
            for row in &snapshot.page.items {
                println!("{row}");
            }
            info!(
                rows = snapshot.page.items.len(),
                total = ?snapshot.page.total_count,
                has_more = snapshot.page.has_more,
                "collection realized"
            );
        }
        Command::Chat { channel } => {
            let mut config = ChannelConfig::from_settings(&settings)?;
            if let Some(channel) = channel {
                config.channel_id = channel.into();
            }
            let chat = RealtimeChannel::over_network(config, &settings.api_url, credentials);
            let mut events = Box::pin(event_stream(chat.subscribe_events()));
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    print_event(&event);
                }
            });

            if let Err(err) = chat.start().await {
                eprintln!("history unavailable: {err}");
            }
            if !chat.config().auto_connect {
                chat.connect().await;
            }

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if handle_line(&chat, &line).await == Flow::Quit {
                    break;
                }
            }
            chat.disconnect().await;
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// One line of chat input. Failures are printed; the session keeps going.
async fn handle_line(chat: &Arc<RealtimeChannel>, line: &str) -> Flow {
    match line.trim() {
        "" => {}
        "/quit" => return Flow::Quit,
        "/older" => {
            if let Err(err) = chat.load_older().await {
                eprintln!("older history unavailable: {err}");
            }
        }
        text => {
            if let Err(err) = chat.send(text, MessageKind::Text, None).await {
                eprintln!("not sent: {err}");
            }
        }
    }
    Flow::Continue
}

fn print_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::StatusChanged(state) => println!("* {state:?}"),
        ChannelEvent::MessageReceived(message) | ChannelEvent::MessageSent(message) => {
            println!("[{}] {}: {}", message.timestamp, message.sender_id, message.content);
        }
        ChannelEvent::MessageUpdated(message) => {
            println!("* {} is now {:?}", message.id, message.status);
        }
        ChannelEvent::HistoryLoaded { added, has_more } => {
            println!("* loaded {added} messages (more: {has_more})");
        }
        ChannelEvent::Error(failure) => eprintln!("! {:?}: {}", failure.kind, failure.message),
        _ => {}
    }
}
