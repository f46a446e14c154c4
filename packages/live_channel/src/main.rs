use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use futures::{Stream, StreamExt};
use futures::stream::SelectAll;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use live_channel::{
    Channel, ChannelEvent, ChannelIdentifier, ChannelState, FileConfig, LiveClient, load_config,
};

#[derive(Parser)]
#[command(name = "live-tail")]
#[command(about = "Subscribe to live channels and print their events as JSON lines")]
struct Cli {
    /// Channel ids, formatted scope/namespace/path
    #[arg(required = true)]
    channels: Vec<String>,

    /// TOML config file ([transport] and [channels] sections)
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket URL, overrides transport.url
    #[arg(long)]
    url: Option<String>,

    /// Print a presence snapshot whenever a presence-capable channel connects
    #[arg(long)]
    presence: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the event stream.
    let default_directive = if cli.debug {
        "live_channel=debug,live_tail=debug,info"
    } else {
        "live_channel=info,live_tail=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut config: FileConfig = load_config(cli.config.as_deref())
        .extract()
        .context("failed to load configuration")?;
    if let Some(url) = cli.url {
        config.transport.url = Some(url);
    }

    let mut ids = Vec::with_capacity(cli.channels.len());
    for raw in &cli.channels {
        let id: ChannelIdentifier = raw
            .parse()
            .with_context(|| format!("invalid channel id {raw:?}"))?;
        ids.push(id);
    }

    let client = LiveClient::from_config(&config).context("failed to start live client")?;
    info!(channels = ids.len(), "tailing channels");

    let mut streams = SelectAll::new();
    for id in &ids {
        let channel = client.channel(id);
        streams.push(
            channel
                .stream()
                .map(move |event| (channel.clone(), event)),
        );
    }

    let result = tail(&mut streams, tokio::signal::ctrl_c(), cli.presence).await;
    client.shutdown();
    result
}

/// Print events until every stream ends or `interrupt` resolves.
async fn tail<S, F>(streams: &mut S, interrupt: F, presence: bool) -> Result<()>
where
    S: Stream<Item = (Channel, ChannelEvent)> + Unpin,
    F: Future,
{
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupted, shutting down");
                return Ok(());
            }
            next = streams.next() => {
                let Some((channel, event)) = next else {
                    info!("all channels closed");
                    return Ok(());
                };
                print_event(&channel, &event)?;
                if presence && is_connected(&event) {
                    spawn_presence_snapshot(&channel);
                }
            }
        }
    }
}

fn is_connected(event: &ChannelEvent) -> bool {
    event
        .as_status()
        .is_some_and(|status| status.state == ChannelState::Connected)
}

fn print_event(channel: &Channel, event: &ChannelEvent) -> Result<()> {
    let line = serde_json::to_string(&serde_json::json!({
        "channel": channel.id().id(),
        "event": event,
    }))
    .context("failed to encode event")?;
    println!("{line}");
    Ok(())
}

fn spawn_presence_snapshot(channel: &Channel) {
    let Some(presence) = channel.presence() else {
        return;
    };
    let id = channel.id().id().to_string();
    tokio::spawn(async move {
        match presence.fetch().await {
            Ok(set) => {
                let line = serde_json::json!({ "channel": id, "presence": set });
                println!("{line}");
            }
            Err(e) => warn!(channel = %id, error = %e, "presence fetch failed"),
        }
    });
}
