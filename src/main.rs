mod connection;
mod transport;

use anyhow::Result;
use connection::{LinkConfig, StripEvent, StripManager};
use std::sync::Arc;
use strip_shared::{PeerId, StripCommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use transport::{GattConfig, GattTransport};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// One line typed on the console: `<peer> <on|off|ping|connect|disconnect>`
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Connect(PeerId),
    Disconnect(PeerId),
    Send(PeerId, StripCommand),
    Status,
}

fn parse_console_line(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let first = words.next()?;
    if first.eq_ignore_ascii_case("status") {
        return Some(ConsoleCommand::Status);
    }

    let peer = first.to_ascii_uppercase();
    let action = words.next()?;
    match action.to_ascii_lowercase().as_str() {
        "connect" => Some(ConsoleCommand::Connect(peer)),
        "disconnect" => Some(ConsoleCommand::Disconnect(peer)),
        other => other
            .parse()
            .ok()
            .map(|command| ConsoleCommand::Send(peer, command)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let peers: Vec<PeerId> = std::env::args()
        .skip(1)
        .map(|peer| peer.to_ascii_uppercase())
        .collect();

    let transport = GattTransport::new(GattConfig::default()).await?;
    let manager = StripManager::start(LinkConfig::default(), Arc::new(transport));
    let mut events = manager.subscribe();

    if peers.is_empty() {
        warn!("No strip addresses given; use the console to connect");
    }
    for peer in &peers {
        info!("Connecting to strip {}", peer);
        manager.connect(peer.clone())?;
    }

    // Console commands
    let console = manager.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = handle_console_line(&console, &line) {
                error!("Console command failed: {}", e);
                break;
            }
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Main event loop
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StripEvent::StateChanged { peer, state }) => {
                    info!("{} is {}", peer, state);
                }
                Ok(StripEvent::MessageReceived { peer, text }) => {
                    info!("{} says {:?}", peer, text.trim_end());
                }
                // Already mirrored to tracing by the manager
                Ok(StripEvent::LogLine { .. }) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event stream lagged, missed {} events", missed);
                }
                Err(RecvError::Closed) => {
                    error!("Connection manager closed");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    manager.shutdown().await?;
    Ok(())
}

fn handle_console_line(manager: &StripManager, line: &str) -> Result<()> {
    let Some(command) = parse_console_line(line) else {
        if !line.trim().is_empty() {
            warn!("Usage: <peer> on|off|ping|connect|disconnect, or status");
        }
        return Ok(());
    };

    match command {
        ConsoleCommand::Connect(peer) => manager.connect(peer),
        ConsoleCommand::Disconnect(peer) => manager.disconnect(peer),
        ConsoleCommand::Send(peer, command) => manager.send_command(peer, command),
        ConsoleCommand::Status => {
            for (peer, state) in manager.peers() {
                info!("  {} {} ready={}", peer, state, manager.is_ready(&peer));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_console_line() {
        assert_eq!(
            parse_console_line("aa:bb:cc:dd:ee:ff on"),
            Some(ConsoleCommand::Send(
                "AA:BB:CC:DD:EE:FF".into(),
                StripCommand::On
            ))
        );
        assert_eq!(
            parse_console_line("AA:BB:CC:DD:EE:FF Disconnect"),
            Some(ConsoleCommand::Disconnect("AA:BB:CC:DD:EE:FF".into()))
        );
        assert_eq!(parse_console_line("status"), Some(ConsoleCommand::Status));
    }

    #[test]
    fn test_parse_console_line_rejects_garbage() {
        assert_eq!(parse_console_line(""), None);
        assert_eq!(parse_console_line("AA:BB:CC:DD:EE:FF"), None);
        assert_eq!(parse_console_line("AA:BB:CC:DD:EE:FF toggle"), None);
    }
}
