//! Transport trait abstraction for pluggable link backends
//!
//! A transport never touches manager state. Its worker tasks report
//! everything through a [`LinkEventSender`] (per session) or a
//! [`RadioEventSender`] (adapter power), which only enqueue into the
//! manager's serialized event loop.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use strip_shared::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Write capability located during discovery
#[async_trait]
pub trait CharacteristicWriter: Send + Sync {
    /// Perform a single write of `payload`
    async fn write(&self, payload: Bytes) -> Result<()>;
}

/// Shared handle to a discovered write capability
pub type WriteHandle = Arc<dyn CharacteristicWriter>;

/// One live logical session with a peer
pub trait LinkSession: Send {
    /// Start locating the write capability; the outcome arrives as
    /// [`LinkEvent::Discovered`]
    fn discover(&mut self);

    /// Close the session and release its resources
    fn close(&mut self);
}

/// Factory for link sessions
pub trait Transport: Send + Sync + 'static {
    /// Open a session to `peer` without waiting for the link to come up
    fn open(&self, peer: &str, link: LinkEventSender) -> Result<Box<dyn LinkSession>>;

    /// Subscribe to radio power changes. Implementations report the current
    /// state first, then every change, until the subscription is dropped.
    fn watch_radio(&self, radio: RadioEventSender) -> Result<RadioSubscription>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Asynchronous outcome reported by a transport session
pub enum LinkEvent {
    /// Link established
    Up,
    /// Link lost or the connect attempt failed
    Down { reason: String },
    /// Capability discovery finished
    Discovered(std::result::Result<WriteHandle, String>),
    /// Notification payload received from the peer
    Data(Bytes),
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::Up => write!(f, "Up"),
            LinkEvent::Down { reason } => write!(f, "Down({})", reason),
            LinkEvent::Discovered(Ok(_)) => write!(f, "Discovered(ok)"),
            LinkEvent::Discovered(Err(reason)) => write!(f, "Discovered(err: {})", reason),
            LinkEvent::Data(data) => write!(f, "Data({} bytes)", data.len()),
        }
    }
}

/// A [`LinkEvent`] stamped with the session that produced it
#[derive(Debug)]
pub struct LinkNotice {
    pub peer: PeerId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Per-session event reporter handed to [`Transport::open`]
#[derive(Clone)]
pub struct LinkEventSender {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkNotice>,
}

impl LinkEventSender {
    pub fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<LinkNotice>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn up(&self) -> bool {
        self.emit(LinkEvent::Up)
    }

    pub fn down(&self, reason: impl Into<String>) -> bool {
        self.emit(LinkEvent::Down {
            reason: reason.into(),
        })
    }

    pub fn discovered(&self, writer: WriteHandle) -> bool {
        self.emit(LinkEvent::Discovered(Ok(writer)))
    }

    pub fn discovery_failed(&self, reason: impl Into<String>) -> bool {
        self.emit(LinkEvent::Discovered(Err(reason.into())))
    }

    pub fn data(&self, payload: impl Into<Bytes>) -> bool {
        self.emit(LinkEvent::Data(payload.into()))
    }

    /// True once the manager has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Returns false if the manager is gone
    fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkNotice {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Radio power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
}

impl RadioState {
    pub fn is_powered(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

impl From<bool> for RadioState {
    fn from(powered: bool) -> Self {
        if powered {
            RadioState::PoweredOn
        } else {
            RadioState::PoweredOff
        }
    }
}

/// Radio power reporter handed to [`Transport::watch_radio`]
#[derive(Clone)]
pub struct RadioEventSender {
    tx: mpsc::UnboundedSender<RadioState>,
}

impl RadioEventSender {
    pub fn new(tx: mpsc::UnboundedSender<RadioState>) -> Self {
        Self { tx }
    }

    /// Returns false if the manager is gone
    pub fn send(&self, state: RadioState) -> bool {
        self.tx.send(state).is_ok()
    }
}

/// Keeps a radio watch alive; dropping it unsubscribes
pub struct RadioSubscription {
    task: Option<JoinHandle<()>>,
}

impl RadioSubscription {
    /// Subscription backed by a watcher task
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Subscription with nothing to tear down
    #[cfg(test)]
    pub fn detached() -> Self {
        Self { task: None }
    }
}

impl Drop for RadioSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_events_are_stamped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = LinkEventSender::new("AA".into(), 7, tx);

        assert!(link.up());
        assert!(link.data(Bytes::from_static(b"OK\n")));

        let notice = rx.try_recv().expect("missing notice");
        assert_eq!(notice.peer, "AA");
        assert_eq!(notice.generation, 7);
        assert!(matches!(notice.event, LinkEvent::Up));

        let notice = rx.try_recv().expect("missing notice");
        assert!(matches!(notice.event, LinkEvent::Data(ref data) if &data[..] == b"OK\n"));
    }

    #[test]
    fn test_sender_reports_closed_manager() {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = LinkEventSender::new("AA".into(), 1, tx);
        drop(rx);

        assert!(link.is_closed());
        assert!(!link.down("gone"));
    }

    #[test]
    fn test_radio_state_from_bool() {
        assert_eq!(RadioState::from(true), RadioState::PoweredOn);
        assert!(!RadioState::from(false).is_powered());
    }
}
