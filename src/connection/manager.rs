//! Multi-peer connection manager with automatic reconnection
//!
//! A single actor task owns the peer map. Callers, transport workers and
//! timers only ever enqueue messages into it, so no state is shared behind
//! locks and every peer transition happens on one serialized timeline.

use crate::connection::session::{PeerSession, WritePipeline};
use crate::transport::{
    LinkEvent, LinkEventSender, LinkNotice, RadioEventSender, RadioState, RadioSubscription,
    Transport, WriteHandle,
};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strip_shared::{
    codec, link, LinkError, PeerId, PeerState, ReconnectPolicy, SessionEvent, StripCommand,
    TransitionResult,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Notifications published to subscribers (UI, persistence, logs)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripEvent {
    /// Peer entered a new lifecycle state
    StateChanged { peer: PeerId, state: PeerState },
    /// Free-form diagnostic line about a peer
    LogLine { peer: PeerId, text: String },
    /// Notification payload received from a peer
    MessageReceived { peer: PeerId, text: String },
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Reconnect delay unit, multiplied by the attempt count
    pub reconnect_base_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Interval between liveness probes
    pub heartbeat_interval: Duration,
    /// Payload written to every ready peer on each heartbeat
    pub heartbeat_payload: Bytes,
    /// How long a peer may sit in Connecting before the attempt is dropped
    pub connect_timeout: Option<Duration>,
    /// Subscriber buffer; slow subscribers miss events beyond this
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(link::RECONNECT_BASE_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(link::RECONNECT_MAX_DELAY_MS),
            heartbeat_interval: Duration::from_millis(link::HEARTBEAT_INTERVAL_MS),
            heartbeat_payload: StripCommand::Ping.encode(),
            connect_timeout: Some(Duration::from_millis(link::CONNECT_TIMEOUT_MS)),
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_base_delay, self.max_reconnect_delay)
    }
}

enum ManagerCommand {
    Connect(PeerId),
    Send(PeerId, Bytes),
    Disconnect(PeerId),
    Shutdown(oneshot::Sender<()>),
}

/// Messages the actor sends to itself from timers and write workers
enum Loopback {
    ReconnectDue {
        peer: PeerId,
        token: u64,
    },
    ConnectDeadline {
        peer: PeerId,
        generation: u64,
    },
    WriteFinished {
        peer: PeerId,
        generation: u64,
        payload: Bytes,
        result: std::result::Result<(), String>,
    },
}

/// Handle to the connection manager
///
/// Cheap to clone. Every method returns immediately; outcomes are reported
/// through [`StripManager::subscribe`].
#[derive(Clone)]
pub struct StripManager {
    commands: mpsc::UnboundedSender<ManagerCommand>,
    events: broadcast::Sender<StripEvent>,
    states: watch::Receiver<HashMap<PeerId, PeerState>>,
}

impl StripManager {
    /// Spawn the manager actor on the current runtime
    pub fn start(config: LinkConfig, transport: Arc<dyn Transport>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (states_tx, states) = watch::channel(HashMap::new());

        info!("[LINK] Starting connection manager over {}", transport.name());
        let actor = ManagerActor::new(config, transport, events.clone(), states_tx, command_rx);
        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            events,
            states,
        }
    }

    /// Create the peer entry if needed and (re)start its connect sequence
    pub fn connect(&self, peer: impl Into<PeerId>) -> Result<()> {
        self.command(ManagerCommand::Connect(peer.into()))
    }

    /// Write `payload` once to a ready peer; failures arrive as log lines
    pub fn send(&self, peer: impl Into<PeerId>, payload: impl Into<Bytes>) -> Result<()> {
        self.command(ManagerCommand::Send(peer.into(), payload.into()))
    }

    pub fn send_command(&self, peer: impl Into<PeerId>, command: StripCommand) -> Result<()> {
        self.send(peer, command.encode())
    }

    /// Close the peer and suppress automatic reconnects until the next connect
    pub fn disconnect(&self, peer: impl Into<PeerId>) -> Result<()> {
        self.command(ManagerCommand::Disconnect(peer.into()))
    }

    pub fn is_ready(&self, peer: &str) -> bool {
        self.state(peer) == Some(PeerState::Ready)
    }

    /// Last published state of `peer`, `None` if it was never connected
    pub fn state(&self, peer: &str) -> Option<PeerState> {
        self.states.borrow().get(peer).copied()
    }

    /// All known peers, sorted by address
    pub fn peers(&self) -> Vec<(PeerId, PeerState)> {
        let mut peers: Vec<_> = self
            .states
            .borrow()
            .iter()
            .map(|(peer, state)| (peer.clone(), *state))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StripEvent> {
        self.events.subscribe()
    }

    /// Close every session, cancel all timers and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(ManagerCommand::Shutdown(ack_tx))?;
        ack_rx
            .await
            .map_err(|_| anyhow!("Connection manager stopped"))
    }

    fn command(&self, command: ManagerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Connection manager stopped"))
    }
}

struct ManagerActor {
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    peers: HashMap<PeerId, PeerSession>,
    events: broadcast::Sender<StripEvent>,
    states: watch::Sender<HashMap<PeerId, PeerState>>,
    command_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    loopback_tx: mpsc::UnboundedSender<Loopback>,
    loopback_rx: mpsc::UnboundedReceiver<Loopback>,
    link_tx: mpsc::UnboundedSender<LinkNotice>,
    link_rx: mpsc::UnboundedReceiver<LinkNotice>,
    radio_powered: bool,
    next_generation: u64,
    next_token: u64,
}

impl ManagerActor {
    fn new(
        config: LinkConfig,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<StripEvent>,
        states: watch::Sender<HashMap<PeerId, PeerState>>,
        command_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    ) -> Self {
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        Self {
            config,
            transport,
            peers: HashMap::new(),
            events,
            states,
            command_rx,
            loopback_tx,
            loopback_rx,
            link_tx,
            link_rx,
            // Assume the radio is usable until the watcher says otherwise
            radio_powered: true,
            next_generation: 0,
            next_token: 0,
        }
    }

    async fn run(mut self) {
        let (radio_tx, mut radio_rx) = mpsc::unbounded_channel();
        let _radio: Option<RadioSubscription> =
            match self.transport.watch_radio(RadioEventSender::new(radio_tx)) {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    warn!("[RADIO] Power state unavailable, recovery disabled: {}", e);
                    None
                }
            };

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(ManagerCommand::Shutdown(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(message) = self.loopback_rx.recv() => self.handle_loopback(message),
                Some(notice) = self.link_rx.recv() => self.handle_link(notice),
                Some(state) = radio_rx.recv() => self.handle_radio(state),
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }

        info!("[LINK] Connection manager stopped");
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Connect(peer) => self.connect(&peer),
            ManagerCommand::Send(peer, payload) => self.send(&peer, payload),
            ManagerCommand::Disconnect(peer) => self.disconnect(&peer),
            ManagerCommand::Shutdown(_) => {}
        }
    }

    fn handle_loopback(&mut self, message: Loopback) {
        match message {
            Loopback::ReconnectDue { peer, token } => self.reconnect_due(&peer, token),
            Loopback::ConnectDeadline { peer, generation } => {
                let stalled = self.peers.get(&peer).is_some_and(|session| {
                    session.is_current(generation) && session.state() == PeerState::Connecting
                });
                if stalled {
                    self.log(&peer, "Connect attempt timed out.");
                    self.session_lost(&peer, "connect timeout");
                }
            }
            Loopback::WriteFinished {
                peer,
                generation,
                payload,
                result,
            } => {
                let current = self
                    .peers
                    .get(&peer)
                    .is_some_and(|session| session.is_current(generation));
                if !current {
                    debug!("[GATT] {}: dropping write result of closed session", peer);
                    return;
                }
                self.log(
                    &peer,
                    format!(
                        "TX: {:?} result={}",
                        codec::describe(&payload),
                        result.is_ok()
                    ),
                );
                if let Err(e) = result {
                    self.log(&peer, e);
                }
            }
        }
    }

    fn handle_link(&mut self, notice: LinkNotice) {
        let LinkNotice {
            peer,
            generation,
            event,
        } = notice;

        let current = self
            .peers
            .get(&peer)
            .is_some_and(|session| session.is_current(generation));
        if !current {
            debug!(
                "[LINK] {}: ignoring {:?} from stale session {}",
                peer, event, generation
            );
            return;
        }

        match event {
            LinkEvent::Up => self.session_up(&peer),
            LinkEvent::Down { reason } => self.session_lost(&peer, &reason),
            LinkEvent::Discovered(Ok(writer)) => self.discovered(&peer, writer),
            LinkEvent::Discovered(Err(reason)) => {
                if let Some(TransitionResult::Degraded) =
                    self.transition(&peer, SessionEvent::DiscoveryFailed)
                {
                    warn!("[GATT] {}: discovery failed, writes stay disabled", peer);
                    self.log(&peer, reason);
                }
            }
            LinkEvent::Data(payload) => {
                let text = codec::decode_text(&payload);
                debug!("[GATT] {}: RX {:?}", peer, text);
                let _ = self.events.send(StripEvent::MessageReceived { peer, text });
            }
        }
    }

    fn handle_radio(&mut self, state: RadioState) {
        let was_powered = self.radio_powered;
        self.radio_powered = state.is_powered();

        if !state.is_powered() {
            if was_powered {
                warn!("[RADIO] Bluetooth OFF");
            }
            return;
        }
        if was_powered {
            return;
        }

        info!("[RADIO] Bluetooth ON");
        let mut peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, session)| session.lifecycle().may_reconnect())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();

        for peer in peers {
            self.log(&peer, "Bluetooth ON → reconnect");
            self.connect(&peer);
        }
    }

    fn heartbeat(&mut self) {
        let ready: Vec<PeerId> = self
            .peers
            .values()
            .filter(|session| session.is_ready())
            .map(|session| session.peer().to_string())
            .collect();

        if !ready.is_empty() {
            debug!("[HEARTBEAT] Probing {} ready peer(s)", ready.len());
        }
        for peer in ready {
            self.send(&peer, self.config.heartbeat_payload.clone());
        }
    }

    fn connect(&mut self, peer: &str) {
        if !self.peers.contains_key(peer) {
            let session = PeerSession::new(peer.to_string(), self.config.reconnect_policy());
            // Known from now on, even if the first attempt cannot start
            self.states.send_modify(|states| {
                states.insert(peer.to_string(), session.state());
            });
            self.peers.insert(peer.to_string(), session);
        }
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };

        session.process_event(SessionEvent::ConnectRequested);
        session.cancel_reconnect();
        self.start_connect(peer);
    }

    /// Open a fresh transport session, replacing any in-flight one
    fn start_connect(&mut self, peer: &str) {
        if !self.radio_powered {
            self.log(peer, "Bluetooth is off. Connect aborted.");
            self.fail_attempt(peer);
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };

        // At most one live session per peer
        session.close_link();

        let link = LinkEventSender::new(peer.to_string(), generation, self.link_tx.clone());
        match self.transport.open(peer, link) {
            Ok(handle) => {
                session.attach(generation, handle);
                if let Some(limit) = self.config.connect_timeout {
                    session.set_connect_deadline(spawn_connect_deadline(
                        peer.to_string(),
                        generation,
                        limit,
                        self.loopback_tx.clone(),
                    ));
                }
                debug!("[LINK] {}: opened session {}", peer, generation);
                self.transition(peer, SessionEvent::AttemptStarted);
            }
            Err(e) => {
                self.log(peer, format!("Connect failed: {}", e));
                self.fail_attempt(peer);
            }
        }
    }

    fn fail_attempt(&mut self, peer: &str) {
        if let Some(session) = self.peers.get_mut(peer) {
            session.close_link();
        }
        self.transition(peer, SessionEvent::AttemptFailed);
    }

    fn session_up(&mut self, peer: &str) {
        if let Some(session) = self.peers.get_mut(peer) {
            session.clear_connect_deadline();
        }
        if let Some(TransitionResult::Success(PeerState::Connected)) =
            self.transition(peer, SessionEvent::SessionUp)
        {
            self.log(peer, "Connected to GATT. Discovering services...");
            if let Some(link) = self.peers.get_mut(peer).and_then(|s| s.link_mut()) {
                link.discover();
            }
        }
    }

    fn session_lost(&mut self, peer: &str, reason: &str) {
        if let Some(session) = self.peers.get_mut(peer) {
            session.close_link();
        }
        debug!("[LINK] {}: session down ({})", peer, reason);
        self.log(peer, "Disconnected from GATT server.");

        if let Some(TransitionResult::Reconnect { attempt, delay }) =
            self.transition(peer, SessionEvent::SessionDown)
        {
            self.schedule_reconnect(peer, attempt, delay);
        }
    }

    fn discovered(&mut self, peer: &str, writer: WriteHandle) {
        let loopback = self.loopback_tx.clone();
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        if session.state() != PeerState::Connected {
            debug!("[GATT] {}: discovery finished in {}", peer, session.state());
            return;
        }

        let generation = session.generation();
        session.arm_writer(spawn_writer(peer.to_string(), generation, writer, loopback));
        self.transition(peer, SessionEvent::DiscoverySucceeded);
        self.log(peer, "UART ready.");
    }

    fn schedule_reconnect(&mut self, peer: &str, attempt: u32, delay: Duration) {
        self.next_token += 1;
        let token = self.next_token;
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };

        let loopback = self.loopback_tx.clone();
        let target = peer.to_string();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let _ = loopback.send(Loopback::ReconnectDue {
                peer: target,
                token,
            });
        });
        session.set_reconnect(token, task);

        self.log(
            peer,
            format!(
                "Schedule reconnect #{} in {}s",
                attempt,
                delay.as_secs_f32()
            ),
        );
    }

    fn reconnect_due(&mut self, peer: &str, token: u64) {
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        if !session.take_reconnect(token) {
            debug!("[LINK] {}: reconnect {} was superseded", peer, token);
            return;
        }
        // Checked again at fire time in case the cancel raced the timer
        if !session.lifecycle().may_reconnect() {
            debug!("[LINK] {}: closed by user, skipping reconnect", peer);
            return;
        }
        self.start_connect(peer);
    }

    fn send(&mut self, peer: &str, payload: Bytes) {
        let Some(session) = self.peers.get(peer) else {
            self.log(peer, LinkError::UnknownPeer(peer.to_string()).to_string());
            return;
        };
        if !session.is_ready() {
            self.log(peer, LinkError::NotReady.to_string());
            return;
        }

        let payload = match codec::encode(payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.log(peer, format!("Write failed: {}", e));
                return;
            }
        };
        if !session.queue_write(payload) {
            self.log(peer, LinkError::NotReady.to_string());
        }
    }

    fn disconnect(&mut self, peer: &str) {
        let Some(session) = self.peers.get_mut(peer) else {
            debug!("[LINK] {}: disconnect for unknown peer", peer);
            return;
        };
        session.cancel_reconnect();
        session.close_link();
        self.log(peer, "Disconnected by user.");
        self.transition(peer, SessionEvent::ManualClose);
    }

    fn shutdown(&mut self) {
        info!("[LINK] Closing {} peer(s)", self.peers.len());
        for session in self.peers.values_mut() {
            session.shutdown();
        }
        self.peers.clear();
        self.states.send_modify(|states| states.clear());
    }

    /// Apply `event` and announce the resulting state
    fn transition(&mut self, peer: &str, event: SessionEvent) -> Option<TransitionResult> {
        let session = self.peers.get_mut(peer)?;
        let result = session.process_event(event);
        let state = session.state();

        match &result {
            TransitionResult::Success(_) | TransitionResult::Reconnect { .. } => {
                self.announce(peer, state)
            }
            TransitionResult::Degraded => {}
            TransitionResult::Invalid { from, event } => {
                debug!("[LINK] {}: {:?} ignored in {}", peer, event, from);
            }
        }
        Some(result)
    }

    fn announce(&self, peer: &str, state: PeerState) {
        // Snapshot first so queries agree with the event subscribers see
        self.states.send_modify(|states| {
            states.insert(peer.to_string(), state);
        });
        info!("[LINK] {} -> {}", peer, state);
        let _ = self.events.send(StripEvent::StateChanged {
            peer: peer.to_string(),
            state,
        });
    }

    fn log(&self, peer: &str, text: impl Into<String>) {
        let text = text.into();
        info!("[LINK] {}: {}", peer, text);
        let _ = self.events.send(StripEvent::LogLine {
            peer: peer.to_string(),
            text,
        });
    }
}

/// Ordered write pipeline for one ready session
fn spawn_writer(
    peer: PeerId,
    generation: u64,
    writer: WriteHandle,
    loopback: mpsc::UnboundedSender<Loopback>,
) -> WritePipeline {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let worker = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let result = writer
                .write(payload.clone())
                .await
                .map_err(|e| e.to_string());
            let finished = Loopback::WriteFinished {
                peer: peer.clone(),
                generation,
                payload,
                result,
            };
            if loopback.send(finished).is_err() {
                break;
            }
        }
    });

    WritePipeline::new(tx, worker)
}

fn spawn_connect_deadline(
    peer: PeerId,
    generation: u64,
    limit: Duration,
    loopback: mpsc::UnboundedSender<Loopback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(limit).await;
        let _ = loopback.send(Loopback::ConnectDeadline { peer, generation });
    })
}
