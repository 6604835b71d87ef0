//! Per-peer session bookkeeping owned by the manager actor

use crate::transport::LinkSession;
use bytes::Bytes;
use strip_shared::{
    PeerId, PeerLifecycle, PeerState, ReconnectPolicy, SessionEvent, TransitionResult,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A scheduled automatic reconnect
struct PendingReconnect {
    token: u64,
    task: JoinHandle<()>,
}

/// Ordered write worker bound to one session
pub struct WritePipeline {
    tx: mpsc::UnboundedSender<Bytes>,
    worker: JoinHandle<()>,
}

impl WritePipeline {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>, worker: JoinHandle<()>) -> Self {
        Self { tx, worker }
    }
}

impl Drop for WritePipeline {
    fn drop(&mut self) {
        // Queued payloads must not reach a closed session
        self.worker.abort();
    }
}

/// Everything the manager tracks for one peer
pub struct PeerSession {
    peer: PeerId,
    lifecycle: PeerLifecycle,
    /// Generation of the currently attached transport session
    generation: u64,
    link: Option<Box<dyn LinkSession>>,
    /// Ordered write pipeline, present only while Ready
    writer: Option<WritePipeline>,
    reconnect: Option<PendingReconnect>,
    connect_deadline: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub fn new(peer: PeerId, policy: ReconnectPolicy) -> Self {
        Self {
            peer,
            lifecycle: PeerLifecycle::new(policy),
            generation: 0,
            link: None,
            writer: None,
            reconnect: None,
            connect_deadline: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> PeerState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &PeerLifecycle {
        &self.lifecycle
    }

    pub fn process_event(&mut self, event: SessionEvent) -> TransitionResult {
        self.lifecycle.process_event(event)
    }

    /// Session open and write pipeline armed
    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready() && self.link.is_some() && self.writer.is_some()
    }

    /// True if `generation` identifies the live session
    pub fn is_current(&self, generation: u64) -> bool {
        self.link.is_some() && self.generation == generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn link_mut(&mut self) -> Option<&mut Box<dyn LinkSession>> {
        self.link.as_mut()
    }

    /// Install a freshly opened session, replacing any previous one
    pub fn attach(&mut self, generation: u64, link: Box<dyn LinkSession>) {
        self.close_link();
        self.generation = generation;
        self.link = Some(link);
    }

    /// Close the live session (if any) and drop everything bound to it
    pub fn close_link(&mut self) -> bool {
        self.writer = None;
        self.clear_connect_deadline();

        match self.link.take() {
            Some(mut link) => {
                link.close();
                true
            }
            None => false,
        }
    }

    pub fn arm_writer(&mut self, writer: WritePipeline) {
        self.writer = Some(writer);
    }

    /// Hand a payload to the write pipeline; false if it is gone
    pub fn queue_write(&self, payload: Bytes) -> bool {
        match &self.writer {
            Some(writer) => writer.tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn set_reconnect(&mut self, token: u64, task: JoinHandle<()>) {
        self.cancel_reconnect();
        self.reconnect = Some(PendingReconnect { token, task });
    }

    /// Consume the pending reconnect if `token` is the one scheduled
    pub fn take_reconnect(&mut self, token: u64) -> bool {
        match &self.reconnect {
            Some(pending) if pending.token == token => {
                self.reconnect = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            pending.task.abort();
        }
    }

    #[cfg(test)]
    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect.is_some()
    }

    pub fn set_connect_deadline(&mut self, task: JoinHandle<()>) {
        self.clear_connect_deadline();
        self.connect_deadline = Some(task);
    }

    pub fn clear_connect_deadline(&mut self) {
        if let Some(task) = self.connect_deadline.take() {
            task.abort();
        }
    }

    /// Cancel timers and close the session for good
    pub fn shutdown(&mut self) {
        self.cancel_reconnect();
        self.close_link();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
