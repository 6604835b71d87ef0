//! Scripted in-memory transport for manager tests
//!
//! Sessions never progress on their own: tests drive them through the
//! recorded [`LinkEventSender`] of each peer.

use crate::transport::traits::{
    CharacteristicWriter, LinkEventSender, LinkSession, RadioEventSender, RadioState,
    RadioSubscription, Transport, WriteHandle,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use strip_shared::{LinkError, PeerId};

#[derive(Default)]
struct MockState {
    links: HashMap<PeerId, LinkEventSender>,
    opens: HashMap<PeerId, usize>,
    discovers: HashMap<PeerId, usize>,
    closes: HashMap<PeerId, usize>,
    writes: Vec<(PeerId, Bytes)>,
    failing_writes: HashSet<PeerId>,
    radio: Option<RadioEventSender>,
    radio_off: bool,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().expect("mock state poisoned");
        f(&mut state)
    }

    /// Event reporter of the most recently opened session for `peer`
    pub fn link(&self, peer: &str) -> LinkEventSender {
        self.with(|s| s.links.get(peer).cloned())
            .unwrap_or_else(|| panic!("no session opened for {}", peer))
    }

    /// Write capability bound to `peer`
    pub fn writer(&self, peer: &str) -> WriteHandle {
        Arc::new(MockWriter {
            peer: peer.to_string(),
            state: self.state.clone(),
        })
    }

    pub fn open_count(&self, peer: &str) -> usize {
        self.with(|s| s.opens.get(peer).copied().unwrap_or(0))
    }

    pub fn discover_count(&self, peer: &str) -> usize {
        self.with(|s| s.discovers.get(peer).copied().unwrap_or(0))
    }

    pub fn close_count(&self, peer: &str) -> usize {
        self.with(|s| s.closes.get(peer).copied().unwrap_or(0))
    }

    pub fn writes_to(&self, peer: &str) -> Vec<Bytes> {
        self.with(|s| {
            s.writes
                .iter()
                .filter(|(p, _)| p == peer)
                .map(|(_, payload)| payload.clone())
                .collect()
        })
    }

    pub fn fail_writes(&self, peer: &str) {
        self.with(|s| s.failing_writes.insert(peer.to_string()));
    }

    /// Flip the radio; opens fail while it is off
    pub fn set_radio(&self, powered: bool) {
        let radio = self.with(|s| {
            s.radio_off = !powered;
            s.radio.clone()
        });
        if let Some(radio) = radio {
            radio.send(RadioState::from(powered));
        }
    }
}

impl Transport for MockTransport {
    fn open(&self, peer: &str, link: LinkEventSender) -> Result<Box<dyn LinkSession>> {
        self.with(|s| -> Result<()> {
            if s.radio_off {
                return Err(LinkError::RadioOff.into());
            }
            *s.opens.entry(peer.to_string()).or_default() += 1;
            s.links.insert(peer.to_string(), link);
            Ok(())
        })?;

        Ok(Box::new(MockSession {
            peer: peer.to_string(),
            state: self.state.clone(),
        }))
    }

    fn watch_radio(&self, radio: RadioEventSender) -> Result<RadioSubscription> {
        let powered = self.with(|s| {
            s.radio = Some(radio.clone());
            !s.radio_off
        });
        radio.send(RadioState::from(powered));
        Ok(RadioSubscription::detached())
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}

struct MockSession {
    peer: PeerId,
    state: Arc<Mutex<MockState>>,
}

impl LinkSession for MockSession {
    fn discover(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            *state.discovers.entry(self.peer.clone()).or_default() += 1;
        }
    }

    fn close(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            *state.closes.entry(self.peer.clone()).or_default() += 1;
        }
    }
}

struct MockWriter {
    peer: PeerId,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl CharacteristicWriter for MockWriter {
    async fn write(&self, payload: Bytes) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("mock state poisoned"))?;
        state.writes.push((self.peer.clone(), payload));
        if state.failing_writes.contains(&self.peer) {
            return Err(LinkError::WriteFailed("GATT write rejected".into()).into());
        }
        Ok(())
    }
}
