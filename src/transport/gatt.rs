//! BLE GATT transport for strips exposing a UART-style characteristic
//!
//! The strip firmware (HM-10 style module) exposes a single service with one
//! characteristic used both for writes and for notifications.

use crate::transport::traits::{
    CharacteristicWriter, LinkEventSender, LinkSession, RadioEventSender, RadioState,
    RadioSubscription, Transport, WriteHandle,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty, Uuid,
};
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strip_shared::LinkError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// UART service exposed by the strip module
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Read/write/notify characteristic inside the UART service
pub const UART_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration for the GATT transport
#[derive(Debug, Clone)]
pub struct GattConfig {
    /// Adapter to use (default adapter when `None`)
    pub adapter_name: Option<String>,
    /// Service carrying the command characteristic
    pub service_uuid: Uuid,
    /// Command characteristic
    pub characteristic_uuid: Uuid,
    /// How long to wait for BlueZ to resolve services after connecting
    pub resolve_timeout: Duration,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            adapter_name: None,
            service_uuid: UART_SERVICE_UUID,
            characteristic_uuid: UART_CHARACTERISTIC_UUID,
            resolve_timeout: Duration::from_secs(10),
        }
    }
}

type PendingDisconnect = Shared<BoxFuture<'static, ()>>;

/// Orders a device's next connect after its previous disconnect
#[derive(Clone, Default)]
struct DisconnectGate {
    pending: Arc<Mutex<HashMap<Address, PendingDisconnect>>>,
}

impl DisconnectGate {
    /// Run `disconnect` in the background and remember it for `address`
    fn spawn(
        &self,
        runtime: &tokio::runtime::Handle,
        address: Address,
        disconnect: impl Future<Output = ()> + Send + 'static,
    ) {
        let done = disconnect.boxed().shared();
        runtime.spawn(done.clone());
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(address, done);
        }
    }

    /// Disconnect the next connect to `address` must wait for
    fn take(&self, address: Address) -> Option<PendingDisconnect> {
        self.pending.lock().ok()?.remove(&address)
    }
}

/// BlueZ-backed transport
pub struct GattTransport {
    _session: bluer::Session,
    adapter: Adapter,
    config: GattConfig,
    disconnects: DisconnectGate,
}

impl GattTransport {
    /// Connect to BlueZ and select the configured adapter
    pub async fn new(config: GattConfig) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = match &config.adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("[GATT] Using adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            config,
            disconnects: DisconnectGate::default(),
        })
    }
}

impl Transport for GattTransport {
    fn open(&self, peer: &str, link: LinkEventSender) -> Result<Box<dyn LinkSession>> {
        let address: Address = peer
            .parse()
            .map_err(|_| LinkError::InvalidAddress(peer.to_string()))?;
        let device = self
            .adapter
            .device(address)
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;

        debug!("[GATT] Connecting to {}", address);
        let previous = self.disconnects.take(address);
        let connect_task = tokio::spawn(drive_connection(device.clone(), link.clone(), previous));

        Ok(Box::new(GattSession {
            device,
            config: self.config.clone(),
            disconnects: self.disconnects.clone(),
            link,
            connect_task: Some(connect_task),
            discover_task: None,
            closed: false,
        }))
    }

    fn watch_radio(&self, radio: RadioEventSender) -> Result<RadioSubscription> {
        let adapter = self.adapter.clone();

        let task = tokio::spawn(async move {
            // Subscribe before sampling so no change slips in between
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("[RADIO] Adapter events unavailable: {}", e);
                    return;
                }
            };
            tokio::pin!(events);

            match adapter.is_powered().await {
                Ok(powered) => {
                    if !radio.send(RadioState::from(powered)) {
                        return;
                    }
                }
                Err(e) => warn!("[RADIO] Failed to read adapter power state: {}", e),
            }

            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    info!("[RADIO] Adapter {} powered={}", adapter.name(), powered);
                    if !radio.send(RadioState::from(powered)) {
                        break;
                    }
                }
            }
        });

        Ok(RadioSubscription::new(task))
    }

    fn name(&self) -> &'static str {
        "BLE GATT"
    }
}

/// Connect the device and report link up/down
async fn drive_connection(
    device: Device,
    link: LinkEventSender,
    previous: Option<PendingDisconnect>,
) {
    // A late disconnect of the replaced session would tear this one down
    if let Some(previous) = previous {
        previous.await;
    }

    // Watch before connecting so an immediate drop is not missed
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            link.down(format!("Device events unavailable: {}", e));
            return;
        }
    };
    tokio::pin!(events);

    if let Err(e) = device.connect().await {
        link.down(format!("GATT connect failed: {}", e));
        return;
    }

    if !link.up() {
        return;
    }

    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            link.down("Peer disconnected");
            return;
        }
        if link.is_closed() {
            return;
        }
    }

    link.down("Device event stream ended");
}

/// Locate the command characteristic, then forward its notifications
async fn discover_uart(device: Device, config: GattConfig, link: LinkEventSender) {
    let characteristic = match find_characteristic(&device, &config).await {
        Ok(characteristic) => characteristic,
        Err(e) => {
            link.discovery_failed(e.to_string());
            return;
        }
    };

    // A strip without working notifications can still take commands
    let notifications = match characteristic.notify().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(
                "[GATT] {}: enabling notifications failed: {}",
                link.peer(),
                e
            );
            None
        }
    };

    let writer: WriteHandle = Arc::new(GattWriter { characteristic });
    if !link.discovered(writer) {
        return;
    }

    let Some(notifications) = notifications else {
        return;
    };
    tokio::pin!(notifications);

    while let Some(value) = notifications.next().await {
        if !link.data(value) {
            break;
        }
    }
}

async fn find_characteristic(device: &Device, config: &GattConfig) -> Result<Characteristic> {
    let resolved = async {
        while !device.is_services_resolved().await? {
            sleep(RESOLVE_POLL_INTERVAL).await;
        }
        Ok::<(), bluer::Error>(())
    };
    timeout(config.resolve_timeout, resolved)
        .await
        .map_err(|_| anyhow!("Service discovery timed out"))??;

    for service in device.services().await? {
        if service.uuid().await? != config.service_uuid {
            continue;
        }

        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == config.characteristic_uuid {
                return Ok(characteristic);
            }
        }

        return Err(anyhow!("UART characteristic not found."));
    }

    Err(anyhow!("UART service not found."))
}

/// Open GATT session with one strip
struct GattSession {
    device: Device,
    config: GattConfig,
    disconnects: DisconnectGate,
    link: LinkEventSender,
    connect_task: Option<JoinHandle<()>>,
    discover_task: Option<JoinHandle<()>>,
    closed: bool,
}

impl GattSession {
    fn abort_tasks(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.discover_task.take() {
            task.abort();
        }
    }
}

impl LinkSession for GattSession {
    fn discover(&mut self) {
        if let Some(task) = self.discover_task.take() {
            task.abort();
        }
        self.discover_task = Some(tokio::spawn(discover_uart(
            self.device.clone(),
            self.config.clone(),
            self.link.clone(),
        )));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.abort_tasks();

        // Closing can happen while the runtime is being torn down
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let device = self.device.clone();
        self.disconnects
            .spawn(&runtime, self.device.address(), async move {
                if let Err(e) = device.disconnect().await {
                    debug!("[GATT] Disconnect of {} failed: {}", device.address(), e);
                }
            });
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Writes to the command characteristic (write with response)
struct GattWriter {
    characteristic: Characteristic,
}

#[async_trait]
impl CharacteristicWriter for GattWriter {
    async fn write(&self, payload: Bytes) -> Result<()> {
        self.characteristic
            .write(&payload)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()).into())
    }
}
