//! Hybrid AODV-style mesh routing core for small airborne sensor nodes.
//!
//! Each node is both a data source and a forwarder. Traffic normally rides a
//! short-range link-local radio; nodes that also hold an infrastructure
//! Wi-Fi association bridge sink-bound traffic onto a UDP path. Route
//! discovery is a reactive AODV subset (HELLO / RREQ / RREP / RERR) with
//! TTL-bounded flooding and bounded duplicate-suppression caches.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(not(test), not(feature = "radio-device-simulator")))]
compile_error!("A radio device implementation feature must be enabled");

#[cfg(all(not(test), not(any(feature = "std", feature = "embedded"))))]
compile_error!("Either the std or the embedded feature must be enabled");

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{log, Level};

mod address_map;
mod dedup;
mod mesh_core;
mod mesh_frame;
mod node_task;
mod payload;
mod route_table;
pub mod upstream_link;

#[cfg(feature = "radio-device-simulator")]
pub mod radio_device_simulator;

#[cfg(feature = "radio-device-simulator")]
use crate::radio_device_simulator::{radio_device_task, RadioDevice};

pub use address_map::{AddressMap, HwAddress, UnknownLocalAddress};
pub use mesh_core::{CoreAction, CoreActions, MeshCore};
pub use mesh_frame::{FrameError, FrameType, HelloView, MeshFrame, RrepView, RreqView};
pub use payload::{AckPayload, DataPayload, HopMetric, PayloadError};
pub use route_table::RouteEntry;
pub use upstream_link::UpstreamLink;

// Wire-compatibility constants; changing these changes the protocol.
pub const MESH_FRAME_SIZE: usize = 250;
pub const MESH_HEADER_SIZE: usize = 14;

// Capacity constants; these only bound local resource usage.
pub const MAX_MESH_NODES: usize = 8;
// Sized so a fully annotated payload still fits one radio frame.
pub const MAX_APP_DATA: usize = 96;
pub const MAX_PATH_ENTRIES: usize = 16;
pub const MAX_HOP_METRICS: usize = 16;

pub(crate) const REVERSE_PATH_CACHE_SIZE: usize = 30;
pub(crate) const DATA_SEEN_CACHE_SIZE: usize = 60;
pub(crate) const ACK_SEEN_CACHE_SIZE: usize = 40;
pub(crate) const DEDUP_RETENTION_MS: u64 = 30_000;

pub(crate) const ROUTE_CLEANUP_INTERVAL_MS: u64 = 1_000;
pub(crate) const UPSTREAM_PROBE_INTERVAL_MS: u64 = 3_000;
pub(crate) const UPSTREAM_RETRY_INTERVAL_MS: u64 = 10_000;

pub const DEFAULT_HELLO_INTERVAL_MS: u32 = 2_000;
pub const DEFAULT_ROUTE_TIMEOUT_MS: u32 = 10_000;
pub const DEFAULT_MAX_TTL: u8 = 10;

/// Node configuration.
///
/// The hardware address table is shared by every node in the mesh; a node's
/// identifier is its index in the table. The sink identifier must not own a
/// table slot: the collector is reachable only through the upstream link.
/// Infrastructure credentials and the sink socket address belong to the
/// connectivity collaborator feeding [`UpstreamLink`] and are not part of
/// the routing configuration.
#[derive(Clone)]
pub struct MeshConfiguration {
    pub hw_addr_table: heapless::Vec<HwAddress, MAX_MESH_NODES>,
    pub sink_id: u8,
    pub hello_interval_ms: u32,
    pub route_timeout_ms: u32,
    pub max_ttl: u8,
    /// Wall-clock milliseconds source, used only for payload timestamps.
    pub wall_clock_ms: fn() -> i64,
}

/// Events surfaced to the application.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum MeshEvent {
    /// A DATA packet addressed to this node arrived, annotated with its
    /// traversal path and per-hop metrics.
    DataDelivered(DataPayload),
    /// The upstream link came up; the application should attempt a time
    /// sync once.
    UpstreamUp,
    /// The upstream link was lost.
    UpstreamDown,
    /// The upstream link has been down for another retry interval; the
    /// application should retry association.
    UpstreamRetryDue,
}

/// A frame handed up by the radio driver together with its signal strength.
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ReceivedFrame {
    pub frame: MeshFrame,
    pub rssi: i8,
}

/// Application requests handled by the node task.
pub(crate) enum Command {
    SendData {
        destination: u8,
        data: heapless::Vec<u8, MAX_APP_DATA>,
    },
}

pub enum SendDataError {
    ChannelFull,
    PayloadTooLarge,
    NotInited,
}

pub enum ReceiveEventError {
    NotInited,
}

#[cfg_attr(feature = "std", derive(Debug))]
pub enum InitializeError {
    /// The local radio MAC is not in the hardware address table.
    UnknownLocalAddress,
    TaskSpawnFailed,
}

const COMMAND_QUEUE_SIZE: usize = 8;
type CommandQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, Command, COMMAND_QUEUE_SIZE>;
pub(crate) type CommandQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, Command, COMMAND_QUEUE_SIZE>;
type CommandQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, Command, COMMAND_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static COMMAND_QUEUE: CommandQueue = Channel::new();

const EVENT_QUEUE_SIZE: usize = 8;
type EventQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, MeshEvent, EVENT_QUEUE_SIZE>;
type EventQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, MeshEvent, EVENT_QUEUE_SIZE>;
pub(crate) type EventQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, MeshEvent, EVENT_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static EVENT_QUEUE: EventQueue = Channel::new();

const RADIO_TX_QUEUE_SIZE: usize = 16;
type RadioTxQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, MeshFrame, RADIO_TX_QUEUE_SIZE>;
pub(crate) type RadioTxQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, MeshFrame, RADIO_TX_QUEUE_SIZE>;
pub(crate) type RadioTxQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, MeshFrame, RADIO_TX_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static RADIO_TX_QUEUE: RadioTxQueue = Channel::new();

const RADIO_RX_QUEUE_SIZE: usize = 16;
type RadioRxQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, ReceivedFrame, RADIO_RX_QUEUE_SIZE>;
pub(crate) type RadioRxQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedFrame, RADIO_RX_QUEUE_SIZE>;
pub(crate) type RadioRxQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedFrame, RADIO_RX_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static RADIO_RX_QUEUE: RadioRxQueue = Channel::new();

enum MeshNetworkManagerState {
    Uninitialized,
    Initialized {
        command_queue_sender: CommandQueueSender,
        event_queue_receiver: EventQueueReceiver,
    },
}

/// Application front-end of one mesh node.
///
/// `initialize` spawns the radio device task and the node event-loop task
/// and hands back the detected node identifier. Afterwards the application
/// submits data with [`send_data`](Self::send_data) and consumes delivery
/// and link events with [`receive_event`](Self::receive_event).
pub struct MeshNetworkManager {
    state: MeshNetworkManagerState,
}

impl MeshNetworkManager {
    pub const fn new() -> Self {
        MeshNetworkManager {
            state: MeshNetworkManagerState::Uninitialized,
        }
    }

    #[cfg(feature = "embedded")]
    pub fn initialize(
        &mut self,
        config: MeshConfiguration,
        spawner: Spawner,
        radio_device: RadioDevice,
        upstream_link: UpstreamLink,
        local_mac: HwAddress,
        rng_seed: u64,
    ) -> Result<u8, InitializeError> {
        self.initialize_common(
            config,
            spawner,
            radio_device,
            upstream_link,
            local_mac,
            rng_seed,
            &COMMAND_QUEUE,
            &EVENT_QUEUE,
            &RADIO_TX_QUEUE,
            &RADIO_RX_QUEUE,
        )
    }

    #[cfg(feature = "std")]
    pub fn initialize(
        &mut self,
        config: MeshConfiguration,
        spawner: Spawner,
        radio_device: RadioDevice,
        upstream_link: UpstreamLink,
        local_mac: HwAddress,
        rng_seed: u64,
    ) -> Result<u8, InitializeError> {
        let command_queue: &'static CommandQueue = Box::leak(Box::new(Channel::new()));
        let event_queue: &'static EventQueue = Box::leak(Box::new(Channel::new()));
        let radio_tx_queue: &'static RadioTxQueue = Box::leak(Box::new(Channel::new()));
        let radio_rx_queue: &'static RadioRxQueue = Box::leak(Box::new(Channel::new()));
        self.initialize_common(
            config,
            spawner,
            radio_device,
            upstream_link,
            local_mac,
            rng_seed,
            command_queue,
            event_queue,
            radio_tx_queue,
            radio_rx_queue,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_common(
        &mut self,
        config: MeshConfiguration,
        spawner: Spawner,
        radio_device: RadioDevice,
        upstream_link: UpstreamLink,
        local_mac: HwAddress,
        rng_seed: u64,
        command_queue: &'static CommandQueue,
        event_queue: &'static EventQueue,
        radio_tx_queue: &'static RadioTxQueue,
        radio_rx_queue: &'static RadioRxQueue,
    ) -> Result<u8, InitializeError> {
        // Identify ourselves before committing any task resources.
        let own_id = AddressMap::new(config.hw_addr_table.clone())
            .own_id(local_mac)
            .map_err(|_| InitializeError::UnknownLocalAddress)?;

        spawner
            .spawn(radio_device_task(radio_device, radio_tx_queue.receiver(), radio_rx_queue.sender()))
            .map_err(|_| InitializeError::TaskSpawnFailed)?;
        log!(Level::Debug, "[{}] Radio device task spawned", own_id);

        spawner
            .spawn(node_task::node_task(
                config,
                local_mac,
                rng_seed,
                command_queue.receiver(),
                event_queue.sender(),
                radio_tx_queue.sender(),
                radio_rx_queue.receiver(),
                upstream_link,
            ))
            .map_err(|_| InitializeError::TaskSpawnFailed)?;
        log!(Level::Info, "[{}] Mesh node initialized", own_id);

        self.state = MeshNetworkManagerState::Initialized {
            command_queue_sender: command_queue.sender(),
            event_queue_receiver: event_queue.receiver(),
        };
        Ok(own_id)
    }

    /// Queues an application payload for transmission to `destination`.
    pub fn send_data(&self, destination: u8, data: &[u8]) -> Result<(), SendDataError> {
        let command_queue_sender = match &self.state {
            MeshNetworkManagerState::Uninitialized => {
                return Err(SendDataError::NotInited);
            }
            MeshNetworkManagerState::Initialized {
                command_queue_sender, ..
            } => command_queue_sender,
        };
        let data = heapless::Vec::from_slice(data).map_err(|_| SendDataError::PayloadTooLarge)?;
        command_queue_sender
            .try_send(Command::SendData { destination, data })
            .map_err(|_| SendDataError::ChannelFull)
    }

    /// Waits for the next delivery or link event.
    pub async fn receive_event(&self) -> Result<MeshEvent, ReceiveEventError> {
        let event_queue_receiver = match &self.state {
            MeshNetworkManagerState::Uninitialized => {
                return Err(ReceiveEventError::NotInited);
            }
            MeshNetworkManagerState::Initialized {
                event_queue_receiver, ..
            } => event_queue_receiver,
        };
        Ok(event_queue_receiver.receive().await)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn config() -> MeshConfiguration {
        let mut table = heapless::Vec::new();
        table.push(HwAddress([0xAA, 0, 0, 0, 0, 1])).unwrap();
        table.push(HwAddress([0xBB, 0, 0, 0, 0, 2])).unwrap();
        MeshConfiguration {
            hw_addr_table: table,
            sink_id: 4,
            hello_interval_ms: DEFAULT_HELLO_INTERVAL_MS,
            route_timeout_ms: DEFAULT_ROUTE_TIMEOUT_MS,
            max_ttl: DEFAULT_MAX_TTL,
            wall_clock_ms: || 0,
        }
    }

    #[test]
    fn mesh_configuration_constructs() {
        let cfg = config();
        assert_eq!(cfg.hw_addr_table.len(), 2);
        assert_eq!(cfg.max_ttl, 10);
    }

    #[test]
    fn manager_send_data_not_inited() {
        let mgr = MeshNetworkManager::new();
        match mgr.send_data(1, b"hi") {
            Err(SendDataError::NotInited) => {}
            _ => panic!("expected NotInited"),
        }
    }

    #[test]
    fn manager_receive_event_not_inited() {
        let mgr = MeshNetworkManager::new();
        let res = block_on(async { mgr.receive_event().await });
        match res {
            Err(ReceiveEventError::NotInited) => {}
            _ => panic!("expected NotInited"),
        }
    }

    #[test]
    fn reexports_are_usable() {
        // Basic sanity that re-exported codec types work from the crate root.
        let frame = MeshFrame::new_hello(HwAddress([0xAA, 0, 0, 0, 0, 1]), 0, 1, DEFAULT_MAX_TTL);
        assert_eq!(frame.frame_type(), FrameType::Hello as u8);
        assert_eq!(frame.hello().unwrap().seq, 1);
    }
}
