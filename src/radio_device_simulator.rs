//! # Radio Device Simulator - Testing and Development Mock
//!
//! Simulated radio device for exercising the mesh without hardware. The
//! device exchanges frames with an external network harness through a pair
//! of queues; the harness owns topology, delivery, and signal-strength
//! assignment.
//!
//! ## Architecture
//!
//! - **Output Queue**: frames this node transmits, handed to the harness
//! - **Input Queue**: frames the harness delivers to this node
//! - **Peer Registry**: unicast transmission requires the destination to be
//!   registered first, mirroring connectionless link-local radios that keep
//!   a bounded peer table. Registration is implicit on first use; a full
//!   table fails the send, which callers treat as transient.
//!
//! The harness decides who hears a broadcast and whether a unicast target is
//! in range, so multi-node topologies (chains, triangles, partitions) are
//! plain test fixtures.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{log, Level};

use crate::address_map::HwAddress;
use crate::mesh_frame::MeshFrame;
use crate::{RadioRxQueueSender, RadioTxQueueReceiver, ReceivedFrame};

/// Maximum unicast peers the radio keeps registered at once.
const MAX_RADIO_PEERS: usize = 20;

/// Size of the queue from this device to the network harness.
const RADIO_OUTPUT_QUEUE_SIZE: usize = 16;

/// Size of the queue from the network harness to this device.
const RADIO_INPUT_QUEUE_SIZE: usize = 16;

pub type RadioOutputQueue =
    embassy_sync::channel::Channel<CriticalSectionRawMutex, MeshFrame, RADIO_OUTPUT_QUEUE_SIZE>;
pub type RadioOutputQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, MeshFrame, RADIO_OUTPUT_QUEUE_SIZE>;
pub type RadioOutputQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, MeshFrame, RADIO_OUTPUT_QUEUE_SIZE>;

pub type RadioInputQueue =
    embassy_sync::channel::Channel<CriticalSectionRawMutex, ReceivedFrame, RADIO_INPUT_QUEUE_SIZE>;
pub type RadioInputQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedFrame, RADIO_INPUT_QUEUE_SIZE>;
pub type RadioInputQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedFrame, RADIO_INPUT_QUEUE_SIZE>;

/// Simulated radio device.
///
/// Holds the node-side endpoints of the harness queues; constructed by the
/// harness, consumed by `initialize`.
pub struct RadioDevice {
    output_queue_sender: RadioOutputQueueSender,
    input_queue_receiver: RadioInputQueueReceiver,
}

impl RadioDevice {
    pub const fn with(output_queue_sender: RadioOutputQueueSender, input_queue_receiver: RadioInputQueueReceiver) -> Self {
        RadioDevice {
            output_queue_sender,
            input_queue_receiver,
        }
    }
}

/// Simulated radio device task.
///
/// Forwards harness-delivered frames to the RX queue and transmits frames
/// from the TX queue, enforcing the bounded unicast peer registry.
#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 16))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub async fn radio_device_task(
    radio_device: RadioDevice,
    tx_receiver: RadioTxQueueReceiver,
    rx_sender: RadioRxQueueSender,
) -> ! {
    let mut peers: heapless::Vec<HwAddress, MAX_RADIO_PEERS> = heapless::Vec::new();
    log!(Level::Info, "Simulated radio device task started");
    loop {
        match embassy_futures::select::select(radio_device.input_queue_receiver.receive(), tx_receiver.receive()).await
        {
            embassy_futures::select::Either::First(received) => {
                rx_sender.send(received).await;
            }
            embassy_futures::select::Either::Second(frame) => {
                let dst = frame.dst_mac();
                if !dst.is_broadcast() && !peers.contains(&dst) {
                    if peers.push(dst).is_err() {
                        log!(Level::Warn, "Peer table full, cannot register {:?}; frame dropped", dst);
                        continue;
                    }
                    log!(Level::Trace, "Registered radio peer {:?}", dst);
                }
                radio_device.output_queue_sender.send(frame).await;
            }
        }
    }
}
