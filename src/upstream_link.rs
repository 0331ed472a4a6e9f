//! Upstream (infrastructure) link endpoint.
//!
//! The mesh core only ever sees the upstream UDP path through this pair of
//! queues plus a shared availability flag. The Wi-Fi/UDP collaborator owns
//! the other ends: it drains the TX queue into a socket aimed at the sink,
//! feeds received datagrams into the RX queue, and flips the flag on
//! association changes. Frames cross this boundary with the same 14-byte
//! header they carry on the radio.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::mesh_frame::MeshFrame;

/// Size of the queue toward the sink.
const UPSTREAM_TX_QUEUE_SIZE: usize = 8;
/// Size of the queue from the sink.
const UPSTREAM_RX_QUEUE_SIZE: usize = 8;

pub type UpstreamTxQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, MeshFrame, UPSTREAM_TX_QUEUE_SIZE>;
pub type UpstreamTxQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, MeshFrame, UPSTREAM_TX_QUEUE_SIZE>;
pub type UpstreamTxQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, MeshFrame, UPSTREAM_TX_QUEUE_SIZE>;

pub type UpstreamRxQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, MeshFrame, UPSTREAM_RX_QUEUE_SIZE>;
pub type UpstreamRxQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, MeshFrame, UPSTREAM_RX_QUEUE_SIZE>;
pub type UpstreamRxQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, MeshFrame, UPSTREAM_RX_QUEUE_SIZE>;

/// Node-side handle of the upstream link.
pub struct UpstreamLink {
    tx_sender: UpstreamTxQueueSender,
    rx_receiver: UpstreamRxQueueReceiver,
    status: &'static AtomicBool,
}

impl UpstreamLink {
    /// Bundles the queue endpoints and the shared link-status flag.
    pub const fn with(
        tx_sender: UpstreamTxQueueSender,
        rx_receiver: UpstreamRxQueueReceiver,
        status: &'static AtomicBool,
    ) -> Self {
        UpstreamLink {
            tx_sender,
            rx_receiver,
            status,
        }
    }

    /// Current association state as reported by the connectivity
    /// collaborator.
    pub fn is_up(&self) -> bool {
        self.status.load(Ordering::Relaxed)
    }

    /// Attempts to queue a frame toward the sink. Returns the frame when the
    /// link is down or the queue is full so the caller can fall back to the
    /// radio.
    pub fn try_send(&self, frame: MeshFrame) -> Result<(), MeshFrame> {
        if !self.is_up() {
            return Err(frame);
        }
        self.tx_sender.try_send(frame).map_err(|e| match e {
            embassy_sync::channel::TrySendError::Full(frame) => frame,
        })
    }

    /// Next frame received from the sink side.
    pub async fn receive(&self) -> MeshFrame {
        self.rx_receiver.receive().await
    }
}
