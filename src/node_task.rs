//! Event loop task.
//!
//! One task per node owns the [`MeshCore`] exclusively and multiplexes its
//! four inputs: frames from the radio, frames from the upstream link,
//! application send commands, and the periodic-duty deadline. All routing
//! state mutations happen here, in arrival order, so the protocol needs no
//! locking anywhere.

use embassy_futures::select::{select4, Either4};
use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

use crate::address_map::HwAddress;
use crate::mesh_core::{CoreAction, CoreActions, MeshCore};
use crate::upstream_link::UpstreamLink;
use crate::{
    Command, CommandQueueReceiver, EventQueueSender, MeshConfiguration, RadioRxQueueReceiver, RadioTxQueueSender,
};

#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 16))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn node_task(
    config: MeshConfiguration,
    local_mac: HwAddress,
    rng_seed: u64,
    command_queue_receiver: CommandQueueReceiver,
    event_queue_sender: EventQueueSender,
    radio_tx_queue_sender: RadioTxQueueSender,
    radio_rx_queue_receiver: RadioRxQueueReceiver,
    upstream_link: UpstreamLink,
) -> ! {
    let wall_clock_ms = config.wall_clock_ms;
    let mut core = match MeshCore::new(&config, local_mac, Instant::now(), rng_seed) {
        Ok(core) => core,
        Err(_) => {
            // The manager verifies the address before spawning; reaching this
            // arm means the node cannot identify itself and must stay silent.
            log!(Level::Error, "Local address {:?} not in the mesh table, node halted", local_mac);
            loop {
                Timer::after(Duration::from_secs(3600)).await;
            }
        }
    };
    let own_id = core.own_node_id();
    log!(Level::Info, "[{}] Mesh node task started", own_id);

    loop {
        let mut actions = CoreActions::new();
        let input = select4(
            radio_rx_queue_receiver.receive(),
            upstream_link.receive(),
            command_queue_receiver.receive(),
            Timer::at(core.next_deadline()),
        )
        .await;

        let now = Instant::now();
        let wall_ms = wall_clock_ms();
        match input {
            Either4::First(received) => {
                core.handle_frame(&received.frame, received.rssi, now, wall_ms, &mut actions);
            }
            Either4::Second(frame) => {
                // Wired ingress carries no signal strength.
                core.handle_frame(&frame, 0, now, wall_ms, &mut actions);
            }
            Either4::Third(Command::SendData { destination, data }) => {
                if core.originate_data(destination, &data, now, wall_ms, &mut actions).is_err() {
                    log!(Level::Warn, "[{}] Dropping oversized application payload", own_id);
                }
            }
            Either4::Fourth(_) => {
                core.process_timed_tasks(now, upstream_link.is_up(), &mut actions);
            }
        }

        for action in actions {
            match action {
                CoreAction::SendRadio(frame) => {
                    if radio_tx_queue_sender.try_send(frame).is_err() {
                        log!(Level::Warn, "[{}] Radio TX queue full, frame dropped", own_id);
                    }
                }
                CoreAction::SendUpstream(frame) => {
                    if let Err(frame) = upstream_link.try_send(frame) {
                        // The link dropped between the probe and the send;
                        // sink-bound traffic falls back to the mesh.
                        log!(Level::Warn, "[{}] Upstream send failed, falling back to radio", own_id);
                        if radio_tx_queue_sender.try_send(frame).is_err() {
                            log!(Level::Warn, "[{}] Radio TX queue full, frame dropped", own_id);
                        }
                    }
                }
                CoreAction::Emit(event) => {
                    if event_queue_sender.try_send(event).is_err() {
                        log!(Level::Warn, "[{}] Event queue full, event dropped", own_id);
                    }
                }
            }
        }
    }
}
