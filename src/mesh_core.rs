//! # Mesh Core Module
//!
//! Routing and forwarding decision logic: HELLO/RREQ/RREP/RERR processing,
//! DATA and ACK relaying, and the choice between the radio mesh and the
//! upstream UDP link.
//!
//! The core is a plain state machine. It owns the route table, the three
//! duplicate-suppression caches, the sequence counters, and the upstream
//! availability flag; it never touches a transport itself. Every entry point
//! appends [`CoreAction`]s describing the outbound work, and the event loop
//! executes them. This keeps the whole protocol single-threaded and directly
//! testable: tests instantiate one core per simulated node and shuttle frames
//! between them.

use embassy_time::{Duration, Instant};
use log::{log, Level};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::address_map::{AddressMap, HwAddress, UnknownLocalAddress};
use crate::dedup::TimedCache;
use crate::mesh_frame::{FrameType, MeshFrame, RreqView};
use crate::payload::{AckPayload, DataPayload, HopMetric, PayloadError};
use crate::route_table::{RouteEntry, RouteTable};
use crate::{
    MeshConfiguration, MeshEvent, ACK_SEEN_CACHE_SIZE, DATA_SEEN_CACHE_SIZE, DEDUP_RETENTION_MS,
    REVERSE_PATH_CACHE_SIZE, ROUTE_CLEANUP_INTERVAL_MS, UPSTREAM_PROBE_INTERVAL_MS, UPSTREAM_RETRY_INTERVAL_MS,
};

/// Outbound work produced by the core for one input event.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum CoreAction {
    /// Transmit over the radio; broadcast or unicast per the frame header.
    SendRadio(MeshFrame),
    /// Hand the frame to the upstream UDP link toward the sink.
    SendUpstream(MeshFrame),
    /// Surface an event to the application.
    Emit(MeshEvent),
}

/// Action buffer filled by one core entry point.
pub type CoreActions = heapless::Vec<CoreAction, 8>;

fn push_action(actions: &mut CoreActions, action: CoreAction, own_id: u8) {
    if actions.push(action).is_err() {
        log!(Level::Error, "[{}] Action buffer full, dropping outbound work", own_id);
    }
}

/// Per-node routing core.
pub struct MeshCore {
    address_map: AddressMap,
    own_id: u8,
    own_mac: HwAddress,
    sink_id: u8,
    max_ttl: u8,
    hello_interval: Duration,

    route_table: RouteTable,
    reverse_path: TimedCache<(u8, u32), u8, REVERSE_PATH_CACHE_SIZE>,
    data_seen: TimedCache<(u8, u32), (), DATA_SEEN_CACHE_SIZE>,
    ack_seen: TimedCache<(u32, u8), (), ACK_SEEN_CACHE_SIZE>,

    /// Shared counter for HELLO sequence numbers and RREQ identifiers.
    local_seq: u32,
    packet_counter: u32,
    upstream_up: bool,

    next_hello_at: Instant,
    next_cleanup_at: Instant,
    next_probe_at: Instant,
    next_retry_at: Instant,
}

impl MeshCore {
    /// Builds a core, detecting the own node id from the local radio MAC.
    ///
    /// Fails when the MAC is not in the address table; the caller must treat
    /// that as fatal.
    pub fn new(
        config: &MeshConfiguration,
        local_mac: HwAddress,
        now: Instant,
        rng_seed: u64,
    ) -> Result<MeshCore, UnknownLocalAddress> {
        let address_map = AddressMap::new(config.hw_addr_table.clone());
        let own_id = address_map.own_id(local_mac)?;
        let hello_interval = Duration::from_millis(config.hello_interval_ms as u64);

        // Desynchronize HELLO phases across nodes booting together.
        let mut rng = WyRand::seed_from_u64(rng_seed);
        let hello_offset = Duration::from_millis(rng.next_u64() % config.hello_interval_ms.max(1) as u64);

        Ok(MeshCore {
            address_map,
            own_id,
            own_mac: local_mac,
            sink_id: config.sink_id,
            max_ttl: config.max_ttl,
            hello_interval,
            route_table: RouteTable::new(Duration::from_millis(config.route_timeout_ms as u64), now),
            reverse_path: TimedCache::new(Duration::from_millis(DEDUP_RETENTION_MS)),
            data_seen: TimedCache::new(Duration::from_millis(DEDUP_RETENTION_MS)),
            ack_seen: TimedCache::new(Duration::from_millis(DEDUP_RETENTION_MS)),
            local_seq: 0,
            packet_counter: 0,
            upstream_up: false,
            next_hello_at: now + hello_offset,
            next_cleanup_at: now + Duration::from_millis(ROUTE_CLEANUP_INTERVAL_MS),
            next_probe_at: now + Duration::from_millis(UPSTREAM_PROBE_INTERVAL_MS),
            next_retry_at: now + Duration::from_millis(UPSTREAM_RETRY_INTERVAL_MS),
        })
    }

    pub fn own_node_id(&self) -> u8 {
        self.own_id
    }

    pub fn upstream_available(&self) -> bool {
        self.upstream_up
    }

    /// Whether a usable route to `dest` exists right now.
    pub fn has_route(&self, dest: u8, now: Instant) -> bool {
        self.route_table.has(dest, now)
    }

    /// Current valid route to `dest`, if one exists.
    pub fn route_to(&self, dest: u8, now: Instant) -> Option<RouteEntry> {
        self.route_table.lookup(dest, now)
    }

    /// Ingress entry point for a frame from either transport.
    ///
    /// Frames not addressed to this node (and not broadcast) and frames from
    /// hardware addresses outside the mesh are dropped here.
    pub fn handle_frame(
        &mut self,
        frame: &MeshFrame,
        rssi: i8,
        now: Instant,
        wall_ms: i64,
        actions: &mut CoreActions,
    ) {
        let dst = frame.dst_mac();
        if !dst.is_broadcast() && dst != self.own_mac {
            return;
        }
        let Some(prev) = self.address_map.node_id_of(frame.src_mac()) else {
            log!(Level::Trace, "[{}] Dropping frame from unknown address {:?}", self.own_id, frame.src_mac());
            return;
        };
        let Ok(frame_type) = FrameType::try_from(frame.frame_type()) else {
            log!(Level::Trace, "[{}] Dropping frame with unknown type {}", self.own_id, frame.frame_type());
            return;
        };

        match frame_type {
            FrameType::Hello => self.process_hello(frame, now),
            FrameType::Rreq => self.process_rreq(frame, prev, now, actions),
            FrameType::Rrep => self.process_rrep(frame, prev, now, actions),
            FrameType::Rerr => self.process_rerr(frame),
            FrameType::Data => self.process_data(frame, prev, rssi, now, wall_ms, actions),
            FrameType::Ack => self.process_ack(frame, now, actions),
        }
    }

    fn process_hello(&mut self, frame: &MeshFrame, now: Instant) {
        let Some(hello) = frame.hello() else {
            log!(Level::Trace, "[{}] Malformed HELLO dropped", self.own_id);
            return;
        };
        if hello.node_id == self.own_id {
            return;
        }
        // A heard beacon is a one-hop route; the replacement rule decides.
        self.route_table.update(hello.node_id, hello.node_id, 1, hello.seq, now);
    }

    fn process_rreq(&mut self, frame: &MeshFrame, prev: u8, now: Instant, actions: &mut CoreActions) {
        let Some(rreq) = frame.rreq() else {
            log!(Level::Trace, "[{}] Malformed RREQ dropped", self.own_id);
            return;
        };
        if self.reverse_path.contains((rreq.source, rreq.rreq_id), now) {
            log!(
                Level::Trace,
                "[{}] Duplicate RREQ ({}, {}) suppressed",
                self.own_id,
                rreq.source,
                rreq.rreq_id
            );
            return;
        }
        self.reverse_path.insert((rreq.source, rreq.rreq_id), prev, now);
        self.route_table.update(rreq.source, prev, 1, rreq.rreq_id, now);

        if rreq.dest == self.own_id {
            self.send_rrep(&rreq, rreq.rreq_id, 0, prev, actions);
        } else if let Some(route) = self.route_table.lookup(rreq.dest, now) {
            self.send_rrep(&rreq, route.seq, route.hop_count, prev, actions);
        } else if frame.ttl() > 0 {
            let relayed = frame.forwarded(self.own_mac, HwAddress::BROADCAST, frame.ttl() - 1);
            push_action(actions, CoreAction::SendRadio(relayed), self.own_id);
        } else {
            log!(Level::Trace, "[{}] RREQ hop budget exhausted", self.own_id);
        }
    }

    fn send_rrep(&mut self, rreq: &RreqView, dest_seq: u32, hop_count: u8, prev: u8, actions: &mut CoreActions) {
        let Some(prev_mac) = self.address_map.hw_addr_of(prev) else {
            return;
        };
        log!(
            Level::Debug,
            "[{}] Replying RREP for requester {} dest {} via {}",
            self.own_id,
            rreq.source,
            rreq.dest,
            prev
        );
        let rrep = MeshFrame::new_rrep(
            self.own_mac,
            prev_mac,
            rreq.source,
            rreq.dest,
            rreq.rreq_id,
            dest_seq,
            hop_count,
            self.max_ttl,
        );
        push_action(actions, CoreAction::SendRadio(rrep), self.own_id);
    }

    fn process_rrep(&mut self, frame: &MeshFrame, prev: u8, now: Instant, actions: &mut CoreActions) {
        let Some(rrep) = frame.rrep() else {
            log!(Level::Trace, "[{}] Malformed RREP dropped", self.own_id);
            return;
        };
        self.route_table
            .update(rrep.dest, prev, rrep.hop_count.saturating_add(1), rrep.dest_seq, now);

        if rrep.requester == self.own_id {
            log!(Level::Debug, "[{}] Route to {} installed via {}", self.own_id, rrep.dest, prev);
            return;
        }
        let Some(reverse_hop) = self.reverse_path.get((rrep.requester, rrep.rreq_id), now) else {
            log!(Level::Trace, "[{}] No reverse path for RREP ({}, {})", self.own_id, rrep.requester, rrep.rreq_id);
            return;
        };
        if frame.ttl() == 0 {
            log!(Level::Trace, "[{}] RREP hop budget exhausted", self.own_id);
            return;
        }
        let Some(reverse_mac) = self.address_map.hw_addr_of(reverse_hop) else {
            return;
        };
        let relayed = frame.forwarded(self.own_mac, reverse_mac, frame.ttl() - 1);
        push_action(actions, CoreAction::SendRadio(relayed), self.own_id);
    }

    fn process_rerr(&mut self, frame: &MeshFrame) {
        let Some(unreachable) = frame.rerr() else {
            log!(Level::Trace, "[{}] Malformed RERR dropped", self.own_id);
            return;
        };
        log!(Level::Debug, "[{}] RERR: invalidating route to {}", self.own_id, unreachable);
        // One-hop notice only; never rebroadcast.
        self.route_table.invalidate(unreachable);
    }

    fn process_data(
        &mut self,
        frame: &MeshFrame,
        prev: u8,
        rssi: i8,
        now: Instant,
        wall_ms: i64,
        actions: &mut CoreActions,
    ) {
        let Ok(mut payload) = DataPayload::parse(frame.payload()) else {
            log!(Level::Trace, "[{}] Malformed DATA dropped", self.own_id);
            return;
        };
        if self.data_seen.contains((payload.source_id, payload.packet_id), now) {
            log!(
                Level::Trace,
                "[{}] Duplicate DATA ({}, {}) suppressed",
                self.own_id,
                payload.source_id,
                payload.packet_id
            );
            return;
        }
        self.data_seen.insert((payload.source_id, payload.packet_id), (), now);

        let elapsed = (wall_ms as u32).checked_sub(payload.timestamp_ms).unwrap_or(0);
        let metric = HopMetric {
            from: prev,
            to: self.own_id,
            rssi,
            delay_ms: elapsed.min(u16::MAX as u32) as u16,
        };
        if !payload.record_hop(metric) {
            log!(Level::Warn, "[{}] Hop annotation lists full for packet {}", self.own_id, payload.packet_id);
        }

        if payload.destination_id == self.own_id {
            // Zero is the no-acknowledgement sentinel.
            if payload.packet_id != 0 {
                let ack = AckPayload {
                    packet_id: payload.packet_id,
                    ack_from: self.own_id,
                    destination: self.sink_id,
                    orig_source: payload.source_id,
                    orig_destination: payload.destination_id,
                    sent_ts_ms: payload.timestamp_ms,
                    ack_ts_ms: wall_ms as u32,
                };
                self.ack_seen.insert((ack.packet_id, ack.ack_from), (), now);
                let ack_frame = MeshFrame::new_ack(self.own_mac, HwAddress::BROADCAST, self.max_ttl, &ack);
                if self.upstream_up {
                    push_action(actions, CoreAction::SendUpstream(ack_frame), self.own_id);
                } else {
                    push_action(actions, CoreAction::SendRadio(ack_frame), self.own_id);
                }
            }
            push_action(actions, CoreAction::Emit(MeshEvent::DataDelivered(payload)), self.own_id);
            return;
        }

        if payload.destination_id == self.sink_id {
            if self.upstream_up {
                // Gateway bridge: the hop budget is untouched on the wired leg.
                if let Ok(relayed) = MeshFrame::new_data(self.own_mac, HwAddress::BROADCAST, frame.ttl(), &payload) {
                    push_action(actions, CoreAction::SendUpstream(relayed), self.own_id);
                }
            } else if frame.ttl() > 0 {
                if let Ok(relayed) =
                    MeshFrame::new_data(self.own_mac, HwAddress::BROADCAST, frame.ttl() - 1, &payload)
                {
                    push_action(actions, CoreAction::SendRadio(relayed), self.own_id);
                }
            } else {
                log!(Level::Trace, "[{}] Sink-bound DATA hop budget exhausted", self.own_id);
            }
            return;
        }

        match self.route_table.lookup(payload.destination_id, now) {
            None => {
                log!(
                    Level::Debug,
                    "[{}] No route to {}; requesting and dropping packet {}",
                    self.own_id,
                    payload.destination_id,
                    payload.packet_id
                );
                self.originate_rreq(payload.destination_id, now, actions);
            }
            Some(route) => {
                if frame.ttl() == 0 {
                    log!(Level::Trace, "[{}] DATA hop budget exhausted", self.own_id);
                    return;
                }
                let Some(next_hop) = route.next_hop else { return };
                let Some(next_mac) = self.address_map.hw_addr_of(next_hop) else {
                    return;
                };
                if let Ok(relayed) = MeshFrame::new_data(self.own_mac, next_mac, frame.ttl() - 1, &payload) {
                    push_action(actions, CoreAction::SendRadio(relayed), self.own_id);
                }
            }
        }
    }

    fn process_ack(&mut self, frame: &MeshFrame, now: Instant, actions: &mut CoreActions) {
        let Some(ack) = frame.ack() else {
            log!(Level::Trace, "[{}] Malformed ACK dropped", self.own_id);
            return;
        };
        if self.ack_seen.contains((ack.packet_id, ack.ack_from), now) {
            log!(Level::Trace, "[{}] Duplicate ACK ({}, {}) suppressed", self.own_id, ack.packet_id, ack.ack_from);
            return;
        }
        self.ack_seen.insert((ack.packet_id, ack.ack_from), (), now);

        if ack.destination == self.sink_id && self.upstream_up {
            push_action(
                actions,
                CoreAction::SendUpstream(frame.forwarded(self.own_mac, HwAddress::BROADCAST, frame.ttl())),
                self.own_id,
            );
        } else if frame.ttl() > 0 {
            push_action(
                actions,
                CoreAction::SendRadio(frame.forwarded(self.own_mac, HwAddress::BROADCAST, frame.ttl() - 1)),
                self.own_id,
            );
        } else {
            log!(Level::Trace, "[{}] ACK hop budget exhausted", self.own_id);
        }
    }

    /// Originates a DATA packet from this node.
    ///
    /// Without a valid route the packet is dropped and discovery starts; the
    /// application layer is responsible for retrying.
    pub fn originate_data(
        &mut self,
        destination: u8,
        app_data: &[u8],
        now: Instant,
        wall_ms: i64,
        actions: &mut CoreActions,
    ) -> Result<(), PayloadError> {
        self.packet_counter = self.packet_counter.wrapping_add(1);
        if self.packet_counter == 0 {
            self.packet_counter = 1;
        }
        let payload = DataPayload::originate(self.own_id, destination, self.packet_counter, wall_ms as u32, app_data)?;
        // Our own flood must not re-annotate when it loops back.
        self.data_seen.insert((self.own_id, self.packet_counter), (), now);

        if destination == self.sink_id {
            let frame = MeshFrame::new_data(self.own_mac, HwAddress::BROADCAST, self.max_ttl, &payload)?;
            if self.upstream_up {
                push_action(actions, CoreAction::SendUpstream(frame), self.own_id);
            } else {
                push_action(actions, CoreAction::SendRadio(frame), self.own_id);
            }
            return Ok(());
        }

        match self.route_table.lookup(destination, now) {
            Some(route) => {
                let Some(next_hop) = route.next_hop else { return Ok(()) };
                let Some(next_mac) = self.address_map.hw_addr_of(next_hop) else {
                    return Ok(());
                };
                let frame = MeshFrame::new_data(self.own_mac, next_mac, self.max_ttl, &payload)?;
                push_action(actions, CoreAction::SendRadio(frame), self.own_id);
            }
            None => {
                log!(Level::Debug, "[{}] No route to {}; starting discovery", self.own_id, destination);
                self.originate_rreq(destination, now, actions);
            }
        }
        Ok(())
    }

    fn originate_rreq(&mut self, dest: u8, now: Instant, actions: &mut CoreActions) {
        self.local_seq = self.local_seq.wrapping_add(1);
        let rreq_id = self.local_seq;
        // Self-entry keeps our own flood from being processed again here.
        self.reverse_path.insert((self.own_id, rreq_id), self.own_id, now);
        log!(Level::Debug, "[{}] RREQ {} flooded for dest {}", self.own_id, rreq_id, dest);
        let frame = MeshFrame::new_rreq(self.own_mac, self.own_id, dest, rreq_id, self.max_ttl);
        push_action(actions, CoreAction::SendRadio(frame), self.own_id);
    }

    /// Drives the periodic duties: HELLO emission, route aging, and
    /// upstream-link probing. `upstream_signal` is the link status sampled
    /// from the connectivity collaborator.
    pub fn process_timed_tasks(&mut self, now: Instant, upstream_signal: bool, actions: &mut CoreActions) {
        if now >= self.next_hello_at {
            self.local_seq = self.local_seq.wrapping_add(1);
            let hello = MeshFrame::new_hello(self.own_mac, self.own_id, self.local_seq, self.max_ttl);
            if self.upstream_up {
                // Mirrored to the collector for presence telemetry.
                push_action(actions, CoreAction::SendUpstream(hello.clone()), self.own_id);
            }
            push_action(actions, CoreAction::SendRadio(hello), self.own_id);
            self.next_hello_at = now + self.hello_interval;
        }

        if now >= self.next_cleanup_at {
            self.route_table.cleanup(now);
            self.next_cleanup_at = now + Duration::from_millis(ROUTE_CLEANUP_INTERVAL_MS);
        }

        if now >= self.next_probe_at {
            if upstream_signal != self.upstream_up {
                self.upstream_up = upstream_signal;
                if upstream_signal {
                    log!(Level::Info, "[{}] Upstream link is up", self.own_id);
                    push_action(actions, CoreAction::Emit(MeshEvent::UpstreamUp), self.own_id);
                } else {
                    log!(Level::Warn, "[{}] Upstream link lost", self.own_id);
                    push_action(actions, CoreAction::Emit(MeshEvent::UpstreamDown), self.own_id);
                    self.next_retry_at = now + Duration::from_millis(UPSTREAM_RETRY_INTERVAL_MS);
                }
            }
            self.next_probe_at = now + Duration::from_millis(UPSTREAM_PROBE_INTERVAL_MS);
        }

        if !self.upstream_up && now >= self.next_retry_at {
            push_action(actions, CoreAction::Emit(MeshEvent::UpstreamRetryDue), self.own_id);
            self.next_retry_at = now + Duration::from_millis(UPSTREAM_RETRY_INTERVAL_MS);
        }
    }

    /// Earliest instant at which `process_timed_tasks` has work to do.
    pub fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_hello_at.min(self.next_cleanup_at).min(self.next_probe_at);
        if !self.upstream_up {
            deadline = deadline.min(self.next_retry_at);
        }
        deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MACS: [HwAddress; 4] = [
        HwAddress([0xAA, 0, 0, 0, 0, 0]),
        HwAddress([0xBB, 0, 0, 0, 0, 1]),
        HwAddress([0xCC, 0, 0, 0, 0, 2]),
        HwAddress([0xDD, 0, 0, 0, 0, 3]),
    ];
    const SINK: u8 = 4;

    fn config() -> MeshConfiguration {
        MeshConfiguration {
            hw_addr_table: heapless::Vec::from_slice(&MACS).unwrap(),
            sink_id: SINK,
            hello_interval_ms: 2000,
            route_timeout_ms: 10_000,
            max_ttl: 10,
            wall_clock_ms: || 0,
        }
    }

    fn core(id: u8, now: Instant) -> MeshCore {
        MeshCore::new(&config(), MACS[id as usize], now, id as u64 + 1).unwrap()
    }

    fn radio_frames(actions: &CoreActions) -> heapless::Vec<MeshFrame, 8> {
        let mut out = heapless::Vec::new();
        for action in actions {
            if let CoreAction::SendRadio(frame) = action {
                let _ = out.push(frame.clone());
            }
        }
        out
    }

    #[test]
    fn boot_detects_own_id_and_rejects_strangers() {
        let now = Instant::now();
        assert_eq!(core(2, now).own_node_id(), 2);
        assert!(MeshCore::new(&config(), HwAddress([9; 6]), now, 1).is_err());
    }

    #[test]
    fn hello_installs_neighbor_route() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_hello(MACS[1], 1, 3, 10), -50, now, 0, &mut actions);
        let route = node.route_to(1, now).unwrap();
        assert_eq!(route.next_hop, Some(1));
        assert_eq!(route.hop_count, 1);
        assert_eq!(route.seq, 3);
        assert!(actions.is_empty());
    }

    #[test]
    fn hello_with_stale_sequence_does_not_regress() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_hello(MACS[1], 1, 9, 10), -50, now, 0, &mut actions);
        node.handle_frame(&MeshFrame::new_hello(MACS[1], 1, 4, 10), -50, now, 0, &mut actions);
        assert_eq!(node.route_to(1, now).unwrap().seq, 9);
    }

    #[test]
    fn rreq_for_self_answers_with_unicast_rrep() {
        let now = Instant::now();
        let mut node = core(2, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_rreq(MACS[1], 0, 2, 7, 9), -50, now, 0, &mut actions);

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        let rrep = frames[0].rrep().unwrap();
        assert_eq!(frames[0].dst_mac(), MACS[1]);
        assert_eq!(rrep.requester, 0);
        assert_eq!(rrep.dest, 2);
        assert_eq!(rrep.dest_seq, 7);
        assert_eq!(rrep.hop_count, 0);
        // The flood also installed a reverse route toward the requester.
        assert_eq!(node.route_to(0, now).unwrap().next_hop, Some(1));
    }

    #[test]
    fn duplicate_rreq_is_suppressed() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        let rreq = MeshFrame::new_rreq(MACS[0], 0, 2, 7, 10);
        node.handle_frame(&rreq, -50, now, 0, &mut actions);
        let first = actions.len();
        node.handle_frame(&rreq, -50, now, 0, &mut actions);
        assert_eq!(actions.len(), first);
    }

    #[test]
    fn rreq_without_route_rebroadcasts_with_decremented_ttl() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_rreq(MACS[0], 0, 2, 7, 10), -50, now, 0, &mut actions);

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type(), FrameType::Rreq as u8);
        assert_eq!(frames[0].ttl(), 9);
        assert_eq!(frames[0].src_mac(), MACS[1]);
        assert!(frames[0].dst_mac().is_broadcast());
        assert_eq!(frames[0].rreq().unwrap().rreq_id, 7);
    }

    #[test]
    fn rreq_with_exhausted_ttl_is_dropped() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_rreq(MACS[0], 0, 2, 7, 0), -50, now, 0, &mut actions);
        assert!(actions.is_empty());
    }

    #[test]
    fn intermediate_with_fresh_route_answers_rreq() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        // Node 1 learns a route to 2 first.
        node.handle_frame(&MeshFrame::new_hello(MACS[2], 2, 5, 10), -50, now, 0, &mut actions);
        node.handle_frame(&MeshFrame::new_rreq(MACS[0], 0, 2, 7, 10), -50, now, 0, &mut actions);

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        let rrep = frames[0].rrep().unwrap();
        assert_eq!(rrep.dest_seq, 5);
        assert_eq!(rrep.hop_count, 1);
    }

    #[test]
    fn rrep_forwards_along_recorded_reverse_path() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_rreq(MACS[0], 0, 2, 7, 10), -50, now, 0, &mut actions);
        actions.clear();

        node.handle_frame(
            &MeshFrame::new_rrep(MACS[2], MACS[1], 0, 2, 7, 7, 0, 10),
            -50,
            now,
            0,
            &mut actions,
        );
        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        // Unicast to the previous hop of the original request.
        assert_eq!(frames[0].dst_mac(), MACS[0]);
        assert_eq!(frames[0].ttl(), 9);
        // Forward route toward the replying destination was installed.
        assert_eq!(node.route_to(2, now).unwrap().next_hop, Some(2));
    }

    #[test]
    fn rrep_without_reverse_path_is_dropped() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        node.handle_frame(
            &MeshFrame::new_rrep(MACS[2], MACS[1], 0, 2, 7, 7, 0, 10),
            -50,
            now,
            0,
            &mut actions,
        );
        assert!(radio_frames(&actions).is_empty());
        // The route from the RREP itself still installs.
        assert!(node.route_to(2, now).is_some());
    }

    #[test]
    fn rrep_for_self_terminates() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();
        node.handle_frame(
            &MeshFrame::new_rrep(MACS[1], MACS[0], 0, 2, 7, 7, 1, 10),
            -50,
            now,
            0,
            &mut actions,
        );
        assert!(actions.is_empty());
        let route = node.route_to(2, now).unwrap();
        assert_eq!(route.next_hop, Some(1));
        assert_eq!(route.hop_count, 2);
    }

    #[test]
    fn rerr_invalidates_route() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_hello(MACS[3], 3, 6, 10), -50, now, 0, &mut actions);
        assert!(node.route_to(3, now).is_some());

        node.handle_frame(&MeshFrame::new_rerr(MACS[2], 3, 1), -50, now, 0, &mut actions);
        assert!(node.route_to(3, now).is_none());
        // Never rebroadcast.
        assert!(actions.is_empty());
    }

    #[test]
    fn delivered_data_is_acked_and_surfaced() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        let payload = DataPayload::originate(0, 1, 41, 100, b"hi").unwrap();
        let frame = MeshFrame::new_data(MACS[0], MACS[1], 10, &payload).unwrap();
        node.handle_frame(&frame, -48, now, 117, &mut actions);

        assert_eq!(actions.len(), 2);
        let mut saw_ack = false;
        let mut saw_delivery = false;
        for action in &actions {
            match action {
                CoreAction::SendRadio(f) => {
                    let ack = AckPayload::parse(f.payload()).unwrap();
                    assert_eq!(f.frame_type(), FrameType::Ack as u8);
                    assert_eq!(ack.packet_id, 41);
                    assert_eq!(ack.ack_from, 1);
                    assert_eq!(ack.destination, SINK);
                    assert_eq!(ack.ack_ts_ms, 117);
                    saw_ack = true;
                }
                CoreAction::Emit(MeshEvent::DataDelivered(delivered)) => {
                    assert_eq!(delivered.path.as_slice(), &[0, 1]);
                    assert_eq!(delivered.hop_metrics.len(), 1);
                    assert_eq!(delivered.hop_metrics[0].from, 0);
                    assert_eq!(delivered.hop_metrics[0].to, 1);
                    assert_eq!(delivered.hop_metrics[0].rssi, -48);
                    assert_eq!(delivered.hop_metrics[0].delay_ms, 17);
                    saw_delivery = true;
                }
                other => panic!("unexpected action: {:?}", other),
            }
        }
        assert!(saw_ack && saw_delivery);
    }

    #[test]
    fn zero_packet_id_delivers_without_ack() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        let payload = DataPayload::originate(0, 1, 0, 0, b"hi").unwrap();
        let frame = MeshFrame::new_data(MACS[0], MACS[1], 10, &payload).unwrap();
        node.handle_frame(&frame, -48, now, 0, &mut actions);

        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], CoreAction::Emit(MeshEvent::DataDelivered(_))));
    }

    #[test]
    fn duplicate_data_processed_once() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        let payload = DataPayload::originate(0, 1, 41, 0, b"hi").unwrap();
        let frame = MeshFrame::new_data(MACS[0], MACS[1], 10, &payload).unwrap();
        node.handle_frame(&frame, -48, now, 0, &mut actions);
        let first = actions.len();
        node.handle_frame(&frame, -48, now, 0, &mut actions);
        assert_eq!(actions.len(), first);
    }

    #[test]
    fn sink_data_floods_on_radio_when_upstream_is_down() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        let payload = DataPayload::originate(0, SINK, 5, 0, b"x").unwrap();
        let frame = MeshFrame::new_data(MACS[0], HwAddress::BROADCAST, 8, &payload).unwrap();
        node.handle_frame(&frame, -48, now, 0, &mut actions);

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ttl(), 7);
        let relayed = DataPayload::parse(frames[0].payload()).unwrap();
        assert_eq!(relayed.path.as_slice(), &[0, 1]);
    }

    #[test]
    fn sink_data_hands_off_upstream_when_available() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        // Bring the upstream link up through a probe cycle.
        let probe_time = now + Duration::from_millis(UPSTREAM_PROBE_INTERVAL_MS);
        node.process_timed_tasks(probe_time, true, &mut actions);
        actions.clear();

        let payload = DataPayload::originate(0, SINK, 5, 0, b"x").unwrap();
        let frame = MeshFrame::new_data(MACS[0], HwAddress::BROADCAST, 8, &payload).unwrap();
        node.handle_frame(&frame, -48, probe_time, 0, &mut actions);

        assert_eq!(actions.len(), 1);
        let CoreAction::SendUpstream(relayed) = &actions[0] else {
            panic!("expected upstream hand-off");
        };
        // The wired leg keeps the remaining hop budget.
        assert_eq!(relayed.ttl(), 8);
        assert_eq!(DataPayload::parse(relayed.payload()).unwrap().path.as_slice(), &[0, 1]);
    }

    #[test]
    fn data_without_route_triggers_discovery_and_drop() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        let payload = DataPayload::originate(0, 3, 5, 0, b"x").unwrap();
        let frame = MeshFrame::new_data(MACS[0], MACS[1], 10, &payload).unwrap();
        node.handle_frame(&frame, -48, now, 0, &mut actions);

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        let rreq = frames[0].rreq().unwrap();
        assert_eq!(rreq.source, 1);
        assert_eq!(rreq.dest, 3);
    }

    #[test]
    fn routed_data_unicasts_to_next_hop() {
        let now = Instant::now();
        let mut node = core(1, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_hello(MACS[2], 2, 5, 10), -50, now, 0, &mut actions);
        actions.clear();

        let payload = DataPayload::originate(0, 2, 5, 0, b"x").unwrap();
        let frame = MeshFrame::new_data(MACS[0], MACS[1], 6, &payload).unwrap();
        node.handle_frame(&frame, -48, now, 0, &mut actions);

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dst_mac(), MACS[2]);
        assert_eq!(frames[0].ttl(), 5);
    }

    #[test]
    fn data_with_exhausted_ttl_still_delivers_but_never_forwards() {
        let now = Instant::now();
        let mut actions = CoreActions::new();

        // Final hop: delivery works at ttl 0.
        let mut dest_node = core(2, now);
        let payload = DataPayload::originate(0, 2, 5, 0, b"x").unwrap();
        let frame = MeshFrame::new_data(MACS[1], MACS[2], 0, &payload).unwrap();
        dest_node.handle_frame(&frame, -48, now, 0, &mut actions);
        assert!(actions.iter().any(|a| matches!(a, CoreAction::Emit(MeshEvent::DataDelivered(_)))));
        actions.clear();

        // Relay: ttl 0 means drop even with a route installed.
        let mut relay_node = core(1, now);
        relay_node.handle_frame(&MeshFrame::new_hello(MACS[2], 2, 5, 10), -50, now, 0, &mut actions);
        actions.clear();
        let payload = DataPayload::originate(0, 2, 6, 0, b"x").unwrap();
        let frame = MeshFrame::new_data(MACS[0], MACS[1], 0, &payload).unwrap();
        relay_node.handle_frame(&frame, -48, now, 0, &mut actions);
        assert!(radio_frames(&actions).is_empty());
    }

    #[test]
    fn ack_relays_as_flood_until_a_gateway_appears() {
        let now = Instant::now();
        let mut node = core(2, now);
        let mut actions = CoreActions::new();
        let ack = AckPayload {
            packet_id: 41,
            ack_from: 1,
            destination: SINK,
            orig_source: 0,
            orig_destination: 1,
            sent_ts_ms: 0,
            ack_ts_ms: 10,
        };
        let frame = MeshFrame::new_ack(MACS[1], HwAddress::BROADCAST, 6, &ack);
        node.handle_frame(&frame, -50, now, 0, &mut actions);

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ttl(), 5);

        // The same ACK again is suppressed.
        actions.clear();
        node.handle_frame(&frame, -50, now, 0, &mut actions);
        assert!(actions.is_empty());
    }

    #[test]
    fn ack_bridges_upstream_at_a_gateway() {
        let now = Instant::now();
        let mut node = core(2, now);
        let mut actions = CoreActions::new();
        let probe_time = now + Duration::from_millis(UPSTREAM_PROBE_INTERVAL_MS);
        node.process_timed_tasks(probe_time, true, &mut actions);
        actions.clear();

        let ack = AckPayload {
            packet_id: 41,
            ack_from: 1,
            destination: SINK,
            orig_source: 0,
            orig_destination: 1,
            sent_ts_ms: 0,
            ack_ts_ms: 10,
        };
        let frame = MeshFrame::new_ack(MACS[1], HwAddress::BROADCAST, 6, &ack);
        node.handle_frame(&frame, -50, probe_time, 0, &mut actions);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], CoreAction::SendUpstream(_)));
    }

    #[test]
    fn originated_data_without_route_starts_discovery() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();
        node.originate_data(2, b"hi", now, 0, &mut actions).unwrap();

        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        let rreq = frames[0].rreq().unwrap();
        assert_eq!(rreq.source, 0);
        assert_eq!(rreq.dest, 2);
        assert_eq!(rreq.rreq_id, 1);

        // A second attempt floods a fresh request id.
        actions.clear();
        node.originate_data(2, b"hi", now, 0, &mut actions).unwrap();
        assert_eq!(radio_frames(&actions)[0].rreq().unwrap().rreq_id, 2);
    }

    #[test]
    fn originated_data_with_route_unicasts() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_hello(MACS[1], 1, 4, 10), -50, now, 0, &mut actions);
        actions.clear();

        node.originate_data(1, b"hi", now, 50, &mut actions).unwrap();
        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dst_mac(), MACS[1]);
        let payload = DataPayload::parse(frames[0].payload()).unwrap();
        assert_eq!(payload.packet_id, 1);
        assert_eq!(payload.path.as_slice(), &[0]);
        assert_eq!(payload.timestamp_ms, 50);
    }

    #[test]
    fn hello_emitted_on_schedule_and_mirrored_upstream() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();

        // Jitter keeps the first beacon within one interval.
        let first = now + Duration::from_millis(2000);
        node.process_timed_tasks(first, false, &mut actions);
        let frames = radio_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type(), FrameType::Hello as u8);
        assert_eq!(frames[0].hello().unwrap().node_id, 0);

        // With the upstream link up, the beacon is also mirrored.
        actions.clear();
        let probe_time = first + Duration::from_millis(UPSTREAM_PROBE_INTERVAL_MS);
        node.process_timed_tasks(probe_time, true, &mut actions);
        actions.clear();
        node.process_timed_tasks(probe_time + Duration::from_millis(2000), true, &mut actions);
        assert!(actions.iter().any(|a| matches!(a, CoreAction::SendUpstream(_))));
        assert!(actions.iter().any(|a| matches!(a, CoreAction::SendRadio(_))));
    }

    #[test]
    fn upstream_probe_edges_emit_events_and_retry_nudges() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();

        let t1 = now + Duration::from_millis(UPSTREAM_PROBE_INTERVAL_MS);
        node.process_timed_tasks(t1, true, &mut actions);
        assert!(actions.iter().any(|a| matches!(a, CoreAction::Emit(MeshEvent::UpstreamUp))));
        assert!(node.upstream_available());

        actions.clear();
        let t2 = t1 + Duration::from_millis(UPSTREAM_PROBE_INTERVAL_MS);
        node.process_timed_tasks(t2, false, &mut actions);
        assert!(actions.iter().any(|a| matches!(a, CoreAction::Emit(MeshEvent::UpstreamDown))));

        actions.clear();
        let t3 = t2 + Duration::from_millis(UPSTREAM_RETRY_INTERVAL_MS);
        node.process_timed_tasks(t3, false, &mut actions);
        assert!(actions.iter().any(|a| matches!(a, CoreAction::Emit(MeshEvent::UpstreamRetryDue))));
    }

    #[test]
    fn route_ages_out_and_rediscovery_begins() {
        let now = Instant::now();
        let mut node = core(0, now);
        let mut actions = CoreActions::new();
        node.handle_frame(&MeshFrame::new_hello(MACS[2], 2, 5, 10), -50, now, 0, &mut actions);
        assert!(node.route_to(2, now).is_some());

        let later = now + Duration::from_millis(10_001);
        node.process_timed_tasks(later, false, &mut actions);
        assert!(node.route_to(2, later).is_none());

        actions.clear();
        node.originate_data(2, b"hi", later, 0, &mut actions).unwrap();
        assert_eq!(radio_frames(&actions)[0].frame_type(), FrameType::Rreq as u8);
    }

    #[test]
    fn frames_for_other_nodes_are_ignored() {
        let now = Instant::now();
        let mut node = core(2, now);
        let mut actions = CoreActions::new();
        let payload = DataPayload::originate(0, 1, 5, 0, b"x").unwrap();
        // Unicast addressed to node 1, overheard by node 2.
        let frame = MeshFrame::new_data(MACS[0], MACS[1], 10, &payload).unwrap();
        node.handle_frame(&frame, -48, now, 0, &mut actions);
        assert!(actions.is_empty());
    }
}
