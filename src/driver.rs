//! The per-connection protocol engine, driven exclusively by the network worker: drains the
//!  accept queue into the send priority queue, packs messages into paced datagrams, tracks and
//!  retransmits reliable datagrams, parses inbound datagrams (duplicate suppression, fragment
//!  reassembly, control messages) and feeds decoded messages to the application queue.

use crate::ack_track::{
    InboundAckQueue, OutboundAckTracker, PacketAckTrack, ReceivedPacketIdSet, ReceivedReliableSet,
};
use crate::clock::{self, Clock, Tick, TICKS_PER_MS};
use crate::config::MIN_INBOUND_SLACK;
use crate::connection::{ConnectionShared, ConnectionState};
use crate::content_id::{InboundContentStamps, OutboundContentMap};
use crate::error::WireError;
use crate::fragment::{FragmentedReceiveManager, MAX_FRAGMENTS_PER_TRANSFER};
use crate::message::{
    message_number_is_newer, msg_id, MessageId, NetworkMessage, QueuedMessage, MAX_PRIORITY,
};
use crate::packet_id::PacketId;
use crate::pacing::{DatagramRateController, RttEstimator};
use crate::socket::DatagramSocket;
use crate::vle;
use crate::wire::{DatagramHeader, MessageHeader, PacketAckPayload, MAX_MESSAGE_CONTENT_LEN};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

/// Reserved space in the datagram size budget for the in-order delta counter slot. The field
///  is part of the frame layout but is neither written nor read; cross-datagram ordering is
///  unspecified.
const IN_ORDER_RESERVED_BYTES: usize = 2;

/// Upper bound for the reliable-base field, accounted when the first reliable message is
///  selected into a datagram.
const RELIABLE_BASE_UPPER_BOUND: usize = 4;

/// The interface the worker drives connections through. A stream-based connection variant
///  would implement this same trait and plug into the worker unchanged.
#[async_trait]
pub(crate) trait DriveConnection: Send + 'static {
    /// Periodic engine work: accept-queue drain, ping/liveness, stats, timeouts, flow
    ///  control, ack emission.
    async fn update_connection(&mut self);

    /// Drains pending inbound datagrams from the socket.
    async fn read_socket(&mut self);

    /// Packs and sends as many datagrams as pacing currently allows.
    async fn send_out_packets(&mut self);

    /// Ticks until the pacing controller admits the next datagram; `None` when there is
    ///  nothing to send.
    fn ticks_until_can_send(&self) -> Option<u64>;

    /// Ticks until the nearest engine timer wants to run.
    fn ticks_until_next_timer(&self) -> u64;

    fn is_closed(&self) -> bool;

    fn socket(&self) -> Arc<dyn DatagramSocket>;
}

enum SendOutcome {
    Sent,
    NoMessages,
    Throttled,
    SocketClosed,
}

pub(crate) struct UdpConnectionDriver {
    shared: Arc<ConnectionShared>,
    socket: Arc<dyn DatagramSocket>,
    clock: Clock,

    accept_rx: mpsc::Receiver<NetworkMessage>,
    inbound_tx: mpsc::Sender<NetworkMessage>,

    send_queue: BinaryHeap<QueuedMessage>,
    outbound_content: OutboundContentMap,
    inbound_content: InboundContentStamps,
    ack_tracker: OutboundAckTracker,
    received_packet_ids: ReceivedPacketIdSet,
    received_reliable: ReceivedReliableSet,
    inbound_acks: InboundAckQueue,
    fragmented_receives: FragmentedReceiveManager,

    rate: DatagramRateController,
    rto: RttEstimator,

    packet_id_counter: PacketId,
    last_heard_tick: Tick,
    ping_deadline: Tick,
    stats_deadline: Tick,
    update_deadline: Tick,

    read_buf: Vec<u8>,
    torn_down: bool,
}

impl UdpConnectionDriver {
    pub fn new(
        shared: Arc<ConnectionShared>,
        socket: Arc<dyn DatagramSocket>,
        accept_rx: mpsc::Receiver<NetworkMessage>,
        inbound_tx: mpsc::Sender<NetworkMessage>,
    ) -> UdpConnectionDriver {
        let clock = Clock::new();
        let now = clock.now();
        let config = &shared.config;

        UdpConnectionDriver {
            socket,
            accept_rx,
            inbound_tx,
            send_queue: BinaryHeap::new(),
            outbound_content: OutboundContentMap::new(),
            inbound_content: InboundContentStamps::new(),
            ack_tracker: OutboundAckTracker::new(),
            received_packet_ids: ReceivedPacketIdSet::new(config.received_packet_id_capacity),
            received_reliable: ReceivedReliableSet::new(config.reliable_number_window),
            inbound_acks: InboundAckQueue::new(),
            fragmented_receives: FragmentedReceiveManager::new(),
            rate: DatagramRateController::new(
                now,
                config.initial_datagram_rate,
                config.target_datagram_rate,
            ),
            rto: RttEstimator::new(
                config.initial_rto.as_millis() as f64,
                config.min_rto.as_millis() as f64,
                config.max_rto.as_millis() as f64,
            ),
            packet_id_counter: PacketId::ZERO,
            last_heard_tick: now,
            // all timers fire on the first update pass
            ping_deadline: now,
            stats_deadline: now,
            update_deadline: now,
            read_buf: vec![0u8; 64 * 1024],
            torn_down: false,
            clock,
            shared,
        }
    }

    fn config(&self) -> &crate::config::ConnectionConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------------------------
    // outbound path
    // ------------------------------------------------------------------------------------

    /// Moves submitted messages from the accept queue into the send priority queue, marking
    ///  messages that a newer same-content-id submission has already superseded.
    fn accept_outbound_messages(&mut self) {
        match self.shared.state.get() {
            ConnectionState::Ok | ConnectionState::Disconnecting => {}
            _ => return,
        }

        for _ in 0..self.config().max_accepts_per_tick {
            match self.accept_rx.try_recv() {
                Ok(mut msg) => {
                    if !self.outbound_content.check_and_save(&msg) {
                        debug!(
                            "message {} (number {}) already superseded under content id {}",
                            msg.id, msg.message_number, msg.content_id
                        );
                        msg.obsolete = true;
                    }
                    self.send_queue.push(QueuedMessage(msg));
                }
                Err(_) => break,
            }
        }
    }

    /// Allocates a control message on the worker side, straight into the send queue.
    fn enqueue_internal(&mut self, id: MessageId, reliable: bool, priority: u32, payload: &[u8]) {
        let mut msg = self.shared.pool.allocate();
        msg.id = id;
        msg.reliable = reliable;
        msg.priority = priority;
        msg.message_number = self.shared.next_message_number();
        msg.reliable_message_number = if reliable {
            self.shared.next_reliable_message_number()
        } else {
            0
        };
        msg.payload.extend_from_slice(payload);
        self.send_queue.push(QueuedMessage(msg));
    }

    /// Releases a message whose lifetime ended: acked, sent unreliably, superseded or torn
    ///  down. Detaches it from its fragmented transfer and content-id slot.
    fn release_message(&mut self, msg: NetworkMessage) {
        if let Some(fragment) = msg.fragment {
            self.shared
                .fragmented_sends
                .lock()
                .expect("fragmented sends lock poisoned")
                .fragment_done(fragment.transfer);
        }
        self.outbound_content.clear_on_release(&msg);
        self.shared.pool.free(msg);
    }

    async fn send_out_packet(&mut self, now: Tick) -> SendOutcome {
        if !self.socket.is_write_open() {
            return SendOutcome::SocketClosed;
        }
        if self.shared.is_paused() || self.send_queue.is_empty() {
            return SendOutcome::NoMessages;
        }
        if !self.rate.can_send(now) {
            return SendOutcome::Throttled;
        }

        let max_send_size = self.socket.max_send_size();

        // selection: pop by priority until the datagram is full, skipping superseded
        // messages and fragments that cannot get a transfer id yet
        let mut selected: Vec<(NetworkMessage, Option<u8>)> = Vec::new();
        let mut skipped: Vec<NetworkMessage> = Vec::new();
        let mut packet_size = DatagramHeader::MIN_LEN;
        let mut reliable = false;
        let mut in_order = false;
        let mut reliable_base = 0u32;

        while let Some(QueuedMessage(msg)) = self.send_queue.pop() {
            if msg.obsolete || !self.outbound_content.is_current(&msg) {
                trace!("dropping superseded message {} at send time", msg.id);
                self.release_message(msg);
                continue;
            }

            let mut wire_id = None;
            if let Some(fragment) = msg.fragment {
                wire_id = self
                    .shared
                    .fragmented_sends
                    .lock()
                    .expect("fragmented sends lock poisoned")
                    .ensure_wire_id(fragment.transfer);
                if wire_id.is_none() {
                    // no free transfer id - try again once one is released
                    skipped.push(msg);
                    continue;
                }
            }

            let mut message_size = msg.wire_size();
            if msg.in_order && !in_order {
                message_size += IN_ORDER_RESERVED_BYTES;
            }
            if msg.reliable && !reliable {
                message_size += RELIABLE_BASE_UPPER_BOUND;
            }

            if packet_size + message_size > max_send_size {
                if selected.is_empty() {
                    error!(
                        "message {} of {} wire bytes cannot fit any datagram - discarding",
                        msg.id,
                        msg.wire_size()
                    );
                    self.release_message(msg);
                    continue;
                }
                self.send_queue.push(QueuedMessage(msg));
                break;
            }

            if msg.reliable {
                if !reliable {
                    reliable_base = msg.reliable_message_number;
                } else if message_number_is_newer(reliable_base, msg.reliable_message_number) {
                    reliable_base = msg.reliable_message_number;
                }
                reliable = true;
            }
            in_order |= msg.in_order;
            packet_size += message_size;
            selected.push((msg, wire_id));
        }

        for msg in skipped {
            self.send_queue.push(QueuedMessage(msg));
        }
        if selected.is_empty() {
            return SendOutcome::NoMessages;
        }

        // serialization
        let packet_id = self.packet_id_counter;
        let mut buf = BytesMut::with_capacity(max_send_size);
        DatagramHeader {
            packet_id,
            reliable,
            in_order,
            reliable_base,
        }
        .ser(&mut buf);

        let mut sent_disconnect_ack = false;
        for (msg, wire_id) in &selected {
            if msg.id == msg_id::DISCONNECT_ACK {
                sent_disconnect_ack = true;
            }

            let carries_id = msg.fragment.map(|f| f.is_first()).unwrap_or(true);
            let id_len = if carries_id {
                vle::len_vle8_16_32(msg.id)
            } else {
                0
            };
            let content_length = msg.payload.len() + id_len;
            debug_assert!(content_length <= MAX_MESSAGE_CONTENT_LEN);

            MessageHeader {
                content_length: content_length as u16,
                reliable: msg.reliable,
                in_order: msg.in_order,
                fragment: msg.fragment.is_some(),
                first_fragment: msg.fragment.map(|f| f.is_first()).unwrap_or(false),
            }
            .ser(&mut buf);

            if msg.reliable {
                let delta = msg.reliable_message_number.wrapping_sub(reliable_base);
                debug_assert!(delta <= vle::MAX_VLE8_16);
                vle::put_vle8_16(&mut buf, delta);
            }
            if let Some(fragment) = msg.fragment {
                if fragment.is_first() {
                    vle::put_vle8_16_32(&mut buf, fragment.total_fragments);
                }
                buf.extend_from_slice(&[wire_id.expect("wire id ensured during selection")]);
                if !fragment.is_first() {
                    vle::put_vle8_16_32(&mut buf, fragment.index);
                }
            }
            if carries_id {
                vle::put_vle8_16_32(&mut buf, msg.id);
            }
            buf.extend_from_slice(&msg.payload);
        }

        if let Err(e) = self.socket.send_datagram(&buf).await {
            warn!(
                "socket send failed ({}) - re-queueing {} messages",
                e,
                selected.len()
            );
            for (msg, _) in selected {
                self.send_queue.push(QueuedMessage(msg));
            }
            return SendOutcome::Throttled;
        }

        trace!(
            "sent datagram {} with {} messages, {} bytes",
            packet_id,
            selected.len(),
            buf.len()
        );

        let num_messages = selected.len() as u64;
        let mut track_send_count = 1;
        let mut selected: Vec<NetworkMessage> = selected
            .into_iter()
            .map(|(mut msg, _)| {
                msg.send_count += 1;
                track_send_count = track_send_count.max(msg.send_count);
                msg
            })
            .collect();

        self.rate.on_datagram_sent(now);
        self.packet_id_counter = self.packet_id_counter.next();
        self.shared
            .stats
            .lock()
            .expect("stats lock poisoned")
            .add_outbound(now, buf.len() as u64, 1, num_messages);

        if reliable {
            let mut track = PacketAckTrack {
                packet_id,
                messages: Vec::new(),
                sent_tick: now,
                timeout_tick: now.wrapping_add(self.rto.rto_ticks()),
                send_count: track_send_count,
                datagram_send_rate: self.rate.rate(),
            };
            for msg in selected.drain(..) {
                if msg.reliable {
                    track.messages.push(msg);
                } else {
                    self.release_message(msg);
                }
            }
            self.ack_tracker.insert(track);
        } else {
            for msg in selected.drain(..) {
                self.release_message(msg);
            }
        }

        if sent_disconnect_ack {
            info!("disconnect ack flushed - connection closed");
            self.shared.state.set(ConnectionState::Closed);
        }

        SendOutcome::Sent
    }

    /// Re-queues the messages of reliable datagrams whose retransmission timeout expired.
    ///  They will be repacked into brand-new datagrams with fresh packet ids.
    fn process_packet_timeouts(&mut self, now: Tick) {
        while let Some(track) = self.ack_tracker.pop_expired(now) {
            debug!(
                "packet {} timed out after {} ms with {} messages - re-queueing",
                track.packet_id,
                clock::ticks_in_between(now, track.sent_tick) / TICKS_PER_MS,
                track.messages.len()
            );
            self.rate.on_loss(track.datagram_send_rate);
            self.rto.on_loss();
            for msg in track.messages {
                self.send_queue.push(QueuedMessage(msg));
            }
        }
    }

    // ------------------------------------------------------------------------------------
    // inbound path
    // ------------------------------------------------------------------------------------

    fn extract_messages(&mut self, data: &[u8], now: Tick) {
        // refuse the whole datagram rather than applying only part of its messages
        if self.inbound_tx.capacity() < MIN_INBOUND_SLACK {
            debug!("inbound queue nearly full - dropping a whole datagram");
            return;
        }

        self.last_heard_tick = now;

        if data.len() < DatagramHeader::MIN_LEN {
            debug!("datagram of {} bytes is too short for a header", data.len());
            return;
        }

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram", %correlation_id);
        let _entered = span.enter();

        let mut buf = data;
        let header = match DatagramHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("unparsable datagram header: {}", e);
                return;
            }
        };

        // queue the ack before the duplicate check: a duplicate usually means our previous
        // ack was lost or late, so the peer needs another one
        if header.reliable {
            self.inbound_acks.record(header.packet_id, now);
        }

        if self.received_packet_ids.contains(header.packet_id) {
            trace!("duplicate datagram {} - discarding body", header.packet_id);
            return;
        }

        let mut num_messages_received = 0u64;
        while buf.has_remaining() {
            match self.extract_one_message(&header, &mut buf, now) {
                Ok(dispatched) => {
                    if dispatched {
                        num_messages_received += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        "malformed message in datagram {} ({}) - dropping the remainder",
                        header.packet_id, e
                    );
                    break;
                }
            }
        }

        self.received_packet_ids.add(header.packet_id);
        self.shared
            .stats
            .lock()
            .expect("stats lock poisoned")
            .add_inbound(now, 0, 1, num_messages_received);
    }

    /// Parses one message out of the datagram body. Returns whether a message reached the
    ///  handler path. A `WireError` poisons the rest of the datagram.
    fn extract_one_message(
        &mut self,
        header: &DatagramHeader,
        buf: &mut &[u8],
        now: Tick,
    ) -> Result<bool, WireError> {
        let mh = MessageHeader::deser(buf)?;

        // a reliable message number we have seen before marks a duplicate: it still has to be
        // parsed so the messages after it can be, but it must not be applied again
        let mut duplicate = false;
        let mut reliable_number = 0u32;
        if mh.reliable {
            let delta = vle::get_vle8_16(buf)?;
            reliable_number = header.reliable_base.wrapping_add(delta);
            duplicate = !self.received_reliable.insert(reliable_number);
        }

        let total_fragments = if mh.first_fragment {
            let total = vle::get_vle8_16_32(buf)?;
            if total <= 1 || total > MAX_FRAGMENTS_PER_TRANSFER {
                return Err(WireError::BadFragmentCount(total));
            }
            total
        } else {
            0
        };
        let transfer_id = if mh.fragment {
            buf.try_get_u8()
                .map_err(|_| WireError::Truncated("transfer id"))?
        } else {
            0
        };
        let fragment_index = if mh.fragment && !mh.first_fragment {
            vle::get_vle8_16_32(buf)?
        } else {
            0
        };

        let content_length = usize::from(mh.content_length);
        if buf.remaining() < content_length {
            return Err(WireError::Truncated("message content"));
        }
        let content = &buf[..content_length];

        if mh.fragment {
            // all fragments of a transfer share one reliable message number, so the duplicate
            // flag cannot distinguish them; fragments deduplicate through the reassembly
            // buffer instead, with that shared number as the transfer's generation tag
            let complete = if mh.first_fragment {
                self.fragmented_receives
                    .start(transfer_id, reliable_number, total_fragments, content)
            } else {
                self.fragmented_receives
                    .fragment_received(transfer_id, reliable_number, fragment_index, content)
            };
            buf.advance(content_length);
            if complete {
                let assembled = self
                    .fragmented_receives
                    .assemble(transfer_id)
                    .expect("transfer reported complete");
                self.handle_inbound_message(header.packet_id, &assembled, now);
                return Ok(true);
            }
            return Ok(false);
        }

        if !duplicate {
            self.handle_inbound_message(header.packet_id, content, now);
            buf.advance(content_length);
            return Ok(true);
        }

        trace!("duplicate reliable message - parsed and dropped");
        buf.advance(content_length);
        Ok(false)
    }

    /// Decodes the message id and routes the message: protocol control messages are consumed
    ///  here, everything else goes through content-id checking onto the inbound queue.
    fn handle_inbound_message(&mut self, packet_id: PacketId, data: &[u8], now: Tick) {
        let mut buf = data;
        let message_id = match vle::get_vle8_16_32(&mut buf) {
            Ok(id) => id,
            Err(e) => {
                warn!("unparsable message id: {}", e);
                return;
            }
        };
        let payload = buf;

        match message_id {
            msg_id::PING_REQUEST => self.handle_ping_request(payload),
            msg_id::PING_REPLY => self.handle_ping_reply(payload, now),
            msg_id::PACKET_ACK => self.handle_packet_ack(payload, now),
            msg_id::DISCONNECT => self.handle_disconnect(),
            msg_id::DISCONNECT_ACK => self.handle_disconnect_ack(),
            msg_id::FLOW_CONTROL_REQUEST => self.handle_flow_control_request(payload),
            _ => {
                if let Some(handler) = self.shared.handler() {
                    let content_id = handler.content_id(message_id, payload);
                    if content_id != 0
                        && !self
                            .inbound_content
                            .check_and_save(message_id, content_id, packet_id, now)
                    {
                        trace!(
                            "message {} in datagram {} is older than the accepted state under \
                             content id {} - skipped",
                            message_id,
                            packet_id,
                            content_id
                        );
                        return;
                    }
                }

                let mut msg = self.shared.pool.allocate();
                msg.id = message_id;
                msg.payload.extend_from_slice(payload);
                if let Err(e) = self.inbound_tx.try_send(msg) {
                    error!("inbound message queue is full - dropping message {}", message_id);
                    match e {
                        mpsc::error::TrySendError::Full(msg)
                        | mpsc::error::TrySendError::Closed(msg) => self.shared.pool.free(msg),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------------------
    // control messages
    // ------------------------------------------------------------------------------------

    fn handle_ping_request(&mut self, payload: &[u8]) {
        let [ping_id] = payload else {
            debug!("ping request with {} payload bytes instead of 1", payload.len());
            return;
        };
        let ping_id = *ping_id;
        trace!("answering ping {}", ping_id);
        self.enqueue_internal(msg_id::PING_REPLY, false, MAX_PRIORITY - 1, &[ping_id]);
    }

    fn handle_ping_reply(&mut self, payload: &[u8], now: Tick) {
        let [ping_id] = payload else {
            debug!("ping reply with {} payload bytes instead of 1", payload.len());
            return;
        };

        let rtt_ticks = self
            .shared
            .stats
            .lock()
            .expect("stats lock poisoned")
            .record_ping_reply(*ping_id, now);
        match rtt_ticks {
            Some(rtt_ticks) => {
                let rtt_ms = rtt_ticks as f64 / TICKS_PER_MS as f64;
                trace!("ping {} answered after {:.1} ms", ping_id, rtt_ms);
                self.shared.feed_rtt_sample(rtt_ms);
            }
            None => debug!("ping reply {} matches no outstanding request", ping_id),
        }
    }

    fn handle_packet_ack(&mut self, payload: &[u8], now: Tick) {
        if payload.len() != PacketAckPayload::LEN {
            debug!(
                "packet ack with {} payload bytes instead of {}",
                payload.len(),
                PacketAckPayload::LEN
            );
            return;
        }
        let mut buf = payload;
        let ack = match PacketAckPayload::deser(&mut buf) {
            Ok(ack) => ack,
            Err(e) => {
                debug!("unparsable packet ack: {}", e);
                return;
            }
        };

        self.free_outbound_track(ack.base, now);
        let acked: Vec<PacketId> = ack.acked_beyond_base().collect();
        for packet_id in acked {
            self.free_outbound_track(packet_id, now);
        }
    }

    /// The peer confirmed a reliable datagram: release its messages and, if the messages were
    ///  never retransmitted, feed the observed round trip into the RTO estimator.
    fn free_outbound_track(&mut self, packet_id: PacketId, now: Tick) {
        let Some(track) = self.ack_tracker.remove(packet_id) else {
            return;
        };
        trace!("datagram {} acked", packet_id);

        for msg in track.messages {
            self.release_message(msg);
        }

        if track.send_count <= 1 {
            let rtt_ms =
                clock::ticks_in_between(now, track.sent_tick) as f64 / TICKS_PER_MS as f64;
            self.rto.on_ack_sample(rtt_ms);
        }
    }

    fn handle_disconnect(&mut self) {
        if self.shared.state.get() == ConnectionState::Closed {
            return;
        }
        info!("peer requested disconnect");
        self.shared.state.set(ConnectionState::Disconnecting);
        self.enqueue_internal(msg_id::DISCONNECT_ACK, false, MAX_PRIORITY, &[]);
    }

    fn handle_disconnect_ack(&mut self) {
        if self.shared.state.get() != ConnectionState::Disconnecting {
            debug!("disconnect ack received outside of a disconnect handshake");
        } else {
            info!("disconnect acknowledged by peer - connection closed");
        }
        self.shared.state.set(ConnectionState::Closed);
    }

    /// Parsed and validated for protocol compatibility, but intentionally inert: the AIMD
    ///  controller governs the send rate.
    fn handle_flow_control_request(&mut self, payload: &[u8]) {
        let Ok(bytes) = <[u8; 2]>::try_from(payload) else {
            debug!(
                "flow control request with {} payload bytes instead of 2",
                payload.len()
            );
            return;
        };
        let requested_rate = u16::from_le_bytes(bytes);
        if !(5..=10 * 1024).contains(&requested_rate) {
            debug!("flow control request outside the valid range: {}", requested_rate);
            return;
        }
        debug!(
            "peer requested a receive rate of {} datagrams/s - ignored, pacing is rate-controlled",
            requested_rate
        );
    }

    // ------------------------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------------------------

    fn send_ping_request(&mut self, now: Tick) {
        let ping_id = {
            let mut stats = self.shared.stats.lock().expect("stats lock poisoned");
            let ping_id = stats.next_ping_id();
            stats.record_ping_sent(ping_id, now);
            ping_id
        };
        trace!("sending ping {}", ping_id);
        self.enqueue_internal(msg_id::PING_REQUEST, false, MAX_PRIORITY - 2, &[ping_id]);
    }

    fn detect_connection_timeout(&mut self, now: Tick) {
        if self.shared.state.get() == ConnectionState::Closed {
            return;
        }
        let silence = clock::ticks_in_between(now, self.last_heard_tick);
        if silence > self.config().liveness_timeout.as_micros() as u64 {
            info!(
                "nothing heard from the peer for {} ms - closing connection",
                silence / TICKS_PER_MS
            );
            self.shared.state.set(ConnectionState::Closed);
        }
    }

    fn refresh_stats(&mut self, now: Tick) {
        let rates = self
            .shared
            .stats
            .lock()
            .expect("stats lock poisoned")
            .refresh(now);
        *self.shared.rates.lock().expect("rates lock poisoned") = rates;

        let age_ms = clock::ticks_in_between(now, self.last_heard_tick) / TICKS_PER_MS;
        self.shared
            .last_heard_age_ms
            .store(age_ms.min(u64::from(u32::MAX)) as u32, std::sync::atomic::Ordering::Relaxed);

        if !self.socket.is_read_open() {
            if !self.socket.is_write_open() {
                self.shared.state.set(ConnectionState::Closed);
            } else {
                self.set_peer_closed();
            }
        }
    }

    fn set_peer_closed(&mut self) {
        match self.shared.state.get() {
            ConnectionState::Pending => {
                // the peer rejected the connection attempt
                self.shared.state.set(ConnectionState::Closed);
            }
            ConnectionState::Ok => {
                info!("peer closed the connection");
                self.shared.state.set(ConnectionState::PeerClosed);
            }
            ConnectionState::Disconnecting => {
                self.shared.state.set(ConnectionState::Closed);
            }
            ConnectionState::PeerClosed | ConnectionState::Closed => {}
        }
    }

    fn perform_ack_sends(&mut self, now: Tick) {
        let config = self.config();
        let max_delay_ticks = config.max_ack_delay.as_micros() as u64;
        let max_pending = config.max_pending_acks;
        if !self.inbound_acks.should_emit(now, max_delay_ticks, max_pending) {
            return;
        }

        for ack in self.inbound_acks.drain_into_payloads() {
            let mut payload = BytesMut::with_capacity(PacketAckPayload::LEN);
            ack.ser(&mut payload);
            self.enqueue_internal(msg_id::PACKET_ACK, false, MAX_PRIORITY - 1, &payload);
        }
    }

    // ------------------------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------------------------

    /// Frees every queued message, the ack tracker, the content tables and both fragment
    ///  managers. Runs once; any fatal path ends here.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!("tearing down connection state");

        while let Ok(msg) = self.accept_rx.try_recv() {
            self.shared.pool.free(msg);
        }
        while let Some(QueuedMessage(msg)) = self.send_queue.pop() {
            self.shared.pool.free(msg);
        }
        let tracks: Vec<PacketAckTrack> = self.ack_tracker.drain().collect();
        for track in tracks {
            for msg in track.messages {
                self.shared.pool.free(msg);
            }
        }

        self.outbound_content.clear();
        self.inbound_content.clear();
        self.inbound_acks.clear();
        self.fragmented_receives.clear();
        self.shared
            .fragmented_sends
            .lock()
            .expect("fragmented sends lock poisoned")
            .clear();
        self.received_packet_ids.clear();
        self.received_reliable.clear();

        self.socket.close();
    }
}

impl Drop for UdpConnectionDriver {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[async_trait]
impl DriveConnection for UdpConnectionDriver {
    async fn update_connection(&mut self) {
        let now = self.clock.now();
        if self.shared.state.get() == ConnectionState::Closed {
            self.teardown();
            return;
        }

        self.accept_outbound_messages();

        if self.shared.state.get() == ConnectionState::Ok
            && !clock::is_newer(self.ping_deadline, now)
        {
            if !self.shared.is_paused() {
                self.send_ping_request(now);
            }
            self.detect_connection_timeout(now);
            self.ping_deadline = now.wrapping_add(self.config().ping_interval.as_micros() as u64);
        }

        if !clock::is_newer(self.stats_deadline, now) {
            self.refresh_stats(now);
            self.stats_deadline =
                now.wrapping_add(self.config().stats_refresh_interval.as_micros() as u64);
        }

        if !clock::is_newer(self.update_deadline, now) {
            self.process_packet_timeouts(now);
            self.rate.update_frame(now);
            self.perform_ack_sends(now);
            self.update_deadline = now.wrapping_add(self.config().update_tick.as_micros() as u64);
        }

        if self.shared.state.get() == ConnectionState::Closed {
            self.teardown();
        }
    }

    async fn read_socket(&mut self) {
        if self.torn_down || !self.socket.is_read_open() {
            return;
        }

        let mut buf = std::mem::take(&mut self.read_buf);
        let mut reads_left = self.config().max_datagrams_per_read;
        let mut total_bytes = 0u64;

        while reads_left > 0 {
            reads_left -= 1;
            match self.socket.try_recv_datagram(&mut buf) {
                Ok(n) => {
                    total_bytes += n as u64;
                    if self.shared.state.get() == ConnectionState::Pending {
                        info!("first datagram from peer - connection established");
                        self.shared.state.set(ConnectionState::Ok);
                    }
                    let now = self.clock.now();
                    self.extract_messages(&buf[..n], now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("socket read error: {}", e);
                    break;
                }
            }
        }
        self.read_buf = buf;

        if reads_left == 0 {
            debug!("datagram read loop throttled to leave room for sending");
        }
        if total_bytes > 0 {
            let now = self.clock.now();
            self.shared
                .stats
                .lock()
                .expect("stats lock poisoned")
                .add_inbound(now, total_bytes, 0, 0);
        }
    }

    async fn send_out_packets(&mut self) {
        if self.torn_down {
            return;
        }
        let mut sends_left = self.config().max_sends_per_tick;
        while sends_left > 0 {
            let now = self.clock.now();
            match self.send_out_packet(now).await {
                SendOutcome::Sent => sends_left -= 1,
                SendOutcome::NoMessages
                | SendOutcome::Throttled
                | SendOutcome::SocketClosed => break,
            }
        }
    }

    fn ticks_until_can_send(&self) -> Option<u64> {
        if self.shared.is_paused() || (self.send_queue.is_empty() && self.accept_rx.is_empty()) {
            return None;
        }
        Some(self.rate.ticks_until_can_send(self.clock.now()))
    }

    fn ticks_until_next_timer(&self) -> u64 {
        let now = self.clock.now();
        let mut next = self.stats_deadline;

        if self.shared.state.get() == ConnectionState::Ok
            && clock::is_newer(next, self.ping_deadline)
        {
            next = self.ping_deadline;
        }
        // the 10 ms engine timer only matters while acks or retransmissions are pending
        if (self.inbound_acks.len() > 0 || !self.ack_tracker.is_empty())
            && clock::is_newer(next, self.update_deadline)
        {
            next = self.update_deadline;
        }

        clock::ticks_in_between(next, now)
    }

    fn is_closed(&self) -> bool {
        self.shared.state.get() == ConnectionState::Closed
    }

    fn socket(&self) -> Arc<dyn DatagramSocket> {
        Arc::clone(&self.socket)
    }
}
