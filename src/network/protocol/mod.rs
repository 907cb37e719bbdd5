//! Per-endpoint protocol.
//!
//! One `UdpProtocol` talks to one remote address, which may host several players
//! (or be a spectator). It runs the handshake, ships local input as delta-encoded
//! bundles until they are acknowledged, measures ping and frame advantage, and
//! watches for silence.

mod input_bytes;
mod state;

use input_bytes::InputBytes;
pub(crate) use state::ProtocolState;

use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::frame_info::PlayerInput;
use crate::network::codec;
use crate::network::compression;
use crate::network::messages::{
    ChecksumReport, ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader,
    QualityReply, QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::report_violation;
use crate::rng::{self, Pcg32};
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::time_sync::{TimeSync, TimeSyncConfig};
use crate::{
    DesyncDetection, Frame, NonBlockingSocket, PeerAddress, PlayerHandle, PlayerStatus,
    SessionError,
};

const UDP_HEADER_SIZE: usize = 28;

/// Wall clock in milliseconds, comparable across machines. `None` if the clock
/// reads before the epoch.
fn millis_since_epoch() -> Option<u128> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(duration) => Some(duration.as_millis()),
            Err(_) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::InternalError,
                    "system time is before UNIX_EPOCH"
                );
                None
            },
        }
    }
    #[cfg(target_arch = "wasm32")]
    {
        let time = js_sys::Date::new_0().get_time();
        if time >= 0.0 {
            Some(time as u128)
        } else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InternalError,
                "Date.getTime() returned a negative value"
            );
            None
        }
    }
}

/// Settings shared by every endpoint of a session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointSettings {
    pub num_players: usize,
    pub max_prediction: usize,
    pub fps: usize,
    pub disconnect_timeout: Duration,
    pub disconnect_notify_start: Duration,
    pub desync_detection: DesyncDetection,
    pub sync_config: SyncConfig,
    pub protocol_config: ProtocolConfig,
    pub time_sync_config: TimeSyncConfig,
}

/// What an endpoint reports back to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProtocolEvent {
    /// The first handshake reply arrived.
    Connected,
    Synchronizing {
        total: u32,
        count: u32,
    },
    Synchronized,
    Input {
        input: PlayerInput,
        player: PlayerHandle,
    },
    Disconnected,
    NetworkInterrupted {
        disconnect_timeout: u64,
    },
    NetworkResumed,
}

pub(crate) struct UdpProtocol {
    handles: Vec<PlayerHandle>,
    settings: EndpointSettings,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<ProtocolEvent>,

    // state
    state: ProtocolState,
    connected: bool,
    sync_remaining_roundtrips: u32,
    sync_random_requests: BTreeSet<u32>,
    sync_requests_sent: u32,
    sync_retry_warning_sent: bool,
    sync_duration_warning_sent: bool,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,
    shutdown_timeout: Instant,
    magic: u16,

    // the other client
    peer_addr: PeerAddress,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // input compression
    pending_output: VecDeque<InputBytes>,
    last_acked_input: InputBytes,
    recv_inputs: BTreeMap<Frame, InputBytes>,
    first_recv_frame: Frame,

    // time sync
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    stats_start_time: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    round_trip_time: u128,
    last_send_time: Instant,
    last_recv_time: Instant,

    // desync detection
    pending_checksums: BTreeMap<Frame, u64>,

    rng: Option<Pcg32>,
}

impl PartialEq for UdpProtocol {
    fn eq(&self, other: &Self) -> bool {
        self.peer_addr == other.peer_addr
    }
}

impl std::fmt::Debug for UdpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpProtocol")
            .field("peer_addr", &self.peer_addr)
            .field("handles", &self.handles)
            .field("state", &self.state)
            .field("pending_output", &self.pending_output.len())
            .finish_non_exhaustive()
    }
}

impl UdpProtocol {
    pub(crate) fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: PeerAddress,
        settings: EndpointSettings,
    ) -> Self {
        let mut rng = settings.protocol_config.rng_seed.map(Pcg32::seed_from_u64);
        let mut magic = 0;
        while magic == 0 {
            magic = match &mut rng {
                Some(rng) => rng.next_u16(),
                None => (rng::random_u32() >> 16) as u16,
            };
        }

        handles.sort_unstable_by_key(|h| h.index());
        let now = Instant::now();

        Self {
            handles,
            settings,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            state: ProtocolState::Initializing,
            connected: false,
            sync_remaining_roundtrips: settings.sync_config.num_sync_packets,
            sync_random_requests: BTreeSet::new(),
            sync_requests_sent: 0,
            sync_retry_warning_sent: false,
            sync_duration_warning_sent: false,
            running_last_quality_report: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,
            shutdown_timeout: now,
            magic,

            peer_addr,
            remote_magic: 0,
            peer_connect_status: vec![ConnectionStatus::default(); settings.num_players],

            pending_output: VecDeque::new(),
            last_acked_input: InputBytes::zeroed(0),
            recv_inputs: BTreeMap::new(),
            first_recv_frame: Frame::NULL,

            time_sync: TimeSync::with_config(settings.time_sync_config),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            stats_start_time: now,
            packets_sent: 0,
            bytes_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,

            pending_checksums: BTreeMap::new(),
            rng,
        }
    }

    /// Registers another player hosted at the same address. Only meaningful before
    /// any input has been received.
    pub(crate) fn add_handle(&mut self, handle: PlayerHandle) {
        if !self.recv_inputs.is_empty() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "{} added to endpoint {} after input arrived",
                handle,
                self.peer_addr
            );
        }
        self.handles.push(handle);
        self.handles.sort_unstable_by_key(|h| h.index());
    }

    pub(crate) fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    pub(crate) fn peer_addr(&self) -> PeerAddress {
        self.peer_addr
    }

    pub(crate) fn magic(&self) -> u16 {
        self.magic
    }

    pub(crate) fn state(&self) -> ProtocolState {
        self.state
    }

    pub(crate) fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.settings.disconnect_timeout = timeout;
    }

    pub(crate) fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.settings.disconnect_notify_start = notify_start;
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::Running | ProtocolState::Disconnected | ProtocolState::Shutdown
        )
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    pub(crate) fn is_handling_message(&self, addr: &PeerAddress) -> bool {
        self.peer_addr == *addr
    }

    /// Connection status as seen by this peer.
    pub(crate) fn player_status(&self) -> PlayerStatus {
        match self.state {
            ProtocolState::Initializing => PlayerStatus::Connecting,
            ProtocolState::Synchronizing if !self.connected => PlayerStatus::Connecting,
            ProtocolState::Synchronizing => PlayerStatus::Synchronizing,
            ProtocolState::Running if self.disconnect_notify_sent => PlayerStatus::Interrupted,
            ProtocolState::Running => PlayerStatus::Running,
            ProtocolState::Disconnected | ProtocolState::Shutdown => PlayerStatus::Disconnected,
        }
    }

    /// What the peer last told us about player `index`.
    pub(crate) fn peer_connect_status(&self, index: usize) -> ConnectionStatus {
        self.peer_connect_status
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    /// Newest frame received from the peer.
    pub(crate) fn last_recv_frame(&self) -> Frame {
        self.recv_inputs
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Frame::NULL)
    }

    pub(crate) fn average_frame_advantage(&self) -> i32 {
        self.time_sync.average_frame_advantage()
    }

    /// Estimates how far the peer runs ahead, from its newest input plus half a ping.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        let last_recv = self.last_recv_frame();
        if local_frame.is_null() || last_recv.is_null() {
            return;
        }
        let ping = i32::try_from(self.round_trip_time / 2).unwrap_or(i32::MAX);
        let fps = i32::try_from(self.settings.fps).unwrap_or(i32::MAX);
        let remote_frame = last_recv + ping.saturating_mul(fps) / 1000;
        self.local_frame_advantage = remote_frame - local_frame;
    }

    pub(crate) fn network_stats(&self) -> Result<NetworkStats, SessionError> {
        if !matches!(
            self.state,
            ProtocolState::Synchronizing | ProtocolState::Running
        ) {
            return Err(SessionError::NotSynchronized);
        }
        let seconds = self.stats_start_time.elapsed().as_secs();
        if seconds == 0 {
            return Err(SessionError::NotSynchronized);
        }

        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;
        let bytes_per_second = total_bytes_sent / seconds as usize;

        Ok(NetworkStats {
            send_queue_len: self.pending_output.len(),
            recv_queue_len: 0,
            ping: self.round_trip_time,
            kbps_sent: bytes_per_second / 1024,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        })
    }

    /// Checksums the peer reported, oldest first.
    pub(crate) fn pending_checksums(&self) -> &BTreeMap<Frame, u64> {
        &self.pending_checksums
    }

    pub(crate) fn forget_checksums_through(&mut self, frame: Frame) {
        self.pending_checksums.retain(|&f, _| f > frame);
    }

    pub(crate) fn disconnect(&mut self) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        self.state = ProtocolState::Disconnected;
        self.shutdown_timeout = Instant::now() + self.settings.protocol_config.shutdown_delay;
    }

    /// Starts the handshake.
    pub(crate) fn synchronize(&mut self) -> Result<(), SessionError> {
        if self.state != ProtocolState::Initializing {
            return Err(SessionError::invalid_request(format!(
                "endpoint {} is {}, not Initializing",
                self.peer_addr, self.state
            )));
        }
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = self.settings.sync_config.num_sync_packets;
        self.stats_start_time = Instant::now();
        self.send_sync_request();
        Ok(())
    }

    /// Runs the timers and hands out the events gathered since the last poll.
    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, ProtocolEvent> {
        let now = Instant::now();
        let sync = self.settings.sync_config;
        match self.state {
            ProtocolState::Synchronizing => {
                if self.last_send_time + sync.sync_retry_interval < now {
                    self.send_sync_request();
                }
            },
            ProtocolState::Running => {
                if self.running_last_input_recv + sync.running_retry_interval < now {
                    self.send_pending_output(connect_status);
                    self.running_last_input_recv = now;
                }

                if self.running_last_quality_report
                    + self.settings.protocol_config.quality_report_interval
                    < now
                {
                    self.send_quality_report();
                }

                if self.last_send_time + sync.keepalive_interval < now {
                    self.send_keep_alive();
                }

                let notify_start = self.settings.disconnect_notify_start;
                let timeout = self.settings.disconnect_timeout;
                if !self.disconnect_notify_sent && self.last_recv_time + notify_start < now {
                    let remaining = timeout.saturating_sub(notify_start);
                    self.event_queue.push_back(ProtocolEvent::NetworkInterrupted {
                        disconnect_timeout: u64::try_from(remaining.as_millis())
                            .unwrap_or(u64::MAX),
                    });
                    self.disconnect_notify_sent = true;
                }

                if !self.disconnect_event_sent && self.last_recv_time + timeout < now {
                    self.event_queue.push_back(ProtocolEvent::Disconnected);
                    self.disconnect_event_sent = true;
                }
            },
            ProtocolState::Disconnected => {
                if self.shutdown_timeout < now {
                    debug!("endpoint {} shut down", self.peer_addr);
                    self.state = ProtocolState::Shutdown;
                }
            },
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }
        self.event_queue.drain(..)
    }

    /*
     *  SENDING MESSAGES
     */

    pub(crate) fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket) {
        if self.state == ProtocolState::Shutdown {
            trace!(
                "endpoint {} shut down; dropping {} messages",
                self.peer_addr,
                self.send_queue.len()
            );
            self.send_queue.clear();
            return;
        }
        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Queues the inputs of one frame, in player order, and sends everything unacknowledged.
    pub(crate) fn send_input(
        &mut self,
        frame: Frame,
        inputs: &[i64],
        connect_status: &[ConnectionStatus],
    ) {
        if self.state != ProtocolState::Running {
            return;
        }

        self.time_sync.advance_frame(
            frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );
        self.pending_output
            .push_back(InputBytes::from_inputs(frame, inputs));

        // players stop at the prediction threshold; only a spectator that stopped
        // acknowledging gets here
        if self.pending_output.len() > self.settings.protocol_config.pending_output_limit
            && !self.disconnect_event_sent
        {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "{} unacknowledged inputs for {}; dropping the endpoint",
                self.pending_output.len(),
                self.peer_addr
            );
            self.event_queue.push_back(ProtocolEvent::Disconnected);
            self.disconnect_event_sent = true;
        }

        self.send_pending_output(connect_status);
    }

    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus]) {
        let Some(front) = self.pending_output.front() else {
            return;
        };

        let reference = if self.last_acked_input.frame.is_null() {
            InputBytes::zeroed(front.bytes.len() / std::mem::size_of::<i64>()).bytes
        } else {
            if self.last_acked_input.frame + 1 != front.frame {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "pending input starts at frame {}, last acked was {}",
                    front.frame,
                    self.last_acked_input.frame
                );
                return;
            }
            self.last_acked_input.bytes.clone()
        };

        let body = Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested: self.state == ProtocolState::Disconnected,
            start_frame: front.frame,
            ack_frame: self.last_recv_frame(),
            bytes: compression::encode(
                &reference,
                self.pending_output.iter().map(|record| record.bytes.as_slice()),
            ),
        };
        self.queue_message(MessageBody::Input(body));
    }

    fn send_input_ack(&mut self) {
        let body = InputAck {
            ack_frame: self.last_recv_frame(),
        };
        self.queue_message(MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self) {
        self.sync_requests_sent += 1;
        let config = self.settings.protocol_config;

        if !self.sync_retry_warning_sent
            && self.sync_requests_sent > config.sync_retry_warning_threshold
        {
            self.sync_retry_warning_sent = true;
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Synchronization,
                "{} handshake requests sent to {} (threshold {}); packet loss is likely",
                self.sync_requests_sent,
                self.peer_addr,
                config.sync_retry_warning_threshold
            );
        }

        let elapsed_ms = self.stats_start_time.elapsed().as_millis();
        if !self.sync_duration_warning_sent && elapsed_ms > config.sync_duration_warning_ms {
            self.sync_duration_warning_sent = true;
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Synchronization,
                "handshake with {} running for {}ms (threshold {}ms)",
                self.peer_addr,
                elapsed_ms,
                config.sync_duration_warning_ms
            );
        }

        let random_request = match &mut self.rng {
            Some(rng) => rng.next_u32(),
            None => rng::random_u32(),
        };
        self.sync_random_requests.insert(random_request);
        self.queue_message(MessageBody::SyncRequest(SyncRequest { random_request }));
    }

    fn send_quality_report(&mut self) {
        self.running_last_quality_report = Instant::now();
        let Some(ping) = millis_since_epoch() else {
            return;
        };
        let frame_advantage = i16::try_from(
            self.local_frame_advantage
                .clamp(i32::from(i16::MIN), i32::from(i16::MAX)),
        )
        .unwrap_or(0);
        self.queue_message(MessageBody::QualityReport(QualityReport {
            frame_advantage,
            ping,
        }));
    }

    pub(crate) fn send_checksum_report(&mut self, frame: Frame, checksum: u64) {
        self.queue_message(MessageBody::ChecksumReport(ChecksumReport { frame, checksum }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        trace!("queuing {:?} for {}", body, self.peer_addr);
        let msg = Message {
            header: MessageHeader { magic: self.magic },
            body,
        };

        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.bytes_sent += codec::encode(&msg).map_or(0, |bytes| bytes.len());
        self.send_queue.push_back(msg);
    }

    /*
     *  RECEIVING MESSAGES
     */

    pub(crate) fn handle_message(&mut self, msg: &Message) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        // once synchronized, only the peer's own magic is accepted
        if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
            trace!("dropping {} from {} with foreign magic", msg.kind(), self.peer_addr);
            return;
        }

        self.last_recv_time = Instant::now();

        if self.disconnect_notify_sent && self.state == ProtocolState::Running {
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(ProtocolEvent::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.pop_pending_output(body.ack_frame),
            MessageBody::QualityReport(body) => self.on_quality_report(*body),
            MessageBody::QualityReply(body) => self.on_quality_reply(*body),
            MessageBody::ChecksumReport(body) => self.on_checksum_report(*body),
            MessageBody::KeepAlive => (),
        }
    }

    fn on_sync_request(&mut self, body: SyncRequest) {
        self.queue_message(MessageBody::SyncReply(SyncReply {
            random_reply: body.random_request,
        }));
    }

    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != ProtocolState::Synchronizing {
            return;
        }
        if !self.sync_random_requests.remove(&body.random_reply) {
            return;
        }

        if !self.connected {
            self.connected = true;
            self.event_queue.push_back(ProtocolEvent::Connected);
        }

        self.sync_remaining_roundtrips = self.sync_remaining_roundtrips.saturating_sub(1);
        let total = self.settings.sync_config.num_sync_packets;
        if self.sync_remaining_roundtrips > 0 {
            self.event_queue.push_back(ProtocolEvent::Synchronizing {
                total,
                count: total - self.sync_remaining_roundtrips,
            });
            self.send_sync_request();
        } else {
            debug!(
                "synchronized with {} after {} requests",
                self.peer_addr, self.sync_requests_sent
            );
            self.state = ProtocolState::Running;
            self.event_queue.push_back(ProtocolEvent::Synchronized);
            self.remote_magic = header.magic;
        }
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(front) = self.pending_output.front() {
            if front.frame > ack_frame {
                break;
            }
            if let Some(acked) = self.pending_output.pop_front() {
                self.last_acked_input = acked;
            }
        }
    }

    fn on_input(&mut self, body: &Input) {
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                self.event_queue.push_back(ProtocolEvent::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.disconnected |= remote.disconnected;
                local.last_frame = std::cmp::max(local.last_frame, remote.last_frame);
            }
        }

        let last_recv = self.last_recv_frame();
        // the bundle starts after a frame we never got; wait for a retransmission
        if !last_recv.is_null() && last_recv + 1 < body.start_frame {
            trace!(
                "bundle from {} starts at {} but last received is {}",
                self.peer_addr,
                body.start_frame,
                last_recv
            );
            return;
        }

        // the sender encodes against blanks until its first frame is acknowledged
        let reference = if last_recv.is_null() || body.start_frame == self.first_recv_frame {
            InputBytes::zeroed(self.handles.len())
        } else {
            match self.recv_inputs.get(&(body.start_frame - 1)) {
                Some(reference) => reference.clone(),
                None => return,
            }
        };

        let records = match compression::decode(&reference.bytes, &body.bytes) {
            Ok(records) => records,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "undecodable input bundle from {}: {}",
                    self.peer_addr,
                    e
                );
                return;
            },
        };
        self.running_last_input_recv = Instant::now();

        for (offset, bytes) in records.into_iter().enumerate() {
            let frame = body.start_frame + offset as i32;
            if frame <= self.last_recv_frame() {
                continue;
            }
            let record = InputBytes { frame, bytes };
            let Some(inputs) = record.to_inputs(self.handles.len()) else {
                return;
            };
            if self.first_recv_frame.is_null() {
                self.first_recv_frame = frame;
            }
            self.recv_inputs.insert(frame, record);
            for (&player, input) in self.handles.iter().zip(inputs) {
                self.event_queue.push_back(ProtocolEvent::Input {
                    input: PlayerInput::new(frame, input),
                    player,
                });
            }
        }

        self.send_input_ack();

        let history = (self.settings.protocol_config.input_history_multiplier
            * self.settings.max_prediction) as i32;
        let oldest = self.last_recv_frame() - history;
        self.recv_inputs.retain(|&frame, _| frame >= oldest);
    }

    fn on_quality_report(&mut self, body: QualityReport) {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        self.queue_message(MessageBody::QualityReply(QualityReply { pong: body.ping }));
    }

    fn on_quality_reply(&mut self, body: QualityReply) {
        if let Some(now) = millis_since_epoch() {
            self.round_trip_time = now.saturating_sub(body.pong);
        }
    }

    fn on_checksum_report(&mut self, body: ChecksumReport) {
        let DesyncDetection::On { interval } = self.settings.desync_detection else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Configuration,
                "checksum report from {} while desync detection is off",
                self.peer_addr
            );
            return;
        };

        let max_history = self.settings.protocol_config.max_checksum_history;
        if self.pending_checksums.len() >= max_history {
            let span = (max_history as i32 - 1).saturating_mul(interval as i32);
            let oldest = body.frame - span;
            self.pending_checksums.retain(|&frame, _| frame >= oldest);
        }
        self.pending_checksums.insert(body.frame, body.checksum);
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn settings() -> EndpointSettings {
        EndpointSettings {
            num_players: 2,
            max_prediction: 8,
            fps: 60,
            disconnect_timeout: Duration::from_millis(2000),
            disconnect_notify_start: Duration::from_millis(500),
            desync_detection: DesyncDetection::On { interval: 10 },
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::deterministic(7),
            time_sync_config: TimeSyncConfig::default(),
        }
    }

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::Ip(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn endpoint(index: u32, port: u16) -> UdpProtocol {
        UdpProtocol::new(vec![PlayerHandle::new(index, 0)], addr(port), settings())
    }

    /// Delivers every queued message of `from` to `to`.
    fn deliver(from: &mut UdpProtocol, to: &mut UdpProtocol) -> usize {
        let msgs: Vec<Message> = from.send_queue.drain(..).collect();
        for msg in &msgs {
            to.handle_message(msg);
        }
        msgs.len()
    }

    fn events(endpoint: &mut UdpProtocol) -> Vec<ProtocolEvent> {
        let status = vec![ConnectionStatus::default(); 2];
        endpoint.poll(&status).collect()
    }

    /// Two endpoints that completed the handshake with each other.
    fn running_pair() -> (UdpProtocol, UdpProtocol) {
        let mut a = endpoint(1, 7001);
        let mut b = UdpProtocol::new(
            vec![PlayerHandle::new(0, 0)],
            addr(7000),
            EndpointSettings {
                protocol_config: ProtocolConfig::deterministic(8),
                ..settings()
            },
        );
        a.synchronize().unwrap();
        b.synchronize().unwrap();
        for _ in 0..20 {
            deliver(&mut a, &mut b);
            deliver(&mut b, &mut a);
        }
        assert!(a.is_running() && b.is_running());
        events(&mut a);
        events(&mut b);
        (a, b)
    }

    #[test]
    fn starts_initializing() {
        let ep = endpoint(1, 7001);
        assert_eq!(ep.state(), ProtocolState::Initializing);
        assert_eq!(ep.player_status(), PlayerStatus::Connecting);
        assert_ne!(ep.magic(), 0);
        assert!(ep.last_recv_frame().is_null());
    }

    #[test]
    fn synchronize_only_once() {
        let mut ep = endpoint(1, 7001);
        ep.synchronize().unwrap();
        assert_eq!(ep.state(), ProtocolState::Synchronizing);
        assert_eq!(ep.send_queue.len(), 1);
        assert!(ep.synchronize().is_err());
    }

    #[test]
    fn same_seed_same_magic() {
        assert_eq!(endpoint(1, 7001).magic(), endpoint(1, 7001).magic());
    }

    #[test]
    fn handshake_reports_progress() {
        let mut a = endpoint(1, 7001);
        let mut b = endpoint(0, 7000);
        a.synchronize().unwrap();

        for _ in 0..5 {
            deliver(&mut a, &mut b);
            deliver(&mut b, &mut a);
        }
        let evs = events(&mut a);
        assert_eq!(evs[0], ProtocolEvent::Connected);
        assert_eq!(
            evs[1],
            ProtocolEvent::Synchronizing { total: 5, count: 1 }
        );
        assert_eq!(evs.last(), Some(&ProtocolEvent::Synchronized));
        assert_eq!(
            evs.iter()
                .filter(|e| matches!(e, ProtocolEvent::Synchronizing { .. }))
                .count(),
            4
        );
        assert!(a.is_running());
        assert_eq!(a.player_status(), PlayerStatus::Running);
    }

    #[test]
    fn unknown_sync_reply_is_ignored() {
        let mut ep = endpoint(1, 7001);
        ep.synchronize().unwrap();
        ep.handle_message(&Message {
            header: MessageHeader { magic: 3 },
            body: MessageBody::SyncReply(SyncReply { random_reply: 0xDEAD }),
        });
        assert_eq!(ep.state(), ProtocolState::Synchronizing);
        assert!(events(&mut ep).is_empty());
    }

    #[test]
    fn foreign_magic_ignored_after_sync() {
        let (mut a, _b) = running_pair();
        let before = a.pending_checksums().len();
        a.handle_message(&Message {
            header: MessageHeader { magic: a.remote_magic.wrapping_add(1) },
            body: MessageBody::ChecksumReport(ChecksumReport {
                frame: Frame::new(10),
                checksum: 1,
            }),
        });
        assert_eq!(a.pending_checksums().len(), before);
    }

    #[test]
    fn inputs_flow_and_get_acked() {
        let (mut a, mut b) = running_pair();
        let status = vec![ConnectionStatus::default(); 2];
        for frame in 0..3 {
            a.send_input(Frame::new(frame), &[10 + i64::from(frame)], &status);
        }
        assert_eq!(a.pending_output.len(), 3);

        deliver(&mut a, &mut b);
        let received: Vec<PlayerInput> = events(&mut b)
            .into_iter()
            .filter_map(|e| match e {
                ProtocolEvent::Input { input, player } => {
                    assert_eq!(player, PlayerHandle::new(1, 0));
                    Some(input)
                },
                _ => None,
            })
            .collect();
        assert_eq!(
            received,
            vec![
                PlayerInput::new(Frame::new(0), 10),
                PlayerInput::new(Frame::new(1), 11),
                PlayerInput::new(Frame::new(2), 12),
            ]
        );
        assert_eq!(b.last_recv_frame(), Frame::new(2));

        deliver(&mut b, &mut a);
        assert!(a.pending_output.is_empty());
        assert_eq!(a.last_acked_input.frame, Frame::new(2));

        // the next bundle is encoded against the acked frame
        a.send_input(Frame::new(3), &[13], &status);
        deliver(&mut a, &mut b);
        assert!(events(&mut b).contains(&ProtocolEvent::Input {
            input: PlayerInput::new(Frame::new(3), 13),
            player: PlayerHandle::new(1, 0),
        }));
    }

    #[test]
    fn duplicate_bundles_are_not_replayed() {
        let (mut a, mut b) = running_pair();
        let status = vec![ConnectionStatus::default(); 2];
        a.send_input(Frame::new(0), &[1], &status);
        let msg = a.send_queue.back().cloned().unwrap();
        deliver(&mut a, &mut b);
        b.handle_message(&msg);
        let inputs = events(&mut b)
            .into_iter()
            .filter(|e| matches!(e, ProtocolEvent::Input { .. }))
            .count();
        assert_eq!(inputs, 1);
    }

    #[test]
    fn bundle_after_gap_is_dropped() {
        let (mut a, mut b) = running_pair();
        let status = vec![ConnectionStatus::default(); 2];
        a.send_input(Frame::new(0), &[1], &status);
        deliver(&mut a, &mut b);
        // frames 1 and 2 count as acknowledged but never reached b
        a.pending_output.clear();
        a.last_acked_input = InputBytes::from_inputs(Frame::new(2), &[1]);
        a.send_input(Frame::new(3), &[5], &status);
        deliver(&mut a, &mut b);
        assert_eq!(b.last_recv_frame(), Frame::new(0));
    }

    #[test]
    fn peer_disconnect_request_is_reported_once() {
        let (mut a, mut b) = running_pair();
        let status = vec![ConnectionStatus::default(); 2];
        a.send_input(Frame::new(0), &[1], &status);
        a.disconnect();
        a.send_pending_output(&status);
        a.send_pending_output(&status);
        deliver(&mut a, &mut b);
        let disconnects = events(&mut b)
            .into_iter()
            .filter(|e| *e == ProtocolEvent::Disconnected)
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(a.player_status(), PlayerStatus::Disconnected);
    }

    #[test]
    fn quality_report_answers_and_measures() {
        let (mut a, mut b) = running_pair();
        a.local_frame_advantage = 3;
        a.send_quality_report();
        deliver(&mut a, &mut b);
        assert_eq!(b.remote_frame_advantage, 3);
        assert!(matches!(
            b.send_queue.back().map(|m| &m.body),
            Some(MessageBody::QualityReply(_))
        ));
        deliver(&mut b, &mut a);
        assert!(a.round_trip_time < 1000);
    }

    #[test]
    fn checksum_history_is_bounded() {
        let (mut a, mut b) = running_pair();
        for i in 0..40 {
            a.send_checksum_report(Frame::new(i * 10), i as u64);
        }
        deliver(&mut a, &mut b);
        let kept = b.pending_checksums();
        assert!(kept.len() <= 32);
        assert_eq!(kept.get(&Frame::new(390)), Some(&39));
        b.forget_checksums_through(Frame::new(380));
        assert_eq!(b.pending_checksums().len(), 1);
    }

    #[test]
    fn silence_interrupts_then_disconnects() {
        let (mut a, mut b) = running_pair();
        a.set_disconnect_notify_start(Duration::from_millis(50));
        a.set_disconnect_timeout(Duration::from_millis(400));

        std::thread::sleep(std::time::Duration::from_millis(80));
        let evs = events(&mut a);
        assert!(evs.contains(&ProtocolEvent::NetworkInterrupted {
            disconnect_timeout: 350
        }));
        assert_eq!(a.player_status(), PlayerStatus::Interrupted);
        assert!(events(&mut a).is_empty(), "interrupt is reported once");

        b.send_keep_alive();
        deliver(&mut b, &mut a);
        assert_eq!(events(&mut a), vec![ProtocolEvent::NetworkResumed]);
        assert_eq!(a.player_status(), PlayerStatus::Running);

        std::thread::sleep(std::time::Duration::from_millis(450));
        let evs = events(&mut a);
        assert!(evs.contains(&ProtocolEvent::Disconnected));
        assert!(!events(&mut a).contains(&ProtocolEvent::Disconnected));
    }

    #[test]
    fn network_stats_need_time() {
        let ep = endpoint(1, 7001);
        assert_eq!(ep.network_stats(), Err(SessionError::NotSynchronized));
        let (a, _b) = running_pair();
        assert_eq!(a.network_stats(), Err(SessionError::NotSynchronized));
    }

    #[test]
    fn frame_advantage_uses_half_ping() {
        let (mut a, mut b) = running_pair();
        let status = vec![ConnectionStatus::default(); 2];
        b.send_input(Frame::new(0), &[0], &status);
        for f in 1..=10 {
            b.send_input(Frame::new(f), &[0], &status);
        }
        deliver(&mut b, &mut a);
        a.round_trip_time = 100;
        a.update_local_frame_advantage(Frame::new(4));
        // remote at 10 plus 50ms at 60fps (3 frames)
        assert_eq!(a.local_frame_advantage, 9);
    }

    #[test]
    fn second_handle_widens_records() {
        let mut ep = endpoint(2, 7001);
        ep.add_handle(PlayerHandle::new(1, 0));
        assert_eq!(
            ep.handles(),
            &[PlayerHandle::new(1, 0), PlayerHandle::new(2, 0)]
        );
    }
}
