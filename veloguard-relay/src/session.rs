//! Per-flow relay session state
//!
//! A [`Session`] terminates one client flow from the tunnel and owns the real
//! outbound channel for it. All sequence arithmetic is modulo 2^32.

use crate::channel::OutboundChannel;
use crate::packet::{ReplyTemplate, TIMESTAMP_OPTION_LEN};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// `a` is at or ahead of `b` in sequence space
#[inline]
pub fn seq_after_eq(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) < 0x8000_0000
}

/// `a` is strictly ahead of `b` in sequence space
#[inline]
pub fn seq_after(a: u32, b: u32) -> bool {
    a != b && seq_after_eq(a, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Identity of one client flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Virtual address and port inside the tunnel
    pub client: SocketAddrV4,
    /// Real destination
    pub remote: SocketAddrV4,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn tcp(client: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { client, remote, protocol: Protocol::Tcp }
    }

    pub fn udp(client: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { client, remote, protocol: Protocol::Udp }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{} {} -> {}", proto, self.client, self.remote)
    }
}

/// Server-role TCP state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynReceived,
    Established,
    /// Client sent FIN, ours is still due
    CloseWait,
    /// Our FIN is out, waiting for the remaining FIN/ACK exchange
    Closing,
    Aborting,
    Terminated,
}

impl TcpState {
    pub fn is_final(&self) -> bool {
        matches!(self, TcpState::Aborting | TcpState::Terminated)
    }

    /// States in which remote bytes may be forwarded to the client
    pub fn can_send_data(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Parameters captured from the client's SYN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynParams {
    pub client_isn: u32,
    pub window: u16,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    /// Client TSval if the SYN carried timestamps
    pub timestamp: Option<u32>,
}

/// Outcome of offering client payload to the receive side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// Number of new bytes appended to the ingress queue
    Accepted(usize),
    /// Every byte was already received
    Duplicate,
    /// Segment starts beyond the next expected byte
    OutOfOrder,
}

/// Outcome of an acknowledgment number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Advanced the unacknowledged edge by this many sequence numbers
    Advanced(u32),
    Duplicate,
    /// Outside `[send_unacked, send_next]`
    Rejected,
}

/// Sequence state, buffers and close flags, guarded by the session lock
#[derive(Debug)]
pub struct TcpControl {
    state: TcpState,
    iss: u32,
    client_isn: u32,
    send_next: u32,
    send_unacked: u32,
    recv_next: u32,
    /// Last advertised client window, already scaled
    client_window: u32,
    client_window_shift: u8,
    /// Our window scale shift, only set when the client offered scaling
    local_window_shift: Option<u8>,
    mss: u16,
    ts_recent: Option<u32>,
    egress: BytesMut,
    ingress: VecDeque<Bytes>,
    ingress_len: usize,
    client_fin: bool,
    remote_eof: bool,
    fin_sent: bool,
    fin_pending: bool,
    write_shutdown: bool,
    read_stalled: bool,
    duplicate_acks: u32,
}

impl TcpControl {
    /// Control block for a flow without a handshake (UDP)
    pub fn datagram() -> Self {
        Self::with_iss(0, 0)
    }

    fn with_iss(iss: u32, client_isn: u32) -> Self {
        Self {
            state: TcpState::Closed,
            iss,
            client_isn,
            send_next: iss,
            send_unacked: iss,
            recv_next: client_isn,
            client_window: 0,
            client_window_shift: 0,
            local_window_shift: None,
            mss: 0,
            ts_recent: None,
            egress: BytesMut::new(),
            ingress: VecDeque::new(),
            ingress_len: 0,
            client_fin: false,
            remote_eof: false,
            fin_sent: false,
            fin_pending: false,
            write_shutdown: false,
            read_stalled: false,
            duplicate_acks: 0,
        }
    }

    /// Passive open: the SYN is consumed and a SYN-ACK is due.
    ///
    /// `local_shift` is our window scale, echoed only when the client offered
    /// scaling. The SYN window itself is never scaled.
    pub fn passive_open(iss: u32, syn: &SynParams, max_mss: u16, default_mss: u16, local_shift: u8) -> Self {
        let mut ctl = Self::with_iss(iss, syn.client_isn);
        ctl.recv_next = syn.client_isn.wrapping_add(1);
        ctl.state = TcpState::SynReceived;
        ctl.send_next = iss.wrapping_add(1);
        ctl.client_window = u32::from(syn.window);
        ctl.client_window_shift = syn.window_scale.map(|s| s.min(14)).unwrap_or(0);
        ctl.local_window_shift = syn.window_scale.map(|_| local_shift.min(14));
        ctl.mss = syn.mss.unwrap_or(default_mss).min(max_mss);
        ctl.ts_recent = syn.timestamp;
        ctl
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn set_state(&mut self, state: TcpState) {
        self.state = state;
    }

    pub fn iss(&self) -> u32 {
        self.iss
    }

    /// Initial sequence number from the client's SYN
    pub fn client_isn(&self) -> u32 {
        self.client_isn
    }

    pub fn send_next(&self) -> u32 {
        self.send_next
    }

    pub fn send_unacked(&self) -> u32 {
        self.send_unacked
    }

    pub fn recv_next(&self) -> u32 {
        self.recv_next
    }

    pub fn client_window(&self) -> u32 {
        self.client_window
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn local_window_shift(&self) -> Option<u8> {
        self.local_window_shift
    }

    pub fn timestamps_enabled(&self) -> bool {
        self.ts_recent.is_some()
    }

    /// Sequence numbers sent but not yet acknowledged
    pub fn in_flight(&self) -> u32 {
        self.send_next.wrapping_sub(self.send_unacked)
    }

    /// Room left in the client's advertised window
    pub fn window_available(&self) -> u32 {
        self.client_window.saturating_sub(self.in_flight())
    }

    /// Largest payload per reply segment
    pub fn max_payload(&self) -> usize {
        let overhead = if self.timestamps_enabled() { TIMESTAMP_OPTION_LEN } else { 0 };
        usize::from(self.mss).saturating_sub(overhead).max(1)
    }

    /// Remember the client's TSval for the echo field of our replies
    pub fn note_client_timestamp(&mut self, timestamp: Option<u32>) {
        if let (Some(_), Some(ts_val)) = (self.ts_recent, timestamp) {
            self.ts_recent = Some(ts_val);
        }
    }

    /// Process an acknowledgment number and the accompanying window field.
    ///
    /// Accepted iff `send_unacked <= ack <= send_next` in sequence space.
    pub fn accept_ack(&mut self, ack: u32, window: u16) -> AckOutcome {
        if !(seq_after_eq(ack, self.send_unacked) && seq_after_eq(self.send_next, ack)) {
            return AckOutcome::Rejected;
        }
        self.client_window = u32::from(window) << self.client_window_shift;
        if self.state == TcpState::SynReceived && ack == self.iss.wrapping_add(1) {
            self.state = TcpState::Established;
        }
        let advanced = ack.wrapping_sub(self.send_unacked);
        self.send_unacked = ack;
        if advanced == 0 {
            if self.in_flight() > 0 {
                self.duplicate_acks += 1;
            }
            AckOutcome::Duplicate
        } else {
            self.duplicate_acks = 0;
            AckOutcome::Advanced(advanced)
        }
    }

    /// Append only the bytes beyond `recv_next` to the ingress queue
    pub fn accept_payload(&mut self, seq: u32, payload: &[u8]) -> PayloadOutcome {
        if payload.is_empty() || self.client_fin {
            return PayloadOutcome::Duplicate;
        }
        let end = seq.wrapping_add(payload.len() as u32);
        if seq_after_eq(self.recv_next, end) {
            return PayloadOutcome::Duplicate;
        }
        if seq_after(seq, self.recv_next) {
            return PayloadOutcome::OutOfOrder;
        }
        let skip = self.recv_next.wrapping_sub(seq) as usize;
        let fresh = &payload[skip..];
        self.push_ingress(Bytes::copy_from_slice(fresh));
        self.recv_next = self.recv_next.wrapping_add(fresh.len() as u32);
        PayloadOutcome::Accepted(fresh.len())
    }

    /// Accept the client's FIN if every byte before it has arrived
    pub fn accept_fin(&mut self, fin_seq: u32) -> bool {
        if self.client_fin || fin_seq != self.recv_next {
            return false;
        }
        self.recv_next = self.recv_next.wrapping_add(1);
        self.client_fin = true;
        if !self.state.is_final() {
            self.state = if self.fin_sent { TcpState::Closing } else { TcpState::CloseWait };
        }
        true
    }

    pub fn client_fin(&self) -> bool {
        self.client_fin
    }

    pub fn push_ingress(&mut self, data: Bytes) {
        self.ingress_len += data.len();
        self.ingress.push_back(data);
    }

    pub fn pop_ingress(&mut self) -> Option<Bytes> {
        let data = self.ingress.pop_front()?;
        self.ingress_len -= data.len();
        Some(data)
    }

    /// Put back the unwritten tail of a chunk
    pub fn requeue_ingress(&mut self, data: Bytes) {
        self.ingress_len += data.len();
        self.ingress.push_front(data);
    }

    pub fn ingress_len(&self) -> usize {
        self.ingress_len
    }

    pub fn ingress_is_empty(&self) -> bool {
        self.ingress.is_empty()
    }

    pub fn egress_len(&self) -> usize {
        self.egress.len()
    }

    pub fn push_egress(&mut self, data: &[u8]) {
        self.egress.extend_from_slice(data);
    }

    /// Cut the next reply segment out of the egress buffer, bounded by the
    /// MSS and the client window, and advance `send_next` past it.
    ///
    /// Returns the segment's sequence number, its bytes and whether it
    /// drained the buffer.
    pub fn next_egress_segment(&mut self) -> Option<(u32, Bytes, bool)> {
        let len = self.egress.len().min(self.max_payload()).min(self.window_available() as usize);
        if len == 0 {
            return None;
        }
        let seq = self.send_next;
        let chunk = self.egress.split_to(len).freeze();
        self.send_next = self.send_next.wrapping_add(len as u32);
        Some((seq, chunk, self.egress.is_empty()))
    }

    /// Consume one sequence number for our FIN
    pub fn take_fin_seq(&mut self) -> u32 {
        let seq = self.send_next;
        self.send_next = self.send_next.wrapping_add(1);
        self.fin_sent = true;
        self.fin_pending = false;
        if !self.state.is_final() {
            self.state = TcpState::Closing;
        }
        seq
    }

    /// Our FIN may go out: remote finished, egress drained and the FIN fits
    /// in the client window.
    pub fn fin_ready(&self) -> bool {
        self.remote_eof && !self.fin_sent && self.egress.is_empty() && self.window_available() >= 1
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    pub fn fin_pending(&self) -> bool {
        self.fin_pending
    }

    pub fn set_fin_pending(&mut self) {
        self.fin_pending = true;
    }

    pub fn remote_eof(&self) -> bool {
        self.remote_eof
    }

    pub fn set_remote_eof(&mut self) {
        self.remote_eof = true;
    }

    pub fn fully_acknowledged(&self) -> bool {
        self.send_unacked == self.send_next
    }

    /// Both FINs exchanged and ours acknowledged
    pub fn close_complete(&self) -> bool {
        self.client_fin && self.fin_sent && self.fully_acknowledged()
    }

    pub fn write_shutdown(&self) -> bool {
        self.write_shutdown
    }

    pub fn set_write_shutdown(&mut self) {
        self.write_shutdown = true;
    }

    pub fn read_stalled(&self) -> bool {
        self.read_stalled
    }

    pub fn set_read_stalled(&mut self, stalled: bool) {
        self.read_stalled = stalled;
    }

    /// Consecutive ACKs that did not advance while data was in flight
    pub fn duplicate_acks(&self) -> u32 {
        self.duplicate_acks
    }

    fn ts_recent(&self) -> Option<u32> {
        self.ts_recent
    }
}

pub const JOB_READ: u8 = 0b001;
pub const JOB_WRITE: u8 = 0b010;
pub const JOB_CLEANUP: u8 = 0b100;

/// Single-owner job queue: pending job bits plus an ownership flag.
///
/// Whoever flips `active` from false to true runs the worker; everyone else
/// only records their job bit.
#[derive(Debug, Default)]
pub struct WorkerSlot {
    pending: AtomicU8,
    active: AtomicBool,
}

impl WorkerSlot {
    /// Queue `job`. Returns true when the caller became the owner and must
    /// start a worker.
    pub fn submit(&self, job: u8) -> bool {
        self.pending.fetch_or(job, Ordering::AcqRel);
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn take(&self) -> u8 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    /// Give up ownership. Returns true if jobs arrived meanwhile and
    /// ownership was taken back, so the worker must keep going.
    pub fn release(&self) -> bool {
        self.active.store(false, Ordering::Release);
        self.pending.load(Ordering::Acquire) != 0
            && self
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

const ARMED_READ: u8 = 0b01;
const ARMED_WRITE: u8 = 0b10;

/// One relayed flow
pub struct Session {
    id: u64,
    key: FlowKey,
    control: Mutex<TcpControl>,
    channel: Mutex<Option<Arc<OutboundChannel>>>,
    registration: CancellationToken,
    slot: WorkerSlot,
    armed: AtomicU8,
    aborting: AtomicBool,
    closed: AtomicBool,
    created: Instant,
    last_active: Mutex<Instant>,
    local_window: u16,
}

impl Session {
    pub fn new(id: u64, key: FlowKey, control: TcpControl, channel: OutboundChannel, local_window: u16) -> Self {
        let now = Instant::now();
        Self {
            id,
            key,
            control: Mutex::new(control),
            channel: Mutex::new(Some(Arc::new(channel))),
            registration: CancellationToken::new(),
            slot: WorkerSlot::default(),
            armed: AtomicU8::new(0),
            aborting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created: now,
            last_active: Mutex::new(now),
            local_window,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.key.protocol
    }

    /// Lock the control block. Reply segments are built and emitted while
    /// holding it so they leave in sequence order.
    pub fn control(&self) -> MutexGuard<'_, TcpControl> {
        self.control.lock()
    }

    pub fn state(&self) -> TcpState {
        self.control.lock().state()
    }

    /// Handle to the outbound channel while the session is open
    pub fn channel(&self) -> Option<Arc<OutboundChannel>> {
        self.channel.lock().clone()
    }

    pub(crate) fn take_channel(&self) -> Option<Arc<OutboundChannel>> {
        self.channel.lock().take()
    }

    /// Event-loop registration; cancelled when the session is released
    pub fn registration(&self) -> &CancellationToken {
        &self.registration
    }

    pub fn slot(&self) -> &WorkerSlot {
        &self.slot
    }

    /// Mark an interest as armed. False if it already was.
    pub(crate) fn try_arm(&self, read: bool) -> bool {
        let bit = if read { ARMED_READ } else { ARMED_WRITE };
        self.armed.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub(crate) fn disarm(&self, read: bool) {
        let bit = if read { ARMED_READ } else { ARMED_WRITE };
        self.armed.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Flag the session for teardown on the next worker pass. Takes the
    /// already locked control block.
    pub fn abort(&self, ctl: &mut TcpControl) {
        self.aborting.store(true, Ordering::Release);
        if ctl.state() != TcpState::Terminated {
            ctl.set_state(TcpState::Aborting);
        }
    }

    /// Flip the closed flag. True only for the first caller.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Header template for replies toward the client
    pub fn reply_template(&self, ctl: &TcpControl, ts_now: u32) -> ReplyTemplate {
        ReplyTemplate {
            src: self.key.remote,
            dst: self.key.client,
            window: self.local_window,
            timestamp: ctl.ts_recent().map(|ecr| (ts_now, ecr)),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("aborting", &self.is_aborting())
            .field("closed", &self.is_closed())
            .finish()
    }
}
