//! Tunnel packet handling
//!
//! Every packet read from the tunnel lands here. TCP segments drive the
//! server side of the client's connection (handshake, acknowledgments,
//! payload and FIN/RST) and UDP datagrams are queued for their session.

use crate::error::{RelayError, Result};
use crate::packet::{
    build_ack, build_fin_ack, build_rst, build_syn_ack, ipv4_checksum_ok, parse_packet, ParsedPacket, ReplyTemplate,
    TcpHeader, TransportHeader,
};
use crate::relay::RelayContext;
use crate::session::{
    AckOutcome, FlowKey, PayloadOutcome, Session, SynParams, TcpControl, TcpState, JOB_CLEANUP, JOB_READ, JOB_WRITE,
};
use crate::worker::send_fin;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Duplicate ACKs that signal a lost segment
const FAST_RETRANSMIT_DUP_ACKS: u32 = 3;

pub struct SessionHandler {
    ctx: Arc<RelayContext>,
}

impl SessionHandler {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self { ctx }
    }

    /// Process one IPv4 packet from the tunnel.
    ///
    /// Parse failures are counted and returned; the packet is dropped.
    /// Checksum mismatches are counted but the packet is still handled.
    pub fn handle_packet(&self, raw: &[u8]) -> Result<()> {
        let stats = self.ctx.stats();
        stats.record_received(raw.len());
        self.ctx.capture(raw);

        let packet = match parse_packet(raw) {
            Ok(p) => p,
            Err(e) => {
                stats.record_parse_error();
                debug!("Dropping tunnel packet ({} bytes): {}", raw.len(), e);
                return Err(e);
            }
        };

        if !ipv4_checksum_ok(raw, &packet.ip) || !packet.transport_checksum_ok() {
            stats.record_checksum_error();
            debug!("Checksum mismatch: {} -> {}", packet.src_socket(), packet.dst_socket());
        }

        match packet.transport {
            TransportHeader::Tcp(ref tcp) => {
                stats.record_tcp();
                self.handle_tcp(&packet, tcp);
            }
            TransportHeader::Udp(_) => {
                stats.record_udp();
                self.handle_udp(&packet);
            }
        }
        Ok(())
    }

    fn handle_tcp(&self, packet: &ParsedPacket<'_>, tcp: &TcpHeader) {
        let key = FlowKey::tcp(packet.src_socket(), packet.dst_socket());
        let payload = packet.payload;
        trace!(
            "TCP {}: seq={} ack={} flags={:?} len={}",
            key,
            tcp.seq,
            tcp.ack,
            tcp.flags,
            payload.len()
        );

        let existing = self.ctx.manager().get_session(&key);

        if tcp.flags.syn && !tcp.flags.ack {
            self.on_syn(key, existing, tcp);
            return;
        }

        let Some(session) = existing else {
            self.on_unknown_flow(&key, tcp, payload.len());
            return;
        };

        if tcp.flags.rst {
            self.on_rst(&session);
            return;
        }
        if session.is_aborting() || session.is_closed() {
            trace!("Segment for closing session {}", key);
            return;
        }

        self.ctx.manager().keep_alive(&session);
        self.on_segment(&session, tcp, payload);
    }

    fn on_syn(&self, key: FlowKey, existing: Option<Arc<Session>>, tcp: &TcpHeader) {
        if let Some(session) = existing {
            let mut ctl = session.control();
            if tcp.seq == ctl.client_isn() {
                if ctl.state() == TcpState::SynReceived {
                    debug!("Retransmitted SYN on {}, resending SYN-ACK", key);
                    self.send_syn_ack(&session, &ctl);
                } else {
                    trace!("Stale SYN on {} ignored", key);
                }
                return;
            }
            // new ISN on a live flow: the client restarted the connection
            warn!("SYN with new ISN on live session {}, resetting", key);
            session.abort(&mut ctl);
            drop(ctl);
            self.ctx.dispatch(&session, JOB_CLEANUP);
            self.refuse_syn(&key, tcp);
            return;
        }

        let syn = SynParams {
            client_isn: tcp.seq,
            window: tcp.window,
            mss: tcp.options.mss,
            window_scale: tcp.options.window_scale,
            timestamp: tcp.options.timestamp.map(|(val, _)| val),
        };

        match self.ctx.manager().create_tcp_session(key, &syn) {
            Some(session) => {
                let ctl = session.control();
                self.send_syn_ack(&session, &ctl);
            }
            None => self.refuse_syn(&key, tcp),
        }
    }

    fn send_syn_ack(&self, session: &Session, ctl: &TcpControl) {
        let tpl = session.reply_template(ctl, self.ctx.timestamp());
        let packet = build_syn_ack(
            &tpl,
            ctl.iss(),
            ctl.client_isn().wrapping_add(1),
            self.ctx.config().tcp.mss,
            ctl.local_window_shift(),
        );
        self.ctx.emit(&packet);
    }

    /// RST|ACK answering a SYN we cannot serve
    fn refuse_syn(&self, key: &FlowKey, tcp: &TcpHeader) {
        let tpl = ReplyTemplate::answering(key.client, key.remote, self.ctx.config().tcp.window);
        self.ctx.emit(&build_rst(&tpl, 0, Some(tcp.seq.wrapping_add(1))));
        self.ctx.stats().record_reset();
        debug!("Refused SYN on {}", key);
    }

    /// Segment for a flow we have no session for
    fn on_unknown_flow(&self, key: &FlowKey, tcp: &TcpHeader, payload_len: usize) {
        if tcp.flags.rst {
            return;
        }
        let tpl = ReplyTemplate::answering(key.client, key.remote, self.ctx.config().tcp.window);
        if tcp.flags.fin {
            // let the client finish its close
            let ack = tcp.seq.wrapping_add(payload_len as u32).wrapping_add(1);
            self.ctx.emit(&build_ack(&tpl, tcp.ack, ack));
            debug!("FIN for unknown flow {}, acknowledged", key);
        } else if tcp.flags.ack {
            self.ctx.emit(&build_rst(&tpl, tcp.ack, None));
            self.ctx.stats().record_reset();
            debug!("{}, reset", RelayError::ProtocolViolation(format!("ACK for unknown flow {}", key)));
        } else {
            self.ctx.stats().record_dropped();
        }
    }

    fn on_rst(&self, session: &Arc<Session>) {
        debug!("RST from client on {}", session.key());
        {
            let mut ctl = session.control();
            session.abort(&mut ctl);
        }
        self.ctx.dispatch(session, JOB_CLEANUP);
    }

    fn on_segment(&self, session: &Arc<Session>, tcp: &TcpHeader, payload: &[u8]) {
        let ctx = &self.ctx;
        let stats = ctx.stats();
        let mut ctl = session.control();
        if ctl.state().is_final() {
            return;
        }
        ctl.note_client_timestamp(tcp.options.timestamp.map(|(val, _)| val));

        let mut schedule_write = false;
        let mut resume_read = false;

        if tcp.flags.ack {
            let was_syn_received = ctl.state() == TcpState::SynReceived;
            match ctl.accept_ack(tcp.ack, tcp.window) {
                AckOutcome::Advanced(n) => trace!("ACK advanced {} on {}", n, session.key()),
                AckOutcome::Duplicate => {
                    if payload.is_empty() && !tcp.flags.fin && ctl.in_flight() > 0 {
                        stats.record_duplicate_ack();
                        if ctl.duplicate_acks() == FAST_RETRANSMIT_DUP_ACKS {
                            // no resend buffer: only counted
                            stats.record_retransmit();
                            debug!(
                                "Client requests retransmit at {} on {} ({} bytes in flight)",
                                tcp.ack,
                                session.key(),
                                ctl.in_flight()
                            );
                        }
                    }
                }
                AckOutcome::Rejected => {
                    debug!(
                        "ACK {} outside [{}, {}] on {}",
                        tcp.ack,
                        ctl.send_unacked(),
                        ctl.send_next(),
                        session.key()
                    );
                }
            }
            if was_syn_received && ctl.state() == TcpState::Established {
                info!("TCP session {} established: {}", session.id(), session.key());
            }
            if ctl.read_stalled() && ctl.state().can_send_data() && ctl.window_available() > 0 {
                ctl.set_read_stalled(false);
                resume_read = true;
            }
        }

        let mut need_ack = false;
        if !payload.is_empty() {
            match ctl.accept_payload(tcp.seq, payload) {
                PayloadOutcome::Accepted(n) => {
                    trace!("Accepted {} bytes on {}", n, session.key());
                    schedule_write = true;
                }
                PayloadOutcome::Duplicate => stats.record_duplicate(),
                PayloadOutcome::OutOfOrder => stats.record_out_of_order(),
            }
            need_ack = true;
        }

        if tcp.flags.fin {
            let fin_seq = tcp.seq.wrapping_add(payload.len() as u32);
            if ctl.accept_fin(fin_seq) {
                debug!("FIN from client on {}", session.key());
                schedule_write = true;
                if ctl.fin_pending() && ctl.state().can_send_data() && ctl.fin_ready() {
                    // our side is done too: one FIN|ACK closes both directions
                    let seq = ctl.take_fin_seq();
                    let tpl = session.reply_template(&ctl, ctx.timestamp());
                    ctx.emit(&build_fin_ack(&tpl, seq, fin_seq));
                } else {
                    need_ack = true;
                }
            } else {
                need_ack = true;
            }
        }

        if need_ack {
            let tpl = session.reply_template(&ctl, ctx.timestamp());
            ctx.emit(&build_ack(&tpl, ctl.send_next(), ctl.recv_next()));
        }

        if ctl.fin_pending() && ctl.fully_acknowledged() && ctl.state().can_send_data() && ctl.fin_ready() {
            send_fin(ctx, session, &mut ctl);
        }

        let release = ctl.close_complete();
        drop(ctl);

        if release {
            ctx.manager().close_session(session);
            return;
        }
        if schedule_write || (tcp.flags.psh && !payload.is_empty()) {
            ctx.dispatch(session, JOB_WRITE);
        }
        if resume_read {
            ctx.dispatch(session, JOB_READ);
        }
    }

    fn handle_udp(&self, packet: &ParsedPacket<'_>) {
        let key = FlowKey::udp(packet.src_socket(), packet.dst_socket());
        let manager = self.ctx.manager();

        let session = match manager.get_session(&key) {
            Some(s) => s,
            None => match manager.create_udp_session(key) {
                Some(s) => s,
                None => {
                    self.ctx.stats().record_dropped();
                    return;
                }
            },
        };
        if session.is_aborting() || session.is_closed() {
            self.ctx.stats().record_dropped();
            return;
        }

        manager.keep_alive(&session);
        session.control().push_ingress(Bytes::copy_from_slice(packet.payload));
        trace!("UDP {}: {} bytes queued", key, packet.payload.len());
        self.ctx.dispatch(&session, JOB_WRITE);
    }
}
