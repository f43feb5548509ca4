//! Worker pool and per-session I/O passes
//!
//! A session has at most one worker at a time ([`WorkerSlot`]). The worker
//! drains the job bits it owns: WRITE moves client bytes to the outbound
//! channel, READ moves remote bytes back into reply packets, and any pass
//! that leaves the session aborting releases it.
//!
//! [`WorkerSlot`]: crate::session::WorkerSlot

use crate::channel::OutboundChannel;
use crate::packet::{build_data_segment, build_fin, build_ipv4_udp, build_rst};
use crate::relay::RelayContext;
use crate::session::{Protocol, Session, TcpControl, JOB_READ, JOB_WRITE};
use std::io;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

/// Bounds how many session workers run I/O passes at once
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue `job` for the session and start a worker if none is running
    pub fn dispatch(&self, ctx: &Arc<RelayContext>, session: &Arc<Session>, job: u8) {
        if !session.slot().submit(job) {
            return;
        }
        let permits = Arc::clone(&self.permits);
        let ctx = Arc::clone(ctx);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                // closed only when the runtime is going away
                Err(_) => return,
            };
            run_jobs(&ctx, &session);
        });
    }
}

fn run_jobs(ctx: &Arc<RelayContext>, session: &Arc<Session>) {
    loop {
        let jobs = session.slot().take();
        if jobs != 0 {
            run_pass(ctx, session, jobs);
            continue;
        }
        if !session.slot().release() {
            break;
        }
    }
}

fn run_pass(ctx: &Arc<RelayContext>, session: &Arc<Session>, jobs: u8) {
    if !session.is_closed() && !session.is_aborting() {
        if let Some(channel) = session.channel() {
            if jobs & JOB_WRITE != 0 {
                match session.protocol() {
                    Protocol::Tcp => write_tcp(ctx, session, &channel),
                    Protocol::Udp => write_udp(ctx, session, &channel),
                }
            }
            if jobs & JOB_READ != 0 && !session.is_aborting() {
                match session.protocol() {
                    Protocol::Tcp => read_tcp(ctx, session, &channel),
                    Protocol::Udp => read_udp(ctx, session, &channel),
                }
            }
        }
    }

    if session.is_aborting() {
        ctx.manager().close_session(session);
    }
}

/// Segment whatever the client window allows out of the egress buffer.
/// PSH marks the segment that drains the buffer.
pub(crate) fn flush_egress(ctx: &RelayContext, session: &Session, ctl: &mut TcpControl) -> usize {
    if !ctl.state().can_send_data() {
        return 0;
    }
    let ts = ctx.timestamp();
    let mut sent = 0;
    while let Some((seq, chunk, drained)) = ctl.next_egress_segment() {
        let tpl = session.reply_template(ctl, ts);
        ctx.emit(&build_data_segment(&tpl, seq, ctl.recv_next(), &chunk, drained));
        sent += chunk.len();
    }
    sent
}

/// Emit our FIN at `send_next`
pub(crate) fn send_fin(ctx: &RelayContext, session: &Session, ctl: &mut TcpControl) {
    let seq = ctl.take_fin_seq();
    let tpl = session.reply_template(ctl, ctx.timestamp());
    ctx.emit(&build_fin(&tpl, seq, ctl.recv_next()));
    debug!("FIN sent on {} (seq {})", session.key(), seq);
}

/// Reset the client side and flag the session for teardown
pub(crate) fn reset_client(ctx: &RelayContext, session: &Session, ctl: &mut TcpControl) {
    if session.protocol() == Protocol::Tcp && !ctl.state().is_final() {
        let tpl = session.reply_template(ctl, ctx.timestamp());
        ctx.emit(&build_rst(&tpl, ctl.send_next(), Some(ctl.recv_next())));
        ctx.stats().record_reset();
    }
    session.abort(ctl);
}

fn write_tcp(ctx: &Arc<RelayContext>, session: &Arc<Session>, channel: &OutboundChannel) {
    let chunk = {
        let mut ctl = session.control();
        if ctl.state().is_final() {
            return;
        }
        match ctl.pop_ingress() {
            Some(chunk) => chunk,
            None => {
                if ctl.client_fin() && !ctl.write_shutdown() {
                    ctl.set_write_shutdown();
                    drop(ctl);
                    match channel.shutdown_write() {
                        Ok(()) => debug!("Outbound write side closed: {}", session.key()),
                        Err(e) => debug!("Outbound half-close failed on {}: {}", session.key(), e),
                    }
                }
                return;
            }
        }
    };

    match channel.try_write(&chunk) {
        Ok(n) => {
            ctx.stats().record_outbound(n);
            trace!("Wrote {} of {} bytes to {}", n, chunk.len(), session.key().remote);
            let mut ctl = session.control();
            if n < chunk.len() {
                ctl.requeue_ingress(chunk.slice(n..));
                drop(ctl);
                ctx.events().arm_write(session);
            } else if !ctl.ingress_is_empty() || (ctl.client_fin() && !ctl.write_shutdown()) {
                drop(ctl);
                session.slot().submit(JOB_WRITE);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            session.control().requeue_ingress(chunk);
            ctx.events().arm_write(session);
        }
        Err(e) => {
            warn!("Outbound write failed on {}: {}", session.key(), e);
            let mut ctl = session.control();
            reset_client(ctx, session, &mut ctl);
        }
    }
}

fn read_tcp(ctx: &Arc<RelayContext>, session: &Arc<Session>, channel: &OutboundChannel) {
    let budget = {
        let mut ctl = session.control();
        if ctl.state().is_final() {
            return;
        }
        flush_egress(ctx, session, &mut ctl);

        if ctl.remote_eof() {
            if ctl.fin_pending() && ctl.state().can_send_data() && ctl.fin_ready() {
                send_fin(ctx, session, &mut ctl);
            } else if ctl.fin_pending() {
                ctl.set_read_stalled(true);
            }
            return;
        }

        let budget = if ctl.state().can_send_data() && ctl.egress_len() == 0 {
            (ctl.window_available() as usize).min(ctx.config().tcp.read_chunk)
        } else {
            0
        };
        if budget == 0 {
            if let Ok(Some(e)) = channel.take_error() {
                debug!("Outbound connection failed on {}: {}", session.key(), e);
                reset_client(ctx, session, &mut ctl);
                return;
            }
            // resumed by the ACK that opens the window
            ctl.set_read_stalled(true);
            ctx.stats().record_window_stall();
            trace!("Read stalled on {} (window {})", session.key(), ctl.window_available());
            return;
        }
        budget
    };

    let mut buf = vec![0u8; budget];
    match channel.try_read(&mut buf) {
        Ok(0) => {
            let mut ctl = session.control();
            if ctl.state().is_final() {
                return;
            }
            ctl.set_remote_eof();
            debug!("Remote closed {}", session.key());
            if ctl.state().can_send_data() && ctl.fin_ready() {
                send_fin(ctx, session, &mut ctl);
            } else {
                ctl.set_fin_pending();
            }
        }
        Ok(n) => {
            ctx.stats().record_inbound(n);
            let mut ctl = session.control();
            if ctl.state().is_final() {
                return;
            }
            ctl.push_egress(&buf[..n]);
            flush_egress(ctx, session, &mut ctl);
            let stalled = ctl.egress_len() > 0;
            ctl.set_read_stalled(stalled);
            drop(ctl);
            if !stalled {
                ctx.events().arm_read(session);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            ctx.events().arm_read(session);
        }
        Err(e) => {
            debug!("Outbound read failed on {}: {}", session.key(), e);
            let mut ctl = session.control();
            reset_client(ctx, session, &mut ctl);
        }
    }
}

fn write_udp(ctx: &Arc<RelayContext>, session: &Arc<Session>, channel: &OutboundChannel) {
    let Some(datagram) = session.control().pop_ingress() else {
        return;
    };

    match channel.try_write(&datagram) {
        Ok(n) => {
            ctx.stats().record_outbound(n);
            if !session.control().ingress_is_empty() {
                session.slot().submit(JOB_WRITE);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            session.control().requeue_ingress(datagram);
            ctx.events().arm_write(session);
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            // ICMP unreachable from an earlier send
            debug!("UDP destination refused {}: {}", session.key(), e);
            ctx.stats().record_dropped();
        }
        Err(e) => {
            warn!("UDP send failed on {}: {}", session.key(), e);
            let mut ctl = session.control();
            session.abort(&mut ctl);
        }
    }
}

fn read_udp(ctx: &Arc<RelayContext>, session: &Arc<Session>, channel: &OutboundChannel) {
    let mut buf = vec![0u8; ctx.config().udp.max_datagram];
    match channel.try_read(&mut buf) {
        Ok(n) => {
            ctx.stats().record_inbound(n);
            let key = session.key();
            ctx.emit(&build_ipv4_udp(key.remote, key.client, &buf[..n]));
            ctx.manager().keep_alive(session);
            ctx.events().arm_read(session);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            ctx.events().arm_read(session);
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!("UDP destination refused {}: {}", session.key(), e);
            ctx.events().arm_read(session);
        }
        Err(e) => {
            warn!("UDP receive failed on {}: {}", session.key(), e);
            let mut ctl = session.control();
            session.abort(&mut ctl);
        }
    }
}
