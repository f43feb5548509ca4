//! Readiness loop for outbound channels
//!
//! Workers never wait on sockets themselves. When a pass would block, they
//! arm read or write interest here; the loop waits on every armed channel at
//! once and dispatches a job when one becomes ready. It also runs the idle
//! sweep.

use crate::channel::Readiness;
use crate::relay::RelayContext;
use crate::session::{Session, JOB_CLEANUP, JOB_READ, JOB_WRITE};
use futures::stream::{FuturesUnordered, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub enum LoopEvent {
    Arm(Arc<Session>, Readiness),
    Shutdown,
}

/// Sender side used by workers and the session manager to arm interest
#[derive(Clone)]
pub struct EventHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl EventHandle {
    pub fn new(tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { tx }
    }

    pub fn arm_read(&self, session: &Arc<Session>) {
        self.arm(session, Readiness::Read);
    }

    pub fn arm_write(&self, session: &Arc<Session>) {
        self.arm(session, Readiness::Write);
    }

    fn arm(&self, session: &Arc<Session>, readiness: Readiness) {
        if session.is_closed() {
            return;
        }
        let read = readiness == Readiness::Read;
        // at most one pending wait per interest
        if !session.try_arm(read) {
            return;
        }
        if self.tx.send(LoopEvent::Arm(Arc::clone(session), readiness)).is_err() {
            session.disarm(read);
            trace!("Event loop gone, dropping {:?} interest for session {}", readiness, session.id());
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopEvent::Shutdown);
    }
}

type Ready = (Arc<Session>, Readiness, Option<io::Result<()>>);

/// Resolves when the channel is ready, or with `None` once the session's
/// registration is cancelled.
async fn wait_ready(session: Arc<Session>, readiness: Readiness) -> Ready {
    let Some(channel) = session.channel() else {
        return (session, readiness, None);
    };
    let registration = session.registration().clone();
    let result = tokio::select! {
        _ = registration.cancelled() => None,
        r = channel.ready(readiness) => Some(r),
    };
    drop(channel);
    (session, readiness, result)
}

pub struct EventLoop {
    ctx: Arc<RelayContext>,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
    shutdown: CancellationToken,
}

impl EventLoop {
    pub fn new(ctx: Arc<RelayContext>, rx: mpsc::UnboundedReceiver<LoopEvent>, shutdown: CancellationToken) -> Self {
        Self { ctx, rx, shutdown }
    }

    pub async fn run(mut self) {
        let period = self.ctx.config().sweep_interval();
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending = FuturesUnordered::new();

        info!("Relay event loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(LoopEvent::Arm(session, readiness)) => {
                        pending.push(wait_ready(session, readiness));
                    }
                    Some(LoopEvent::Shutdown) | None => break,
                },
                Some((session, readiness, result)) = pending.next(), if !pending.is_empty() => {
                    self.on_ready(session, readiness, result);
                }
                _ = sweep.tick() => self.sweep(),
            }
        }

        info!("Relay event loop stopped ({} waits dropped)", pending.len());
    }

    fn on_ready(&self, session: Arc<Session>, readiness: Readiness, result: Option<io::Result<()>>) {
        session.disarm(readiness == Readiness::Read);
        match result {
            None => trace!("Registration cancelled for session {}", session.id()),
            Some(Ok(())) => {
                let job = match readiness {
                    Readiness::Read => JOB_READ,
                    Readiness::Write => JOB_WRITE,
                };
                self.ctx.dispatch(&session, job);
            }
            Some(Err(e)) => {
                debug!("Channel error on {}: {}", session.key(), e);
                {
                    let mut ctl = session.control();
                    session.abort(&mut ctl);
                }
                self.ctx.dispatch(&session, JOB_CLEANUP);
            }
        }
    }

    fn sweep(&self) {
        for session in self.ctx.manager().sweep_idle() {
            self.ctx.dispatch(&session, JOB_CLEANUP);
        }
    }
}
