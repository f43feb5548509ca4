//! Session registry keyed by flow

use crate::channel::OutboundChannel;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::event_loop::EventHandle;
use crate::session::{FlowKey, Protocol, Session, SynParams, TcpControl, TcpState};
use crate::stats::RelayStats;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Concurrent map of live sessions.
///
/// Sessions are created by the packet handler and released exactly once
/// through [`SessionManager::close_session`].
pub struct SessionManager {
    sessions: DashMap<FlowKey, Arc<Session>>,
    config: RelayConfig,
    stats: Arc<RelayStats>,
    events: EventHandle,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(config: RelayConfig, stats: Arc<RelayStats>, events: EventHandle) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            stats,
            events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get_session(&self, key: &FlowKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Open the outbound connection for a client SYN and register the
    /// session. `None` if the flow exists, the table is full or the socket
    /// could not be created.
    pub fn create_tcp_session(&self, key: FlowKey, syn: &SynParams) -> Option<Arc<Session>> {
        if !self.admit(&key) {
            return None;
        }

        let channel = match OutboundChannel::connect_tcp(key.remote) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to open outbound channel for {}: {}", key, e);
                self.stats.record_session_failure();
                return None;
            }
        };

        let tcp = &self.config.tcp;
        let iss: u32 = rand::random();
        let control = TcpControl::passive_open(iss, syn, tcp.mss, tcp.default_client_mss, tcp.window_scale);
        let session = self.register(key, control, channel)?;

        self.stats.record_tcp_session();
        info!("TCP session {} opened: {}", session.id(), key);
        Some(session)
    }

    /// Bind an outbound UDP socket for a new client flow
    pub fn create_udp_session(&self, key: FlowKey) -> Option<Arc<Session>> {
        if !self.admit(&key) {
            return None;
        }

        let channel = match OutboundChannel::bind_udp(key.remote) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to bind outbound socket for {}: {}", key, e);
                self.stats.record_session_failure();
                return None;
            }
        };

        let session = self.register(key, TcpControl::datagram(), channel)?;

        self.stats.record_udp_session();
        debug!("UDP session {} opened: {}", session.id(), key);
        Some(session)
    }

    fn admit(&self, key: &FlowKey) -> bool {
        if self.sessions.contains_key(key) {
            debug!("Session already exists: {}", key);
            return false;
        }
        if self.sessions.len() >= self.config.max_sessions {
            warn!("{}, refusing {}", RelayError::SessionLimit(self.config.max_sessions), key);
            self.stats.record_session_failure();
            return false;
        }
        true
    }

    fn register(&self, key: FlowKey, control: TcpControl, channel: OutboundChannel) -> Option<Arc<Session>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, key, control, channel, self.config.tcp.window));

        match self.sessions.entry(key) {
            Entry::Occupied(_) => {
                // lost a race with another packet of the same flow
                debug!("Session for {} created concurrently, dropping duplicate", key);
                return None;
            }
            Entry::Vacant(v) => {
                v.insert(Arc::clone(&session));
            }
        }

        self.events.arm_read(&session);
        Some(session)
    }

    /// Refresh the idle timer
    pub fn keep_alive(&self, session: &Session) {
        session.touch();
    }

    /// Release a session: cancel its registration, close the channel and
    /// drop it from the table. Returns false if it was already released.
    ///
    /// Must not be called while holding the session's control lock.
    pub fn close_session(&self, session: &Arc<Session>) -> bool {
        if !session.begin_close() {
            return false;
        }

        session.control().set_state(TcpState::Terminated);
        session.registration().cancel();
        if let Some(channel) = session.take_channel() {
            channel.close();
        }
        self.sessions.remove_if(session.key(), |_, s| Arc::ptr_eq(s, session));

        match session.protocol() {
            Protocol::Tcp => {
                self.stats.record_tcp_closed();
                info!("TCP session {} closed: {} (age {:?})", session.id(), session.key(), session.age());
            }
            Protocol::Udp => {
                self.stats.record_udp_closed();
                debug!("UDP session {} closed: {}", session.id(), session.key());
            }
        }
        true
    }

    /// Flag sessions idle past their protocol timeout for teardown and
    /// return them so the caller can schedule cleanup.
    pub fn sweep_idle(&self) -> Vec<Arc<Session>> {
        let tcp_timeout = self.config.tcp_idle_timeout();
        let udp_timeout = self.config.udp_idle_timeout();

        let expired: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                let timeout = match session.protocol() {
                    Protocol::Tcp => tcp_timeout,
                    Protocol::Udp => udp_timeout,
                };
                session.idle_for() >= timeout
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in &expired {
            let mut ctl = session.control();
            session.abort(&mut ctl);
            trace!("Session {} idle for {:?}: {}", session.id(), session.idle_for(), session.key());
        }
        if !expired.is_empty() {
            debug!("Idle sweep expired {} sessions", expired.len());
        }
        expired
    }

    /// Release every session, used on shutdown
    pub fn abort_all(&self) -> usize {
        let all: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        all.iter().filter(|s| self.close_session(s)).count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn tcp_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.key().protocol == Protocol::Tcp).count()
    }

    pub fn udp_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.key().protocol == Protocol::Udp).count()
    }

    /// Iterate over all sessions
    pub fn iter(&self) -> impl Iterator<Item = Arc<Session>> + '_ {
        self.sessions.iter().map(|e| Arc::clone(e.value()))
    }
}
