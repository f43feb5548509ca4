//! Relay entry point: shared context, builder and the ingestion loop

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::event_loop::{EventHandle, EventLoop, LoopEvent};
use crate::handler::SessionHandler;
use crate::manager::SessionManager;
use crate::session::Session;
use crate::sink::{NullSink, PacketSink};
use crate::stats::RelayStats;
use crate::worker::WorkerPool;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// State shared by the handler, the workers and the event loop
pub struct RelayContext {
    config: RelayConfig,
    stats: Arc<RelayStats>,
    manager: SessionManager,
    events: EventHandle,
    pool: WorkerPool,
    client_sink: Arc<dyn PacketSink>,
    capture_sink: Arc<dyn PacketSink>,
    clock: Instant,
    ts_offset: u32,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        client_sink: Arc<dyn PacketSink>,
        capture_sink: Arc<dyn PacketSink>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventHandle::new(tx);
        let stats = Arc::new(RelayStats::new());
        let manager = SessionManager::new(config.clone(), Arc::clone(&stats), events.clone());

        let ctx = Arc::new(Self {
            pool: WorkerPool::new(config.worker_pool_size),
            config,
            stats,
            manager,
            events,
            client_sink,
            capture_sink,
            clock: Instant::now(),
            ts_offset: rand::random(),
        });
        (ctx, rx)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn events(&self) -> &EventHandle {
        &self.events
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Send a synthesized packet to the client, then record it in the
    /// capture sink
    pub fn emit(&self, packet: &[u8]) {
        match self.client_sink.send_packet(packet) {
            Ok(()) => self.stats.record_sent(packet.len()),
            Err(e) => {
                self.stats.record_sink_error();
                debug!("Client sink rejected {} byte packet: {}", packet.len(), e);
            }
        }
        self.capture(packet);
    }

    /// Copy a packet to the capture sink
    pub fn capture(&self, packet: &[u8]) {
        if let Err(e) = self.capture_sink.send_packet(packet) {
            self.stats.record_sink_error();
            trace!("Capture sink rejected packet: {}", e);
        }
    }

    /// Millisecond clock for TCP timestamp values
    pub fn timestamp(&self) -> u32 {
        (self.clock.elapsed().as_millis() as u32).wrapping_add(self.ts_offset)
    }

    pub fn dispatch(self: &Arc<Self>, session: &Arc<Session>, job: u8) {
        self.pool.dispatch(self, session, job);
    }
}

/// Relay builder for fluent configuration
pub struct RelayBuilder {
    config: RelayConfig,
    client_sink: Option<Arc<dyn PacketSink>>,
    capture_sink: Option<Arc<dyn PacketSink>>,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            client_sink: None,
            capture_sink: None,
        }
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.config.tcp.mss = mss;
        self
    }

    pub fn window_scale(mut self, shift: u8) -> Self {
        self.config.tcp.window_scale = shift;
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.config.worker_pool_size = size;
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    pub fn tcp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.udp.idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval_secs = interval.as_secs();
        self
    }

    /// Where replies toward the client are written (the tunnel)
    pub fn client_sink<S: PacketSink + 'static>(mut self, sink: S) -> Self {
        self.client_sink = Some(Arc::new(sink));
        self
    }

    /// Receives a copy of every packet in both directions
    pub fn capture_sink<S: PacketSink + 'static>(mut self, sink: S) -> Self {
        self.capture_sink = Some(Arc::new(sink));
        self
    }

    pub fn build(self) -> Result<Relay> {
        let client_sink = self
            .client_sink
            .ok_or_else(|| RelayError::Config("client sink is required".into()))?;
        let capture_sink = self
            .capture_sink
            .unwrap_or_else(|| Arc::new(NullSink) as Arc<dyn PacketSink>);
        Relay::new(self.config, client_sink, capture_sink)
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport relay between the tunnel and real sockets
pub struct Relay {
    ctx: Arc<RelayContext>,
    handler: SessionHandler,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<LoopEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    /// Runtime the relay was started on; sockets and workers live there
    runtime: OnceLock<Handle>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl Relay {
    pub fn new(config: RelayConfig, client_sink: Arc<dyn PacketSink>, capture_sink: Arc<dyn PacketSink>) -> Result<Self> {
        config.validate()?;
        let (ctx, rx) = RelayContext::new(config, client_sink, capture_sink);
        Ok(Self {
            handler: SessionHandler::new(Arc::clone(&ctx)),
            ctx,
            event_rx: Mutex::new(Some(rx)),
            event_loop: Mutex::new(None),
            runtime: OnceLock::new(),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    /// Spawn the event loop on the current Tokio runtime.
    ///
    /// Packets may afterwards be fed from any thread, including ones
    /// outside the runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|e| RelayError::Resource(format!("relay must start inside a Tokio runtime: {}", e)))?;
        let Some(rx) = self.event_rx.lock().take() else {
            return Err(RelayError::Resource("relay already started".into()));
        };
        let event_loop = EventLoop::new(Arc::clone(&self.ctx), rx, self.shutdown.clone());
        *self.event_loop.lock() = Some(runtime.spawn(event_loop.run()));
        let _ = self.runtime.set(runtime);
        self.running.store(true, Ordering::Release);
        info!("Relay started (workers: {}, mss: {})", self.ctx.config().worker_pool_size, self.ctx.config().tcp.mss);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Handle one IPv4 packet read from the tunnel.
    ///
    /// Safe to call from a blocking tunnel-reader thread: the relay's
    /// runtime is entered for the duration of the call.
    pub fn process_packet(&self, packet: &[u8]) -> Result<()> {
        let Some(runtime) = self.runtime.get().filter(|_| self.is_running()) else {
            self.ctx.stats().record_dropped();
            return Ok(());
        };
        let _guard = runtime.enter();
        self.handler.handle_packet(packet)
    }

    /// Ingestion loop: feed tunnel packets until the channel closes or the
    /// relay shuts down
    pub async fn run(&self, mut tunnel: mpsc::Receiver<BytesMut>) {
        info!("Relay ingestion loop started");
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                packet = tunnel.recv() => match packet {
                    Some(p) => p,
                    None => break,
                },
            };
            match self.process_packet(&packet) {
                Ok(()) => {}
                Err(e) if e.is_parse_error() => trace!("Tunnel packet dropped: {}", e),
                Err(e) => warn!("Tunnel packet failed: {}", e),
            }
        }
        info!("Relay ingestion loop stopped");
    }

    /// Stop the event loop and release every session
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.ctx.events().shutdown();

        let released = self.ctx.manager().abort_all();
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Event loop task failed: {}", e);
            }
        }
        info!("Relay stopped ({} sessions released)", released);
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        self.ctx.stats()
    }

    pub fn session_manager(&self) -> &SessionManager {
        self.ctx.manager()
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    pub fn config(&self) -> &RelayConfig {
        self.ctx.config()
    }
}
