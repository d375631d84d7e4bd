//! The command exerciser loop
//!
//! Connects once, then fires one command per cycle against the configured
//! device: produce on the worker pool, send through a fresh request handle,
//! report, close the handle, pace, repeat. Exactly one exchange is in flight
//! at any time. Reconnect notifications start a new epoch; a completion from
//! the superseded epoch is logged but does not drive the new one.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::{debug, error, info, trace, warn};

use super::cycle::{CycleEvent, CycleStateMachine, Epoch, TransitionResult};
use super::pacing::Pacing;
use super::reporter::{LogReporter, ResponseReporter};
use crate::command::{Command, CommandSource, PoolError, WorkerPool};
use crate::config::CommanderConfig;
use crate::transport::{Connection, RequestHandle, TransportError, TransportHandle};
use commander_shared::defaults;

/// Name of the pool command production runs on
pub const POOL_NAME: &str = "user-input-pool";

#[derive(Error, Debug)]
pub enum ExerciserError {
    /// The initial connect failed; nothing was dispatched
    #[error("Connection failure: {0}")]
    ConnectionFailure(#[source] TransportError),

    #[error(transparent)]
    WorkerPool(#[from] PoolError),
}

/// Who to address and how to pace
#[derive(Debug, Clone)]
pub struct ExerciserSettings {
    pub tenant_id: String,
    pub device_id: String,
    pub request_timeout: Duration,
    pub worker_pool_size: usize,
    pub pacing: Pacing,
}

impl Default for ExerciserSettings {
    fn default() -> Self {
        Self {
            tenant_id: defaults::TENANT_ID.into(),
            device_id: defaults::DEVICE_ID.into(),
            request_timeout: Duration::from_millis(defaults::REQUEST_TIMEOUT_MS),
            worker_pool_size: defaults::WORKER_POOL_SIZE,
            pacing: Pacing::default(),
        }
    }
}

impl From<&CommanderConfig> for ExerciserSettings {
    fn from(config: &CommanderConfig) -> Self {
        Self {
            tenant_id: config.tenant_id.clone(),
            device_id: config.device_id.clone(),
            request_timeout: config.request_timeout(),
            worker_pool_size: config.worker_pool_size,
            pacing: config.pacing(),
        }
    }
}

/// Counters for one `run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Completions that arrived after a reconnect had started a new epoch
    pub stale: u64,
    /// Connection epochs seen, the initial connect included
    pub epochs: u64,
}

pub struct Exerciser<T: TransportHandle + ?Sized> {
    dispatcher: Dispatcher<T>,
    source: Arc<dyn CommandSource>,
    pool: WorkerPool,
    pacing: Pacing,
    closed: AtomicBool,
}

impl<T: TransportHandle + ?Sized> Exerciser<T> {
    pub fn new(transport: Arc<T>, source: Arc<dyn CommandSource>, settings: ExerciserSettings) -> Self {
        let pool = WorkerPool::new(POOL_NAME, settings.worker_pool_size);
        Self {
            dispatcher: Dispatcher {
                transport,
                reporter: Arc::new(LogReporter),
                tenant_id: settings.tenant_id,
                device_id: settings.device_id,
                timeout: settings.request_timeout,
            },
            source,
            pool,
            pacing: settings.pacing,
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the default log reporter
    pub fn with_reporter(mut self, reporter: Arc<dyn ResponseReporter>) -> Self {
        self.dispatcher.reporter = reporter;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Connect and exercise the device until the reconnect listener closes
    pub async fn run(&self) -> Result<RunStats, ExerciserError> {
        let transport = &self.dispatcher.transport;
        let mut tracker = EpochTracker::new(transport.reconnect_listener());

        let connection = match transport.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Error: {}", e);
                self.close().await;
                return Err(ExerciserError::ConnectionFailure(e));
            }
        };
        tracker.begin(&connection);

        let mut pacing = self.pacing.clone();
        while tracker.apply_pending() {
            let epoch = tracker.current();

            let source = self.source.clone();
            let command = match tracker.watch(self.pool.execute(move || source.next_command())).await {
                Ok(command) => command,
                Err(e) => {
                    error!("Command production failed: {}", e);
                    self.close().await;
                    return Err(e.into());
                }
            };

            if tracker.transition(epoch, CycleEvent::Dispatched).is_stale() {
                debug!("Dropping command produced in {} after reconnect to {}", epoch, tracker.current());
                continue;
            }
            tracker.stats.dispatched += 1;

            let result = tracker.watch(self.dispatcher.dispatch(&command)).await;
            let event = match &result {
                Ok(()) => {
                    tracker.stats.succeeded += 1;
                    CycleEvent::Succeeded
                }
                Err(e) => {
                    error!("Error sending command: {}", e);
                    tracker.stats.failed += 1;
                    CycleEvent::Failed
                }
            };
            tracker.settle(epoch, event);

            let delay = pacing.next_delay(result.is_ok());
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tracker.watch(tokio::time::sleep(delay)).await;
            }
        }

        info!("Reconnect listener closed, stopping after {} commands", tracker.stats.dispatched);
        self.close().await;
        Ok(tracker.stats)
    }

    /// Release the worker pool and the transport; later calls do nothing
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close();
        self.dispatcher.transport.close().await;
        info!("Exerciser closed");
    }
}

/// Sends one command through a fresh request handle
struct Dispatcher<T: TransportHandle + ?Sized> {
    transport: Arc<T>,
    reporter: Arc<dyn ResponseReporter>,
    tenant_id: String,
    device_id: String,
    timeout: Duration,
}

impl<T: TransportHandle + ?Sized> Dispatcher<T> {
    async fn dispatch(&self, command: &Command) -> Result<(), TransportError> {
        let mut client: Box<dyn RequestHandle> = self
            .transport
            .request_client(&self.tenant_id, &self.device_id)
            .await?;
        client.set_timeout(self.timeout);

        info!(
            "Command '{}' sent to device [{}:{}] [request will timeout in {} seconds]",
            command.name(),
            self.tenant_id,
            self.device_id,
            self.timeout.as_secs_f64()
        );

        let exchange = async {
            if command.is_one_way() {
                client
                    .send_one_way(command.name(), command.content_type(), command.payload().clone())
                    .await?;
                info!("One-way command '{}' delivered", command.name());
                return Ok(());
            }

            let outcome = client
                .send(command.name(), command.content_type(), command.payload().clone())
                .await?;
            if !outcome.success {
                let message = outcome.error_message.unwrap_or_else(|| "no error message".into());
                return Err(TransportError::DeviceFailure(message));
            }
            self.reporter.report(&outcome);
            Ok::<_, TransportError>(())
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        };

        client.close().await;
        trace!("Close command connection to device [{}:{}]", self.tenant_id, self.device_id);
        result
    }
}

/// Epoch bookkeeping fed by the transport's reconnect notifications
struct EpochTracker {
    reconnects: broadcast::Receiver<Connection>,
    listening: bool,
    fsm: CycleStateMachine,
    stats: RunStats,
}

impl EpochTracker {
    fn new(reconnects: broadcast::Receiver<Connection>) -> Self {
        Self {
            reconnects,
            listening: true,
            fsm: CycleStateMachine::new(),
            stats: RunStats::default(),
        }
    }

    fn current(&self) -> Epoch {
        self.fsm.epoch()
    }

    fn begin(&mut self, connection: &Connection) {
        let epoch = self.fsm.begin_epoch();
        self.stats.epochs += 1;
        if epoch.get() == 1 {
            info!("Connected to {}", connection.peer);
        } else {
            warn!(
                "Reconnected to {} (transport epoch {}), starting {}",
                connection.peer, connection.epoch, epoch
            );
        }
    }

    fn lagged(&mut self, missed: u64) {
        warn!("Missed {} reconnect notification(s)", missed);
        let epoch = self.fsm.begin_epoch();
        self.stats.epochs += 1;
        debug!("Starting {} after lag", epoch);
    }

    /// Apply notifications queued since the last check; false once the listener is closed
    fn apply_pending(&mut self) -> bool {
        loop {
            match self.reconnects.try_recv() {
                Ok(connection) => self.begin(&connection),
                Err(TryRecvError::Lagged(missed)) => self.lagged(missed),
                Err(TryRecvError::Empty) => return self.listening,
                Err(TryRecvError::Closed) => {
                    self.listening = false;
                    return false;
                }
            }
        }
    }

    /// Drive `fut` to completion while keeping up with reconnect notifications
    async fn watch<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            if !self.listening {
                return fut.await;
            }
            let event = tokio::select! {
                biased;
                output = &mut fut => return output,
                event = self.reconnects.recv() => event,
            };
            match event {
                Ok(connection) => self.begin(&connection),
                Err(RecvError::Lagged(missed)) => self.lagged(missed),
                Err(RecvError::Closed) => self.listening = false,
            }
        }
    }

    fn transition(&mut self, epoch: Epoch, event: CycleEvent) -> TransitionResult {
        let result = self.fsm.process_event(epoch, event);
        if let TransitionResult::Invalid { from, event } = &result {
            warn!("Ignoring {:?} while {:?}", event, from);
        }
        result
    }

    /// Record the end of a cycle started in `epoch`
    fn settle(&mut self, epoch: Epoch, event: CycleEvent) {
        if let TransitionResult::Stale { epoch: stale, current } = self.transition(epoch, event) {
            self.stats.stale += 1;
            debug!("Completion from {} ignored, now in {}", stale, current);
            return;
        }
        self.transition(epoch, CycleEvent::Settled);
    }
}
