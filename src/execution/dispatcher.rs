//! # Worker Pool Dispatcher
//!
//! Actor that owns the [`WorkerPool`] and drives every unit through
//! `Free → Busy → Free`.
//!
//! ## Flow
//!
//! ```text
//! image-resize delivery ─submit─▶ JobReceived
//!     no free unit ─────────────▶ requeue(delay)
//!     fetch (spawned) ──────────▶ FetchCompleted
//!         failed / non-2xx ─────▶ requeue(delay)
//!         assign → arm timer → send `process`
//! unit `complete` ──────────────▶ UnitCompleted
//!     no record ────────────────▶ discard
//!     upload (spawned) ─────────▶ finish | requeue, then UploadFinished → Free
//! timer ────────────────────────▶ AssignmentTimedOut → Free, requeue once
//! close / error ────────────────▶ UnitDisconnected → remove, requeue if awaiting
//! ```
//!
//! All pool mutation happens on the actor task. Fetches, uploads, broker
//! acknowledgements and timers run in spawned tasks and report back through
//! the command channel, so handlers never block on I/O.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fetch::{FetchError, FetchedImage, ImageFetcher};
use super::storage::{object_key, BlobStore, PutObjectRequest, StorageError};
use super::transport::{decode_content, ProcessTask, UnitMessage};
use super::worker_pool::{
    AssignmentId, AssignmentPhase, AssignmentRecord, ConnectionId, PoolSnapshot, WorkerPool,
    WorkerPoolError,
};
use crate::config::{ConfigResult, RszrConfig};
use crate::events::{decode_event, EventBus, EventType, ResizeJob};
use crate::messaging::{DeadLetterPolicy, QueueDelivery};

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("Dispatcher is not running (operation: {operation})")]
    NotRunning { operation: String },

    #[error("Dispatcher dropped the response to {operation}")]
    ResponseDropped { operation: String },

    #[error("Worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),
}

impl DispatcherError {
    fn not_running(operation: impl Into<String>) -> Self {
        Self::NotRunning {
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bucket: String,
    pub public_read: bool,
    pub requeue_delay: Duration,
    pub assignment_timeout: Duration,
    pub selection_seed: Option<u64>,
}

impl DispatcherConfig {
    pub fn from_config(config: &RszrConfig) -> ConfigResult<Self> {
        let (bucket, _region) = config.storage_target()?;
        Ok(Self {
            bucket,
            public_read: config.storage.public_read,
            requeue_delay: config.dispatcher.requeue_delay(),
            assignment_timeout: config.dispatcher.assignment_timeout(),
            selection_seed: config.dispatcher.selection_seed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

#[derive(Debug)]
pub enum DispatcherCommand {
    UnitConnected {
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<UnitMessage>,
    },
    UnitDisconnected {
        connection_id: ConnectionId,
        reason: DisconnectReason,
    },
    UnitCompleted {
        connection_id: ConnectionId,
        content: String,
    },
    JobReceived {
        delivery: Arc<QueueDelivery>,
    },
    FetchCompleted {
        delivery: Arc<QueueDelivery>,
        job: ResizeJob,
        preferred: ConnectionId,
        result: Result<FetchedImage, FetchError>,
    },
    AssignmentTimedOut {
        connection_id: ConnectionId,
        assignment_id: AssignmentId,
    },
    UploadFinished {
        connection_id: ConnectionId,
        assignment_id: AssignmentId,
        uploaded: bool,
    },
    Snapshot {
        resp: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the dispatcher actor
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    sender: mpsc::UnboundedSender<DispatcherCommand>,
}

impl DispatcherHandle {
    fn send(&self, operation: &str, command: DispatcherCommand) -> Result<(), DispatcherError> {
        self.sender
            .send(command)
            .map_err(|_| DispatcherError::not_running(operation))
    }

    /// Register a new unit; frames for it arrive on the returned receiver
    pub fn unit_connected(
        &self,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<UnitMessage>), DispatcherError> {
        let connection_id = ConnectionId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.send(
            "unit_connected",
            DispatcherCommand::UnitConnected {
                connection_id,
                sender,
            },
        )?;
        Ok((connection_id, receiver))
    }

    pub fn unit_completed(
        &self,
        connection_id: ConnectionId,
        content: impl Into<String>,
    ) -> Result<(), DispatcherError> {
        self.send(
            "unit_completed",
            DispatcherCommand::UnitCompleted {
                connection_id,
                content: content.into(),
            },
        )
    }

    pub fn unit_disconnected(&self, connection_id: ConnectionId) -> Result<(), DispatcherError> {
        self.send(
            "unit_disconnected",
            DispatcherCommand::UnitDisconnected {
                connection_id,
                reason: DisconnectReason::Closed,
            },
        )
    }

    /// Transport errors count as a disconnect
    pub fn unit_errored(
        &self,
        connection_id: ConnectionId,
        error: impl fmt::Display,
    ) -> Result<(), DispatcherError> {
        self.send(
            "unit_errored",
            DispatcherCommand::UnitDisconnected {
                connection_id,
                reason: DisconnectReason::Error(error.to_string()),
            },
        )
    }

    /// Hand an `image-resize` delivery to the dispatcher
    pub fn submit(&self, delivery: Arc<QueueDelivery>) -> Result<(), DispatcherError> {
        self.send("submit", DispatcherCommand::JobReceived { delivery })
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot, DispatcherError> {
        let (resp, rx) = oneshot::channel();
        self.send("snapshot", DispatcherCommand::Snapshot { resp })?;
        rx.await.map_err(|_| DispatcherError::ResponseDropped {
            operation: "snapshot".to_string(),
        })
    }

    /// Requeue in-flight work and stop the actor
    pub async fn shutdown(&self) -> Result<(), DispatcherError> {
        let (resp, rx) = oneshot::channel();
        self.send("shutdown", DispatcherCommand::Shutdown { resp })?;
        rx.await.map_err(|_| DispatcherError::ResponseDropped {
            operation: "shutdown".to_string(),
        })
    }

    /// Feed `image-resize` deliveries from `bus` into this dispatcher.
    ///
    /// A delivery arriving after the dispatcher stopped is requeued with the
    /// bus's requeue delay.
    pub fn register(&self, bus: &EventBus, channel: &str) {
        let handle = self.clone();
        let requeue_delay = bus.requeue_delay();
        bus.on(EventType::ImageResize, move |delivery| {
            let handle = handle.clone();
            async move {
                if let Err(e) = handle.submit(Arc::clone(&delivery)) {
                    warn!(message_id = %delivery.id(), error = %e, "Dispatcher is gone, requeueing job");
                    if let Err(e) = delivery.requeue(requeue_delay).await {
                        error!(message_id = %delivery.id(), error = %e, "Requeue after dispatcher stop failed");
                    }
                }
            }
        });
        bus.consume(EventType::ImageResize, channel);
    }
}

pub struct WorkerPoolDispatcher {
    config: DispatcherConfig,
    pool: WorkerPool,
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn BlobStore>,
    dead_letter: DeadLetterPolicy,
    receiver: mpsc::UnboundedReceiver<DispatcherCommand>,
    sender: mpsc::WeakUnboundedSender<DispatcherCommand>,
}

impl fmt::Debug for WorkerPoolDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolDispatcher")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl WorkerPoolDispatcher {
    /// Start the actor task
    pub fn spawn(
        config: DispatcherConfig,
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn BlobStore>,
        dead_letter: DeadLetterPolicy,
    ) -> (DispatcherHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = Self {
            pool: WorkerPool::new(config.selection_seed),
            config,
            fetcher,
            store,
            dead_letter,
            receiver,
            sender: sender.downgrade(),
        };
        let task = tokio::spawn(actor.run());
        (DispatcherHandle { sender }, task)
    }

    async fn run(mut self) {
        info!(
            bucket = %self.config.bucket,
            assignment_timeout_ms = self.config.assignment_timeout.as_millis() as u64,
            requeue_delay_ms = self.config.requeue_delay.as_millis() as u64,
            "🚀 Dispatcher started"
        );

        while let Some(command) = self.receiver.recv().await {
            match command {
                DispatcherCommand::UnitConnected {
                    connection_id,
                    sender,
                } => self.on_connect(connection_id, sender),
                DispatcherCommand::UnitDisconnected {
                    connection_id,
                    reason,
                } => self.on_disconnect(connection_id, &reason),
                DispatcherCommand::UnitCompleted {
                    connection_id,
                    content,
                } => self.on_complete(connection_id, &content),
                DispatcherCommand::JobReceived { delivery } => self.on_job(delivery),
                DispatcherCommand::FetchCompleted {
                    delivery,
                    job,
                    preferred,
                    result,
                } => self.on_fetched(delivery, job, preferred, result),
                DispatcherCommand::AssignmentTimedOut {
                    connection_id,
                    assignment_id,
                } => self.on_timeout(connection_id, assignment_id),
                DispatcherCommand::UploadFinished {
                    connection_id,
                    assignment_id,
                    uploaded,
                } => self.on_upload_finished(connection_id, assignment_id, uploaded),
                DispatcherCommand::Snapshot { resp } => {
                    let _ = resp.send(self.pool.snapshot());
                }
                DispatcherCommand::Shutdown { resp } => {
                    self.drain().await;
                    let _ = resp.send(());
                    break;
                }
            }
        }

        info!("Dispatcher stopped");
    }

    fn on_connect(
        &mut self,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<UnitMessage>,
    ) {
        match self.pool.register(connection_id, sender) {
            Ok(()) => info!(
                connection_id = %connection_id,
                units = self.pool.len(),
                free = self.pool.free_count(),
                "🔌 Unit connected"
            ),
            Err(e) => error!(connection_id = %connection_id, error = %e, "Unit registration failed"),
        }
    }

    fn on_disconnect(&mut self, connection_id: ConnectionId, reason: &DisconnectReason) {
        let Some(unit) = self.pool.remove(connection_id) else {
            debug!(connection_id = %connection_id, reason = %reason, "Disconnect for unknown unit");
            return;
        };

        info!(
            connection_id = %connection_id,
            reason = %reason,
            units = self.pool.len(),
            "Unit disconnected"
        );

        if let Some(record) = unit.into_record() {
            match record.phase {
                AssignmentPhase::AwaitingResult => {
                    warn!(
                        connection_id = %connection_id,
                        target_uri = %record.job.target_uri,
                        "Busy unit went away, requeueing its job"
                    );
                    self.requeue(Arc::clone(&record.delivery), "unit disconnected");
                }
                AssignmentPhase::Uploading => {
                    debug!(
                        connection_id = %connection_id,
                        target_uri = %record.job.target_uri,
                        "Unit went away during upload, upload resolves the job"
                    );
                }
            }
        }
    }

    fn on_job(&mut self, delivery: Arc<QueueDelivery>) {
        if self.dead_letter.exceeds_attempts(&delivery) {
            self.reject(delivery, "attempt ceiling exceeded".to_string());
            return;
        }

        let job: ResizeJob = match decode_event(&delivery) {
            Ok(job) => job,
            Err(e) => {
                self.reject(delivery, e.to_string());
                return;
            }
        };

        let Some(preferred) = self.pool.select_free() else {
            warn!(
                message_id = %delivery.id(),
                target_uri = %job.target_uri,
                units = self.pool.len(),
                "No units available"
            );
            self.requeue(delivery, "no free unit");
            return;
        };

        debug!(
            message_id = %delivery.id(),
            connection_id = %preferred,
            uri = %job.uri,
            "Downloading source image"
        );

        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let fetcher = Arc::clone(&self.fetcher);
        tokio::spawn(async move {
            let result = fetcher.fetch(&job.uri).await;
            let _ = sender.send(DispatcherCommand::FetchCompleted {
                delivery,
                job,
                preferred,
                result,
            });
        });
    }

    fn on_fetched(
        &mut self,
        delivery: Arc<QueueDelivery>,
        job: ResizeJob,
        preferred: ConnectionId,
        result: Result<FetchedImage, FetchError>,
    ) {
        let image = match result {
            Ok(image) if image.is_success() => image,
            Ok(image) => {
                warn!(uri = %job.uri, status = image.status, "Invalid status code for source image");
                self.requeue(delivery, "source returned non-2xx");
                return;
            }
            Err(e) => {
                warn!(uri = %job.uri, error = %e, "Could not retrieve source image");
                self.requeue(delivery, "source fetch failed");
                return;
            }
        };

        // the preferred unit may have been taken or dropped while downloading
        let connection_id = if self.pool.is_free(preferred) {
            Some(preferred)
        } else {
            self.pool.select_free()
        };
        let Some(connection_id) = connection_id else {
            warn!(target_uri = %job.target_uri, "No units left after download");
            self.requeue(delivery, "no free unit");
            return;
        };

        let task = ProcessTask::for_job(&job, &image.bytes);
        let assignment_id = self.pool.next_assignment_id();
        let record = AssignmentRecord::new(
            assignment_id,
            connection_id,
            Arc::clone(&delivery),
            job,
            image.content_type,
        );

        let mut timer = self.arm_timer(connection_id, assignment_id);
        match self.pool.assign(connection_id, record) {
            Ok(record) => {
                if let Some(timer) = timer.take() {
                    record.arm_timeout(timer);
                }
                info!(
                    connection_id = %connection_id,
                    assignment_id = %assignment_id,
                    target_uri = %record.job.target_uri,
                    "Job assigned"
                );
            }
            Err(e) => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                error!(connection_id = %connection_id, error = %e, "Assignment failed");
                self.requeue(delivery, "assignment failed");
                return;
            }
        }

        let delivered = self
            .pool
            .sender(connection_id)
            .is_some_and(|sender| sender.send(UnitMessage::Process(task)).is_ok());
        if !delivered {
            self.on_disconnect(
                connection_id,
                &DisconnectReason::Error("unit channel closed".to_string()),
            );
        }
    }

    fn on_complete(&mut self, connection_id: ConnectionId, content: &str) {
        let Some(record) = self
            .pool
            .record_mut(connection_id)
            .filter(|record| record.phase == AssignmentPhase::AwaitingResult)
        else {
            warn!(connection_id = %connection_id, "No data for this completion, discard");
            return;
        };
        record.cancel_timeout();

        let bytes = match decode_content(content) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Undecodable unit result");
                if let Some(record) = self.pool.release(connection_id) {
                    self.requeue(Arc::clone(&record.delivery), "undecodable result");
                }
                return;
            }
        };

        let key = match object_key(&record.job.target_uri) {
            Ok(key) => key,
            Err(e) => {
                if let Some(record) = self.pool.release(connection_id) {
                    self.reject(Arc::clone(&record.delivery), e.to_string());
                }
                return;
            }
        };

        record.phase = AssignmentPhase::Uploading;
        let assignment_id = record.assignment_id;
        let delivery = Arc::clone(&record.delivery);
        let target_uri = record.job.target_uri.clone();
        let request = PutObjectRequest {
            bucket: self.config.bucket.clone(),
            key,
            bytes,
            content_type: record.content_type.clone(),
            public_read: self.config.public_read,
        };

        debug!(
            connection_id = %connection_id,
            target_uri = %target_uri,
            size = request.bytes.len(),
            "Uploading resized image"
        );

        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let requeue_delay = self.config.requeue_delay;
        tokio::spawn(async move {
            let uploaded = upload_and_acknowledge(
                store.as_ref(),
                request,
                &delivery,
                &target_uri,
                requeue_delay,
            )
            .await;
            let _ = sender.send(DispatcherCommand::UploadFinished {
                connection_id,
                assignment_id,
                uploaded,
            });
        });
    }

    fn on_upload_finished(
        &mut self,
        connection_id: ConnectionId,
        assignment_id: AssignmentId,
        uploaded: bool,
    ) {
        let current = self
            .pool
            .record(connection_id)
            .is_some_and(|record| record.assignment_id == assignment_id);
        if !current {
            debug!(
                connection_id = %connection_id,
                assignment_id = %assignment_id,
                "Upload finished for a unit that is gone"
            );
            return;
        }

        self.pool.release(connection_id);
        if uploaded {
            self.pool.record_completion(connection_id);
        }
        debug!(
            connection_id = %connection_id,
            free = self.pool.free_count(),
            "Unit returned to pool"
        );
    }

    fn on_timeout(&mut self, connection_id: ConnectionId, assignment_id: AssignmentId) {
        let expired = self.pool.record(connection_id).is_some_and(|record| {
            record.assignment_id == assignment_id && record.phase == AssignmentPhase::AwaitingResult
        });
        if !expired {
            debug!(
                connection_id = %connection_id,
                assignment_id = %assignment_id,
                "Ignoring stale assignment timer"
            );
            return;
        }

        if let Some(record) = self.pool.release(connection_id) {
            warn!(
                connection_id = %connection_id,
                target_uri = %record.job.target_uri,
                timeout_ms = self.config.assignment_timeout.as_millis() as u64,
                "⏰ Assignment timed out, reclaiming unit"
            );
            self.requeue(Arc::clone(&record.delivery), "assignment timed out");
        }
    }

    /// Requeue every job still awaiting a result
    async fn drain(&mut self) {
        let records = self.pool.release_all();
        for record in records {
            if record.phase == AssignmentPhase::AwaitingResult {
                if let Err(e) = record.delivery.requeue(self.config.requeue_delay).await {
                    warn!(message_id = %record.delivery.id(), error = %e, "Requeue on shutdown failed");
                }
            }
        }
    }

    fn arm_timer(
        &self,
        connection_id: ConnectionId,
        assignment_id: AssignmentId,
    ) -> Option<JoinHandle<()>> {
        let sender = self.sender.upgrade()?;
        let timeout = self.config.assignment_timeout;
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = sender.send(DispatcherCommand::AssignmentTimedOut {
                connection_id,
                assignment_id,
            });
        }))
    }

    fn requeue(&self, delivery: Arc<QueueDelivery>, reason: &'static str) {
        let delay = self.config.requeue_delay;
        tokio::spawn(async move {
            match delivery.requeue(delay).await {
                Ok(()) => debug!(
                    message_id = %delivery.id(),
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "Job requeued"
                ),
                Err(e) => warn!(message_id = %delivery.id(), error = %e, reason, "Requeue failed"),
            }
        });
    }

    fn reject(&self, delivery: Arc<QueueDelivery>, reason: String) {
        let policy = self.dead_letter.clone();
        tokio::spawn(async move {
            policy.reject(&delivery, &reason).await;
        });
    }
}

async fn upload_and_acknowledge(
    store: &dyn BlobStore,
    request: PutObjectRequest,
    delivery: &QueueDelivery,
    target_uri: &str,
    requeue_delay: Duration,
) -> bool {
    match store.put(request).await {
        Ok(()) => {
            info!(target_uri = %target_uri, "✅ Resized image uploaded");
            if let Err(e) = delivery.finish().await {
                warn!(message_id = %delivery.id(), error = %e, "Finish after upload failed");
            }
            true
        }
        Err(e) => {
            log_upload_failure(target_uri, &e);
            if let Err(e) = delivery.requeue(requeue_delay).await {
                warn!(message_id = %delivery.id(), error = %e, "Requeue after failed upload failed");
            }
            false
        }
    }
}

fn log_upload_failure(target_uri: &str, error: &StorageError) {
    error!(target_uri = %target_uri, error = %error, "Upload of resized image failed");
}
