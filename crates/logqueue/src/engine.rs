// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log path wiring and lifecycle.
//!
//! The engine owns one active log path (queue service plus coordinator) for the
//! configured destination, and one drain per abandoned queue file. Sources push
//! through an [`Ingress`] that always points at the active queue.
//!
//! On `reload` the active queue is saved and reopened when its destination and
//! disk-buffer options are unchanged. Otherwise it is abandoned: it keeps
//! draining to its old destination, receives nothing new, and is deleted once
//! empty. A new queue file with the next sequence index takes its place.

use crate::config::{Config, DiskBufferConfig};
use crate::constants::DYNAMIC_WINDOW_TICK;
use crate::coordinator::{Coordinator, Liveness};
use crate::destination;
use crate::disk_queue::{DiskQueue, QueueSnapshot};
use crate::errors::{ConfigError, EngineError, QueueFileError};
use crate::http::{HttpServer, Routes, Webhook};
use crate::persist::{PersistState, QueueRecord};
use crate::qdisk::{next_sequence, QueueFileId};
use crate::queue_service::{QueueHandle, QueueService, ServiceExit};
use crate::source::{Ingress, TcpSource};
use crate::stats::StatsRegistry;
use crate::window::{WindowAllocator, WindowHandle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Engine {
    config: Config,
    stats: Arc<StatsRegistry>,
    store: PersistStore,
    cancel: CancellationToken,
    queue_tx: watch::Sender<QueueHandle>,
    active: Option<LogPath>,
    drains: Vec<LogPath>,
    listeners: Option<Listeners>,
}

impl Engine {
    /// Opens the queues recorded in `disk_buffer.dir`, binds the sources and
    /// starts delivering.
    pub async fn start(config: Config) -> Result<Self, EngineError> {
        let mut config = config;
        config.validate()?;
        config.normalize();
        let stats = Arc::new(StatsRegistry::new()?);
        let dir = config.disk_buffer.dir.clone();
        std::fs::create_dir_all(&dir).map_err(|e| QueueFileError::io(&dir, e))?;

        let store = PersistStore::load(dir);
        let cancel = CancellationToken::new();
        let identity = config.destination.identity();

        let mut reusable = None;
        let mut drains = Vec::new();
        for record in store.state().queues {
            if reusable.is_none()
                && !record.abandoned
                && record.identity == identity
                && record.options == config.disk_buffer
            {
                reusable = Some(record);
                continue;
            }
            let mut queue = open_queue(&record, config.flow_control, &stats)?;
            let mut record = record;
            if !record.abandoned {
                queue.abandon();
                record.abandoned = true;
                store.update(|state| state.upsert(record.clone()))?;
            }
            drains.push(LogPath::spawn(queue, record, &store, &cancel));
        }

        let record = match reusable {
            Some(mut record) => {
                info!(
                    path = %record.path(&record.options.dir).display(),
                    destination = %identity,
                    "Reusing disk-buffer file"
                );
                record.destination = config.destination.clone();
                record
            }
            None => new_record(&config, &store)?,
        };
        let queue = open_queue(&record, config.flow_control, &stats)?;
        store.update(|state| state.upsert(record.clone()))?;
        let active = LogPath::spawn(queue, record, &store, &cancel);

        let (queue_tx, _) = watch::channel(active.handle.clone());
        let listeners =
            Listeners::start(&config, &stats, Ingress::new(queue_tx.subscribe()), &cancel).await?;

        info!(
            destination = %identity,
            abandoned = drains.len(),
            "Engine started"
        );
        Ok(Self {
            config,
            stats,
            store,
            cancel,
            queue_tx,
            active: Some(active),
            drains,
            listeners: Some(listeners),
        })
    }

    /// Applies a new configuration without losing or duplicating buffered
    /// messages.
    ///
    /// Directory and queue file preparation happen before the active queue is
    /// halted. An error there leaves the engine untouched. Failures after the
    /// halt fall back to a queue that keeps accepting messages, and the first
    /// of them is returned.
    pub async fn reload(&mut self, config: Config) -> Result<(), EngineError> {
        let mut config = config;
        config.validate()?;
        config.normalize();
        info!("Reloading configuration");
        self.drains.retain(|drain| !drain.service.is_finished());

        let mut record = self
            .active
            .as_ref()
            .map(|active| active.record.clone())
            .ok_or(EngineError::NotRunning)?;
        let identity = config.destination.identity();
        let reuse = record.identity == identity && record.options == config.disk_buffer;

        let previous_dir = self.config.disk_buffer.dir.clone();
        let dir_changed = config.disk_buffer.dir != previous_dir;
        if dir_changed {
            std::fs::create_dir_all(&config.disk_buffer.dir)
                .map_err(|e| QueueFileError::io(&config.disk_buffer.dir, e))?;
            self.store.move_to(config.disk_buffer.dir.clone())?;
        }
        let fresh = if reuse {
            None
        } else {
            match self.fresh_queue(&config) {
                Ok(fresh) => Some(fresh),
                Err(e) => {
                    if dir_changed {
                        self.restore_store_dir(previous_dir);
                    }
                    return Err(e);
                }
            }
        };

        let Some(current) = self.active.take() else {
            return Err(EngineError::NotRunning);
        };
        let mut queue = current.halt().await;
        let saved = match queue.as_mut() {
            Some(halted) => halted.save().map(|_| ()),
            None => Ok(()),
        };
        if let Err(e) = saved {
            error!(
                path = %record.path(&record.options.dir).display(),
                error = %e,
                "Failed to save disk-buffer file, keeping the previous configuration"
            );
            if let Some((_, fresh_queue)) = fresh {
                discard(fresh_queue);
            }
            if dir_changed {
                self.restore_store_dir(previous_dir);
            }
            self.resume(record, queue)?;
            return Err(e.into());
        }
        drop(queue);

        let mut failure: Option<EngineError> = None;
        let reopened = open_queue(&record, config.flow_control, &self.stats);
        let (next, queue) = match fresh {
            None => match reopened {
                Ok(queue) => {
                    info!(
                        path = %record.path(&record.options.dir).display(),
                        destination = %identity,
                        "Reusing disk-buffer file"
                    );
                    record.destination = config.destination.clone();
                    (record, queue)
                }
                Err(e) => {
                    error!(
                        path = %record.path(&record.options.dir).display(),
                        error = %e,
                        "Failed to reopen disk-buffer file, switching to a new one"
                    );
                    failure.get_or_insert(e);
                    self.keep_for_next_start(record, &mut failure);
                    self.fresh_queue(&config)?
                }
            },
            Some(fresh) => {
                match reopened {
                    Ok(mut abandoned) => {
                        abandoned.abandon();
                        record.abandoned = true;
                        if let Err(e) = self.store.update(|state| state.upsert(record.clone())) {
                            error!(error = %e, "Failed to record abandoned disk-buffer file");
                            failure.get_or_insert(e);
                        }
                        self.drains
                            .push(LogPath::spawn(abandoned, record, &self.store, &self.cancel));
                    }
                    Err(e) => {
                        error!(
                            path = %record.path(&record.options.dir).display(),
                            error = %e,
                            "Failed to reopen abandoned disk-buffer file, it drains on the next start"
                        );
                        failure.get_or_insert(e);
                        self.keep_for_next_start(record, &mut failure);
                    }
                }
                fresh
            }
        };

        if let Err(e) = self.store.update(|state| state.upsert(next.clone())) {
            error!(error = %e, "Failed to record disk-buffer file");
            failure.get_or_insert(e);
        }
        let active = LogPath::spawn(queue, next, &self.store, &self.cancel);
        self.queue_tx.send_replace(active.handle.clone());
        self.active = Some(active);

        let listeners_changed = config.source != self.config.source
            || config.window != self.config.window
            || config.stats != self.config.stats;
        if listeners_changed {
            if let Some(listeners) = self.listeners.take() {
                listeners.stop().await;
            }
            let started = Listeners::start(
                &config,
                &self.stats,
                Ingress::new(self.queue_tx.subscribe()),
                &self.cancel,
            )
            .await;
            match started {
                Ok(listeners) => self.listeners = Some(listeners),
                Err(e) => {
                    error!(error = %e, "Failed to start sources, keeping the previous ones");
                    failure.get_or_insert(e);
                    config.source = self.config.source.clone();
                    config.window = self.config.window;
                    config.stats = self.config.stats.clone();
                    let restarted = Listeners::start(
                        &config,
                        &self.stats,
                        Ingress::new(self.queue_tx.subscribe()),
                        &self.cancel,
                    )
                    .await;
                    match restarted {
                        Ok(listeners) => self.listeners = Some(listeners),
                        Err(e) => error!(error = %e, "Failed to restart the previous sources"),
                    }
                }
            }
        }

        self.config = config;
        match failure {
            Some(e) => Err(e),
            None => {
                info!("Configuration reloaded");
                Ok(())
            }
        }
    }

    /// Stops the sources, then saves every queue so the next start resumes
    /// where this one left off.
    pub async fn stop(mut self) -> Result<(), EngineError> {
        info!("Stopping engine");
        if let Some(listeners) = self.listeners.take() {
            listeners.stop().await;
        }

        let mut result: Result<(), EngineError> = Ok(());
        let paths = self.active.take().into_iter().chain(self.drains.drain(..));
        for path in paths {
            let Some(mut queue) = path.halt().await else {
                continue;
            };
            if let Err(e) = queue.save() {
                error!(error = %e, "Failed to save disk-buffer file");
                result = Err(e.into());
            }
        }

        self.cancel.cancel();
        let persisted = self.store.update(|_| {});
        info!("Engine stopped");
        result.and(persisted)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub fn persist_state(&self) -> PersistState {
        self.store.state()
    }

    /// Handle of the queue currently receiving messages.
    pub fn queue(&self) -> Result<QueueHandle, EngineError> {
        self.active
            .as_ref()
            .map(|active| active.handle.clone())
            .ok_or(EngineError::NotRunning)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, EngineError> {
        self.queue()?.snapshot().await
    }

    /// Snapshots of the abandoned queues still draining.
    pub async fn abandoned_snapshots(&self) -> Vec<QueueSnapshot> {
        let mut snapshots = Vec::new();
        for drain in &self.drains {
            if let Ok(snapshot) = drain.handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub fn liveness(&self) -> Liveness {
        self.active
            .as_ref()
            .map_or(Liveness::Down, |active| *active.liveness.borrow())
    }

    pub fn allocator(&self) -> Option<&WindowAllocator> {
        self.listeners.as_ref().map(|l| &l.allocator)
    }

    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.listeners.as_ref().map(|l| l.source_addr)
    }

    pub fn webhook_addr(&self) -> Option<SocketAddr> {
        self.listeners.as_ref().and_then(|l| l.webhook_addr)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.listeners.as_ref().and_then(|l| l.metrics_addr)
    }
}

impl Engine {
    /// Record and queue of a new file for `config`.
    fn fresh_queue(&self, config: &Config) -> Result<(QueueRecord, DiskQueue), EngineError> {
        let record = new_record(config, &self.store)?;
        let queue = open_queue(&record, config.flow_control, &self.stats)?;
        Ok((record, queue))
    }

    /// Makes `record` the active queue again after a failed reload.
    fn resume(&mut self, record: QueueRecord, queue: Option<DiskQueue>) -> Result<(), EngineError> {
        let queue = match queue {
            Some(queue) => queue,
            None => open_queue(&record, self.config.flow_control, &self.stats)?,
        };
        let active = LogPath::spawn(queue, record, &self.store, &self.cancel);
        self.queue_tx.send_replace(active.handle.clone());
        self.active = Some(active);
        Ok(())
    }

    /// Records a saved file that could not be reopened as abandoned, so the
    /// next start drains it.
    fn keep_for_next_start(&self, record: QueueRecord, failure: &mut Option<EngineError>) {
        let mut record = record;
        record.abandoned = true;
        if let Err(e) = self.store.update(|state| state.upsert(record)) {
            error!(error = %e, "Failed to record abandoned disk-buffer file");
            failure.get_or_insert(e);
        }
    }

    fn restore_store_dir(&self, dir: PathBuf) {
        if let Err(e) = self.store.move_to(dir) {
            error!(error = %e, "Failed to move persist state back");
        }
    }
}

/// Deletes a queue file opened for a reload that did not happen.
fn discard(queue: DiskQueue) {
    let path = queue.path().to_path_buf();
    if let Err(e) = queue.remove() {
        error!(path = %path.display(), error = %e, "Failed to remove unused disk-buffer file");
    }
}

/// A queue with its service task and the coordinator draining it.
struct LogPath {
    record: QueueRecord,
    handle: QueueHandle,
    service: JoinHandle<Option<DiskQueue>>,
    coordinator: JoinHandle<()>,
    cancel: CancellationToken,
    liveness: watch::Receiver<Liveness>,
}

impl LogPath {
    fn spawn(
        queue: DiskQueue,
        record: QueueRecord,
        store: &PersistStore,
        parent: &CancellationToken,
    ) -> Self {
        let (service, handle) = QueueService::new(queue);
        let service = tokio::spawn(run_queue(service, record.file_name.clone(), store.clone()));

        let cancel = parent.child_token();
        let (coordinator, liveness) = Coordinator::new(
            destination::from_config(&record.destination),
            handle.clone(),
            record.destination.time_reopen,
            cancel.clone(),
        );
        let coordinator = tokio::spawn(coordinator.run());

        Self {
            record,
            handle,
            service,
            coordinator,
            cancel,
            liveness,
        }
    }

    /// Stops delivery, then the queue service. Returns the queue unless it was
    /// already drained and removed.
    async fn halt(self) -> Option<DiskQueue> {
        self.cancel.cancel();
        if let Err(e) = self.coordinator.await {
            error!(file = %self.record.file_name, error = %e, "Coordinator task failed");
        }
        if let Err(e) = self.handle.shutdown() {
            debug!(file = %self.record.file_name, error = %e, "Queue service already stopped");
        }
        match self.service.await {
            Ok(queue) => queue,
            Err(e) => {
                error!(file = %self.record.file_name, error = %e, "Queue service task failed");
                None
            }
        }
    }
}

async fn run_queue(service: QueueService, file_name: String, store: PersistStore) -> Option<DiskQueue> {
    match service.run().await {
        ServiceExit::Stopped(queue) => Some(queue),
        ServiceExit::Removed => {
            if let Err(e) = store.update(|state| state.remove(&file_name)) {
                error!(file = %file_name, error = %e, "Failed to forget removed disk-buffer file");
            }
            None
        }
    }
}

fn open_queue(
    record: &QueueRecord,
    flow_control: bool,
    stats: &Arc<StatsRegistry>,
) -> Result<DiskQueue, EngineError> {
    let queue = DiskQueue::open(
        &record.path(&record.options.dir),
        record.id(),
        &record.options,
        flow_control,
        Arc::clone(stats),
        stats.output(&record.identity),
    )?;
    Ok(queue)
}

/// Record of a fresh queue file with the next free sequence index.
fn new_record(config: &Config, store: &PersistStore) -> Result<QueueRecord, EngineError> {
    let options: DiskBufferConfig = config.disk_buffer.clone();
    let on_disk = next_sequence(&options.dir)?;
    let recorded = store
        .state()
        .queues
        .iter()
        .map(|q| q.sequence + 1)
        .max()
        .unwrap_or(0);
    let id = QueueFileId::new(on_disk.max(recorded));
    let file_name = id.file_name(options.reliable);
    debug!(file = %file_name, "Creating disk-buffer file");
    Ok(QueueRecord {
        identity: config.destination.identity(),
        file_name,
        sequence: id.sequence,
        abandoned: false,
        options,
        destination: config.destination.clone(),
    })
}

/// Persist state shared with the queue tasks, saved on every change.
#[derive(Clone)]
struct PersistStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    dir: PathBuf,
    state: PersistState,
}

impl PersistStore {
    fn load(dir: PathBuf) -> Self {
        let state = PersistState::load(&dir);
        Self {
            inner: Arc::new(Mutex::new(StoreInner { dir, state })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn state(&self) -> PersistState {
        self.lock().state.clone()
    }

    fn update(&self, change: impl FnOnce(&mut PersistState)) -> Result<(), EngineError> {
        let mut inner = self.lock();
        change(&mut inner.state);
        inner.state.save(&inner.dir)
    }

    /// Saves the state into `dir` and keeps it there from now on.
    fn move_to(&self, dir: PathBuf) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner.state.save(&dir)?;
        inner.dir = dir;
        Ok(())
    }
}

/// Sources, HTTP servers and the rebalance ticker sharing one allocator.
struct Listeners {
    cancel: CancellationToken,
    allocator: WindowAllocator,
    webhook_window: Option<WindowHandle>,
    tasks: JoinSet<()>,
    source_addr: SocketAddr,
    webhook_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
}

impl Listeners {
    async fn start(
        config: &Config,
        stats: &Arc<StatsRegistry>,
        ingress: Ingress,
        parent: &CancellationToken,
    ) -> Result<Self, EngineError> {
        let cancel = parent.child_token();
        let allocator = WindowAllocator::new(&config.window, Arc::clone(stats));
        let mut tasks = JoinSet::new();

        let host = &config.source.host;
        let source = TcpSource::bind(
            &format!("{host}:{}", config.source.port),
            allocator.clone(),
            ingress.clone(),
            Arc::clone(stats),
            cancel.clone(),
        )
        .await?;
        let source_addr = source
            .local_addr()
            .map_err(|source| EngineError::Bind {
                address: format!("{host}:{}", config.source.port),
                source,
            })?;
        tasks.spawn(source.run());

        let mut webhook_window = None;
        let mut webhook_addr = None;
        let mut metrics_addr = None;

        if let Some(port) = config.source.webhook_port {
            let window = allocator.admit("webhook").map_err(|rejected| {
                ConfigError::InvalidConfig(format!(
                    "max_connections ({}) leaves no room for the webhook source",
                    rejected.max_connections
                ))
            })?;
            let shares_metrics = config.stats.port == Some(port);
            let routes = Routes {
                webhook: Some(Webhook {
                    window: window.clone(),
                    ingress,
                    auth_token: config.source.auth_token.clone(),
                }),
                metrics: shares_metrics.then(|| Arc::clone(stats)),
            };
            let server = HttpServer::bind(&format!("{host}:{port}"), routes, cancel.clone()).await?;
            let addr = local_addr(&server, host, port)?;
            webhook_addr = Some(addr);
            if shares_metrics {
                metrics_addr = Some(addr);
            }
            webhook_window = Some(window);
            tasks.spawn(server.run());
        }

        if let (Some(port), None) = (config.stats.port, metrics_addr) {
            let routes = Routes {
                webhook: None,
                metrics: Some(Arc::clone(stats)),
            };
            let server = HttpServer::bind(&format!("{host}:{port}"), routes, cancel.clone()).await?;
            metrics_addr = Some(local_addr(&server, host, port)?);
            tasks.spawn(server.run());
        }

        if allocator.sizing().is_dynamic() {
            tasks.spawn(run_ticker(allocator.clone(), cancel.clone()));
        }

        Ok(Self {
            cancel,
            allocator,
            webhook_window,
            tasks,
            source_addr,
            webhook_addr,
            metrics_addr,
        })
    }

    async fn stop(mut self) {
        self.cancel.cancel();
        while let Some(finished) = self.tasks.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Listener task failed");
            }
        }
        if let Some(window) = self.webhook_window.take() {
            window.close();
        }
    }
}

fn local_addr(server: &HttpServer, host: &str, port: u16) -> Result<SocketAddr, EngineError> {
    server.local_addr().map_err(|source| EngineError::Bind {
        address: format!("{host}:{port}"),
        source,
    })
}

async fn run_ticker(allocator: WindowAllocator, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(DYNAMIC_WINDOW_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                allocator.tick();
            }
        }
    }
}
