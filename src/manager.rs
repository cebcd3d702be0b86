// src/manager.rs

use crate::config::{ConfigError, ManagerConfig};
use crate::mirror::{FirstMirror, MirrorSelector, PreferredHost};
use crate::models::{BookItem, TaskEvent, TaskId, TaskSnapshot};
use crate::store::{StoreError, TaskStore};
use crate::task::{Binding, DownloadTask};
use crate::throttle::Throttle;
use crate::transport::{HttpTransport, TransferError, Transport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransferError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("download manager must be created inside a tokio runtime")]
    NoRuntime,
}

/// Owns the task list and the worker(s) draining it.
///
/// Producers call [`enqueue`](Self::enqueue) or one of the `download`
/// variants from any thread; each worker takes the oldest task that has
/// never been started and awaits [`DownloadTask::join`] before looking
/// again, so with the default single worker there is one transfer at a time.
pub struct DownloadManager {
    config: ManagerConfig,
    tasks: Mutex<Vec<Arc<DownloadTask>>>,
    /// Carries the workers' wakeup, signalled whenever a task becomes
    /// claimable; workers re-check the list on wake.
    binding: Binding,
    store: Option<Arc<TaskStore>>,
    store_events: Mutex<Option<broadcast::Receiver<TaskEvent>>>,
    workers: TaskTracker,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            config,
            tasks: Mutex::new(Vec::new()),
            binding: Binding {
                transport,
                selector: Arc::new(FirstMirror),
                events,
                wakeup: Arc::new(Notify::new()),
                runtime,
            },
            store: None,
            store_events: Mutex::new(None),
            workers: TaskTracker::new(),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// HTTP transport, mirror preference and state database as configured,
    /// with saved tasks already restored.
    pub async fn from_config(config: ManagerConfig) -> Result<Arc<Self>, ManagerError> {
        config.validate()?;
        let transport = HttpTransport::new(
            &config.user_agent,
            config.connect_timeout(),
            Throttle::new(config.rate_limit),
        )?;
        let mut manager = Self::new(config.clone(), Arc::new(transport))?;
        if !config.preferred_mirrors.is_empty() {
            manager = manager.with_selector(Arc::new(PreferredHost::new(config.preferred_mirrors.clone())));
        }
        if let Some(path) = &config.state_db {
            manager = manager.with_store(TaskStore::open(path).await?);
        }
        let manager = Arc::new(manager);
        manager.restore().await?;
        Ok(manager)
    }

    pub fn with_selector(mut self, selector: Arc<dyn MirrorSelector>) -> Self {
        self.binding.selector = selector;
        self
    }

    /// Persists every task change into `store`.
    pub fn with_store(mut self, store: TaskStore) -> Self {
        *self.store_events.get_mut().unwrap_or_else(PoisonError::into_inner) =
            Some(self.binding.events.subscribe());
        self.store = Some(Arc::new(store));
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Spawns the configured number of workers. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self
            .store_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(store), Some(rx)) = (self.store.clone(), rx) {
            self.workers
                .spawn_on(Arc::clone(self).persist(store, rx), &self.binding.runtime);
        }
        for worker in 0..self.config.workers {
            self.workers
                .spawn_on(Arc::clone(self).work(worker), &self.binding.runtime);
        }
        info!(workers = self.config.workers, "download manager started");
    }

    /// Pauses running transfers, stops the workers and writes the final
    /// state of every task to the store.
    pub async fn shutdown(&self) {
        self.pause_all();
        self.shutdown.cancel();
        self.workers.close();
        self.workers.wait().await;
        if let Some(store) = &self.store {
            for task in self.tasks() {
                task.wait_idle().await;
                if let Err(err) = store.save(&task.snapshot()).await {
                    error!(task = %task.id(), %err, "could not save task state");
                }
            }
        }
        info!("download manager stopped");
    }

    /// Events for every insertion, removal and state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.binding.events.subscribe()
    }

    /// Appends `task` and wakes a worker. Returns false if a task with the
    /// same id is already listed or the task was removed before.
    pub fn enqueue(&self, task: Arc<DownloadTask>) -> bool {
        self.enqueue_all([task]) == 1
    }

    /// Appends every task in one step. Returns how many were added.
    pub fn enqueue_all<I>(&self, tasks: I) -> usize
    where
        I: IntoIterator<Item = Arc<DownloadTask>>,
    {
        let mut added = Vec::new();
        {
            let mut list = self.lock_tasks();
            let mut known: HashSet<TaskId> = list.iter().map(|t| t.id()).collect();
            for task in tasks {
                if task.is_retired() || !known.insert(task.id()) {
                    debug!(task = %task.id(), "skipping task already seen by the manager");
                    continue;
                }
                task.bind(self.binding.clone());
                list.push(Arc::clone(&task));
                added.push(task);
            }
        }
        for task in &added {
            info!(task = %task.id(), title = %task.book().title, url = task.url().unwrap_or("-"), "queued");
            self.publish(TaskEvent::Added(task.id()));
            self.binding.wakeup.notify_one();
        }
        added.len()
    }

    /// Queues the book through the mirror selector. A book without a usable
    /// link is logged and skipped.
    pub fn download(&self, book: impl Into<Arc<BookItem>>) -> Option<Arc<DownloadTask>> {
        let task = self.build_task(book.into())?;
        self.enqueue(Arc::clone(&task)).then_some(task)
    }

    /// Queues an explicit URL for `book`, no mirror selection.
    pub fn download_url(&self, url: impl Into<String>, book: impl Into<Arc<BookItem>>) -> Arc<DownloadTask> {
        let task = DownloadTask::new(url, book.into(), &self.config.download_dir);
        self.enqueue(Arc::clone(&task));
        task
    }

    /// Bulk variant of [`download`](Self::download). Books without a link
    /// are left out; the rest are queued in order.
    pub fn download_books<I, B>(&self, books: I) -> Vec<Arc<DownloadTask>>
    where
        I: IntoIterator<Item = B>,
        B: Into<Arc<BookItem>>,
    {
        let tasks: Vec<_> = books
            .into_iter()
            .filter_map(|book| self.build_task(book.into()))
            .collect();
        self.enqueue_all(tasks.iter().cloned());
        tasks
    }

    /// Queues every book the user has selected.
    pub fn download_selected(&self, selection: &[Arc<BookItem>]) -> Vec<Arc<DownloadTask>> {
        self.download_books(selection.iter().cloned())
    }

    fn build_task(&self, book: Arc<BookItem>) -> Option<Arc<DownloadTask>> {
        match DownloadTask::for_book(book, self.binding.selector.as_ref(), &self.config.download_dir) {
            Ok(task) => Some(task),
            Err(err) => {
                warn!(%err, "not queueing download");
                None
            }
        }
    }

    /// Takes the task off the list.
    ///
    /// A transfer that is running keeps going until it ends; pause the task
    /// first to stop it. A suspended task no longer holds its worker.
    pub fn remove(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.remove_all(&[id]).pop()
    }

    pub fn remove_all(&self, ids: &[TaskId]) -> Vec<Arc<DownloadTask>> {
        let removed: Vec<_> = {
            let mut list = self.lock_tasks();
            let (gone, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|t| ids.contains(&t.id()));
            *list = kept;
            gone
        };
        for task in &removed {
            task.retire();
            info!(task = %task.id(), "removed");
            self.publish(TaskEvent::Removed(task.id()));
        }
        removed
    }

    /// Pauses every loading task. Others are untouched.
    pub fn pause_all(&self) -> usize {
        self.tasks().iter().filter(|t| t.pause()).count()
    }

    /// Resumes every suspended task.
    pub fn resume_all(&self) -> usize {
        self.tasks().iter().filter(|t| t.resume()).count()
    }

    /// Empties the list, then pauses every task and waits until none of
    /// them writes any more.
    ///
    /// Tasks are retired before they are paused, so one a worker claimed
    /// but has not started yet can no longer begin its transfer.
    pub async fn clear(&self) {
        let drained = std::mem::take(&mut *self.lock_tasks());
        for task in &drained {
            task.retire();
            task.pause();
        }
        for task in &drained {
            task.wait_idle().await;
            self.publish(TaskEvent::Removed(task.id()));
        }
        info!(count = drained.len(), "cleared download list");
    }

    /// Reloads tasks saved by a previous run. Returns how many came back.
    pub async fn restore(&self) -> Result<usize, ManagerError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let saved = store.load_all().await?;
        let restored = self.enqueue_all(saved.into_iter().map(DownloadTask::restore));
        if restored > 0 {
            info!(restored, "restored saved downloads");
        }
        Ok(restored)
    }

    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.lock_tasks().clone()
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks().iter().map(|t| t.snapshot()).collect()
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.lock_tasks().iter().find(|t| t.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_tasks().is_empty()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<Arc<DownloadTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: TaskEvent) {
        // no subscribers is fine
        let _ = self.binding.events.send(event);
    }

    /// First never-started task in list order, marked started under the lock.
    fn claim_next(&self) -> Option<Arc<DownloadTask>> {
        let list = self.lock_tasks();
        list.iter()
            .find(|t| !t.is_started())
            .filter(|t| t.claim())
            .cloned()
    }

    /// Blocks until a task can be claimed or the manager shuts down.
    async fn next_task(&self) -> Option<Arc<DownloadTask>> {
        loop {
            let notified = self.binding.wakeup.notified();
            tokio::pin!(notified);
            // register before checking so an enqueue in between is not lost
            notified.as_mut().enable();

            if let Some(task) = self.claim_next() {
                return Some(task);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    async fn work(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker waiting for tasks");
        while let Some(task) = self.next_task().await {
            debug!(worker, task = %task.id(), "worker picked task");
            tokio::select! {
                _ = task.join() => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        debug!(worker, "worker stopped");
    }

    async fn persist(self: Arc<Self>, store: Arc<TaskStore>, mut events: broadcast::Receiver<TaskEvent>) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.shutdown.cancelled() => break,
            };
            let result = match event {
                Ok(TaskEvent::Added(id)) | Ok(TaskEvent::StateChanged(id, _)) => match self.get(id) {
                    Some(task) => store.save(&task.snapshot()).await,
                    None => Ok(()),
                },
                Ok(TaskEvent::Removed(id)) => store.delete(id).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "state store fell behind, saving every task");
                    self.save_all(&store).await
                }
                Err(RecvError::Closed) => break,
            };
            if let Err(err) = result {
                error!(%err, "could not persist task state");
            }
        }
    }

    async fn save_all(&self, store: &TaskStore) -> Result<(), StoreError> {
        let snapshots = self.snapshots();
        store.clear().await?;
        for snapshot in &snapshots {
            store.save(snapshot).await?;
        }
        Ok(())
    }
}
