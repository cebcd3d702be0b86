// src/task.rs

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mirror::MirrorSelector;
use crate::models::{part_path, BookItem, TaskEvent, TaskId, TaskSnapshot, TaskState};
use crate::transport::{Progress, TransferError, TransferRequest, Transport};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("book {0} has no download link")]
    NoDownloadLink(String),
}

/// Everything a task needs from its manager to run a transfer.
#[derive(Clone)]
pub struct Binding {
    pub transport: Arc<dyn Transport>,
    pub selector: Arc<dyn MirrorSelector>,
    pub events: broadcast::Sender<TaskEvent>,
    /// Wakes the manager's workers when a task becomes claimable again.
    pub wakeup: Arc<Notify>,
    pub runtime: Handle,
}

/// One download: a URL, the book it belongs to, and its progress.
///
/// Tasks compare and hash by [`TaskId`] only.
pub struct DownloadTask {
    id: TaskId,
    url: OnceLock<String>,
    book: Arc<BookItem>,
    destination: PathBuf,
    state: watch::Sender<TaskState>,
    started: AtomicBool,
    /// Set while a worker is inside `join` for this task.
    joined: AtomicBool,
    bytes: AtomicU64,
    total: AtomicU64,
    /// Stop signal of the transfer currently running; replaced on resume.
    transfer: Mutex<CancellationToken>,
    /// Held for as long as a transfer may write to the part file.
    io: tokio::sync::Mutex<()>,
    /// Fired once the task leaves the manager's list.
    retired: CancellationToken,
    binding: OnceLock<Binding>,
}

impl DownloadTask {
    fn build(id: TaskId, url: Option<String>, book: Arc<BookItem>, destination: PathBuf) -> Self {
        let cell = OnceLock::new();
        if let Some(url) = url {
            let _ = cell.set(url);
        }
        let (state, _) = watch::channel(TaskState::Queued);
        Self {
            id,
            url: cell,
            book,
            destination,
            state,
            started: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
            total: AtomicU64::new(0),
            transfer: Mutex::new(CancellationToken::new()),
            io: tokio::sync::Mutex::new(()),
            retired: CancellationToken::new(),
            binding: OnceLock::new(),
        }
    }

    /// Task bound to an explicit URL.
    pub fn new(url: impl Into<String>, book: Arc<BookItem>, download_dir: &Path) -> Arc<Self> {
        let destination = download_dir.join(book.file_name());
        Arc::new(Self::build(next_id(), Some(url.into()), book, destination))
    }

    /// Task for one of the book's mirrors, chosen now.
    pub fn for_book(
        book: Arc<BookItem>,
        selector: &dyn MirrorSelector,
        download_dir: &Path,
    ) -> Result<Arc<Self>, TaskError> {
        let url = selector
            .select(&book)
            .ok_or_else(|| TaskError::NoDownloadLink(book.id.clone()))?;
        Ok(Self::new(url, book, download_dir))
    }

    /// Task whose mirror is chosen when the worker starts it.
    pub fn unresolved(book: Arc<BookItem>, download_dir: &Path) -> Arc<Self> {
        let destination = download_dir.join(book.file_name());
        Arc::new(Self::build(next_id(), None, book, destination))
    }

    /// Rebuilds a task saved earlier. An interrupted transfer comes back
    /// suspended so it continues from its part file on resume.
    pub fn restore(snapshot: TaskSnapshot) -> Arc<Self> {
        NEXT_TASK_ID.fetch_max(snapshot.id.0 + 1, Ordering::Relaxed);
        let task = Self::build(
            snapshot.id,
            snapshot.url,
            Arc::new(snapshot.book),
            snapshot.destination,
        );
        let state = match snapshot.state {
            TaskState::Loading => TaskState::Suspended,
            other => other,
        };
        task.started
            .store(snapshot.started || state != TaskState::Queued, Ordering::SeqCst);
        task.bytes.store(snapshot.bytes, Ordering::SeqCst);
        task.total.store(snapshot.total, Ordering::SeqCst);
        task.state.send_replace(state);
        Arc::new(task)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn url(&self) -> Option<&str> {
        self.url.get().map(String::as_str)
    }

    pub fn book(&self) -> &Arc<BookItem> {
        &self.book
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            url: self.url.get().cloned(),
            book: (*self.book).clone(),
            destination: self.destination.clone(),
            state: self.state(),
            started: self.is_started(),
            bytes: self.bytes(),
            total: self.total(),
        }
    }

    /// Attaches the task to a manager. Only the first binding counts.
    pub fn bind(&self, binding: Binding) {
        let _ = self.binding.set(binding);
    }

    /// Marks the task as picked by a worker. Returns false if it already was.
    pub(crate) fn claim(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn retire(&self) {
        self.retired.cancel();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Runs the task on the calling worker.
    ///
    /// Returns once the task is done or failed, or once it has been retired
    /// with no transfer in flight. A suspended task keeps the caller waiting
    /// until it is resumed or retired.
    pub async fn join(self: &Arc<Self>) {
        self.started.store(true, Ordering::SeqCst);
        self.joined.store(true, Ordering::SeqCst);
        let _joined = JoinGuard(self);
        let Some(binding) = self.binding.get().cloned() else {
            self.fail_from(TaskState::Queued, "task is not attached to a manager".into());
            return;
        };
        if self.retired.is_cancelled() {
            return;
        }

        if self.url.get().is_none() {
            match binding.selector.select(&self.book) {
                Some(url) => {
                    let _ = self.url.set(url);
                }
                None => {
                    warn!(task = %self.id, book = %self.book.id, "no mirror available at start");
                    self.fail_from(TaskState::Queued, TaskError::NoDownloadLink(self.book.id.clone()).to_string());
                    return;
                }
            }
        }

        let mut token = None;
        self.transition(|s| {
            (*s == TaskState::Queued && !self.is_retired()).then(|| {
                token = Some(self.fresh_token());
                TaskState::Loading
            })
        });
        if let Some(token) = token {
            info!(task = %self.id, title = %self.book.title, "download started");
            self.run_transfer(binding.transport, token).await;
        }
        self.settle().await;
    }

    /// Stops a loading transfer. No-op in any other state.
    pub fn pause(&self) -> bool {
        let paused = self.transition(|s| {
            (*s == TaskState::Loading).then(|| {
                self.current_token().cancel();
                TaskState::Suspended
            })
        });
        if paused {
            debug!(task = %self.id, "paused");
        }
        paused
    }

    /// Restarts a suspended transfer from the bytes already on disk.
    /// No-op in any other state and once the task has been removed.
    ///
    /// While a worker is still joined on the task the transfer restarts at
    /// once on that worker's slot. Otherwise the task goes back to `Queued`
    /// and waits for a free worker like any other task.
    pub fn resume(self: &Arc<Self>) -> bool {
        let Some(binding) = self.binding.get().cloned() else {
            return false;
        };
        if self.url.get().is_none() {
            return false;
        }
        let mut token = None;
        let resumed = self.transition(|s| {
            if *s != TaskState::Suspended || self.is_retired() {
                return None;
            }
            if self.joined.load(Ordering::SeqCst) {
                token = Some(self.fresh_token());
                Some(TaskState::Loading)
            } else {
                self.started.store(false, Ordering::SeqCst);
                Some(TaskState::Queued)
            }
        });
        if !resumed {
            return false;
        }
        match token {
            Some(token) => {
                debug!(task = %self.id, offset = self.bytes(), "resumed");
                let task = Arc::clone(self);
                let transport = binding.transport.clone();
                binding
                    .runtime
                    .spawn(async move { task.run_transfer(transport, token).await });
            }
            None => {
                debug!(task = %self.id, offset = self.bytes(), "requeued for a free worker");
                binding.wakeup.notify_one();
            }
        }
        true
    }

    /// Resolves once no transfer is writing for this task.
    pub async fn wait_idle(&self) {
        let _gate = self.io.lock().await;
    }

    async fn run_transfer(&self, transport: Arc<dyn Transport>, cancel: CancellationToken) {
        let _gate = self.io.lock().await;
        // a previous transfer may have finished while this one waited
        if cancel.is_cancelled() || self.state().is_terminal() {
            return;
        }
        let Some(url) = self.url.get().cloned() else {
            return;
        };

        let part = part_path(&self.destination);
        let offset = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
        self.bytes.store(offset, Ordering::SeqCst);
        let request = TransferRequest { url, part_path: part, offset };

        match transport.fetch(&request, &TaskProgress(self), &cancel).await {
            Ok(outcome) => {
                if let Err(err) = tokio::fs::rename(&request.part_path, &self.destination).await {
                    let reason = format!("could not move {} into place: {err}", request.part_path.display());
                    self.fail_from(TaskState::Loading, reason);
                    return;
                }
                self.bytes.store(outcome.total, Ordering::SeqCst);
                self.total.store(outcome.total, Ordering::SeqCst);
                if self.transition(|s| (!s.is_terminal()).then_some(TaskState::Done)) {
                    info!(task = %self.id, bytes = outcome.total, path = %self.destination.display(), "download finished");
                }
            }
            Err(TransferError::Paused) => {
                debug!(task = %self.id, bytes = self.bytes(), "transfer stopped");
            }
            // errors racing a pause are dropped; resume retries
            Err(err) => self.fail_from(TaskState::Loading, err.to_string()),
        }
    }

    async fn settle(&self) {
        let mut rx = self.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.is_terminal() {
                    return;
                }
                if self.retired.is_cancelled() && *state != TaskState::Loading {
                    return;
                }
            }
            if self.retired.is_cancelled() {
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.retired.cancelled() => {}
            }
        }
    }

    fn fail_from(&self, from: TaskState, reason: String) {
        if self.transition(|s| (*s == from).then(|| TaskState::Failed(reason.clone()))) {
            warn!(task = %self.id, title = %self.book.title, %reason, "download failed");
        }
    }

    /// Applies `next` atomically against the current state and publishes
    /// the result. Returns whether the state changed.
    ///
    /// `next` runs with the state locked, so token swaps done inside it
    /// cannot interleave with another transition.
    fn transition(&self, next: impl FnOnce(&TaskState) -> Option<TaskState>) -> bool {
        self.state.send_if_modified(|state| match next(state) {
            Some(new) => {
                // published under the lock so subscribers see transitions in order
                if let Some(binding) = self.binding.get() {
                    let _ = binding.events.send(TaskEvent::StateChanged(self.id, new.clone()));
                }
                *state = new;
                true
            }
            None => false,
        })
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.transfer.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn current_token(&self) -> CancellationToken {
        self.transfer.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct JoinGuard<'a>(&'a DownloadTask);

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.0.joined.store(false, Ordering::SeqCst);
    }
}

struct TaskProgress<'a>(&'a DownloadTask);

impl Progress for TaskProgress<'_> {
    fn advance(&self, bytes: u64) {
        self.0.bytes.store(bytes, Ordering::SeqCst);
    }

    fn set_total(&self, total: u64) {
        self.0.total.store(total, Ordering::SeqCst);
    }
}

impl PartialEq for DownloadTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DownloadTask {}

impl Hash for DownloadTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.url.get())
            .field("book", &self.book.id)
            .field("state", &*self.state.borrow())
            .field("bytes", &self.bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::FirstMirror;
    use crate::transport::TransferOutcome;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Writes `body` once `release` is notified; honours cancellation.
    struct Gate {
        body: &'static [u8],
        release: Notify,
        fail: bool,
    }

    #[async_trait]
    impl Transport for Gate {
        async fn fetch(
            &self,
            request: &TransferRequest,
            progress: &dyn Progress,
            cancel: &CancellationToken,
        ) -> Result<TransferOutcome, TransferError> {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Paused),
                _ = self.release.notified() => {}
            }
            if self.fail {
                return Err(TransferError::Io(std::io::Error::other("disk full")));
            }
            tokio::fs::write(&request.part_path, self.body).await?;
            progress.advance(self.body.len() as u64);
            Ok(TransferOutcome { total: self.body.len() as u64 })
        }
    }

    fn gate(fail: bool) -> Arc<Gate> {
        Arc::new(Gate { body: b"book", release: Notify::new(), fail })
    }

    /// Binds `task` to a detached runtime context; returns the wakeup its
    /// manager would wait on.
    fn bound(task: &Arc<DownloadTask>, transport: Arc<dyn Transport>) -> Arc<Notify> {
        let (events, _) = broadcast::channel(16);
        let wakeup = Arc::new(Notify::new());
        task.bind(Binding {
            transport,
            selector: Arc::new(FirstMirror),
            events,
            wakeup: wakeup.clone(),
            runtime: Handle::current(),
        });
        wakeup
    }

    /// Writes the first half of `body` and stalls until paused; every later
    /// request appends the rest from its offset. Records each offset.
    struct Halves {
        body: &'static [u8],
        offsets: std::sync::Mutex<Vec<u64>>,
        wrote: Notify,
    }

    #[async_trait]
    impl Transport for Halves {
        async fn fetch(
            &self,
            request: &TransferRequest,
            progress: &dyn Progress,
            cancel: &CancellationToken,
        ) -> Result<TransferOutcome, TransferError> {
            self.offsets.lock().unwrap().push(request.offset);
            let total = self.body.len() as u64;
            if request.offset == 0 {
                let half = &self.body[..self.body.len() / 2];
                tokio::fs::write(&request.part_path, half).await?;
                progress.advance(half.len() as u64);
                self.wrote.notify_one();
                cancel.cancelled().await;
                return Err(TransferError::Paused);
            }
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&request.part_path)
                .await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &self.body[request.offset as usize..]).await?;
            progress.advance(total);
            Ok(TransferOutcome { total })
        }
    }

    fn book() -> Arc<BookItem> {
        Arc::new(BookItem::new("md5", "Dune").with_extension("epub").with_links(["http://m/1"]))
    }

    async fn wait_for(task: &DownloadTask, want: TaskState) {
        let mut rx = task.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[test]
    fn identity_is_independent_of_content() {
        let dir = Path::new("/tmp");
        let a = DownloadTask::new("http://m/1", book(), dir);
        let b = DownloadTask::new("http://m/1", book(), dir);
        assert_ne!(a, b);
        let set: HashSet<_> = [a.clone(), b, a].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn for_book_requires_a_link() {
        let bare = Arc::new(BookItem::new("md5", "Dune"));
        let err = DownloadTask::for_book(bare, &FirstMirror, Path::new("/tmp")).unwrap_err();
        assert_eq!(err, TaskError::NoDownloadLink("md5".into()));
    }

    #[test]
    fn pause_and_resume_are_noops_when_queued() {
        let task = DownloadTask::new("http://m/1", book(), Path::new("/tmp"));
        assert!(!task.pause());
        assert!(!task.resume());
        assert_eq!(task.state(), TaskState::Queued);
    }

    #[tokio::test]
    async fn join_completes_and_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::for_book(book(), &FirstMirror, dir.path()).unwrap();
        let transport = gate(false);
        bound(&task, transport.clone());

        let worker = tokio::spawn({
            let task = task.clone();
            async move { task.join().await }
        });
        wait_for(&task, TaskState::Loading).await;
        transport.release.notify_one();
        worker.await.unwrap();

        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(task.bytes(), 4);
        let data = tokio::fs::read(task.destination()).await.unwrap();
        assert_eq!(data, b"book");
    }

    #[tokio::test]
    async fn io_error_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("http://m/1", book(), dir.path());
        let transport = gate(true);
        bound(&task, transport.clone());
        transport.release.notify_one();

        task.join().await;

        assert!(matches!(task.state(), TaskState::Failed(reason) if reason.contains("disk full")));
    }

    #[tokio::test]
    async fn pause_twice_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("http://m/1", book(), dir.path());
        let transport = gate(false);
        bound(&task, transport.clone());

        let worker = tokio::spawn({
            let task = task.clone();
            async move { task.join().await }
        });
        wait_for(&task, TaskState::Loading).await;

        assert!(task.pause());
        assert!(!task.pause());
        assert_eq!(task.state(), TaskState::Suspended);
        task.wait_idle().await;
        assert!(!worker.is_finished());

        assert!(task.resume());
        assert_eq!(task.state(), TaskState::Loading);
        transport.release.notify_one();
        worker.await.unwrap();
        assert_eq!(task.state(), TaskState::Done);

        assert!(!task.resume());
        assert_eq!(task.state(), TaskState::Done);
    }

    #[tokio::test]
    async fn unresolved_task_fails_without_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::unresolved(Arc::new(BookItem::new("md5", "Dune")), dir.path());
        bound(&task, gate(false));

        task.join().await;

        assert!(matches!(task.state(), TaskState::Failed(_)));
        assert_eq!(task.url(), None);
    }

    #[tokio::test]
    async fn retiring_a_suspended_task_releases_join() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("http://m/1", book(), dir.path());
        bound(&task, gate(false));

        let worker = tokio::spawn({
            let task = task.clone();
            async move { task.join().await }
        });
        wait_for(&task, TaskState::Loading).await;
        task.pause();
        task.retire();

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("join did not return")
            .unwrap();
        assert_eq!(task.state(), TaskState::Suspended);
    }

    #[tokio::test]
    async fn resume_continues_from_bytes_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("http://m/1", book(), dir.path());
        let transport = Arc::new(Halves {
            body: b"whole book",
            offsets: std::sync::Mutex::new(Vec::new()),
            wrote: Notify::new(),
        });
        bound(&task, transport.clone());

        let worker = tokio::spawn({
            let task = task.clone();
            async move { task.join().await }
        });
        transport.wrote.notified().await;
        assert!(task.pause());
        task.wait_idle().await;
        assert_eq!(task.bytes(), 5);

        assert!(task.resume());
        worker.await.unwrap();

        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(*transport.offsets.lock().unwrap(), [0, 5]);
        let data = tokio::fs::read(task.destination()).await.unwrap();
        assert_eq!(data, b"whole book");
    }

    #[tokio::test]
    async fn resume_without_a_worker_requeues() {
        let snapshot = TaskSnapshot {
            id: TaskId(80_000),
            url: Some("http://m/1".into()),
            book: (*book()).clone(),
            destination: PathBuf::from("/tmp/Dune.epub"),
            state: TaskState::Loading,
            started: true,
            bytes: 10,
            total: 20,
        };
        let task = DownloadTask::restore(snapshot);
        let wakeup = bound(&task, gate(false));

        assert!(task.resume());
        assert_eq!(task.state(), TaskState::Queued);
        assert!(!task.is_started());
        tokio::time::timeout(Duration::from_secs(5), wakeup.notified())
            .await
            .expect("workers were not woken");
        assert!(!task.resume());
    }

    #[tokio::test]
    async fn removed_task_cannot_be_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("http://m/1", book(), dir.path());
        bound(&task, gate(false));

        let worker = tokio::spawn({
            let task = task.clone();
            async move { task.join().await }
        });
        wait_for(&task, TaskState::Loading).await;
        task.pause();
        task.retire();
        worker.await.unwrap();

        assert!(!task.resume());
        assert_eq!(task.state(), TaskState::Suspended);
    }

    #[tokio::test]
    async fn retired_task_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::new("http://m/1", book(), dir.path());
        bound(&task, gate(false));
        task.retire();

        task.join().await;

        assert_eq!(task.state(), TaskState::Queued);
        assert!(!part_path(task.destination()).exists());
    }

    #[test]
    fn restore_turns_loading_into_suspended() {
        let snapshot = TaskSnapshot {
            id: TaskId(90_000),
            url: Some("http://m/1".into()),
            book: (*book()).clone(),
            destination: PathBuf::from("/tmp/Dune.epub"),
            state: TaskState::Loading,
            started: true,
            bytes: 10,
            total: 20,
        };
        let task = DownloadTask::restore(snapshot);
        assert_eq!(task.state(), TaskState::Suspended);
        assert!(task.is_started());
        assert_eq!(task.bytes(), 10);

        let fresh = DownloadTask::new("http://m/2", book(), Path::new("/tmp"));
        assert!(fresh.id() > TaskId(90_000));
    }
}
