//! Shared helpers for the manager integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bookdl::models::{BookItem, TaskState};
use bookdl::task::DownloadTask;
use bookdl::transport::{Progress, TransferError, TransferOutcome, TransferRequest, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Transport whose transfers only finish when the test releases them.
///
/// Each URL has its own gate; a release that happens before the transfer
/// starts is remembered. Finished transfers write the URL as file content.
#[derive(Default)]
pub struct GatedTransport {
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    fetched: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gate(&self, url: &str) -> Arc<Notify> {
        self.gates
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .clone()
    }

    pub fn release(&self, url: &str) {
        self.gate(url).notify_one();
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    /// URLs in the order their transfers started, resumes included.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn fetch(
        &self,
        request: &TransferRequest,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        self.fetched.lock().unwrap().push(request.url.clone());
        let gate = self.gate(&request.url);
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Paused),
            _ = gate.notified() => {}
        }
        if self.failing.lock().unwrap().contains(&request.url) {
            return Err(TransferError::Io(std::io::Error::other("connection reset")));
        }
        tokio::fs::write(&request.part_path, request.url.as_bytes()).await?;
        let len = request.url.len() as u64;
        progress.set_total(len);
        progress.advance(len);
        Ok(TransferOutcome { total: len })
    }
}

pub fn book(id: &str, links: &[&str]) -> BookItem {
    BookItem::new(id, format!("Book {id}"))
        .with_extension("epub")
        .with_links(links.iter().copied())
}

pub async fn wait_for(task: &DownloadTask, want: TaskState) {
    let mut rx = task.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("task {} never reached {want:?}, is {:?}", task.id(), task.state()))
        .unwrap();
}
