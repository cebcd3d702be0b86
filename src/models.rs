// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Process-unique identity of a download task.
///
/// Allocated once at construction and never reused; list membership,
/// equality and removal all go through this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a download task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Loading,
    Suspended,
    Done,
    Failed(String),
}

impl TaskState {
    /// `Done` and `Failed` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed(_))
    }
}

/// Lazily loaded part of a book record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookDetails {
    /// Candidate mirror URLs serving the same file.
    pub file_links: Vec<String>,
}

/// A book as handed over by the catalogue/search layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookItem {
    /// Catalogue identity (the MD5 on Libgen mirrors).
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    /// File extension without the dot, e.g. `epub`.
    pub extension: Option<String>,
    /// `None` until the detail page has been fetched.
    pub details: Option<BookDetails>,
}

impl BookItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            author: None,
            extension: None,
            details: None,
        }
    }

    pub fn with_links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details = Some(BookDetails {
            file_links: links.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Resolved mirror links, empty when details were never loaded.
    pub fn file_links(&self) -> &[String] {
        self.details
            .as_ref()
            .map(|d| d.file_links.as_slice())
            .unwrap_or(&[])
    }

    /// File name used on disk: `Title [id].ext`, with path separators and
    /// other reserved characters replaced in every part.
    ///
    /// The id keeps books that share a title apart.
    pub fn file_name(&self) -> String {
        let stem = sanitize(&self.title);
        let id = sanitize(&self.id);
        let base = match (stem.is_empty(), id.is_empty()) {
            (false, false) => format!("{stem} [{id}]"),
            (false, true) => stem,
            (true, false) => id,
            (true, true) => "book".to_string(),
        };
        match self.extension.as_deref().map(sanitize) {
            Some(ext) if !ext.is_empty() => format!("{base}.{ext}"),
            _ => base,
        }
    }
}

/// Makes one path component out of catalogue text.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .trim_matches('.')
        .to_string()
}

/// Point-in-time copy of everything observable about a task.
/// This struct is what gets persisted and handed to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub url: Option<String>,
    pub book: BookItem,
    pub destination: PathBuf,
    pub state: TaskState,
    pub started: bool,
    pub bytes: u64,
    /// Size reported by the server, 0 while unknown.
    pub total: u64,
}

impl TaskSnapshot {
    /// Download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.bytes as f32 / self.total as f32).min(1.0)
        }
    }
}

/// Path of the in-progress file for a destination,
/// e.g. `/books/Dune.epub` becomes `/books/Dune.epub.part`.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Manager-level notification, published on every list or state change.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Added(TaskId),
    Removed(TaskId),
    StateChanged(TaskId, TaskState),
}
