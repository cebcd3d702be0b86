// src/mirror.rs

use crate::models::BookItem;

/// Picks one of a book's candidate links.
pub trait MirrorSelector: Send + Sync {
    fn select(&self, book: &BookItem) -> Option<String>;
}

/// Takes the first non-empty link.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMirror;

impl MirrorSelector for FirstMirror {
    fn select(&self, book: &BookItem) -> Option<String> {
        book.file_links()
            .iter()
            .find(|link| !link.trim().is_empty())
            .cloned()
    }
}

/// Prefers links on the given hosts, in the order listed, then falls back
/// to [`FirstMirror`].
#[derive(Debug, Clone, Default)]
pub struct PreferredHost {
    hosts: Vec<String>,
}

impl PreferredHost {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(|h| h.into().to_ascii_lowercase()).collect(),
        }
    }
}

impl MirrorSelector for PreferredHost {
    fn select(&self, book: &BookItem) -> Option<String> {
        for wanted in &self.hosts {
            let hit = book
                .file_links()
                .iter()
                .find(|link| mirror_label(link).eq_ignore_ascii_case(wanted));
            if let Some(link) = hit {
                return Some(link.clone());
            }
        }
        FirstMirror.select(book)
    }
}

/// Human-readable name for a mirror link, e.g. `libgen.li` for
/// `https://www.libgen.li/ads.php?md5=...`. Unparseable input is returned
/// as is.
pub fn mirror_label(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.strip_prefix("www.").unwrap_or(host).to_string(),
            None => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}
