//! Tracks concurrently running downloads by id and talks to the recording
//! endpoints of the server.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::download::{Download, DownloadId, ResponseSource};
use crate::error::{RegistryError, Result};
use crate::listing::encode_path;
use crate::model::{DownloadStatus, FileEntry, HistoryRecord, IDEMPOTENCY_HEADER, RecordedDownload};
use crate::progress::parse_total;

pub const DEFAULT_ATTEMPTS: u32 = 3;

const REGISTRY_NAMESPACE: &str = "registry";

type Entries = Arc<Mutex<HashMap<DownloadId, Download>>>;

fn lock(entries: &Mutex<HashMap<DownloadId, Download>>) -> MutexGuard<'_, HashMap<DownloadId, Download>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Like [`lock`], but first drops engines that ended without a terminal
/// event (failed reads, abandoned loops).
fn lock_live(entries: &Mutex<HashMap<DownloadId, Download>>) -> MutexGuard<'_, HashMap<DownloadId, Download>> {
    let mut entries = lock(entries);
    entries.retain(|id, download| {
        let live = !download.state().is_terminal();
        if !live {
            debug!("Dropping ended download {} from registry", id);
        }
        live
    });
    entries
}

/// Runs `op` up to `attempts` times, retrying immediately on error, and
/// returns the last error once attempts are exhausted.
pub async fn retry<T, E, F, Fut>(attempts: u32, label: &str, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct DownloadRegistry {
    client: Client,
    base: Url,
    attempts: u32,
    signal: CancellationToken,
    entries: Entries,
}

impl DownloadRegistry {
    /// `base` is the server root, e.g. `http://nas.local:3000/`.
    pub fn new(base: &str) -> Result<Self> {
        Self::with_client(Client::new(), base)
    }

    pub fn with_client(client: Client, base: &str) -> Result<Self> {
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| RegistryError::Url(e.to_string()))?;

        Ok(Self {
            client,
            base,
            attempts: DEFAULT_ATTEMPTS,
            signal: CancellationToken::new(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Ties every request and every engine of this registry to `signal`.
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    /// Aborts pending requests and stops every engine created by [`start`](Self::start).
    pub fn cancel_all(&self) {
        info!("Cancelling {} active download(s)", self.count());
        self.signal.cancel();
    }

    pub fn has_active(&self, id: DownloadId) -> bool {
        lock_live(&self.entries).contains_key(&id)
    }

    pub fn count(&self) -> usize {
        lock_live(&self.entries).len()
    }

    pub fn ids(&self) -> Vec<DownloadId> {
        let mut ids: Vec<_> = lock_live(&self.entries).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: DownloadId) -> Option<Download> {
        lock_live(&self.entries).get(&id).cloned()
    }

    pub fn remove(&self, id: DownloadId) {
        if lock(&self.entries).remove(&id).is_some() {
            debug!("Download {} removed from registry", id);
        }
    }

    /// Adds an engine under its id. Fails if that id is still active.
    ///
    /// The entry is dropped again as soon as the engine emits a terminal event.
    pub fn register(&self, download: Download) -> Result<Download> {
        let id = download.id();
        match lock_live(&self.entries).entry(id) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyActive(id)),
            Entry::Vacant(slot) => {
                slot.insert(download.clone());
            }
        }

        let entries = Arc::downgrade(&self.entries);
        download
            .events()
            .subscribe_in(REGISTRY_NAMESPACE, move |event| {
                if !event.is_terminal() {
                    return;
                }
                let Some(entries) = entries.upgrade() else {
                    return;
                };
                let mut entries = lock(&entries);
                // Only drop the entry if it is still this (now terminal) engine.
                if entries.get(&id).is_some_and(|d| d.state().is_terminal()) {
                    entries.remove(&id);
                }
            })
            .detach();

        Ok(download)
    }

    /// Opens `files/{path}` and returns an engine for it, registered under
    /// `id` but not started. Subscribe first, then call
    /// [`Download::start`].
    pub async fn start(&self, path: &str, id: DownloadId) -> Result<Download> {
        if self.has_active(id) {
            return Err(RegistryError::AlreadyActive(id));
        }

        let url = self.endpoint(&format!("files/{}", encode_path(path)))?;
        let response = self
            .send("get file", || self.client.get(url.clone()))
            .await?;

        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_total);

        let abort = self.signal.child_token();
        let source = ResponseSource::new(response, abort.clone());
        let download = Download::with_signal(id, source, total, &abort);
        info!("Opened {} as download {} ({:?} bytes)", path, id, total);

        self.register(download)
    }

    /// Creates a `pending` history row for `filename`.
    pub async fn record_start(&self, filename: &str) -> Result<RecordedDownload> {
        let url = self.endpoint(&format!("request-file/{}", encode_path(filename)))?;
        let key = Uuid::new_v4().to_string();
        let response = self
            .send("record download", || {
                self.client
                    .post(url.clone())
                    .header(IDEMPOTENCY_HEADER, &key)
            })
            .await?;
        let recorded: RecordedDownload = decode("record download", response).await?;
        debug!("{} recorded as download {}", filename, recorded.ndx);
        Ok(recorded)
    }

    /// Stores the final status of download `id` and drops it from the active set.
    pub async fn record_status(
        &self,
        filename: &str,
        id: DownloadId,
        status: DownloadStatus,
    ) -> Result<Vec<HistoryRecord>> {
        let url = self.endpoint(&format!("file-status/{}/{}", id, status))?;
        let response = self
            .send("update status", || self.client.post(url.clone()))
            .await
            .inspect_err(|e| warn!("Error marking {} as {}: {}", filename, status, e))?;
        let history = decode("update status", response).await?;
        self.remove(id);
        Ok(history)
    }

    pub async fn clear_history(&self) -> Result<Vec<HistoryRecord>> {
        let url = self.endpoint("reset")?;
        let response = self
            .send("clear history", || self.client.post(url.clone()))
            .await?;
        decode("clear history", response).await
    }

    pub async fn history(&self) -> Result<Vec<HistoryRecord>> {
        let url = self.endpoint("api/history")?;
        let response = self
            .send("fetch history", || self.client.get(url.clone()))
            .await?;
        decode("fetch history", response).await
    }

    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let url = self.endpoint("api/files")?;
        let response = self
            .send("list files", || self.client.get(url.clone()))
            .await?;
        decode("list files", response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| RegistryError::Url(e.to_string()))
    }

    async fn send<F>(&self, op: &'static str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let request = retry(self.attempts, op, || build().send());
        let response = tokio::select! {
            biased;
            _ = self.signal.cancelled() => return Err(RegistryError::Cancelled { op }),
            result = request => result.map_err(|source| RegistryError::Transport { op, source })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Rejected { op, status });
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(op: &'static str, response: Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|source| RegistryError::Decode { op, source })
}
