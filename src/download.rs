//! Single-transfer streaming engine.
//!
//! A [`Download`] pulls chunks from a [`ByteSource`] one at a time, keeps
//! byte/progress/speed accounting, and reports its lifecycle through an
//! [`EventBus`]:
//!
//! - `update` after every read, including the final end-of-data read
//! - `finished` once the source is exhausted, carrying every chunk in order
//! - `stopped` after [`Download::stop`]
//!
//! `finished` and `stopped` are terminal; nothing is emitted after them. A
//! failing read emits no terminal event, [`Download::start`] returns the error
//! instead.

use std::fmt;
use std::io;
use std::mem;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DownloadError;
use crate::events::{EventBus, Subscription};
use crate::progress::{self, ZERO_RATE};

const SPEED_WINDOW: Duration = Duration::from_millis(1000);

/// Identifier shared by the engine, the registry and the history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub i64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental byte stream consumed by the engine.
///
/// `read` resolves to `Ok(None)` at end of data. `cancel` releases the
/// underlying transport and must make any pending or later `read` finish
/// promptly.
pub trait ByteSource: Send {
    fn read(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;

    fn cancel(&mut self);
}

/// Adapts any fallible byte stream into a [`ByteSource`].
pub struct StreamSource<S> {
    stream: Option<S>,
}

impl<S> StreamSource<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

impl<S, E> ByteSource for StreamSource<S>
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn read(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        async move {
            let Some(stream) = self.stream.as_mut() else {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "source released"));
            };
            match stream.next().await {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(e)) => Err(io::Error::other(e)),
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn cancel(&mut self) {
        self.stream = None;
    }
}

/// Body of an HTTP response. Cancelling drops the connection and trips the
/// request's abort token.
pub struct ResponseSource {
    inner: StreamSource<BoxStream<'static, reqwest::Result<Bytes>>>,
    abort: CancellationToken,
}

impl ResponseSource {
    pub fn new(response: reqwest::Response, abort: CancellationToken) -> Self {
        Self {
            inner: StreamSource::new(response.bytes_stream().boxed()),
            abort,
        }
    }
}

impl ByteSource for ResponseSource {
    fn read(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        let abort = self.abort.clone();
        let read = self.inner.read();
        async move {
            tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "request aborted"))
                }
                result = read => result,
            }
        }
        .boxed()
    }

    fn cancel(&mut self) {
        self.abort.cancel();
        self.inner.cancel();
    }
}

/// Payload of an `update` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub speed: String,
    pub progress: String,
    pub percent_remaining: f64,
    pub loaded_bytes: u64,
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Update(Progress),
    /// The engine keeps no reference to these buffers once emitted.
    Finished { chunks: Vec<Bytes> },
    Stopped,
}

impl DownloadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DownloadEvent::Update(_) => "update",
            DownloadEvent::Finished { .. } => "finished",
            DownloadEvent::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Update(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Idle,
    Active,
    Finished,
    Stopped,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Finished | DownloadState::Stopped | DownloadState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished { bytes: u64 },
    Stopped,
}

struct Transfer {
    state: DownloadState,
    source: Option<Box<dyn ByteSource>>,
    chunks: Vec<Bytes>,
    loaded: u64,
    progress: f64,
    speed: String,
}

struct Inner {
    id: DownloadId,
    total: Option<NonZeroU64>,
    events: EventBus<DownloadEvent>,
    stop: CancellationToken,
    transfer: Mutex<Transfer>,
    /// Held by the read loop from the stop check through `update` emission.
    emit_gate: Mutex<()>,
    /// Thread currently holding `emit_gate`, so listeners can call `stop()`.
    emitter: Mutex<Option<ThreadId>>,
}

/// Releases the emission gate and forgets the emitting thread.
struct EmitGuard<'a> {
    emitter: &'a Mutex<Option<ThreadId>>,
    _gate: MutexGuard<'a, ()>,
}

impl Drop for EmitGuard<'_> {
    fn drop(&mut self) {
        *self.emitter.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Handle to one in-flight transfer. Clones share the same engine.
#[derive(Clone)]
pub struct Download {
    inner: Arc<Inner>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("loaded", &self.loaded_bytes())
            .finish()
    }
}

impl Download {
    pub fn new(id: DownloadId, source: impl ByteSource + 'static, total: Option<NonZeroU64>) -> Self {
        Self::with_signal(id, source, total, &CancellationToken::new())
    }

    /// Cancelling `parent` stops this engine as if [`stop`](Self::stop) was called.
    pub fn with_signal(
        id: DownloadId,
        source: impl ByteSource + 'static,
        total: Option<NonZeroU64>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                total,
                events: EventBus::new(),
                stop: parent.child_token(),
                transfer: Mutex::new(Transfer {
                    state: DownloadState::Idle,
                    source: Some(Box::new(source)),
                    chunks: Vec::new(),
                    loaded: 0,
                    progress: 0.0,
                    speed: ZERO_RATE.to_string(),
                }),
                emit_gate: Mutex::new(()),
                emitter: Mutex::new(None),
            }),
        }
    }

    fn transfer(&self) -> MutexGuard<'_, Transfer> {
        self.inner
            .transfer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn enter_emit(&self) -> EmitGuard<'_> {
        let gate = self
            .inner
            .emit_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *self.emitter() = Some(thread::current().id());
        EmitGuard {
            emitter: &self.inner.emitter,
            _gate: gate,
        }
    }

    fn emitter(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.inner
            .emitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> DownloadId {
        self.inner.id
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.inner.total.map(NonZeroU64::get)
    }

    pub fn state(&self) -> DownloadState {
        self.transfer().state
    }

    pub fn loaded_bytes(&self) -> u64 {
        self.transfer().loaded
    }

    pub fn progress(&self) -> f64 {
        self.transfer().progress
    }

    pub fn speed(&self) -> String {
        self.transfer().speed.clone()
    }

    pub fn events(&self) -> &EventBus<DownloadEvent> {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription<DownloadEvent>
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }

    /// Runs the read loop to completion.
    ///
    /// Subscribe before calling this; events are not buffered. Starting an
    /// engine twice is rejected, starting a stopped engine returns
    /// [`Outcome::Stopped`] without emitting anything.
    pub async fn start(&self) -> Result<Outcome, DownloadError> {
        let mut source = {
            let mut transfer = self.transfer();
            match transfer.state {
                DownloadState::Idle => {}
                DownloadState::Stopped => return Ok(Outcome::Stopped),
                _ => return Err(DownloadError::AlreadyStarted(self.id())),
            }
            let Some(source) = transfer.source.take() else {
                return Err(DownloadError::AlreadyStarted(self.id()));
            };
            transfer.state = DownloadState::Active;
            source
        };

        let _guard = LoopGuard { download: self };
        debug!("Download {} started (total: {:?})", self.id(), self.inner.total);

        let mut window_at = Instant::now();
        let mut window_loaded = 0u64;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => None,
                result = source.read() => Some(result),
            };

            let Some(read) = read else {
                source.cancel();
                return Ok(self.finish_stopped());
            };

            // stop() waits for this gate, so a read that raced with it is
            // discarded here and nothing is emitted once stop() returns.
            let emit = self.enter_emit();
            if self.inner.stop.is_cancelled() {
                drop(emit);
                source.cancel();
                return Ok(self.finish_stopped());
            }

            let chunk = match read {
                Ok(chunk) => chunk,
                Err(e) => {
                    source.cancel();
                    return Err(self.fail(e));
                }
            };
            let done = chunk.is_none();

            let update = {
                let mut transfer = self.transfer();
                if let Some(bytes) = chunk {
                    transfer.loaded += bytes.len() as u64;
                    transfer.chunks.push(bytes);
                }
                transfer.progress = progress::percent(transfer.loaded, self.inner.total);

                let now = Instant::now();
                let elapsed = now.duration_since(window_at);
                if elapsed >= SPEED_WINDOW {
                    transfer.speed = progress::rate(
                        transfer.loaded - window_loaded,
                        elapsed.as_secs_f64() * 1000.0,
                    );
                    window_loaded = transfer.loaded;
                    window_at = now;
                }

                Progress {
                    speed: transfer.speed.clone(),
                    progress: progress::format_percent(transfer.progress),
                    percent_remaining: ((100.0 - transfer.progress) * 10.0).round() / 10.0,
                    loaded_bytes: transfer.loaded,
                }
            };
            self.inner.events.emit(&DownloadEvent::Update(update));

            if done {
                // An update listener may have asked to stop.
                if self.inner.stop.is_cancelled() {
                    drop(emit);
                    source.cancel();
                    return Ok(self.finish_stopped());
                }

                let (chunks, bytes) = {
                    let mut transfer = self.transfer();
                    transfer.state = DownloadState::Finished;
                    (mem::take(&mut transfer.chunks), transfer.loaded)
                };
                drop(emit);
                info!("Download {} finished ({} bytes)", self.id(), bytes);
                self.emit_terminal(DownloadEvent::Finished { chunks });
                return Ok(Outcome::Finished { bytes });
            }
        }
    }

    /// Cancels the transfer and frees buffered data.
    ///
    /// Idle engines are stopped right here. For a running engine the stop
    /// flag is set immediately and the read loop releases the source and
    /// emits `stopped` as soon as it resumes. Repeated calls are no-ops.
    ///
    /// Called from another thread, this waits for an `update` being emitted
    /// to complete; no `update` is emitted after it returns.
    pub fn stop(&self) {
        let emitting_here = *self.emitter() == Some(thread::current().id());
        let gate = (!emitting_here).then(|| self.enter_emit());

        let mut transfer = self.transfer();
        match transfer.state {
            DownloadState::Idle => {
                transfer.state = DownloadState::Stopped;
                let source = transfer.source.take();
                Self::clear(&mut transfer);
                self.inner.stop.cancel();
                drop(transfer);
                drop(gate);

                if let Some(mut source) = source {
                    source.cancel();
                }
                info!("Download {} stopped before start", self.id());
                self.emit_terminal(DownloadEvent::Stopped);
            }
            DownloadState::Active => {
                if self.inner.stop.is_cancelled() {
                    return;
                }
                Self::clear(&mut transfer);
                self.inner.stop.cancel();
            }
            DownloadState::Finished | DownloadState::Stopped | DownloadState::Failed => {}
        }
    }

    fn clear(transfer: &mut Transfer) {
        transfer.chunks = Vec::new();
        transfer.speed = ZERO_RATE.to_string();
        transfer.progress = 0.0;
    }

    fn finish_stopped(&self) -> Outcome {
        {
            let mut transfer = self.transfer();
            if transfer.state != DownloadState::Active {
                return Outcome::Stopped;
            }
            transfer.state = DownloadState::Stopped;
            Self::clear(&mut transfer);
        }
        info!("Download {} stopped", self.id());
        self.emit_terminal(DownloadEvent::Stopped);
        Outcome::Stopped
    }

    /// Nothing follows a terminal event, so listeners are released with it.
    fn emit_terminal(&self, event: DownloadEvent) {
        self.inner.events.emit(&event);
        self.inner.events.clear();
    }

    fn fail(&self, e: io::Error) -> DownloadError {
        {
            let mut transfer = self.transfer();
            transfer.state = DownloadState::Failed;
            Self::clear(&mut transfer);
        }
        warn!("Download {} failed: {}", self.id(), e);
        DownloadError::Stream {
            id: self.id(),
            message: e.to_string(),
        }
    }
}

/// Settles an engine whose read loop was dropped mid-transfer.
struct LoopGuard<'a> {
    download: &'a Download,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        if self.download.state() != DownloadState::Active {
            return;
        }
        if self.download.inner.stop.is_cancelled() {
            self.download.finish_stopped();
        } else {
            let mut transfer = self.download.transfer();
            transfer.state = DownloadState::Failed;
            Download::clear(&mut transfer);
            warn!("Download {} abandoned mid-transfer", self.download.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ChannelSource {
        rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
        cancels: Arc<AtomicUsize>,
    }

    impl ByteSource for ChannelSource {
        fn read(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
            async move {
                match self.rx.recv().await {
                    Some(Ok(bytes)) => Ok(Some(bytes)),
                    Some(Err(e)) => Err(e),
                    None => Ok(None),
                }
            }
            .boxed()
        }

        fn cancel(&mut self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.rx.close();
        }
    }

    fn channel_download(
        total: u64,
    ) -> (
        Download,
        mpsc::UnboundedSender<io::Result<Bytes>>,
        Arc<AtomicUsize>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancels = Arc::new(AtomicUsize::new(0));
        let source = ChannelSource {
            rx,
            cancels: cancels.clone(),
        };
        let download = Download::new(DownloadId(1), source, NonZeroU64::new(total));
        (download, tx, cancels)
    }

    fn record(download: &Download) -> Arc<Mutex<Vec<DownloadEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        download
            .subscribe(move |e| log_clone.lock().unwrap().push(e.clone()))
            .detach();
        log
    }

    fn names(log: &Mutex<Vec<DownloadEvent>>) -> Vec<&'static str> {
        log.lock().unwrap().iter().map(DownloadEvent::name).collect()
    }

    async fn wait_for_active(download: &Download) {
        while download.state() != DownloadState::Active {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_chunks_then_end_of_data() {
        let (download, tx, cancels) = channel_download(3000);
        let log = record(&download);

        tx.send(Ok(Bytes::from(vec![1u8; 1000]))).unwrap();
        tx.send(Ok(Bytes::from(vec![2u8; 2000]))).unwrap();
        drop(tx);

        let outcome = download.start().await.unwrap();
        assert_eq!(outcome, Outcome::Finished { bytes: 3000 });
        assert_eq!(names(&log), vec!["update", "update", "update", "finished"]);

        let events = log.lock().unwrap();
        let progress: Vec<(String, f64, u64)> = events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Update(p) => {
                    Some((p.progress.clone(), p.percent_remaining, p.loaded_bytes))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            progress,
            vec![
                ("33.3".to_string(), 66.7, 1000),
                ("100.0".to_string(), 0.0, 3000),
                ("100.0".to_string(), 0.0, 3000),
            ]
        );

        let DownloadEvent::Finished { chunks } = &events[3] else {
            panic!("expected finished, got {:?}", events[3]);
        };
        assert_eq!(chunks.len(), 2);
        let body = chunks.concat();
        assert_eq!(body.len(), 3000);
        assert!(body[..1000].iter().all(|b| *b == 1));
        assert!(body[1000..].iter().all(|b| *b == 2));

        assert_eq!(download.state(), DownloadState::Finished);
        assert!(download.events().is_empty());
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_total_reports_zero_progress() {
        let (download, tx, _) = channel_download(0);
        let log = record(&download);
        tx.send(Ok(Bytes::from_static(b"abc"))).unwrap();
        drop(tx);

        download.start().await.unwrap();

        let events = log.lock().unwrap();
        let DownloadEvent::Update(first) = &events[0] else {
            panic!("expected update");
        };
        assert_eq!(first.progress, "0.0");
        assert_eq!(first.percent_remaining, 100.0);
        assert_eq!(download.total_bytes(), None);
    }

    #[tokio::test]
    async fn test_stop_before_first_chunk() {
        let (download, tx, cancels) = channel_download(3000);
        let log = record(&download);

        let runner = download.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        wait_for_active(&download).await;

        download.stop();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(outcome, Outcome::Stopped);
        assert_eq!(names(&log), vec!["stopped"]);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(download.state(), DownloadState::Stopped);
        drop(tx);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (download, _tx, cancels) = channel_download(3000);
        let log = record(&download);

        let runner = download.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        wait_for_active(&download).await;

        download.stop();
        download.stop();
        handle.await.unwrap().unwrap();
        download.stop();

        assert_eq!(names(&log), vec!["stopped"]);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_while_idle_then_start() {
        let (download, _tx, cancels) = channel_download(3000);
        let log = record(&download);

        download.stop();
        download.stop();
        assert_eq!(download.start().await.unwrap(), Outcome::Stopped);

        assert_eq!(names(&log), vec!["stopped"]);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chunk_racing_stop_is_discarded() {
        let (download, tx, _) = channel_download(3000);
        let log = record(&download);

        let runner = download.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        wait_for_active(&download).await;

        download.stop();
        tx.send(Ok(Bytes::from(vec![0u8; 3000]))).unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(names(&log), vec!["stopped"]);
        assert_eq!(download.loaded_bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_update_after_stop_from_another_thread() {
        use std::sync::atomic::AtomicBool;

        for _ in 0..100 {
            let endless = futures::stream::repeat_with(|| Ok::<_, io::Error>(Bytes::from_static(b"x")));
            let download = Download::new(DownloadId(1), StreamSource::new(endless), None);

            let returned = Arc::new(AtomicBool::new(false));
            let late_updates = Arc::new(AtomicUsize::new(0));
            let stopped = Arc::new(AtomicUsize::new(0));
            {
                let returned = returned.clone();
                let late_updates = late_updates.clone();
                let stopped = stopped.clone();
                download
                    .subscribe(move |e| match e {
                        DownloadEvent::Update(_) if returned.load(Ordering::SeqCst) => {
                            late_updates.fetch_add(1, Ordering::SeqCst);
                        }
                        DownloadEvent::Stopped => {
                            stopped.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    })
                    .detach();
            }

            let runner = download.clone();
            let handle = tokio::spawn(async move { runner.start().await });
            while download.loaded_bytes() < 64 {
                tokio::task::yield_now().await;
            }

            let stopper = download.clone();
            let flag = returned.clone();
            std::thread::spawn(move || {
                stopper.stop();
                flag.store(true, Ordering::SeqCst);
            })
            .join()
            .unwrap();

            assert_eq!(handle.await.unwrap().unwrap(), Outcome::Stopped);
            assert_eq!(late_updates.load(Ordering::SeqCst), 0);
            assert_eq!(stopped.load(Ordering::SeqCst), 1);
            assert_eq!(download.state(), DownloadState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_stop_mid_transfer_clears_state() {
        let (download, tx, cancels) = channel_download(3000);
        let log = record(&download);

        let runner = download.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        tx.send(Ok(Bytes::from(vec![0u8; 1500]))).unwrap();
        while download.loaded_bytes() < 1500 {
            tokio::task::yield_now().await;
        }
        assert_eq!(download.progress(), 50.0);

        download.stop();
        assert_eq!(download.progress(), 0.0);
        handle.await.unwrap().unwrap();

        assert_eq!(names(&log), vec!["update", "stopped"]);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (download, tx, _) = channel_download(10);
        let runner = download.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        wait_for_active(&download).await;

        let err = download.start().await.unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyStarted(DownloadId(1))));

        drop(tx);
        handle.await.unwrap().unwrap();
        assert!(download.start().await.is_err());
    }

    #[tokio::test]
    async fn test_read_error_is_not_finished() {
        let (download, tx, cancels) = channel_download(3000);
        let log = record(&download);

        tx.send(Ok(Bytes::from(vec![0u8; 100]))).unwrap();
        tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        let err = download.start().await.unwrap_err();
        assert!(matches!(err, DownloadError::Stream { .. }));
        assert_eq!(names(&log), vec!["update"]);
        assert_eq!(download.state(), DownloadState::Failed);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_stopping_on_last_update_suppresses_finished() {
        let (download, tx, _) = channel_download(4);
        let log = record(&download);
        let handle = download.clone();
        download
            .subscribe(move |e| {
                if let DownloadEvent::Update(p) = e
                    && p.progress == "100.0"
                {
                    handle.stop();
                }
            })
            .detach();

        tx.send(Ok(Bytes::from_static(b"data"))).unwrap();
        drop(tx);

        assert_eq!(download.start().await.unwrap(), Outcome::Stopped);
        assert_eq!(names(&log), vec!["update", "stopped"]);
    }

    #[tokio::test]
    async fn test_parent_signal_stops_engine() {
        let parent = CancellationToken::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let cancels = Arc::new(AtomicUsize::new(0));
        let source = ChannelSource {
            rx,
            cancels: cancels.clone(),
        };
        let download = Download::with_signal(DownloadId(9), source, None, &parent);
        let log = record(&download);

        let runner = download.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        wait_for_active(&download).await;
        parent.cancel();

        assert_eq!(handle.await.unwrap().unwrap(), Outcome::Stopped);
        assert_eq!(names(&log), vec!["stopped"]);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_sampled_per_window() {
        let stream = futures::stream::iter(vec![(0u64, 1000usize), (1000, 124_000)])
            .then(|(delay, size)| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, io::Error>(Bytes::from(vec![0u8; size]))
            })
            .boxed();
        let download = Download::new(DownloadId(2), StreamSource::new(stream), None);
        let log = record(&download);

        download.start().await.unwrap();

        let speeds: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Update(p) => Some(p.speed.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(speeds, vec!["0 bps", "1.0 mbps", "1.0 mbps"]);
    }
}
