/*
 * Downloader
 *
 * One remote resource fetched as a byte stream. The transfer starts as
 * soon as the instance is created and ends in exactly one of `end`,
 * `error` or `cancel`. There is no retry: create a new instance instead.
 */
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::DownloadError;
use super::events::{DownloadEvent, EventHandler, EventKind, HandlerId, HandlerRegistry};
use super::file::DownloadedFile;
use super::progress::{DownloadProgress, DownloadStatus};
use crate::config::DownloadConfig;

/// What to fetch and how to tag the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Caller correlation key, passed through untouched.
    pub id: String,
    pub url: String,
    pub name: String,
    pub mime: String,
    /// Size advertised by a manifest, if any. Only used for a sanity
    /// warning; `total` always comes from the response.
    pub expected_size: Option<u64>,
}

impl DownloadRequest {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        name: impl Into<String>,
        mime: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: name.into(),
            mime: mime.into(),
            expected_size: None,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = (size > 0).then_some(size);
        self
    }
}

/// How a download ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Completed(DownloadedFile),
    Failed(DownloadError),
    Cancelled,
}

impl DownloadOutcome {
    fn into_event(self) -> DownloadEvent {
        match self {
            Self::Completed(file) => DownloadEvent::End(file),
            Self::Failed(err) => DownloadEvent::Error(err),
            Self::Cancelled => DownloadEvent::Cancel,
        }
    }
}

struct State {
    status: DownloadStatus,
    loaded: u64,
    total: u64,
    cancelled: bool,
    file: Option<DownloadedFile>,
    outcome: Option<DownloadOutcome>,
    handlers: HandlerRegistry,
}

pub struct Downloader {
    request: DownloadRequest,
    cancel_token: CancellationToken,
    state: Mutex<State>,
    done: watch::Sender<bool>,
    created_at: Instant,
}

/// Configures a [`Downloader`] before its transfer is spawned. Handlers
/// attached here are guaranteed to see `start`.
pub struct DownloaderBuilder {
    request: DownloadRequest,
    client: Option<Client>,
    config: DownloadConfig,
    handlers: Vec<(EventKind, EventHandler)>,
}

impl DownloaderBuilder {
    /// Reuse an existing client (connection pool) instead of building one
    /// from the config.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(mut self, config: DownloadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.handlers.push((kind, handler));
        self
    }

    /// Create the downloader and begin the transfer on the current Tokio
    /// runtime. Never fails synchronously: problems surface as `error`.
    pub fn spawn(self) -> Arc<Downloader> {
        let downloader = Arc::new(Downloader::new(self.request));
        {
            let mut state = downloader.lock_state();
            for (kind, handler) in self.handlers {
                state.handlers.add(kind, handler);
            }
        }

        let client = match self.client {
            Some(client) => Ok(client),
            None => self
                .config
                .client()
                .map_err(|e| DownloadError::Client(e.to_string())),
        };
        let log_interval = Duration::from_millis(self.config.progress_log_interval_ms);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = Arc::clone(&downloader);
                handle.spawn(async move { task.run(client, log_interval).await });
            }
            Err(err) => {
                downloader.emit(DownloadEvent::Start);
                downloader.finish(DownloadOutcome::Failed(DownloadError::Client(format!(
                    "no Tokio runtime: {}",
                    err
                ))));
            }
        }
        downloader
    }
}

impl Downloader {
    /// Start fetching `url` right away with default settings.
    pub fn start(
        id: impl Into<String>,
        url: impl Into<String>,
        name: impl Into<String>,
        mime: impl Into<String>,
    ) -> Arc<Self> {
        Self::builder(DownloadRequest::new(id, url, name, mime)).spawn()
    }

    pub fn builder(request: DownloadRequest) -> DownloaderBuilder {
        DownloaderBuilder {
            request,
            client: None,
            config: DownloadConfig::default(),
            handlers: Vec::new(),
        }
    }

    fn new(request: DownloadRequest) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            request,
            cancel_token: CancellationToken::new(),
            state: Mutex::new(State {
                status: DownloadStatus::Pending,
                loaded: 0,
                total: 0,
                cancelled: false,
                file: None,
                outcome: None,
                handlers: HandlerRegistry::default(),
            }),
            done,
            created_at: Instant::now(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        // Handlers never run under the lock, so a poisoned state is still
        // consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn name(&self) -> &str {
        &self.request.name
    }

    pub fn mime(&self) -> &str {
        &self.request.mime
    }

    pub fn loaded(&self) -> u64 {
        self.lock_state().loaded
    }

    pub fn total(&self) -> u64 {
        self.lock_state().total
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock_state().cancelled
    }

    /// The finished blob, present only after a clean `end`.
    pub fn file(&self) -> Option<DownloadedFile> {
        self.lock_state().file.clone()
    }

    pub fn outcome(&self) -> Option<DownloadOutcome> {
        self.lock_state().outcome.clone()
    }

    pub fn progress(&self) -> DownloadProgress {
        let state = self.lock_state();
        DownloadProgress::new(state.status.clone(), state.loaded, state.total)
            .with_elapsed(self.created_at.elapsed().as_secs_f64())
    }

    /// Subscribe to one event kind.
    ///
    /// Subscribing to `end` after the download already completed calls the
    /// handler immediately with the finished file instead of registering it.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock_state();
        if kind == EventKind::End {
            if let Some(file) = state.file.clone() {
                let id = state.handlers.reserve();
                drop(state);
                handler(&DownloadEvent::End(file));
                return id;
            }
        }
        state.handlers.add(kind, Arc::new(handler))
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.lock_state().handlers.remove(kind, id)
    }

    /// Stop the transfer. Safe to call repeatedly and after completion;
    /// only the first call before a terminal event has any effect.
    pub fn cancel(&self) {
        {
            let mut state = self.lock_state();
            if state.cancelled || state.outcome.is_some() {
                return;
            }
            state.cancelled = true;
        }
        tracing::info!("[Downloader] 取消下載: {} ({})", self.request.name, self.request.id);
        self.cancel_token.cancel();
    }

    /// Resolve once a terminal event has been delivered.
    pub async fn wait(&self) -> DownloadOutcome {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so this only returns once it is set.
        let _ = rx.wait_for(|done| *done).await;
        self.outcome().unwrap_or(DownloadOutcome::Cancelled)
    }

    fn emit(&self, event: DownloadEvent) {
        let handlers = {
            let state = self.lock_state();
            if state.cancelled && matches!(event, DownloadEvent::Progress { .. }) {
                return;
            }
            state.handlers.snapshot(event.kind())
        };
        for handler in handlers {
            handler(&event);
        }
    }

    /// Record the terminal state and deliver its event. A cancel requested
    /// before this point wins over `end` or `error`.
    fn finish(&self, outcome: DownloadOutcome) {
        let (event, handlers) = {
            let mut state = self.lock_state();
            if state.outcome.is_some() {
                return;
            }
            let outcome = if state.cancelled {
                DownloadOutcome::Cancelled
            } else {
                outcome
            };
            let status = match &outcome {
                DownloadOutcome::Completed(file) => {
                    state.file = Some(file.clone());
                    DownloadStatus::Completed
                }
                DownloadOutcome::Failed(err) => DownloadStatus::Failed(err.to_string()),
                DownloadOutcome::Cancelled => DownloadStatus::Cancelled,
            };
            state.status = status;
            state.outcome = Some(outcome.clone());
            let event = outcome.into_event();
            let handlers = state.handlers.snapshot(event.kind());
            (event, handlers)
        };

        match &event {
            DownloadEvent::End(file) => {
                tracing::info!("[Downloader] 下載完成: {} ({} bytes)", self.request.name, file.len())
            }
            DownloadEvent::Error(err) => {
                tracing::warn!("[Downloader] {} 下載失敗: {}", self.request.name, err)
            }
            _ => tracing::info!("[Downloader] 已取消: {}", self.request.name),
        }

        for handler in handlers {
            handler(&event);
        }
        self.done.send_replace(true);
    }

    async fn run(self: Arc<Self>, client: Result<Client, DownloadError>, log_interval: Duration) {
        self.emit(DownloadEvent::Start);
        tracing::info!(
            "[Downloader] 開始下載: {} -> {} ({})",
            self.request.url,
            self.request.name,
            self.request.id
        );

        let outcome = match client {
            Ok(client) => match self.transfer(&client, log_interval).await {
                Ok(Some(chunks)) => DownloadOutcome::Completed(DownloadedFile::assemble(
                    &self.request.name,
                    &self.request.mime,
                    chunks,
                )),
                Ok(None) => DownloadOutcome::Cancelled,
                // An abort can surface as a transport failure.
                Err(_) if self.cancel_token.is_cancelled() => DownloadOutcome::Cancelled,
                Err(err) => DownloadOutcome::Failed(err),
            },
            Err(err) => DownloadOutcome::Failed(err),
        };
        self.finish(outcome);
    }

    /// Pull the body chunk by chunk. `Ok(None)` means cancellation was
    /// observed and the chunks were dropped.
    async fn transfer(
        &self,
        client: &Client,
        log_interval: Duration,
    ) -> Result<Option<Vec<Bytes>>, DownloadError> {
        if self.cancel_token.is_cancelled() {
            return Ok(None);
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Ok(None),
            response = client.get(&self.request.url).send() => {
                response.map_err(DownloadError::transport)?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: self.request.url.clone(),
            });
        }
        if status == StatusCode::NO_CONTENT || status == StatusCode::RESET_CONTENT {
            return Err(DownloadError::MissingBody(self.request.url.clone()));
        }

        let total = response.content_length().unwrap_or(0);
        {
            let mut state = self.lock_state();
            state.total = total;
            state.status = DownloadStatus::InProgress;
        }
        if let Some(expected) = self.request.expected_size {
            if total != 0 && total != expected {
                tracing::warn!(
                    "[Downloader] 警告: 文件大小與預期不符 (預期: {}, 實際: {})",
                    expected,
                    total
                );
            }
        }

        let mut stream = response.bytes_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut last_log = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            let Some(item) = next else { break };
            let chunk = item.map_err(DownloadError::transport)?;

            // A read that was already in flight finishes, but its bytes are
            // discarded once cancel has been requested.
            let loaded = {
                let mut state = self.lock_state();
                if state.cancelled {
                    return Ok(None);
                }
                state.loaded += chunk.len() as u64;
                state.loaded
            };
            chunks.push(chunk);
            self.emit(DownloadEvent::Progress { loaded, total });

            if last_log.elapsed() >= log_interval {
                last_log = Instant::now();
                if total > 0 {
                    tracing::debug!(
                        "[Downloader] 進度: {:.2}% ({} / {} bytes) {}",
                        loaded as f64 / total as f64 * 100.0,
                        loaded,
                        total,
                        self.request.name
                    );
                } else {
                    tracing::debug!("[Downloader] 已下載 {} bytes {}", loaded, self.request.name);
                }
            }
        }

        Ok(Some(chunks))
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Downloader")
            .field("request", &self.request)
            .field("status", &state.status)
            .field("loaded", &state.loaded)
            .field("total", &state.total)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
