/*
 * Download Manager
 *
 * Keeps track of the downloads that are still running, keyed by the
 * caller's id. Finished downloads drop out on their own.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use reqwest::Client;

use super::downloader::{DownloadRequest, Downloader};
use super::error::DownloadError;
use super::events::{DownloadEvent, EventKind};
use crate::config::DownloadConfig;

struct Job {
    serial: u64,
    downloader: Arc<Downloader>,
}

struct Inner {
    client: Client,
    config: DownloadConfig,
    jobs: Mutex<HashMap<String, Job>>,
    next_serial: Mutex<u64>,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_job(&self, id: &str, serial: u64) {
        let mut jobs = self.jobs();
        // The id may already belong to a newer download.
        if jobs.get(id).is_some_and(|job| job.serial == serial) {
            jobs.remove(id);
            tracing::debug!("[DownloadManager] 移除已結束的下載: {}", id);
        }
    }
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        let client = config
            .client()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// All downloads share `client`'s connection pool.
    pub fn with_client(client: Client, config: DownloadConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                jobs: Mutex::new(HashMap::new()),
                next_serial: Mutex::new(0),
            }),
        }
    }

    /// Start a download unless one with the same id is still running.
    pub fn start(&self, request: DownloadRequest) -> Result<Arc<Downloader>, DownloadError> {
        if let Err(err) = tokio::runtime::Handle::try_current() {
            return Err(DownloadError::Client(format!("no Tokio runtime: {}", err)));
        }

        let serial = {
            let mut next = self
                .inner
                .next_serial
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };

        let mut jobs = self.inner.jobs();
        if jobs.contains_key(&request.id) {
            return Err(DownloadError::AlreadyActive(request.id));
        }

        let id = request.id.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job_id = id.clone();
        let remove = move |_: &DownloadEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_job(&job_id, serial);
            }
        };

        // Handlers only run on the spawned task, so holding `jobs` here
        // cannot deadlock.
        let downloader = Downloader::builder(request)
            .client(self.inner.client.clone())
            .config(self.inner.config.clone())
            .on(EventKind::End, remove.clone())
            .on(EventKind::Error, remove.clone())
            .on(EventKind::Cancel, remove)
            .spawn();

        jobs.insert(
            id.clone(),
            Job {
                serial,
                downloader: Arc::clone(&downloader),
            },
        );
        tracing::info!("[DownloadManager] 新增下載: {} (進行中: {})", id, jobs.len());
        Ok(downloader)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Downloader>> {
        self.inner
            .jobs()
            .get(id)
            .map(|job| Arc::clone(&job.downloader))
    }

    /// Request cancellation. The entry disappears once `cancel` fires.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(downloader) => {
                downloader.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let downloaders: Vec<_> = self
            .inner
            .jobs()
            .values()
            .map(|job| Arc::clone(&job.downloader))
            .collect();
        for downloader in downloaders {
            downloader.cancel();
        }
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.inner.jobs().len()
    }
}
