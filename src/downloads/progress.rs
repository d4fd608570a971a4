/*
 * Progress Reporting
 *
 * Point-in-time view of a transfer for UIs that poll instead of
 * subscribing to `progress` events.
 */
use serde::{Deserialize, Serialize};

/// Where a download is in its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DownloadStatus {
    /// Spawned, no response yet
    Pending,
    /// Receiving body chunks
    InProgress,
    /// Successfully completed
    Completed,
    /// Failed with error
    Failed(String),
    /// Cancelled by caller
    Cancelled,
}

impl DownloadStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// Download progress information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub loaded: u64,
    /// 0 when the server did not report a length
    pub total: u64,
    pub percent: f64,
    /// Average since the request was sent
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

impl DownloadProgress {
    pub fn new(status: DownloadStatus, loaded: u64, total: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            ((loaded as f64 / total as f64) * 100.0).min(100.0)
        };
        Self {
            status,
            loaded,
            total,
            percent,
            speed_bps: None,
            eta_seconds: None,
        }
    }

    /// Attach a transfer rate and derive the ETA from it.
    pub fn with_elapsed(mut self, elapsed_secs: f64) -> Self {
        if elapsed_secs > 0.0 && self.loaded > 0 {
            let speed_bps = (self.loaded as f64 / elapsed_secs) as u64;
            self.speed_bps = Some(speed_bps);
            if speed_bps > 0 && self.total > self.loaded {
                self.eta_seconds = Some((self.total - self.loaded) / speed_bps);
            }
        }
        self
    }
}
