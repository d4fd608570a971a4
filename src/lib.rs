// 統一下載管理模塊
pub mod downloads;
// 注意力 / 機率縮減模塊
pub mod attention;
// 模型與數據集清單
pub mod manifest;
// 設定檔
pub mod config;

pub use attention::{
    rank_top_k, reduce_attention, reduce_attention_with, reduce_layers, significant_tokens,
    AttentionSelection, HeadWeight, SignificantToken, TokenProbability,
};
pub use config::{AttentionConfig, ConfigError, DownloadConfig, Settings};
pub use downloads::{
    DownloadError, DownloadEvent, DownloadManager, DownloadOutcome, DownloadProgress,
    DownloadRequest, DownloadedFile, Downloader, EventKind, HandlerId,
};
pub use manifest::{Manifest, ManifestEntry, ManifestError};
