use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::DownloadError;
use super::file::DownloadedFile;

/// Event names a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Progress,
    End,
    Error,
    Cancel,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Start,
        EventKind::Progress,
        EventKind::End,
        EventKind::Error,
        EventKind::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress => "progress",
            Self::End => "end",
            Self::Error => "error",
            Self::Cancel => "cancel",
        }
    }

    /// `end`, `error` and `cancel` close the lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error | Self::Cancel)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown download event: {}", s))
    }
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Start,
    /// `total` is 0 when the server sent no length.
    Progress { loaded: u64, total: u64 },
    End(DownloadedFile),
    Error(DownloadError),
    Cancel,
}

impl DownloadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start => EventKind::Start,
            Self::Progress { .. } => EventKind::Progress,
            Self::End(_) => EventKind::End,
            Self::Error(_) => EventKind::Error,
            Self::Cancel => EventKind::Cancel,
        }
    }
}

/// Identity of one subscription, used to unsubscribe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type EventHandler = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: u64,
    handlers: Vec<(EventKind, HandlerId, EventHandler)>,
}

impl HandlerRegistry {
    pub(crate) fn add(&mut self, kind: EventKind, handler: EventHandler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.handlers.push((kind, id, handler));
        id
    }

    pub(crate) fn remove(&mut self, kind: EventKind, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers
            .retain(|(k, handler_id, _)| !(*k == kind && *handler_id == id));
        self.handlers.len() != before
    }

    /// Handlers for `kind`, in subscription order. Cloned so they can be
    /// called without holding the downloader's lock.
    pub(crate) fn snapshot(&self, kind: EventKind) -> Vec<EventHandler> {
        self.handlers
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect()
    }

    /// Reserve an id without registering anything (late `end` subscribers).
    pub(crate) fn reserve(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}
