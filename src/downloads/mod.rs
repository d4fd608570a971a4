/**
 * Downloads Module
 *
 * Streaming, cancellable fetches of model and dataset archives with an
 * observable lifecycle: start → progress* → end | error | cancel.
 */
mod downloader;
mod error;
mod events;
mod file;
mod manager;
mod progress;

pub use downloader::*;
pub use error::*;
pub use events::*;
pub use file::*;
pub use manager::*;
pub use progress::*;
