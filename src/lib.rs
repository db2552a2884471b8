//! Local media acquisition and caching core for the Aria music player.
//!
//! Three services with real invariants live here: [`DownloadCatalog`], the
//! durable catalog of completed downloads; [`StreamCache`], a bounded LRU
//! byte-span cache in front of remote streaming reads; and
//! [`DownloadManager`], the concurrent, cancellable download orchestrator.
//! Presentation, playback and the remote catalog stay outside, behind the
//! [`NotificationSink`], [`MediaSourceFactory`] and [`StreamResolver`]
//! seams.

pub mod catalog;
pub mod downloads;
pub mod logging;
pub mod notify;
pub mod paths;
pub mod resolver;
pub mod stream_cache;
pub mod track;

pub use catalog::{CatalogEntry, DownloadCatalog};
pub use downloads::{DownloadManager, ManagerConfig};
pub use notify::{NoopNotificationSink, NotificationSink};
pub use paths::StoragePaths;
pub use resolver::StreamResolver;
pub use stream_cache::{
    DiskSpanStore, MediaByteSource, MediaSourceFactory, SpanStore, StreamCache,
};
pub use track::{DownloadProgress, DownloadState, Track, TrackOrigin};
