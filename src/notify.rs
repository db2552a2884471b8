/// Event contract between the download manager and whatever presents
/// downloads to the user (system notifications, a tray badge, a UI list).
///
/// The manager calls these at well-defined transition points and nothing
/// else; rate-limiting, coalescing and platform rendering are the sink's
/// problem. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn progress(
        &self,
        id: &str,
        title: &str,
        artist: &str,
        fraction: f64,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    );

    fn completed(&self, id: &str, title: &str, artist: &str);

    fn failed(&self, id: &str, title: &str);

    /// Fired when a live progress entry is removed (grace expiry or cancel)
    /// so the sink can tear down whatever it is showing for `id`.
    fn dismiss(&self, id: &str);
}

/// Sink that ignores every event, for embedders with no download UI.
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn progress(&self, _: &str, _: &str, _: &str, _: f64, _: u64, _: Option<u64>) {}
    fn completed(&self, _: &str, _: &str, _: &str) {}
    fn failed(&self, _: &str, _: &str) {}
    fn dismiss(&self, _: &str) {}
}
