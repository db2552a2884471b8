use async_trait::async_trait;

/// Resolves a track id to a playable stream URL.
///
/// Resolved URLs are typically short-lived and signed, so the manager calls
/// this immediately before issuing the request and never caches the result.
/// Implemented outside the core, against whatever remote service the player
/// talks to.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve_stream_url(&self, track_id: &str) -> Result<String, String>;
}
