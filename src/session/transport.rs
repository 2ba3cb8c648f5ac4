//! Session transport traits

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::targets::ResolvedTargets;
use super::types::SessionEvent;
use crate::config::SessionConfig;
use crate::error::Result;

/// A constructed avatar session
#[async_trait]
pub trait AvatarSession: Send + Sync {
    /// Begin connecting
    ///
    /// Returns once the attempt is under way; the outcome arrives later as a
    /// [`SessionEvent`] on the channel given to the factory.
    async fn start(&self) -> Result<()>;

    /// Queue one PCM16LE chunk for the remote avatar
    ///
    /// Never blocks; a full queue is reported as an error and the chunk is lost.
    fn send_audio(&self, pcm: Bytes) -> Result<()>;

    /// Release the session; safe to call more than once
    async fn close(&self);
}

/// Builds sessions from configuration and render targets
pub trait SessionFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(
        &self,
        config: &SessionConfig,
        targets: ResolvedTargets,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn AvatarSession>>;
}
