use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::{Conversation, Media, TextEntity},
    Result,
};

/// Outbound messaging port.
///
/// Adapters surface flood control as `Error::RateLimited` once their own
/// retry budget is spent.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    /// Status replies (HTML parse mode).
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()>;

    /// Plain text with explicit formatting spans.
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        entities: &[TextEntity],
    ) -> Result<MessageRef>;

    async fn send_photo(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: &str,
        entities: &[TextEntity],
    ) -> Result<MessageRef>;

    /// Forward a message verbatim.
    async fn forward(&self, chat_id: ChatId, source: MessageRef) -> Result<MessageRef>;

    /// Download an attachment into `dest_dir` and return the written file.
    async fn download_media(&self, media: &Media, dest_dir: &Path) -> Result<PathBuf>;
}

/// Lookup side of the messenger: which chats exist and how to reach them.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Conversations the connected account participates in.
    async fn conversations(&self) -> Result<Vec<Conversation>>;

    /// Ask the platform about one numeric id that `conversations()` did not
    /// list, e.g. a chat joined after startup. `Ok(None)` when unreachable.
    async fn lookup_id(&self, id: ChatId) -> Result<Option<Conversation>>;

    /// Resolve a public handle (without `@`). `Ok(None)` when unknown.
    async fn lookup_handle(&self, handle: &str) -> Result<Option<Conversation>>;
}
