//! Telegram adapter (teloxide).
//!
//! This crate implements the `mrb-core` MessagingPort and ChatDirectory over
//! the Telegram Bot API and runs the update dispatcher.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;

use teloxide::{
    net::Download,
    prelude::*,
    types::{InputFile, ParseMode, Recipient},
    ApiError, RequestError,
};

use tokio::{sync::RwLock, time::sleep};
use tracing::{debug, warn};

pub mod convert;
pub mod router;

use mrb_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::{ChatDirectory, MessagingPort},
        types::{Conversation, Media, TextEntity},
    },
    utils::unique_suffix,
    Result,
};

use crate::convert::{chat_id as tg_chat, entities_to_tg, message_id as tg_msg_id};

const MAX_RETRIES: usize = 3;

/// Chats the bot has seen, either through updates or explicit lookups.
///
/// The Bot API has no "list my dialogs" call, so this registry is what the
/// resolver scans.
#[derive(Default)]
pub struct KnownChats {
    inner: RwLock<HashMap<i64, Conversation>>,
}

impl KnownChats {
    pub async fn record(&self, conv: Conversation) {
        self.inner.write().await.insert(conv.id.0, conv);
    }

    pub async fn all(&self) -> Vec<Conversation> {
        let mut out: Vec<Conversation> = self.inner.read().await.values().cloned().collect();
        out.sort_by_key(|c| c.id.0);
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
    known: Arc<KnownChats>,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            known: Default::default(),
        }
    }

    pub fn known(&self) -> &KnownChats {
        &self.known
    }

    /// Fetch chats by id with `getChat` so configured targets resolve before
    /// they have posted anything. Returns how many were found.
    pub async fn discover(&self, ids: &[i64]) -> usize {
        let mut found = 0usize;
        for &id in ids {
            match self
                .with_retry(|| self.bot.get_chat(teloxide::types::ChatId(id)))
                .await
            {
                Ok(chat) => {
                    self.known.record(convert::conversation(&chat)).await;
                    found += 1;
                }
                Err(e) => warn!(chat_id = id, "chat not reachable: {e}"),
            }
        }
        found
    }

    fn map_err(e: RequestError) -> Error {
        match e {
            RequestError::Api(ApiError::ChatNotFound) => Error::NotFound("chat not found".to_string()),
            RequestError::RetryAfter(d) => Error::RateLimited { retry_after: d },
            other => Error::External(format!("telegram error: {other}")),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    warn!(attempt = attempts, wait_secs = d.as_secs(), "flood wait");
                    sleep(d).await;
                }
                Err(e) => return Err(Self::map_err(e)),
            }
        }
    }

    fn sent(chat_id: ChatId, msg: &Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .edit_message_text(tg_chat(msg.chat_id), tg_msg_id(msg.message_id), html.to_string())
                .parse_mode(ParseMode::Html)
        })
        .await?;
        Ok(())
    }

    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        entities: &[TextEntity],
    ) -> Result<MessageRef> {
        let entities = entities_to_tg(entities);
        let msg = self
            .with_retry(|| {
                let req = self.bot.send_message(tg_chat(chat_id), text.to_string());
                if entities.is_empty() {
                    req
                } else {
                    req.entities(entities.clone())
                }
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: &str,
        entities: &[TextEntity],
    ) -> Result<MessageRef> {
        let entities = entities_to_tg(entities);
        let msg = self
            .with_retry(|| {
                let mut req = self
                    .bot
                    .send_photo(tg_chat(chat_id), InputFile::file(path.to_path_buf()));
                if !caption.is_empty() {
                    req = req.caption(caption.to_string());
                    if !entities.is_empty() {
                        req = req.caption_entities(entities.clone());
                    }
                }
                req
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn forward(&self, chat_id: ChatId, source: MessageRef) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot.forward_message(
                    tg_chat(chat_id),
                    tg_chat(source.chat_id),
                    tg_msg_id(source.message_id),
                )
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn download_media(&self, media: &Media, dest_dir: &Path) -> Result<PathBuf> {
        let Some(file_id) = media.file_id() else {
            return Err(Error::NotFound("message has no media".to_string()));
        };
        let file = self
            .with_retry(|| self.bot.get_file(file_id.to_string()))
            .await?;

        // Telegram paths look like `photos/file_12.jpg`.
        let ext = Path::new(&file.path)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| if media.is_photo() { "jpg".to_string() } else { "bin".to_string() });
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(format!("tg_{}.{ext}", unique_suffix()));

        let mut dst = tokio::fs::File::create(&path).await?;
        if let Err(e) = self.bot.download_file(&file.path, &mut dst).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(Error::Download(format!("telegram file download failed: {e}")));
        }
        debug!(path = %path.display(), "media downloaded");
        Ok(path)
    }
}

#[async_trait]
impl ChatDirectory for TelegramMessenger {
    async fn conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.known.all().await)
    }

    async fn lookup_id(&self, id: ChatId) -> Result<Option<Conversation>> {
        match self.with_retry(|| self.bot.get_chat(tg_chat(id))).await {
            Ok(chat) => {
                let conv = convert::conversation(&chat);
                self.known.record(conv.clone()).await;
                Ok(Some(conv))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lookup_handle(&self, handle: &str) -> Result<Option<Conversation>> {
        let recipient = Recipient::ChannelUsername(format!("@{handle}"));
        match self.with_retry(|| self.bot.get_chat(recipient.clone())).await {
            Ok(chat) => {
                let conv = convert::conversation(&chat);
                self.known.record(conv.clone()).await;
                Ok(Some(conv))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
