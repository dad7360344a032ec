//! In-memory fakes for the messaging ports.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::{
        port::{ChatDirectory, MessagingPort},
        types::{Conversation, Media, TextEntity},
    },
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Html(ChatId, String),
    Edit(MessageRef, String),
    Text(ChatId, String, Vec<TextEntity>),
    /// `bool`: whether the photo file existed when it was sent.
    /// Chat, file, caption, caption entities, whether the file existed.
    Photo(ChatId, PathBuf, String, Vec<TextEntity>, bool),
    Forward(ChatId, MessageRef),
    Download(PathBuf),
}

#[derive(Default)]
pub struct FakeMessenger {
    pub calls: Mutex<Vec<Call>>,
    pub failing_chats: HashSet<i64>,
    pub fail_downloads: bool,
    next_id: AtomicI32,
}

impl FakeMessenger {
    pub fn failing(chats: &[i64]) -> Self {
        Self {
            failing_chats: chats.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn failing_downloads() -> Self {
        Self {
            fail_downloads: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn html_to(&self, chat: i64) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Html(id, html) if id.0 == chat => Some(html),
                _ => None,
            })
            .collect()
    }

    pub fn edits_to(&self, chat: i64) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Edit(msg, html) if msg.chat_id.0 == chat => Some(html),
                _ => None,
            })
            .collect()
    }

    /// Sent and edited HTML for `chat`, in call order.
    pub fn texts_to(&self, chat: i64) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Html(id, html) if id.0 == chat => Some(html),
                Call::Edit(msg, html) if msg.chat_id.0 == chat => Some(html),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn check(&self, chat_id: ChatId) -> Result<MessageRef> {
        if self.failing_chats.contains(&chat_id.0) {
            return Err(Error::External(format!("chat {} rejected the message", chat_id.0)));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(id),
        })
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.record(Call::Html(chat_id, html.to_string()));
        self.check(chat_id)
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.record(Call::Edit(msg, html.to_string()));
        self.check(msg.chat_id).map(|_| ())
    }

    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        entities: &[TextEntity],
    ) -> Result<MessageRef> {
        self.record(Call::Text(chat_id, text.to_string(), entities.to_vec()));
        self.check(chat_id)
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: &str,
        entities: &[TextEntity],
    ) -> Result<MessageRef> {
        self.record(Call::Photo(
            chat_id,
            path.to_path_buf(),
            caption.to_string(),
            entities.to_vec(),
            path.exists(),
        ));
        self.check(chat_id)
    }

    async fn forward(&self, chat_id: ChatId, source: MessageRef) -> Result<MessageRef> {
        self.record(Call::Forward(chat_id, source));
        self.check(chat_id)
    }

    async fn download_media(&self, media: &Media, dest_dir: &Path) -> Result<PathBuf> {
        if self.fail_downloads {
            return Err(Error::External("download refused".to_string()));
        }
        let name = match media {
            Media::Photo { file_id } => format!("{file_id}.jpg"),
            Media::Document {
                file_id, file_name, ..
            } => file_name.clone().unwrap_or_else(|| file_id.clone()),
            Media::None => return Err(Error::NotFound("no media".to_string())),
        };
        std::fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(name);
        std::fs::write(&path, b"media")?;
        self.record(Call::Download(path.clone()));
        Ok(path)
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    pub conversations: Vec<Conversation>,
    /// Not listed by `conversations()`, but found by `lookup_id`.
    pub reachable: Vec<Conversation>,
    pub rate_limited: bool,
    pub scans: AtomicUsize,
    pub handle_lookups: AtomicUsize,
    pub id_lookups: AtomicUsize,
}

impl FakeDirectory {
    pub fn with(convs: &[(i64, Option<&str>)]) -> Self {
        Self {
            conversations: convs
                .iter()
                .map(|(id, handle)| Conversation {
                    id: ChatId(*id),
                    handle: handle.map(|h| h.to_string()),
                    title: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.scans.load(Ordering::SeqCst) + self.handle_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatDirectory for FakeDirectory {
    async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.rate_limited {
            return Err(Error::RateLimited {
                retry_after: Duration::from_secs(30),
            });
        }
        Ok(self.conversations.clone())
    }

    async fn lookup_id(&self, id: ChatId) -> Result<Option<Conversation>> {
        self.id_lookups.fetch_add(1, Ordering::SeqCst);
        if self.rate_limited {
            return Err(Error::RateLimited {
                retry_after: Duration::from_secs(30),
            });
        }
        Ok(self
            .conversations
            .iter()
            .chain(&self.reachable)
            .find(|c| c.id == id)
            .cloned())
    }

    async fn lookup_handle(&self, handle: &str) -> Result<Option<Conversation>> {
        self.handle_lookups.fetch_add(1, Ordering::SeqCst);
        if self.rate_limited {
            return Err(Error::RateLimited {
                retry_after: Duration::from_secs(30),
            });
        }
        Ok(self
            .conversations
            .iter()
            .find(|c| c.handle.as_deref() == Some(handle))
            .cloned())
    }
}

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mrb-{prefix}-{}", crate::utils::unique_suffix()));
    let _ = std::fs::create_dir_all(&dir);
    dir
}
