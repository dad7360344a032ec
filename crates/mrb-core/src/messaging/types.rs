use crate::domain::{ChatId, MessageRef};

/// Attachment carried by an inbound message, decided once at ingestion.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Media {
    Photo {
        file_id: String,
    },
    /// Documents, videos, audio, voice notes and animations.
    Document {
        file_id: String,
        mime_type: Option<String>,
        file_name: Option<String>,
    },
    #[default]
    None,
}

impl Media {
    pub fn is_photo(&self) -> bool {
        matches!(self, Media::Photo { .. })
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Media::None)
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            Media::Photo { file_id } | Media::Document { file_id, .. } => Some(file_id.as_str()),
            Media::None => None,
        }
    }
}

/// Formatting span over the message text (offsets in UTF-16 units, as Telegram sends them).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextEntity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Spoiler,
    Code,
    Pre { language: Option<String> },
    TextLink { url: String },
}

/// Platform-neutral view of an inbound message.
///
/// The Telegram adapter builds this from a teloxide `Message`; the routing core
/// only ever sees this shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub message: MessageRef,
    /// Public username of the chat, without `@`.
    pub chat_handle: Option<String>,
    pub chat_title: Option<String>,
    /// Message text, or the caption for media messages.
    pub text: String,
    pub entities: Vec<TextEntity>,
    pub media: Media,
}

impl InboundMessage {
    pub fn chat_id(&self) -> ChatId {
        self.message.chat_id
    }

    pub fn has_photo(&self) -> bool {
        self.media.is_photo()
    }

    /// `@handle` form of the originating chat, when it has one.
    pub fn chat_handle_key(&self) -> Option<String> {
        self.chat_handle.as_ref().map(|h| format!("@{h}"))
    }
}

/// A chat the connected account can address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    pub id: ChatId,
    pub handle: Option<String>,
    pub title: Option<String>,
}

