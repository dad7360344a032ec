//! Translation between teloxide types and the platform-neutral core types.

use teloxide::types::{Message, MessageEntity, MessageEntityKind};

use mrb_core::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::types::{Conversation, EntityKind, InboundMessage, Media, TextEntity},
};

pub fn chat_id(id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(id.0)
}

pub fn message_id(id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(id.0)
}

pub fn conversation(chat: &teloxide::types::Chat) -> Conversation {
    Conversation {
        id: ChatId(chat.id.0),
        handle: chat.username().map(str::to_string),
        title: chat.title().map(str::to_string),
    }
}

/// Build the neutral view of a message. Captions stand in for text on media
/// messages, and the largest photo size is the one kept.
pub fn inbound(msg: &Message) -> InboundMessage {
    let (text, entities) = match msg.text() {
        Some(t) => (t, msg.entities()),
        None => (msg.caption().unwrap_or_default(), msg.caption_entities()),
    };

    InboundMessage {
        message: MessageRef {
            chat_id: ChatId(msg.chat.id.0),
            message_id: MessageId(msg.id.0),
        },
        chat_handle: msg.chat.username().map(str::to_string),
        chat_title: msg.chat.title().map(str::to_string),
        text: text.to_string(),
        entities: entities
            .unwrap_or_default()
            .iter()
            .filter_map(entity_from_tg)
            .collect(),
        media: media(msg),
    }
}

fn media(msg: &Message) -> Media {
    if let Some(best) = msg.photo().and_then(|sizes| sizes.last()) {
        return Media::Photo {
            file_id: best.file.id.clone(),
        };
    }
    if let Some(d) = msg.document() {
        return document(&d.file.id, d.mime_type.as_ref(), d.file_name.as_deref());
    }
    if let Some(v) = msg.video() {
        return document(&v.file.id, v.mime_type.as_ref(), v.file_name.as_deref());
    }
    if let Some(a) = msg.audio() {
        return document(&a.file.id, a.mime_type.as_ref(), a.file_name.as_deref());
    }
    if let Some(a) = msg.animation() {
        return document(&a.file.id, a.mime_type.as_ref(), a.file_name.as_deref());
    }
    if let Some(v) = msg.voice() {
        return document(&v.file.id, v.mime_type.as_ref(), None);
    }
    Media::None
}

fn document(file_id: &str, mime: Option<&impl ToString>, file_name: Option<&str>) -> Media {
    Media::Document {
        file_id: file_id.to_string(),
        mime_type: mime.map(ToString::to_string),
        file_name: file_name.map(str::to_string),
    }
}

/// Formatting spans only; mentions, hashtags and other auto-detected kinds are
/// re-detected by Telegram on send.
pub fn entity_from_tg(e: &MessageEntity) -> Option<TextEntity> {
    let kind = match &e.kind {
        MessageEntityKind::Bold => EntityKind::Bold,
        MessageEntityKind::Italic => EntityKind::Italic,
        MessageEntityKind::Underline => EntityKind::Underline,
        MessageEntityKind::Strikethrough => EntityKind::Strikethrough,
        MessageEntityKind::Spoiler => EntityKind::Spoiler,
        MessageEntityKind::Code => EntityKind::Code,
        MessageEntityKind::Pre { language } => EntityKind::Pre {
            language: language.clone(),
        },
        MessageEntityKind::TextLink { url } => EntityKind::TextLink {
            url: url.to_string(),
        },
        _ => return None,
    };
    Some(TextEntity {
        kind,
        offset: e.offset,
        length: e.length,
    })
}

pub fn entity_to_tg(e: &TextEntity) -> Option<MessageEntity> {
    let kind = match &e.kind {
        EntityKind::Bold => MessageEntityKind::Bold,
        EntityKind::Italic => MessageEntityKind::Italic,
        EntityKind::Underline => MessageEntityKind::Underline,
        EntityKind::Strikethrough => MessageEntityKind::Strikethrough,
        EntityKind::Spoiler => MessageEntityKind::Spoiler,
        EntityKind::Code => MessageEntityKind::Code,
        EntityKind::Pre { language } => MessageEntityKind::Pre {
            language: language.clone(),
        },
        EntityKind::TextLink { url } => MessageEntityKind::TextLink {
            url: reqwest::Url::parse(url).ok()?,
        },
    };
    Some(MessageEntity::new(kind, e.offset, e.length))
}

pub fn entities_to_tg(entities: &[TextEntity]) -> Vec<MessageEntity> {
    entities.iter().filter_map(entity_to_tg).collect()
}
