//! Relay rules: mirror messages from a source chat into target chats.
//!
//! Every rule whose source matches is evaluated, in configuration order, and
//! each one succeeds or fails on its own. A broken target never stops the
//! remaining rules.

use std::{path::PathBuf, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    domain::{ChatIdentifier, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{EntityKind, InboundMessage, TextEntity},
    },
    resolver::{EntityResolver, ResolvedEntity},
    utils::TempFile,
    Error,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRule {
    pub source_chat: ChatIdentifier,
    pub target_chat: ChatIdentifier,
    /// OR-matched substrings; empty matches everything.
    pub include_keywords: Vec<String>,
    /// OR-matched substrings; any hit vetoes the transfer.
    pub exclude_words: Vec<String>,
    /// Compose a new message instead of forwarding the original.
    pub direct: bool,
}

impl TransferRule {
    /// The rule's source names this chat, by numeric id or by `@handle`.
    pub fn matches_source(&self, msg: &InboundMessage) -> bool {
        let source = self.source_chat.key();
        if source == msg.chat_id().0.to_string() {
            return true;
        }
        msg.chat_handle_key().is_some_and(|h| h == source)
    }

    /// Keyword filter. Exclusions are checked first and short-circuit.
    pub fn should_transfer(&self, text: &str) -> bool {
        if self.exclude_words.iter().any(|w| text.contains(w.as_str())) {
            return false;
        }
        if self.include_keywords.is_empty() {
            return true;
        }
        self.include_keywords
            .iter()
            .any(|k| text.contains(k.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferAction {
    Forwarded { sent: MessageRef },
    Sent { sent: MessageRef, with_photo: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("target could not be resolved")]
    Unresolved,

    #[error("message has neither text nor photo")]
    NothingToSend,

    #[error("transfer failed: {0}")]
    Execution(#[from] Error),
}

/// Result of one rule that matched and passed its filter.
#[derive(Debug)]
pub struct RuleOutcome {
    /// Index of the rule in configuration order.
    pub rule: usize,
    /// Target key as configured.
    pub target: String,
    pub result: Result<TransferAction, TransferError>,
}

impl RuleOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct TransferEngine {
    rules: Vec<TransferRule>,
    resolver: Arc<EntityResolver>,
    messenger: Arc<dyn MessagingPort>,
    temp_dir: PathBuf,
}

impl TransferEngine {
    pub fn new(
        rules: Vec<TransferRule>,
        resolver: Arc<EntityResolver>,
        messenger: Arc<dyn MessagingPort>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            rules,
            resolver,
            messenger,
            temp_dir,
        }
    }

    pub fn rules(&self) -> &[TransferRule] {
        &self.rules
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    /// Every chat a rule sends into, for warming the resolver at startup.
    pub fn targets(&self) -> Vec<ChatIdentifier> {
        let mut out: Vec<ChatIdentifier> = Vec::new();
        for r in &self.rules {
            if !out.contains(&r.target_chat) {
                out.push(r.target_chat.clone());
            }
        }
        out
    }

    /// Apply every matching rule to `msg`.
    pub async fn route(&self, msg: &InboundMessage) -> Vec<RuleOutcome> {
        let mut outcomes = Vec::new();

        for (idx, rule) in self.rules.iter().enumerate() {
            if !rule.matches_source(msg) {
                continue;
            }
            if !rule.should_transfer(&msg.text) {
                debug!(rule = idx, chat_id = msg.chat_id().0, "filtered by keywords");
                continue;
            }

            let target = rule.target_chat.key();
            let result = match self.resolver.resolve(&rule.target_chat).await {
                Some(entity) => self.execute(rule, msg, &entity).await,
                None => Err(TransferError::Unresolved),
            };

            match &result {
                Ok(action) => info!(rule = idx, target = %target, ?action, "message relayed"),
                Err(e) => warn!(
                    rule = idx,
                    target = %target,
                    chat_id = msg.chat_id().0,
                    message_id = msg.message.message_id.0,
                    "relay skipped: {e}"
                ),
            }

            outcomes.push(RuleOutcome {
                rule: idx,
                target,
                result,
            });
        }

        outcomes
    }

    async fn execute(
        &self,
        rule: &TransferRule,
        msg: &InboundMessage,
        target: &ResolvedEntity,
    ) -> Result<TransferAction, TransferError> {
        let chat = target.chat_id();

        if !rule.direct {
            let sent = self.messenger.forward(chat, msg.message).await?;
            return Ok(TransferAction::Forwarded { sent });
        }

        let (text, entities) = rewrite_links(&msg.text, &msg.entities);

        if msg.has_photo() {
            let downloaded = self
                .messenger
                .download_media(&msg.media, &self.temp_dir)
                .await?;
            let photo = TempFile::new(downloaded);
            let sent = self
                .messenger
                .send_photo(chat, photo.path(), &text, &entities)
                .await?;
            return Ok(TransferAction::Sent {
                sent,
                with_photo: true,
            });
        }

        if text.trim().is_empty() {
            return Err(TransferError::NothingToSend);
        }

        let sent = self.messenger.send_text(chat, &text, &entities).await?;
        Ok(TransferAction::Sent {
            sent,
            with_photo: false,
        })
    }
}

/// Label that, when present, becomes a clickable link to the share URL.
const SAVE_LABEL: &str = "点击转存";

/// Cloud-drive share links end the URL scan.
const SHARE_HOST_MARK: &str = "115";

/// Spell out text links for a composed copy.
///
/// Each text-link URL is appended on its own line, stopping after the first
/// cloud-drive share link. When the text carries the save label, the last URL
/// is not appended; every label occurrence links to it instead and the other
/// formatting spans are dropped.
pub fn rewrite_links(text: &str, entities: &[TextEntity]) -> (String, Vec<TextEntity>) {
    let mut out = text.to_string();
    let mut last_url = None;
    for entity in entities {
        if let EntityKind::TextLink { url } = &entity.kind {
            out.push('\n');
            out.push_str(url);
            last_url = Some(url.as_str());
            if url.contains(SHARE_HOST_MARK) {
                break;
            }
        }
    }

    let Some(url) = last_url else {
        return (out, entities.to_vec());
    };
    if !out.contains(SAVE_LABEL) {
        return (out, entities.to_vec());
    }

    out.truncate(out.len() - url.len() - 1);
    let label_len = utf16_len(SAVE_LABEL);
    let links = out
        .match_indices(SAVE_LABEL)
        .map(|(at, _)| TextEntity {
            kind: EntityKind::TextLink {
                url: url.to_string(),
            },
            offset: utf16_len(&out[..at]),
            length: label_len,
        })
        .collect();
    (out, links)
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}
