use std::{collections::HashSet, fmt::Display};

use crate::{domain::ChatIdentifier, messaging::types::InboundMessage};

// ============== Authorization ==============

/// Chats allowed to trigger downloads.
///
/// An empty list allows every chat. Membership compares string forms, so a
/// configured `111` and an incoming `"111"` are the same chat.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    chat_ids: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Display,
    {
        Self {
            chat_ids: ids
                .into_iter()
                .map(|id| id.to_string().trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    pub fn from_identifiers(ids: &[ChatIdentifier]) -> Self {
        Self::new(ids.iter().map(ChatIdentifier::key))
    }

    pub fn is_open(&self) -> bool {
        self.chat_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chat_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chat_ids.is_empty()
    }

    pub fn is_allowed(&self, chat_id: impl Display) -> bool {
        if self.chat_ids.is_empty() {
            return true;
        }
        self.chat_ids.contains(chat_id.to_string().trim())
    }

    /// The message's chat is listed by numeric id or by `@handle`.
    pub fn allows(&self, msg: &InboundMessage) -> bool {
        self.is_allowed(msg.chat_id().0)
            || msg
                .chat_handle_key()
                .is_some_and(|handle| self.is_allowed(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChatId, MessageId, MessageRef},
        messaging::types::Media,
    };

    #[test]
    fn empty_list_allows_everyone() {
        let gate = AllowList::default();
        assert!(gate.is_open());
        assert!(gate.is_allowed(333));
        assert!(gate.is_allowed("-100123"));
        assert!(gate.is_allowed("@anyone"));
    }

    #[test]
    fn numbers_and_strings_are_the_same_chat() {
        let gate = AllowList::new(["111", "222"]);
        assert!(!gate.is_allowed("333"));
        assert!(gate.is_allowed(111));
        assert!(gate.is_allowed("222"));
        assert!(!gate.is_allowed(-111));
    }

    #[test]
    fn built_from_configured_identifiers() {
        let ids: Vec<ChatIdentifier> = vec![111.into(), "@owner".parse().unwrap()];
        let gate = AllowList::from_identifiers(&ids);
        assert_eq!(gate.len(), 2);
        assert!(gate.is_allowed(111i64));
        assert!(gate.is_allowed("@owner"));
        assert!(!gate.is_allowed("owner"));
    }

    fn from_chat(chat: i64, handle: Option<&str>) -> InboundMessage {
        InboundMessage {
            message: MessageRef {
                chat_id: ChatId(chat),
                message_id: MessageId(1),
            },
            chat_handle: handle.map(str::to_string),
            chat_title: None,
            text: String::new(),
            entities: vec![],
            media: Media::None,
        }
    }

    #[test]
    fn messages_match_by_id_or_handle() {
        let gate = AllowList::new(["@owner", "222"]);
        assert!(gate.allows(&from_chat(5, Some("owner"))));
        assert!(gate.allows(&from_chat(222, None)));
        assert!(!gate.allows(&from_chat(5, Some("stranger"))));
        assert!(!gate.allows(&from_chat(5, None)));
        assert!(AllowList::default().allows(&from_chat(5, None)));
    }
}
