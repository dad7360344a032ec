use std::{fmt, str::FromStr};

use serde::Deserialize;

/// Telegram chat id (numeric, channels carry the `-100` prefix).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// A chat as configured by the user: either a numeric id or a public handle.
///
/// The string form (`key()`) is what rules, the allow-list and the entity cache
/// compare against, so `111` and `"111"` are the same identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "RawIdentifier")]
pub enum ChatIdentifier {
    Id(i64),
    Handle(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdentifier {
    Int(i64),
    Str(String),
}

impl TryFrom<RawIdentifier> for ChatIdentifier {
    type Error = String;

    fn try_from(raw: RawIdentifier) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawIdentifier::Int(v) => Ok(Self::Id(v)),
            RawIdentifier::Str(s) => s.parse(),
        }
    }
}

impl ChatIdentifier {
    /// Canonical string form: the decimal id, or `@handle`.
    pub fn key(&self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::Handle(h) => format!("@{h}"),
        }
    }

    pub fn as_id(&self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Handle(_) => None,
        }
    }
}

impl FromStr for ChatIdentifier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let t = s.trim();
        if t.is_empty() {
            return Err("empty chat identifier".to_string());
        }
        if let Ok(id) = t.parse::<i64>() {
            return Ok(Self::Id(id));
        }

        let handle = t
            .strip_prefix("https://")
            .or_else(|| t.strip_prefix("http://"))
            .unwrap_or(t);
        let handle = handle.strip_prefix("t.me/").unwrap_or(handle);
        let handle = handle.trim_start_matches('@').trim_end_matches('/');

        if handle.is_empty() || handle.contains(char::is_whitespace) || handle.contains('/') {
            return Err(format!("invalid chat identifier: {s}"));
        }
        Ok(Self::Handle(handle.to_string()))
    }
}

impl From<i64> for ChatIdentifier {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<ChatId> for ChatIdentifier {
    fn from(id: ChatId) -> Self {
        Self::Id(id.0)
    }
}

impl fmt::Display for ChatIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_strings_are_ids() {
        assert_eq!("-100123".parse::<ChatIdentifier>(), Ok(ChatIdentifier::Id(-100123)));
        assert_eq!(ChatIdentifier::from(111).key(), "111".parse::<ChatIdentifier>().unwrap().key());
    }

    #[test]
    fn handles_are_normalized() {
        for raw in ["mirror", "@mirror", "t.me/mirror", "https://t.me/mirror/"] {
            let id: ChatIdentifier = raw.parse().unwrap();
            assert_eq!(id.key(), "@mirror", "input {raw}");
        }
        assert!("two words".parse::<ChatIdentifier>().is_err());
        assert!("  ".parse::<ChatIdentifier>().is_err());
    }

    #[test]
    fn deserializes_ints_and_strings() {
        let ids: Vec<ChatIdentifier> = serde_yaml::from_str("[111, \"222\", \"@chan\"]").unwrap();
        assert_eq!(
            ids,
            vec![
                ChatIdentifier::Id(111),
                ChatIdentifier::Id(222),
                ChatIdentifier::Handle("chan".to_string())
            ]
        );
    }
}
