//! Courier Telegram
//!
//! Telegram Bot API update model. Updates are what the scheduler persists
//! as task payloads, so every type round-trips through serde unchanged.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<TelegramMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<TelegramDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<TelegramVideo>,
    pub chat: TelegramChat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TelegramUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramVideo {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

/// A `/command@bot args` invocation extracted from message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCommand {
    pub name: String,
    pub mention: Option<String>,
    pub args: Vec<String>,
}

impl BotCommand {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim_start();
        let rest = text.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let head = parts.next()?;

        let (name, mention) = match head.split_once('@') {
            Some((name, bot)) if !bot.is_empty() => (name, Some(bot.to_string())),
            Some((name, _)) => (name, None),
            None => (head, None),
        };
        if name.is_empty() {
            return None;
        }

        Some(Self {
            name: name.to_lowercase(),
            mention,
            args: parts.map(str::to_string).collect(),
        })
    }
}

impl TelegramUpdate {
    /// The message carrying the update, including the one behind a callback.
    pub fn message(&self) -> Option<&TelegramMessage> {
        self.message
            .as_ref()
            .or_else(|| self.callback_query.as_ref().and_then(|q| q.message.as_ref()))
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.message().map(|m| m.chat.id)
    }

    pub fn from(&self) -> Option<&TelegramUser> {
        match (&self.message, &self.callback_query) {
            (Some(message), _) => message.from.as_ref(),
            (None, Some(query)) => Some(&query.from),
            (None, None) => None,
        }
    }

    /// Message text or caption, or callback data for button presses.
    pub fn text(&self) -> Option<&str> {
        if let Some(message) = &self.message {
            return message.text.as_deref().or(message.caption.as_deref());
        }
        self.callback_query.as_ref().and_then(|q| q.data.as_deref())
    }

    pub fn bot_command(&self) -> Option<BotCommand> {
        self.message
            .as_ref()
            .and_then(|m| m.text.as_deref())
            .and_then(BotCommand::parse)
    }
}

impl TelegramMessage {
    pub fn largest_photo(&self) -> Option<&TelegramPhotoSize> {
        self.photo
            .as_ref()?
            .iter()
            .max_by_key(|item| item.width.saturating_mul(item.height))
    }

    pub fn media_kind(&self) -> Option<&'static str> {
        if self.photo.as_ref().is_some_and(|items| !items.is_empty()) {
            Some("photo")
        } else if self.video.is_some() {
            Some("video")
        } else if self.document.is_some() {
            Some("document")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_update(text: &str) -> TelegramUpdate {
        serde_json::from_value(serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "text": text,
                "chat": { "id": -100, "type": "supergroup" },
                "from": { "id": 42, "username": "alice" }
            }
        }))
        .expect("valid update")
    }

    #[test]
    fn parses_command_with_mention_and_args() {
        let cmd = BotCommand::parse("/Download@courier_bot https://example.com/v 720p")
            .expect("command");
        assert_eq!(cmd.name, "download");
        assert_eq!(cmd.mention.as_deref(), Some("courier_bot"));
        assert_eq!(cmd.args, vec!["https://example.com/v", "720p"]);
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(BotCommand::parse("hello /ai").is_none());
        assert!(BotCommand::parse("/").is_none());
        assert!(BotCommand::parse("/@bot").is_none());
        assert_eq!(BotCommand::parse("/ai").expect("bare").mention, None);
    }

    #[test]
    fn update_accessors_follow_message() {
        let update = text_update("/ai tell me a joke");
        assert_eq!(update.chat_id(), Some(-100));
        assert_eq!(update.from().map(|u| u.id), Some(42));
        assert_eq!(update.text(), Some("/ai tell me a joke"));
        assert_eq!(update.bot_command().map(|c| c.name), Some("ai".to_string()));
    }

    #[test]
    fn callback_updates_expose_data_and_origin_chat() {
        let update: TelegramUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 11,
            "callback_query": {
                "id": "cb-1",
                "from": { "id": 7 },
                "data": "img:next",
                "message": {
                    "message_id": 9,
                    "chat": { "id": 3, "type": "private" }
                }
            }
        }))
        .expect("valid update");

        assert_eq!(update.text(), Some("img:next"));
        assert_eq!(update.chat_id(), Some(3));
        assert_eq!(update.from().map(|u| u.id), Some(7));
        assert!(update.bot_command().is_none());
    }

    #[test]
    fn picks_largest_photo() {
        let message: TelegramMessage = serde_json::from_value(serde_json::json!({
            "message_id": 1,
            "chat": { "id": 1, "type": "private" },
            "caption": "look",
            "photo": [
                { "file_id": "small", "width": 90, "height": 90 },
                { "file_id": "big", "width": 1280, "height": 720 }
            ]
        }))
        .expect("valid message");

        assert_eq!(message.largest_photo().map(|p| p.file_id.as_str()), Some("big"));
        assert_eq!(message.media_kind(), Some("photo"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{"update_id":1,"edited_message":{"message_id":2},"message":{"message_id":3,"chat":{"id":4,"type":"private"},"sticker":{}}}"#,
        )
        .expect("lenient decode");
        assert_eq!(update.chat_id(), Some(4));
    }
}
