use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value_objects::{DeviceId, DisplayName, MessageId, RoomId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Document,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Document => "document",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Document,
}

impl From<MediaKind> for MessageType {
    fn from(value: MediaKind) -> Self {
        match value {
            MediaKind::Image => MessageType::Image,
            MediaKind::Video => MessageType::Video,
            MediaKind::Document => MessageType::Document,
        }
    }
}

/// 已上传文件的元数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: MediaKind,
    pub url: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessagePayload {
    Text {
        text: String,
    },
    Media {
        media: MediaKind,
        url: String,
        name: String,
        size: u64,
        caption: Option<String>,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Text { .. } => MessageType::Text,
            MessagePayload::Media { media, .. } => (*media).into(),
        }
    }

    /// 文本内容：纯文本消息的正文，或媒体消息的说明文字。
    pub fn text(&self) -> Option<&str> {
        match self {
            MessagePayload::Text { text } => Some(text),
            MessagePayload::Media { caption, .. } => caption.as_deref(),
        }
    }
}

/// 客户端提交的待发送消息。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    /// 空文本且无附件时返回 `None`，调用方应静默丢弃。
    pub fn into_payload(self) -> Option<MessagePayload> {
        let text = self.text.trim();
        match self.attachment {
            Some(attachment) => Some(MessagePayload::Media {
                media: attachment.kind,
                url: attachment.url,
                name: attachment.name,
                size: attachment.size,
                caption: (!text.is_empty()).then(|| text.to_owned()),
            }),
            None if text.is_empty() => None,
            None => Some(MessagePayload::Text {
                text: text.to_owned(),
            }),
        }
    }
}

/// 已持久化的消息，创建后不可修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub participant_id: DisplayName,
    pub device_id: DeviceId,
    pub payload: MessagePayload,
    /// 房间内单调递增的序号，由存储分配
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment() -> Attachment {
        Attachment {
            kind: MediaKind::Image,
            url: "https://cdn.example.com/a.png".into(),
            name: "a.png".into(),
            size: 1024,
        }
    }

    #[test]
    fn empty_draft_has_no_payload() {
        assert_eq!(MessageDraft::text("").into_payload(), None);
        assert_eq!(MessageDraft::text("   \n").into_payload(), None);
    }

    #[test]
    fn text_draft_becomes_text_payload() {
        let payload = MessageDraft::text(" hello ").into_payload().unwrap();
        assert_eq!(payload.message_type(), MessageType::Text);
        assert_eq!(payload.text(), Some("hello"));
    }

    #[test]
    fn file_only_draft_becomes_media_without_caption() {
        let draft = MessageDraft {
            text: String::new(),
            attachment: Some(attachment()),
        };
        let payload = draft.into_payload().unwrap();
        assert_eq!(payload.message_type(), MessageType::Image);
        assert_eq!(payload.text(), None);
    }

    #[test]
    fn text_and_file_keep_caption() {
        let draft = MessageDraft {
            text: "look".into(),
            attachment: Some(Attachment {
                kind: MediaKind::Document,
                ..attachment()
            }),
        };
        let payload = draft.into_payload().unwrap();
        assert_eq!(payload.message_type(), MessageType::Document);
        assert_eq!(payload.text(), Some("look"));
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = MessagePayload::Text {
            text: "hi".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hi");
    }
}
