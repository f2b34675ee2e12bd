//! Wire codec for update envelopes.
//!
//! Producers publish updates to the event log as MessagePack maps:
//!
//! ```text
//! { meta: { timestamp: <unix secs>, audience: [..] },
//!   body: { kind: "message" | "created_chat" | "deleted_chat"
//!                 | "member_added" | "member_removed", ..fields } }
//! ```
//!
//! Decoding is a pure function. Kinds this build does not know decode to
//! [`DecodeError::Unsupported`] so the caller can skip them.

use crate::error::{DecodeError, NotifyError, Result};
use crate::types::{
    ChatCreated, ChatDeleted, FileAttachment, MembershipChanged, MessageSent, Timestamp, Update,
    UpdateMeta, UserId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct WireUpdate {
    meta: WireMeta,
    #[serde(default)]
    body: Option<WireBody>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMeta {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    audience: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireAttachment {
    file_id: String,
    mime_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireBody {
    Message {
        message_id: String,
        from_user: String,
        chat_id: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        reply_to: Option<String>,
        #[serde(default)]
        attachments: Vec<WireAttachment>,
    },
    CreatedChat {
        chat_id: String,
        #[serde(default)]
        is_direct: bool,
        #[serde(default)]
        members: Vec<String>,
    },
    DeletedChat {
        chat_id: String,
    },
    MemberAdded {
        chat_id: String,
        user_id: String,
    },
    MemberRemoved {
        chat_id: String,
        user_id: String,
    },
}

/// Kinds the decoder understands.
const KNOWN_KINDS: &[&str] = &[
    "message",
    "created_chat",
    "deleted_chat",
    "member_added",
    "member_removed",
];

/// Only used to read the discriminant when the full body does not parse.
#[derive(Deserialize)]
struct KindProbe {
    #[serde(default)]
    body: Option<KindOnly>,
}

#[derive(Deserialize)]
struct KindOnly {
    kind: String,
}

/// Decode one log message value into an [`Update`].
pub fn decode_update(bytes: &[u8]) -> std::result::Result<Update, DecodeError> {
    let wire: WireUpdate = match rmp_serde::from_slice(bytes) {
        Ok(wire) => wire,
        Err(e) => return Err(classify_failure(bytes, e)),
    };

    let meta = UpdateMeta {
        timestamp: Timestamp::from_unix_secs(wire.meta.timestamp),
        audience: wire.meta.audience.into_iter().map(UserId).collect(),
    };
    let body = wire.body.ok_or(DecodeError::MissingBody)?;

    let update = match body {
        WireBody::Message {
            message_id,
            from_user,
            chat_id,
            text,
            reply_to,
            attachments,
        } => Update::MessageSent(MessageSent {
            meta,
            message_id,
            from_user: UserId(from_user),
            chat_id,
            text,
            reply_to,
            attachments: attachments
                .into_iter()
                .map(|a| FileAttachment {
                    file_id: a.file_id,
                    mime_type: a.mime_type,
                })
                .collect(),
        }),
        WireBody::CreatedChat {
            chat_id,
            is_direct,
            members,
        } => Update::ChatCreated(ChatCreated {
            meta,
            chat_id,
            is_direct,
            members: members.into_iter().map(UserId).collect(),
        }),
        WireBody::DeletedChat { chat_id } => Update::ChatDeleted(ChatDeleted { meta, chat_id }),
        WireBody::MemberAdded { chat_id, user_id } => Update::MemberAdded(MembershipChanged {
            meta,
            chat_id,
            user_id: UserId(user_id),
        }),
        WireBody::MemberRemoved { chat_id, user_id } => Update::MemberRemoved(MembershipChanged {
            meta,
            chat_id,
            user_id: UserId(user_id),
        }),
    };
    Ok(update)
}

/// Tell an unknown kind apart from garbage.
fn classify_failure(bytes: &[u8], err: rmp_serde::decode::Error) -> DecodeError {
    match rmp_serde::from_slice::<KindProbe>(bytes) {
        Ok(KindProbe {
            body: Some(KindOnly { kind }),
        }) if !KNOWN_KINDS.contains(&kind.as_str()) => DecodeError::Unsupported(kind),
        _ => DecodeError::from(err),
    }
}

/// Encode an update into the wire envelope.
pub fn encode_update(update: &Update) -> Result<Vec<u8>> {
    let meta = update.meta();
    let wire_meta = WireMeta {
        timestamp: meta.timestamp.as_unix_secs(),
        audience: meta.audience.iter().map(|u| u.0.clone()).collect(),
    };

    let body = match update {
        Update::MessageSent(m) => WireBody::Message {
            message_id: m.message_id.clone(),
            from_user: m.from_user.0.clone(),
            chat_id: m.chat_id.clone(),
            text: m.text.clone(),
            reply_to: m.reply_to.clone(),
            attachments: m
                .attachments
                .iter()
                .map(|a| WireAttachment {
                    file_id: a.file_id.clone(),
                    mime_type: a.mime_type.clone(),
                })
                .collect(),
        },
        Update::ChatCreated(c) => WireBody::CreatedChat {
            chat_id: c.chat_id.clone(),
            is_direct: c.is_direct,
            members: c.members.iter().map(|u| u.0.clone()).collect(),
        },
        Update::ChatDeleted(c) => WireBody::DeletedChat {
            chat_id: c.chat_id.clone(),
        },
        Update::MemberAdded(m) => WireBody::MemberAdded {
            chat_id: m.chat_id.clone(),
            user_id: m.user_id.0.clone(),
        },
        Update::MemberRemoved(m) => WireBody::MemberRemoved {
            chat_id: m.chat_id.clone(),
            user_id: m.user_id.0.clone(),
        },
        Update::Unknown { kind, .. } => {
            return Err(NotifyError::Decode(DecodeError::Unsupported(kind.clone())))
        }
    };

    let wire = WireUpdate {
        meta: wire_meta,
        body: Some(body),
    };
    Ok(rmp_serde::to_vec_named(&wire)?)
}
