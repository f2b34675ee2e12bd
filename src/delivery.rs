//! Bridge from listener subscriptions to streaming connections.
//!
//! A connection handler resolves the caller's identity, attaches a listener,
//! and forwards each update as a [`Notification`] to its transport until the
//! stream ends, the client goes away, or a send fails. The listener is
//! detached on every one of those paths.

use crate::cancel::CancellationToken;
use crate::engine::FanoutEngine;
use crate::error::{NotifyError, Result};
use crate::types::{Update, UserId};
use crossbeam_channel::select;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Metadata key carrying the caller's credentials.
pub const AUTH_HEADER: &str = "authorization";

/// File reference inside a [`Notification`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAttachment {
    pub file_id: String,
    pub mime_type: String,
}

/// What a client receives on its stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    NewMessage {
        message_id: String,
        /// Unix seconds.
        created_at: i64,
        text: String,
        from_user: String,
        chat_id: String,
        reply_to: Option<String>,
        attachments: Vec<NotificationAttachment>,
    },
    NewChat {
        chat_id: String,
        is_direct: bool,
        members: Vec<String>,
        created_at: i64,
    },
}

impl Notification {
    /// Client-facing form of an update. `None` for kinds clients are not
    /// told about.
    pub fn from_update(update: &Update) -> Option<Self> {
        match update {
            Update::MessageSent(m) => Some(Notification::NewMessage {
                message_id: m.message_id.clone(),
                created_at: m.meta.timestamp.as_unix_secs(),
                text: m.text.clone(),
                from_user: m.from_user.0.clone(),
                chat_id: m.chat_id.clone(),
                reply_to: m.reply_to.clone(),
                attachments: m
                    .attachments
                    .iter()
                    .map(|a| NotificationAttachment {
                        file_id: a.file_id.clone(),
                        mime_type: a.mime_type.clone(),
                    })
                    .collect(),
            }),
            Update::ChatCreated(c) => Some(Notification::NewChat {
                chat_id: c.chat_id.clone(),
                is_direct: c.is_direct,
                members: c.members.iter().map(|u| u.0.clone()).collect(),
                created_at: c.meta.timestamp.as_unix_secs(),
            }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Request metadata of one incoming streaming call. Keys are case-insensitive.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    metadata: HashMap<String, Vec<String>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.metadata
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// All values for `key`.
    pub fn get(&self, key: &str) -> &[String] {
        self.metadata
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).first().map(String::as_str)
    }
}

/// Turns an incoming request into a user identity.
pub trait IdentityResolver: Send + Sync {
    /// Fails with [`NotifyError::Unauthenticated`] if the caller is unknown.
    fn resolve_user(&self, request: &RequestContext) -> Result<UserId>;
}

/// Resolves fixed bearer tokens to users.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

impl IdentityResolver for StaticTokenResolver {
    fn resolve_user(&self, request: &RequestContext) -> Result<UserId> {
        let header = request
            .first(AUTH_HEADER)
            .ok_or_else(|| NotifyError::Unauthenticated("missing credentials".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .unwrap_or(header)
            .trim();
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| NotifyError::Unauthenticated("provided token is invalid".to_string()))
    }
}

/// Transport side of one streaming connection.
pub trait NotificationSink {
    fn send(&mut self, notification: &Notification) -> Result<()>;
}

/// Serve one streaming call.
///
/// Rejects the call before any listener exists if the identity does not
/// resolve. Otherwise forwards notifications until the listener's stream
/// ends (`Ok`), `client_gone` fires (`Ok`), or the sink fails (its error).
/// The listener is detached in all cases.
pub fn serve_listener<R, S>(
    engine: &FanoutEngine,
    resolver: &R,
    request: &RequestContext,
    sink: &mut S,
    client_gone: &CancellationToken,
) -> Result<()>
where
    R: IdentityResolver + ?Sized,
    S: NotificationSink + ?Sized,
{
    let user_id = resolver.resolve_user(request)?;
    let subscription = engine.listen(user_id.clone());
    info!(user_id = %user_id, listener_id = %subscription.id(), "stream opened");

    let result = loop {
        let update = select! {
            recv(client_gone.receiver()) -> _ => {
                debug!(user_id = %user_id, "client went away");
                break Ok(());
            }
            recv(subscription.receiver()) -> msg => match msg {
                Ok(update) => update,
                Err(_) => break Ok(()),
            },
        };

        let Some(notification) = Notification::from_update(&update) else {
            continue;
        };
        if let Err(e) = sink.send(&notification) {
            warn!(user_id = %user_id, error = %e, "send failed, closing stream");
            break Err(e);
        }
    };

    subscription.detach();
    info!(
        user_id = %user_id,
        dropped = subscription.dropped_count(),
        "stream closed"
    );
    result
}
