//! Store contracts the reconciliation engine and composer depend on.
//!
//! The engine never talks to a concrete database. It receives these traits at
//! construction time so the SQLite backend, or an in-memory fake in tests, can
//! be swapped without touching the classification logic.

use anyhow::Result;
use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::notification::{Notification, OutboundEmail};

/// A single chat message as written by the chat pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    #[serde(default)]
    pub text: String,
    /// Raw timestamp; parsed when idle time is computed. A JSON number is
    /// kept as its epoch-millisecond string.
    #[serde(default, deserialize_with = "date_from_string_or_number")]
    pub date: String,
}

fn date_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(date) => Ok(date),
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|millis| millis.trunc() as i64))
            .map(|millis| millis.to_string())
            .ok_or_else(|| D::Error::custom(format!("unsupported message date {}", n))),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!("unsupported message date {}", other))),
    }
}

/// Projection of a conversation record used by the reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agreement: bool,
    pub messages: Vec<ConversationMessage>,
    pub notification_sent: bool,
    pub client_number: String,
    /// Set by the store when the stored history could not be decoded.
    #[serde(skip)]
    pub history_error: Option<String>,
}

impl Conversation {
    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub notifications: Vec<Notification>,
}

/// Telemetry arrays kept on an organization record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Clicks,
    Deliveries,
}

impl MetricKind {
    pub(crate) fn column(self) -> &'static str {
        match self {
            MetricKind::Clicks => "click_events",
            MetricKind::Deliveries => "delivery_events",
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Equality-filtered read on the two guard flags.
    async fn find_conversations(
        &self,
        agreement: bool,
        notification_sent: bool,
    ) -> Result<Vec<Conversation>>;

    /// Targeted single-field update of `notification_sent`.
    async fn set_notification_sent(&self, conversation_id: &str, sent: bool) -> Result<()>;
}

#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    /// Lookup by exact name. `Ok(None)` is the "not found" outcome, not an error.
    async fn find_organization(&self, name: &str) -> Result<Option<Organization>>;

    /// Replace the whole notification list of an organization.
    async fn replace_notifications(
        &self,
        organization_id: &str,
        notifications: &[Notification],
    ) -> Result<()>;

    /// Append a telemetry payload to one of the organization's metric arrays.
    /// Returns `false` when no organization has that name.
    async fn append_metric(
        &self,
        organization_name: &str,
        kind: MetricKind,
        payload: serde_json::Value,
    ) -> Result<bool>;
}

/// Outbound email queue. Delivery happens elsewhere; enqueue is all we await.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn enqueue(&self, email: &OutboundEmail) -> Result<()>;
}
