use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::notification::{Notification, OutboundEmail};
use crate::store::{
    Conversation, ConversationMessage, ConversationStore, MailTransport, MetricKind, Organization,
    OrganizationDirectory,
};

/// An email waiting in the outbox for the delivery worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEmail {
    pub id: String,
    pub email: OutboundEmail,
    pub queued_at: DateTime<Utc>,
}

/// SQLite-backed conversation store, organization directory and mail outbox.
pub struct WatchDatabase {
    conn: Mutex<Connection>,
}

impl WatchDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                agreement INTEGER NOT NULL DEFAULT 0,
                messages TEXT NOT NULL DEFAULT '[]',
                notification_sent INTEGER NOT NULL DEFAULT 0,
                client_number TEXT NOT NULL DEFAULT ''
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_flags
             ON conversations(agreement, notification_sent)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                notifications TEXT NOT NULL DEFAULT '[]',
                click_events TEXT NOT NULL DEFAULT '[]',
                delivery_events TEXT NOT NULL DEFAULT '[]'
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS mail_outbox (
                id TEXT PRIMARY KEY,
                recipients TEXT NOT NULL,
                subject TEXT NOT NULL,
                text_body TEXT NOT NULL,
                html_body TEXT NOT NULL,
                queued_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    /// Insert or overwrite a conversation record. Used by seeding and tests;
    /// the chat pipeline owns these rows in production.
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let messages = serde_json::to_string(&conversation.messages)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO conversations
                 (id, agreement, messages, notification_sent, client_number)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id,
                conversation.agreement,
                messages,
                conversation.notification_sent,
                conversation.client_number,
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, agreement, messages, notification_sent, client_number
             FROM conversations WHERE id = ?1",
            [id],
            row_to_conversation,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_conversations(
        &self,
        agreement: bool,
        notification_sent: bool,
    ) -> Result<Vec<Conversation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, agreement, messages, notification_sent, client_number
             FROM conversations
             WHERE agreement = ?1 AND notification_sent = ?2
             ORDER BY id",
        )?;
        let conversations = stmt
            .query_map(params![agreement, notification_sent], row_to_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    pub fn update_notification_sent(&self, id: &str, sent: bool) -> Result<()> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET notification_sent = ?2 WHERE id = ?1",
            params![id, sent],
        )?;
        if changed == 0 {
            return Err(anyhow!("conversation '{}' not found", id));
        }
        Ok(())
    }

    /// Create an organization with empty arrays, returning its id.
    pub fn create_organization(&self, name: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO organizations (id, name) VALUES (?1, ?2)",
            params![id, name],
        )
        .with_context(|| format!("Failed to create organization '{}'", name))?;
        Ok(id)
    }

    pub fn get_organization(&self, name: &str) -> Result<Option<Organization>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, notifications FROM organizations WHERE name = ?1 LIMIT 1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, notifications)) = row else {
            return Ok(None);
        };
        let notifications: Vec<Notification> = serde_json::from_str(&notifications)
            .with_context(|| format!("Corrupt notifications list on organization '{}'", name))?;
        Ok(Some(Organization {
            id,
            name,
            notifications,
        }))
    }

    pub fn set_notifications(
        &self,
        organization_id: &str,
        notifications: &[Notification],
    ) -> Result<()> {
        let encoded = serde_json::to_string(notifications)?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE organizations SET notifications = ?2 WHERE id = ?1",
            params![organization_id, encoded],
        )?;
        if changed == 0 {
            return Err(anyhow!("organization '{}' not found", organization_id));
        }
        Ok(())
    }

    pub fn get_metrics(
        &self,
        organization_name: &str,
        kind: MetricKind,
    ) -> Result<Vec<serde_json::Value>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT {} FROM organizations WHERE name = ?1", kind.column()),
                [organization_name],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Append under the connection lock, so concurrent ingests cannot drop events.
    pub fn push_metric(
        &self,
        organization_name: &str,
        kind: MetricKind,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let column = kind.column();
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT {} FROM organizations WHERE name = ?1", column),
                [organization_name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut events: Vec<serde_json::Value> = serde_json::from_str(&raw).with_context(|| {
            format!("Corrupt {} on organization '{}'", column, organization_name)
        })?;
        events.push(payload);
        conn.execute(
            &format!("UPDATE organizations SET {} = ?2 WHERE name = ?1", column),
            params![organization_name, serde_json::to_string(&events)?],
        )?;
        Ok(true)
    }

    pub fn queue_email(&self, email: &OutboundEmail) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO mail_outbox (id, recipients, subject, text_body, html_body, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                serde_json::to_string(&email.to)?,
                email.subject,
                email.text,
                email.html,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Oldest first.
    pub fn list_outbox(&self, limit: usize) -> Result<Vec<QueuedEmail>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, recipients, subject, text_body, html_body, queued_at
             FROM mail_outbox ORDER BY queued_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, recipients, subject, text, html, queued_at)| -> Result<QueuedEmail> {
                Ok(QueuedEmail {
                    id,
                    email: OutboundEmail {
                        to: serde_json::from_str(&recipients)?,
                        subject,
                        text,
                        html,
                    },
                    queued_at: DateTime::parse_from_rfc3339(&queued_at)?.with_timezone(&Utc),
                })
            })
            .collect()
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let raw_messages: String = row.get(2)?;
    let (messages, history_error) =
        match serde_json::from_str::<Vec<ConversationMessage>>(&raw_messages) {
            Ok(messages) => (messages, None),
            Err(e) => {
                tracing::warn!("Conversation {} has undecodable messages: {}", id, e);
                (Vec::new(), Some(e.to_string()))
            }
        };
    Ok(Conversation {
        id,
        agreement: row.get(1)?,
        messages,
        notification_sent: row.get(3)?,
        client_number: row.get(4)?,
        history_error,
    })
}

#[async_trait]
impl ConversationStore for WatchDatabase {
    async fn find_conversations(
        &self,
        agreement: bool,
        notification_sent: bool,
    ) -> Result<Vec<Conversation>> {
        self.list_conversations(agreement, notification_sent)
    }

    async fn set_notification_sent(&self, conversation_id: &str, sent: bool) -> Result<()> {
        self.update_notification_sent(conversation_id, sent)
    }
}

#[async_trait]
impl OrganizationDirectory for WatchDatabase {
    async fn find_organization(&self, name: &str) -> Result<Option<Organization>> {
        self.get_organization(name)
    }

    async fn replace_notifications(
        &self,
        organization_id: &str,
        notifications: &[Notification],
    ) -> Result<()> {
        self.set_notifications(organization_id, notifications)
    }

    async fn append_metric(
        &self,
        organization_name: &str,
        kind: MetricKind,
        payload: serde_json::Value,
    ) -> Result<bool> {
        self.push_metric(organization_name, kind, payload)
    }
}

#[async_trait]
impl MailTransport for WatchDatabase {
    async fn enqueue(&self, email: &OutboundEmail) -> Result<()> {
        let id = self.queue_email(email)?;
        tracing::debug!("Queued email {} to {:?}", id, email.to);
        Ok(())
    }
}
