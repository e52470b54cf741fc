//! Staff alert composition and dispatch.
//!
//! A dispatch writes the alert into the organization's notification list
//! (the record the dashboard reads) and then queues an email copy for the
//! operations mailbox. The two writes are independent: the list write is the
//! source of truth, the email is best effort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::WatchConfig;
use crate::store::{Conversation, MailTransport, OrganizationDirectory};

pub const ALERT_NAME: &str = "Chat Alert";
pub const ALERT_TYPE: &str = "new_message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub name: String,
    /// Human-readable timestamp in the configured timezone.
    pub date: String,
    #[serde(rename = "for")]
    pub recipient: String,
    pub from: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(rename = "isArchived", default)]
    pub is_archived: bool,
    #[serde(rename = "isRead", default)]
    pub is_read: bool,
    #[serde(default)]
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// What happened to a single dispatch. Only `Err` from
/// [`NotificationComposer::compose_and_dispatch`] means nothing was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched { notification_id: String },
    /// The notification list was updated but the email could not be queued.
    RecordedWithoutEmail {
        notification_id: String,
        error: String,
    },
    OrganizationNotFound { organization: String },
}

impl DispatchOutcome {
    /// True when the alert is visible in the organization's list.
    pub fn is_recorded(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Dispatched { .. } | DispatchOutcome::RecordedWithoutEmail { .. }
        )
    }
}

/// Static content of every alert, resolved once from config.
#[derive(Debug, Clone)]
pub struct AlertTemplate {
    pub ops_mailbox: String,
    pub message: String,
    pub icon_url: String,
    pub logo_url: Option<String>,
    pub timezone: Tz,
}

impl AlertTemplate {
    pub fn from_config(config: &WatchConfig) -> Result<Self> {
        let ops_mailbox = config.ops_mailbox.trim();
        if ops_mailbox.is_empty() {
            return Err(anyhow!("ops_mailbox cannot be empty"));
        }
        Ok(Self {
            ops_mailbox: ops_mailbox.to_string(),
            message: config.notification_message.clone(),
            icon_url: config.notification_icon_url.clone(),
            logo_url: config
                .email_logo_url
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            timezone: config.tz()?,
        })
    }
}

pub struct NotificationComposer {
    directory: Arc<dyn OrganizationDirectory>,
    mail: Arc<dyn MailTransport>,
    template: AlertTemplate,
    /// One async lock per organization name, held across read-append-write.
    org_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NotificationComposer {
    pub fn new(
        directory: Arc<dyn OrganizationDirectory>,
        mail: Arc<dyn MailTransport>,
        template: AlertTemplate,
    ) -> Self {
        Self {
            directory,
            mail,
            template,
            org_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build the alert record for a stalled conversation.
    pub fn build_notification(
        &self,
        conversation: &Conversation,
        now: DateTime<Utc>,
    ) -> Notification {
        Notification {
            id: uuid::Uuid::new_v4().to_string(),
            name: ALERT_NAME.to_string(),
            date: format_alert_date(now, self.template.timezone),
            recipient: self.template.ops_mailbox.clone(),
            from: conversation.client_number.clone(),
            kind: ALERT_TYPE.to_string(),
            message: self.template.message.clone(),
            is_archived: false,
            is_read: false,
            icon: self.template.icon_url.clone(),
        }
    }

    pub fn build_email(&self, notification: &Notification) -> OutboundEmail {
        let message = escape_html(&notification.message);
        let from = escape_html(&notification.from);
        let date = escape_html(&notification.date);
        let header = match &self.template.logo_url {
            Some(url) => format!(
                r#"<img src="{}" alt="Logo" style="width: 300px; height: auto;"/>"#,
                escape_html(url)
            ),
            None => r#"<span style="color: #fff; font-size: 20px;">Alerta de chat</span>"#
                .to_string(),
        };

        OutboundEmail {
            to: vec![self.template.ops_mailbox.clone()],
            subject: format!("Nueva alerta de chat de {}", notification.from),
            text: notification.message.clone(),
            html: format!(
                r#"<div style="font-family: Arial, sans-serif; color: #333;">
    <div style="background-color: #6950E8; padding: 20px; text-align: center;">{header}</div>
    <div style="padding: 20px;">
        <h1 style="color: #6950E8;">Nueva Alerta de Chat</h1>
        <p style="font-size: 16px;">{message}</p>
        <p><strong>De:</strong> {from}</p>
        <p><strong>Fecha:</strong> {date}</p>
        <p style="margin-top: 20px;">¡Contacta al cliente lo antes posible!</p>
    </div>
</div>"#
            ),
        }
    }

    /// Append `notification` to the named organization and queue the email copy.
    pub async fn compose_and_dispatch(
        &self,
        organization_name: &str,
        notification: Notification,
    ) -> Result<DispatchOutcome> {
        let lock = self.organization_lock(organization_name)?;
        {
            let _guard = lock.lock().await;

            let Some(organization) = self
                .directory
                .find_organization(organization_name)
                .await
                .with_context(|| format!("Failed to look up organization '{}'", organization_name))?
            else {
                tracing::warn!("No organization found with name '{}'", organization_name);
                return Ok(DispatchOutcome::OrganizationNotFound {
                    organization: organization_name.to_string(),
                });
            };

            tracing::debug!(
                "Organization '{}' has {} notification(s) before append",
                organization.name,
                organization.notifications.len()
            );

            let mut notifications = organization.notifications;
            notifications.push(notification.clone());
            self.directory
                .replace_notifications(&organization.id, &notifications)
                .await
                .with_context(|| {
                    format!("Failed to write notifications for '{}'", organization_name)
                })?;
        }

        let email = self.build_email(&notification);
        match self.mail.enqueue(&email).await {
            Ok(()) => {
                tracing::info!(
                    "Notification {} created for '{}' (from {})",
                    notification.id,
                    organization_name,
                    notification.from
                );
                Ok(DispatchOutcome::Dispatched {
                    notification_id: notification.id,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Notification {} recorded but email enqueue failed: {:#}",
                    notification.id,
                    e
                );
                Ok(DispatchOutcome::RecordedWithoutEmail {
                    notification_id: notification.id,
                    error: format!("{:#}", e),
                })
            }
        }
    }

    fn organization_lock(&self, organization_name: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .org_locks
            .lock()
            .map_err(|e| anyhow!("Organization lock table poisoned: {}", e))?;
        Ok(locks
            .entry(organization_name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }
}

const SPANISH_MONTHS: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// Long Spanish date with a 12-hour clock, e.g. `19 de octubre de 2026, 3:04:05 p. m.`
pub fn format_alert_date(at: DateTime<Utc>, tz: Tz) -> String {
    let local = at.with_timezone(&tz);
    let (is_pm, hour) = local.hour12();
    format!(
        "{} de {} de {}, {}:{:02}:{:02} {}",
        local.day(),
        SPANISH_MONTHS[local.month0() as usize],
        local.year(),
        hour,
        local.minute(),
        local.second(),
        if is_pm { "p. m." } else { "a. m." }
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
