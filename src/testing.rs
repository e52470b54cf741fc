//! In-memory store fakes with failure injection, shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::notification::{Notification, OutboundEmail};
use crate::store::{
    Conversation, ConversationMessage, ConversationStore, MailTransport, MetricKind, Organization,
    OrganizationDirectory,
};

#[derive(Default)]
pub struct FakeConversationStore {
    conversations: Mutex<Vec<Conversation>>,
    updates: Mutex<Vec<(String, bool)>>,
    fail_reads: AtomicBool,
    fail_updates_for: Mutex<HashSet<String>>,
}

impl FakeConversationStore {
    pub fn new(conversations: Vec<Conversation>) -> Self {
        Self {
            conversations: Mutex::new(conversations),
            ..Self::default()
        }
    }

    pub fn get(&self, id: &str) -> Conversation {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .expect("conversation exists")
    }

    pub fn updates(&self) -> Vec<(String, bool)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn push_message(&self, id: &str, date: String) {
        let mut conversations = self.conversations.lock().unwrap();
        let conversation = conversations
            .iter_mut()
            .find(|c| c.id == id)
            .expect("conversation exists");
        conversation.messages.push(ConversationMessage {
            text: "mensaje".to_string(),
            date,
        });
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn fail_updates_for(&self, id: &str) {
        self.fail_updates_for.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl ConversationStore for FakeConversationStore {
    async fn find_conversations(
        &self,
        agreement: bool,
        notification_sent: bool,
    ) -> Result<Vec<Conversation>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("conversation store unavailable"));
        }
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.agreement == agreement && c.notification_sent == notification_sent)
            .cloned()
            .collect())
    }

    async fn set_notification_sent(&self, conversation_id: &str, sent: bool) -> Result<()> {
        if self.fail_updates_for.lock().unwrap().contains(conversation_id) {
            return Err(anyhow!("update rejected for {}", conversation_id));
        }
        let mut conversations = self.conversations.lock().unwrap();
        let conversation = conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| anyhow!("no conversation {}", conversation_id))?;
        conversation.notification_sent = sent;
        self.updates
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), sent));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    organizations: Mutex<Vec<Organization>>,
    metrics: Mutex<HashMap<(String, &'static str), Vec<serde_json::Value>>>,
    fail_writes: AtomicBool,
    yield_on_read: AtomicBool,
}

impl FakeDirectory {
    pub fn with_organization(id: &str, name: &str) -> Self {
        let directory = Self::default();
        directory.organizations.lock().unwrap().push(Organization {
            id: id.to_string(),
            name: name.to_string(),
            notifications: Vec::new(),
        });
        directory
    }

    pub fn notifications(&self, name: &str) -> Vec<Notification> {
        self.organizations
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.notifications.clone())
            .unwrap_or_default()
    }

    pub fn metrics(&self, name: &str, kind: MetricKind) -> Vec<serde_json::Value> {
        self.metrics
            .lock()
            .unwrap()
            .get(&(name.to_string(), kind.column()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Makes the read-append-write window observable to concurrent tasks.
    pub fn yield_between_read_and_write(&self) {
        self.yield_on_read.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrganizationDirectory for FakeDirectory {
    async fn find_organization(&self, name: &str) -> Result<Option<Organization>> {
        let found = self
            .organizations
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.name == name)
            .cloned();
        if self.yield_on_read.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(found)
    }

    async fn replace_notifications(
        &self,
        organization_id: &str,
        notifications: &[Notification],
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("directory write rejected"));
        }
        let mut organizations = self.organizations.lock().unwrap();
        let organization = organizations
            .iter_mut()
            .find(|o| o.id == organization_id)
            .ok_or_else(|| anyhow!("no organization {}", organization_id))?;
        organization.notifications = notifications.to_vec();
        Ok(())
    }

    async fn append_metric(
        &self,
        organization_name: &str,
        kind: MetricKind,
        payload: serde_json::Value,
    ) -> Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("directory write rejected"));
        }
        let exists = self
            .organizations
            .lock()
            .unwrap()
            .iter()
            .any(|o| o.name == organization_name);
        if !exists {
            return Ok(false);
        }
        self.metrics
            .lock()
            .unwrap()
            .entry((organization_name.to_string(), kind.column()))
            .or_default()
            .push(payload);
        Ok(true)
    }
}

#[derive(Default)]
pub struct FakeMail {
    sent: Mutex<Vec<OutboundEmail>>,
    failing: bool,
}

impl FakeMail {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for FakeMail {
    async fn enqueue(&self, email: &OutboundEmail) -> Result<()> {
        if self.failing {
            return Err(anyhow!("mail queue unavailable"));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}
