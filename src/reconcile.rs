//! Stalled-conversation reconciliation.
//!
//! One pass reads every open conversation that has not been alerted yet,
//! measures how long it has been idle and decides, per conversation, whether
//! to raise a staff alert or to re-open alert eligibility. The persisted
//! `notification_sent` flag is the only state this module writes.
//!
//! Per-conversation state, derived from the two flags and the idle time:
//!
//! ```text
//! FRESH ──idle in notify window──▶ NOTIFIED ──idle ≥ reset──▶ FRESH
//!   agreement = true from any state is terminal and never touched.
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;

use crate::notification::{DispatchOutcome, NotificationComposer};
use crate::store::{Conversation, ConversationStore};

/// Idle-time thresholds. The notify window is closed on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileWindows {
    pub notify_after: Duration,
    pub notify_until: Duration,
    pub reset_after: Duration,
}

impl ReconcileWindows {
    pub fn new(
        notify_after: Duration,
        notify_until: Duration,
        reset_after: Duration,
    ) -> Result<Self> {
        if notify_after < Duration::zero() {
            return Err(anyhow!("notify window cannot start before zero idle time"));
        }
        if notify_after > notify_until {
            return Err(anyhow!(
                "notify window start ({}m) is after its end ({}m)",
                notify_after.num_minutes(),
                notify_until.num_minutes()
            ));
        }
        if reset_after <= Duration::zero() {
            return Err(anyhow!("reset threshold must be positive"));
        }
        if reset_after <= notify_until {
            tracing::warn!(
                "Reset threshold ({}m) overlaps the notify window (ends at {}m)",
                reset_after.num_minutes(),
                notify_until.num_minutes()
            );
        }
        Ok(Self {
            notify_after,
            notify_until,
            reset_after,
        })
    }

    pub fn in_notify_window(&self, idle: Duration) -> bool {
        idle >= self.notify_after && idle <= self.notify_until
    }

    pub fn past_reset(&self, idle: Duration) -> bool {
        idle >= self.reset_after
    }
}

impl Default for ReconcileWindows {
    fn default() -> Self {
        Self {
            notify_after: Duration::hours(3),
            notify_until: Duration::hours(5),
            reset_after: Duration::hours(24),
        }
    }
}

/// Something the pass did (or failed to do) for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConversationAction {
    Notified { notification_id: String },
    NotifiedWithoutEmail { notification_id: String, error: String },
    OrganizationNotFound { organization: String },
    DispatchFailed { error: String },
    Reset,
    FlagUpdateFailed { value: bool, error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationReport {
    pub conversation_id: String,
    pub idle_secs: Option<i64>,
    /// Empty when the conversation needed nothing this pass.
    pub actions: Vec<ConversationAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Conversations eligible for an alert (`agreement = false`, not yet notified).
    pub candidates: usize,
    /// Already-notified conversations checked against the reset threshold.
    pub reset_checked: usize,
    pub conversations: Vec<ConversationReport>,
}

impl PassReport {
    fn count(&self, pred: impl Fn(&ConversationAction) -> bool) -> usize {
        self.conversations
            .iter()
            .flat_map(|c| c.actions.iter())
            .filter(|a| pred(a))
            .count()
    }

    pub fn notified(&self) -> usize {
        self.count(|a| {
            matches!(
                a,
                ConversationAction::Notified { .. }
                    | ConversationAction::NotifiedWithoutEmail { .. }
            )
        })
    }

    pub fn resets(&self) -> usize {
        self.count(|a| matches!(a, ConversationAction::Reset))
    }

    pub fn skipped(&self) -> usize {
        self.count(|a| matches!(a, ConversationAction::Skipped { .. }))
    }

    pub fn failures(&self) -> usize {
        self.count(|a| {
            matches!(
                a,
                ConversationAction::OrganizationNotFound { .. }
                    | ConversationAction::DispatchFailed { .. }
                    | ConversationAction::FlagUpdateFailed { .. }
            )
        })
    }
}

pub struct ReconciliationEngine {
    conversations: Arc<dyn ConversationStore>,
    composer: Arc<NotificationComposer>,
    organization_name: String,
    windows: ReconcileWindows,
    /// Serializes passes regardless of who triggers them.
    pass_lock: tokio::sync::Mutex<()>,
}

impl ReconciliationEngine {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        composer: Arc<NotificationComposer>,
        organization_name: impl Into<String>,
        windows: ReconcileWindows,
    ) -> Self {
        Self {
            conversations,
            composer,
            organization_name: organization_name.into(),
            windows,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn run_pass(&self) -> Result<PassReport> {
        self.run_pass_at(Utc::now()).await
    }

    /// Run one pass with `now` as the reference instant for idle time.
    ///
    /// Returns `Err` only when a store read fails; in that case no
    /// conversation has been touched.
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let _guard = self.pass_lock.lock().await;
        let started_at = Utc::now();
        tracing::debug!("Checking conversations...");

        let candidates = self
            .conversations
            .find_conversations(false, false)
            .await
            .context("Failed to fetch candidate conversations")?;
        let notified = self
            .conversations
            .find_conversations(false, true)
            .await
            .context("Failed to fetch notified conversations")?;

        let mut reports = Vec::with_capacity(candidates.len() + notified.len());
        for conversation in &candidates {
            reports.push(self.reconcile_conversation(conversation, now).await);
        }
        for conversation in &notified {
            reports.push(self.reconcile_conversation(conversation, now).await);
        }

        let report = PassReport {
            started_at,
            finished_at: Utc::now(),
            candidates: candidates.len(),
            reset_checked: notified.len(),
            conversations: reports,
        };

        tracing::info!(
            "Reconciliation pass done: {} candidate(s), {} notified, {} reset, {} skipped, \
             {} failure(s)",
            report.candidates,
            report.notified(),
            report.resets(),
            report.skipped(),
            report.failures()
        );
        Ok(report)
    }

    async fn reconcile_conversation(
        &self,
        conversation: &Conversation,
        now: DateTime<Utc>,
    ) -> ConversationReport {
        let mut report = ConversationReport {
            conversation_id: conversation.id.clone(),
            idle_secs: None,
            actions: Vec::new(),
        };

        // Terminal state: the store filter already excludes these.
        if conversation.agreement {
            return report;
        }

        let idle = match idle_time(conversation, now) {
            Ok(idle) => idle,
            Err(e) => {
                tracing::warn!("Skipping conversation {}: {:#}", conversation.id, e);
                report.actions.push(ConversationAction::Skipped {
                    reason: format!("{:#}", e),
                });
                return report;
            }
        };
        report.idle_secs = Some(idle.num_seconds());
        tracing::debug!(
            "Conversation {} idle for {}m (notification_sent={})",
            conversation.id,
            idle.num_minutes(),
            conversation.notification_sent
        );

        // `notification_sent` is the value read at query time. Passes are
        // serialized, so only a writer outside this process can change it
        // between the read and this check.
        let mut flag_set = conversation.notification_sent;
        if self.windows.in_notify_window(idle) && !flag_set {
            flag_set = self.notify(conversation, now, &mut report.actions).await;
        }

        if self.windows.past_reset(idle) {
            match self
                .conversations
                .set_notification_sent(&conversation.id, false)
                .await
            {
                // Only a cleared flag counts as a reset.
                Ok(()) if flag_set => report.actions.push(ConversationAction::Reset),
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(
                        "Failed to reset notification flag on {}: {:#}",
                        conversation.id,
                        e
                    );
                    report.actions.push(ConversationAction::FlagUpdateFailed {
                        value: false,
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        report
    }

    /// Returns whether `notification_sent` is now true in the store.
    async fn notify(
        &self,
        conversation: &Conversation,
        now: DateTime<Utc>,
        actions: &mut Vec<ConversationAction>,
    ) -> bool {
        let notification = self.composer.build_notification(conversation, now);
        let outcome = match self
            .composer
            .compose_and_dispatch(&self.organization_name, notification)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Dispatch failed for conversation {}: {:#}", conversation.id, e);
                actions.push(ConversationAction::DispatchFailed {
                    error: format!("{:#}", e),
                });
                return false;
            }
        };

        // The flag is only raised once the alert is in the organization's list.
        let action = match outcome {
            DispatchOutcome::Dispatched { notification_id } => {
                ConversationAction::Notified { notification_id }
            }
            DispatchOutcome::RecordedWithoutEmail {
                notification_id,
                error,
            } => ConversationAction::NotifiedWithoutEmail {
                notification_id,
                error,
            },
            DispatchOutcome::OrganizationNotFound { organization } => {
                actions.push(ConversationAction::OrganizationNotFound { organization });
                return false;
            }
        };
        actions.push(action);

        if let Err(e) = self
            .conversations
            .set_notification_sent(&conversation.id, true)
            .await
        {
            tracing::error!(
                "Alert recorded but notification flag not set on {}: {:#}",
                conversation.id,
                e
            );
            actions.push(ConversationAction::FlagUpdateFailed {
                value: true,
                error: format!("{:#}", e),
            });
            return false;
        }
        true
    }
}

/// Elapsed time since the conversation's last message.
pub fn idle_time(conversation: &Conversation, now: DateTime<Utc>) -> Result<Duration> {
    if let Some(error) = &conversation.history_error {
        return Err(anyhow!("undecodable message history: {}", error));
    }
    let last = conversation
        .last_message()
        .ok_or_else(|| anyhow!("conversation has no messages"))?;
    let at = parse_message_date(&last.date)?;
    Ok(now - at)
}

/// Accepts RFC 3339, naive ISO-8601 (taken as UTC) and epoch milliseconds.
pub fn parse_message_date(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("last message has an empty date"));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(millis) = raw.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp_millis(millis) {
            return Ok(dt);
        }
    }
    Err(anyhow!("unparsable message date '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::AlertTemplate;
    use crate::store::ConversationMessage;
    use crate::testing::{FakeConversationStore, FakeDirectory, FakeMail};
    use chrono::TimeZone;

    const ORG: &str = "acme";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap()
    }

    fn conversation(id: &str, idle: Duration, notification_sent: bool) -> Conversation {
        Conversation {
            id: id.to_string(),
            agreement: false,
            messages: vec![
                ConversationMessage {
                    text: "hola".to_string(),
                    date: (now() - idle - Duration::minutes(10)).to_rfc3339(),
                },
                ConversationMessage {
                    text: "¿sigues ahí?".to_string(),
                    date: (now() - idle).to_rfc3339(),
                },
            ],
            notification_sent,
            client_number: format!("client-{id}"),
            history_error: None,
        }
    }

    struct Harness {
        store: Arc<FakeConversationStore>,
        directory: Arc<FakeDirectory>,
        mail: Arc<FakeMail>,
        engine: ReconciliationEngine,
    }

    fn harness(conversations: Vec<Conversation>) -> Harness {
        harness_with(
            conversations,
            FakeDirectory::with_organization("org-1", ORG),
            FakeMail::default(),
        )
    }

    fn harness_with(
        conversations: Vec<Conversation>,
        directory: FakeDirectory,
        mail: FakeMail,
    ) -> Harness {
        let store = Arc::new(FakeConversationStore::new(conversations));
        let directory = Arc::new(directory);
        let mail = Arc::new(mail);
        let composer = Arc::new(NotificationComposer::new(
            directory.clone(),
            mail.clone(),
            AlertTemplate {
                ops_mailbox: "ops@example.com".to_string(),
                message: "You have unfinished conversations".to_string(),
                icon_url: String::new(),
                logo_url: None,
                timezone: chrono_tz::America::Bogota,
            },
        ));
        let engine = ReconciliationEngine::new(
            store.clone(),
            composer,
            ORG,
            ReconcileWindows::default(),
        );
        Harness {
            store,
            directory,
            mail,
            engine,
        }
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let w = ReconcileWindows::default();
        assert!(!w.in_notify_window(Duration::hours(3) - Duration::seconds(1)));
        assert!(w.in_notify_window(Duration::hours(3)));
        assert!(w.in_notify_window(Duration::hours(5)));
        assert!(!w.in_notify_window(Duration::hours(5) + Duration::seconds(1)));
        assert!(!w.past_reset(Duration::hours(24) - Duration::seconds(1)));
        assert!(w.past_reset(Duration::hours(24)));
    }

    #[test]
    fn message_dates_in_common_formats_parse() {
        let expected = Utc.with_ymd_and_hms(2026, 10, 19, 13, 30, 0).unwrap();
        assert_eq!(parse_message_date("2026-10-19T13:30:00Z").unwrap(), expected);
        assert_eq!(parse_message_date("2026-10-19T08:30:00-05:00").unwrap(), expected);
        assert_eq!(parse_message_date("2026-10-19T13:30:00.000").unwrap(), expected);
        assert_eq!(parse_message_date("2026-10-19 13:30:00").unwrap(), expected);
        assert_eq!(
            parse_message_date(&expected.timestamp_millis().to_string()).unwrap(),
            expected
        );
        assert!(parse_message_date("yesterday").is_err());
        assert!(parse_message_date("  ").is_err());
    }

    #[tokio::test]
    async fn idle_inside_window_notifies_once_and_sets_flag() {
        let h = harness(vec![conversation("a", Duration::hours(4), false)]);

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.notified(), 1);
        let notifications = h.directory.notifications(ORG);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].from, "client-a");
        assert_eq!(h.mail.sent().len(), 1);
        assert!(h.store.get("a").notification_sent);
    }

    #[tokio::test]
    async fn fresh_conversation_is_left_alone() {
        let h = harness(vec![conversation("b", Duration::hours(2), false)]);

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.notified(), 0);
        assert!(report.conversations[0].actions.is_empty());
        assert!(h.directory.notifications(ORG).is_empty());
        assert!(!h.store.get("b").notification_sent);
        assert!(h.store.updates().is_empty());
    }

    #[tokio::test]
    async fn long_idle_conversation_is_reset_even_when_already_notified() {
        let h = harness(vec![
            conversation("c-true", Duration::hours(30), true),
            conversation("c-false", Duration::hours(30), false),
        ]);

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.notified(), 0);
        assert!(!h.store.get("c-true").notification_sent);
        assert!(!h.store.get("c-false").notification_sent);
        assert!(h.directory.notifications(ORG).is_empty());
        let mut updates = h.store.updates();
        updates.sort();
        assert_eq!(
            updates,
            vec![("c-false".to_string(), false), ("c-true".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn only_a_cleared_flag_counts_as_a_reset() {
        let h = harness(vec![
            conversation("was-set", Duration::hours(30), true),
            conversation("never-set", Duration::hours(30), false),
        ]);

        let first = h.engine.run_pass_at(now()).await.unwrap();
        let second = h
            .engine
            .run_pass_at(now() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(first.resets(), 1);
        let reset: Vec<&str> = first
            .conversations
            .iter()
            .filter(|c| c.actions.contains(&ConversationAction::Reset))
            .map(|c| c.conversation_id.as_str())
            .collect();
        assert_eq!(reset, vec!["was-set"]);
        assert_eq!(second.resets(), 0);
        assert!(second.conversations.iter().all(|c| c.actions.is_empty()));
    }

    #[tokio::test]
    async fn notified_conversation_below_reset_threshold_keeps_its_flag() {
        let h = harness(vec![conversation("n", Duration::hours(10), true)]);

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.reset_checked, 1);
        assert_eq!(report.resets(), 0);
        assert!(h.store.get("n").notification_sent);
        assert!(h.store.updates().is_empty());
    }

    #[tokio::test]
    async fn empty_history_is_skipped_without_stopping_the_pass() {
        let mut broken = conversation("d", Duration::hours(4), false);
        broken.messages.clear();
        let mut bad_date = conversation("d2", Duration::hours(4), false);
        bad_date.messages[1].date = "not a date".to_string();
        let h = harness(vec![
            broken,
            bad_date,
            conversation("ok", Duration::hours(4), false),
        ]);

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.skipped(), 2);
        assert_eq!(report.notified(), 1);
        assert_eq!(
            report.conversations[0].actions,
            vec![ConversationAction::Skipped {
                reason: "conversation has no messages".to_string()
            }]
        );
        assert!(h.store.get("ok").notification_sent);
        assert!(!h.store.get("d").notification_sent);
        assert!(!h.store.get("d2").notification_sent);
    }

    #[tokio::test]
    async fn undecodable_history_is_reported_as_such() {
        let mut broken = conversation("h", Duration::hours(4), false);
        broken.messages.clear();
        broken.history_error = Some("invalid type: map, expected a sequence".to_string());
        let h = harness(vec![broken]);

        let report = h.engine.run_pass_at(now()).await.unwrap();

        match &report.conversations[0].actions[..] {
            [ConversationAction::Skipped { reason }] => {
                assert!(reason.starts_with("undecodable message history"), "{reason}");
            }
            other => panic!("unexpected actions {other:?}"),
        }
        assert!(h.store.updates().is_empty());
    }

    #[tokio::test]
    async fn missing_organization_leaves_flag_unset() {
        let h = harness_with(
            vec![conversation("e", Duration::hours(4), false)],
            FakeDirectory::with_organization("org-2", "someone-else"),
            FakeMail::default(),
        );

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.failures(), 1);
        assert!(matches!(
            report.conversations[0].actions[0],
            ConversationAction::OrganizationNotFound { .. }
        ));
        assert!(!h.store.get("e").notification_sent);
        assert!(h.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn agreed_conversations_are_never_touched() {
        let mut agreed = conversation("f", Duration::hours(4), false);
        agreed.agreement = true;
        let mut agreed_old = conversation("g", Duration::hours(48), true);
        agreed_old.agreement = true;
        let h = harness(vec![agreed, agreed_old]);

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.candidates, 0);
        assert_eq!(report.reset_checked, 0);
        assert!(h.store.updates().is_empty());
        assert!(h.directory.notifications(ORG).is_empty());
        assert!(h.store.get("g").notification_sent);
    }

    #[tokio::test]
    async fn back_to_back_passes_dispatch_at_most_once() {
        let h = harness(vec![conversation("a", Duration::hours(4), false)]);

        let first = h.engine.run_pass_at(now()).await.unwrap();
        let second = h
            .engine
            .run_pass_at(now() + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(first.notified(), 1);
        assert_eq!(second.notified(), 0);
        assert_eq!(second.candidates, 0);
        assert_eq!(h.directory.notifications(ORG).len(), 1);
        assert_eq!(h.mail.sent().len(), 1);
    }

    #[tokio::test]
    async fn full_cycle_notify_reset_and_notify_again() {
        let h = harness(vec![conversation("a", Duration::hours(4), false)]);

        h.engine.run_pass_at(now()).await.unwrap();
        assert!(h.store.get("a").notification_sent);

        // 26h after the last message: past the reset threshold.
        let later = now() + Duration::hours(22);
        let report = h.engine.run_pass_at(later).await.unwrap();
        assert_eq!(report.resets(), 1);
        assert!(!h.store.get("a").notification_sent);

        // Customer writes again; a new stall is alerted anew.
        h.store.push_message("a", (later - Duration::hours(3)).to_rfc3339());
        let report = h.engine.run_pass_at(later).await.unwrap();
        assert_eq!(report.notified(), 1);
        assert_eq!(h.directory.notifications(ORG).len(), 2);
    }

    #[tokio::test]
    async fn candidate_read_failure_aborts_with_no_side_effects() {
        let h = harness(vec![conversation("a", Duration::hours(4), false)]);
        h.store.fail_reads();

        assert!(h.engine.run_pass_at(now()).await.is_err());
        assert!(h.store.updates().is_empty());
        assert!(h.directory.notifications(ORG).is_empty());
    }

    #[tokio::test]
    async fn email_failure_still_sets_flag() {
        let h = harness_with(
            vec![conversation("a", Duration::hours(4), false)],
            FakeDirectory::with_organization("org-1", ORG),
            FakeMail::failing(),
        );

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert!(matches!(
            report.conversations[0].actions[0],
            ConversationAction::NotifiedWithoutEmail { .. }
        ));
        assert_eq!(report.notified(), 1);
        assert!(h.store.get("a").notification_sent);
    }

    #[tokio::test]
    async fn list_write_failure_leaves_flag_unset() {
        let directory = FakeDirectory::with_organization("org-1", ORG);
        directory.fail_writes();
        let h = harness_with(
            vec![conversation("a", Duration::hours(4), false)],
            directory,
            FakeMail::default(),
        );

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert!(matches!(
            report.conversations[0].actions[0],
            ConversationAction::DispatchFailed { .. }
        ));
        assert!(!h.store.get("a").notification_sent);
    }

    #[tokio::test]
    async fn flag_write_failure_on_one_record_does_not_stop_others() {
        let h = harness(vec![
            conversation("a", Duration::hours(4), false),
            conversation("b", Duration::hours(4), false),
        ]);
        h.store.fail_updates_for("a");

        let report = h.engine.run_pass_at(now()).await.unwrap();

        assert_eq!(report.notified(), 2);
        assert_eq!(report.failures(), 1);
        assert!(!h.store.get("a").notification_sent);
        assert!(h.store.get("b").notification_sent);
    }

    #[tokio::test]
    async fn overlapping_windows_evaluate_both_branches() {
        let store = Arc::new(FakeConversationStore::new(vec![conversation(
            "a",
            Duration::hours(4),
            false,
        )]));
        let directory = Arc::new(FakeDirectory::with_organization("org-1", ORG));
        let composer = Arc::new(NotificationComposer::new(
            directory.clone(),
            Arc::new(FakeMail::default()),
            AlertTemplate {
                ops_mailbox: "ops@example.com".to_string(),
                message: "m".to_string(),
                icon_url: String::new(),
                logo_url: None,
                timezone: chrono_tz::UTC,
            },
        ));
        let windows =
            ReconcileWindows::new(Duration::hours(3), Duration::hours(5), Duration::hours(4))
                .unwrap();
        let engine = ReconciliationEngine::new(store.clone(), composer, ORG, windows);

        let report = engine.run_pass_at(now()).await.unwrap();

        let actions = &report.conversations[0].actions;
        assert!(matches!(actions[0], ConversationAction::Notified { .. }));
        assert_eq!(actions[1], ConversationAction::Reset);
        assert_eq!(directory.notifications(ORG).len(), 1);
        assert!(!store.get("a").notification_sent);
    }

    #[tokio::test]
    async fn concurrent_passes_are_serialized() {
        let h = Arc::new(harness(vec![
            conversation("a", Duration::hours(4), false),
            conversation("b", Duration::hours(3), false),
        ]));
        h.directory.yield_between_read_and_write();

        let first = {
            let h = h.clone();
            tokio::spawn(async move { h.engine.run_pass_at(now()).await })
        };
        let second = {
            let h = h.clone();
            tokio::spawn(async move { h.engine.run_pass_at(now()).await })
        };
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        let total = first.notified() + second.notified();

        assert_eq!(total, 2);
        assert_eq!(h.directory.notifications(ORG).len(), 2);
    }
}
