//! Notification dispatcher (C7): builds notify intents from a node's
//! configuration and the work order's submitted form data, and drains them
//! through a bounded worker pool after the triggering transaction commits.
//! Never rolls the transition back on a dispatch failure.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::graph::GraphNode;
use crate::resolver::UserDirectory;
use crate::state::WorkOrder;

/// Field names the original service extracts out of submitted form data to
/// populate the notification body. Configurable rather than hardcoded, but
/// these match the original's two named fields.
pub const DEFAULT_PROBLEM_FIELD: &str = "problem_text";
pub const DEFAULT_PHONE_FIELD: &str = "phone_number";

/// Channel code meaning "send an email"; further codes are reserved.
pub const EMAIL_CHANNEL_CODE: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyIntent {
    pub work_order_id: i64,
    pub process_id: i64,
    pub to_user_ids: Vec<i64>,
    pub cc_emails: Vec<String>,
    pub subject: String,
    pub description: String,
    /// Channel codes to dispatch on, copied from the process's `notice`
    /// list (1 = email, further codes reserved).
    pub classify: Vec<i64>,
    pub title: String,
    pub problem_text: Option<String>,
    pub phone_number: Option<String>,
    pub creator_name: Option<String>,
    pub priority: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub fn build_intent(
    work_order: &WorkOrder,
    node: &GraphNode,
    to_user_ids: Vec<i64>,
    form_data: &serde_json::Value,
    notice_channels: &[i64],
    creator_name: Option<String>,
) -> NotifyIntent {
    NotifyIntent {
        work_order_id: work_order.id,
        process_id: work_order.process_id,
        to_user_ids,
        cc_emails: vec![],
        subject: format!("{} — {}", work_order.title, node.label),
        description: "您有一条待办工单请及时处理".into(),
        classify: notice_channels.to_vec(),
        title: work_order.title.clone(),
        problem_text: form_data
            .get(DEFAULT_PROBLEM_FIELD)
            .and_then(|v| v.as_str())
            .map(str::to_string),
        phone_number: form_data
            .get(DEFAULT_PHONE_FIELD)
            .and_then(|v| v.as_str())
            .map(str::to_string),
        creator_name,
        priority: work_order.priority,
        created_at: work_order.create_time,
    }
}

pub async fn resolve_cc_emails(
    node: &GraphNode,
    directory: &dyn UserDirectory,
) -> Vec<String> {
    let mut emails = Vec::new();
    for user_id in &node.cc {
        if let Ok(Some(email)) = directory.email_for_user(*user_id).await {
            emails.push(email);
        }
    }
    emails
}

#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, intent: &NotifyIntent);
}

/// Bounded mpsc queue drained by a small worker pool — the in-process
/// analogue of polling a persistent task-result table with
/// `FOR UPDATE SKIP LOCKED`, since no queue table is introduced here.
///
/// Holds a channel registry keyed by classify code rather than one fixed
/// channel, so each intent fans out only to the channels named in its own
/// `classify` list.
pub struct Dispatcher {
    sender: mpsc::Sender<NotifyIntent>,
}

impl Dispatcher {
    pub fn spawn(
        channels: Vec<(i64, std::sync::Arc<dyn NotificationChannel>)>,
        worker_count: usize,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<NotifyIntent>(capacity);
        let receiver = std::sync::Arc::new(tokio::sync::Mutex::new(receiver));
        let channels = std::sync::Arc::new(channels);
        for _ in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let channels = channels.clone();
            tokio::spawn(async move {
                loop {
                    let intent = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    match intent {
                        Some(intent) => {
                            for (code, channel) in channels.iter() {
                                if intent.classify.contains(code) {
                                    channel.send(&intent).await;
                                }
                            }
                        }
                        None => break,
                    }
                }
            });
        }
        Dispatcher { sender }
    }

    /// Fire-and-forget: a full queue drops the intent with a warning rather
    /// than blocking the caller, since notification delivery must never
    /// hold up the committing request.
    pub fn dispatch(&self, intent: NotifyIntent) {
        if let Err(err) = self.sender.try_send(intent) {
            tracing::warn!(error = %err, "notification dropped, dispatch queue full or closed");
        }
    }
}

#[cfg(feature = "email")]
pub struct EmailChannel {
    pub transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
    pub from: lettre::message::Mailbox,
}

#[cfg(feature = "email")]
#[async_trait::async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(&self, intent: &NotifyIntent) {
        use lettre::AsyncTransport;

        for cc in &intent.cc_emails {
            let Ok(to) = cc.parse() else { continue };
            let body = format!(
                "{}\n\nproblem: {}\nphone: {}",
                intent.subject,
                intent.problem_text.as_deref().unwrap_or(""),
                intent.phone_number.as_deref().unwrap_or(""),
            );
            let message = lettre::Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(intent.subject.clone())
                .body(body);
            if let Ok(message) = message {
                if let Err(err) = self.transport.send(message).await {
                    tracing::error!(error = %err, work_order_id = intent.work_order_id, "email dispatch failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeClass;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn work_order() -> WorkOrder {
        WorkOrder {
            id: 1,
            process_id: 1,
            title: "network outage".into(),
            priority: 1,
            creator: 1,
            related_person: vec![],
            state: vec![],
            is_end: false,
            classify: 1,
            urge_count: 0,
            urge_last_time: None,
            create_time: Utc::now(),
        }
    }

    fn node() -> GraphNode {
        GraphNode {
            id: "n2".into(),
            label: "triage".into(),
            clazz: NodeClass::UserTask,
            processor: vec![],
            process_method: None,
            cc: vec![],
        }
    }

    #[test]
    fn intent_extracts_named_fields() {
        let form = json!({"problem_text": "router down", "phone_number": "555-1234"});
        let intent = build_intent(
            &work_order(),
            &node(),
            vec![42],
            &form,
            &[EMAIL_CHANNEL_CODE],
            Some("Jane".into()),
        );
        assert_eq!(intent.problem_text.as_deref(), Some("router down"));
        assert_eq!(intent.phone_number.as_deref(), Some("555-1234"));
        assert_eq!(intent.to_user_ids, vec![42]);
        assert_eq!(intent.classify, vec![EMAIL_CHANNEL_CODE]);
        assert_eq!(intent.creator_name.as_deref(), Some("Jane"));
    }

    struct CountingChannel {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl NotificationChannel for CountingChannel {
        async fn send(&self, _intent: &NotifyIntent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatcher_drains_queue() {
        let count = Arc::new(AtomicUsize::new(0));
        let channels: Vec<(i64, Arc<dyn NotificationChannel>)> =
            vec![(EMAIL_CHANNEL_CODE, Arc::new(CountingChannel { count: count.clone() }))];
        let dispatcher = Dispatcher::spawn(channels, 2, 8);
        for _ in 0..5 {
            dispatcher.dispatch(build_intent(
                &work_order(),
                &node(),
                vec![1],
                &json!({}),
                &[EMAIL_CHANNEL_CODE],
                None,
            ));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn dispatcher_skips_channel_not_named_in_classify() {
        let count = Arc::new(AtomicUsize::new(0));
        let channels: Vec<(i64, Arc<dyn NotificationChannel>)> =
            vec![(EMAIL_CHANNEL_CODE, Arc::new(CountingChannel { count: count.clone() }))];
        let dispatcher = Dispatcher::spawn(channels, 1, 8);
        dispatcher.dispatch(build_intent(&work_order(), &node(), vec![1], &json!({}), &[], None));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
