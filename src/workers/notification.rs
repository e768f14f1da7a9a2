//! Notification dispatch worker
//!
//! Fans one notification out over the registered channel transports.
//! The transports themselves (SMTP, webhooks, chat bridges) are
//! collaborators behind the `NotificationTransport` trait; this worker
//! owns the retry semantics: per-channel failures are classified by the
//! canonical policy, and delivery through any single channel is enough
//! for the job to succeed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::jobs::types::{Job, JobKind, NotificationArgs};
use crate::jobs::worker::{
    classify_failure, FailureClass, WorkContext, WorkError, WorkOutcome, Worker,
};

/// One outbound delivery channel
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn deliver(&self, notification: &NotificationArgs) -> anyhow::Result<()>;
}

/// Default transport that records deliveries in the log stream; real
/// deployments register SMTP/webhook transports next to it
pub struct LogNotificationTransport;

#[async_trait]
impl NotificationTransport for LogNotificationTransport {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, notification: &NotificationArgs) -> anyhow::Result<()> {
        info!(
            "Notification for {}: {} - {}",
            notification.recipient, notification.subject, notification.body
        );
        Ok(())
    }
}

pub struct NotificationDispatchWorker {
    transports: HashMap<&'static str, Arc<dyn NotificationTransport>>,
}

impl NotificationDispatchWorker {
    pub fn new(transports: Vec<Arc<dyn NotificationTransport>>) -> Self {
        let transports = transports
            .into_iter()
            .map(|transport| (transport.channel(), transport))
            .collect();
        Self { transports }
    }
}

enum ChannelResult {
    Delivered,
    Failed(FailureClass, String),
}

#[async_trait]
impl Worker for NotificationDispatchWorker {
    fn kind(&self) -> JobKind {
        JobKind::NotificationDispatch
    }

    async fn work(&self, job: &Job, _ctx: &WorkContext) -> Result<WorkOutcome, WorkError> {
        let args: NotificationArgs = job
            .parse_args()
            .map_err(|e| WorkError::permanent(anyhow::anyhow!("invalid job arguments: {e}")))?;

        let channels: Vec<&str> = if args.channels.is_empty() {
            self.transports.keys().copied().collect()
        } else {
            args.channels.iter().map(String::as_str).collect()
        };
        if channels.is_empty() {
            return Err(WorkError::permanent(anyhow::anyhow!(
                "no notification channels registered"
            )));
        }

        let mut results: Vec<(String, ChannelResult)> = Vec::new();
        for channel in channels {
            let result = match self.transports.get(channel) {
                None => ChannelResult::Failed(
                    FailureClass::Permanent,
                    format!("unknown channel '{channel}'"),
                ),
                Some(transport) => match transport.deliver(&args).await {
                    Ok(()) => ChannelResult::Delivered,
                    Err(e) => {
                        let message = format!("{e:#}");
                        warn!(
                            "Notification delivery via '{}' to {} failed: {}",
                            channel, args.recipient, message
                        );
                        ChannelResult::Failed(classify_failure(&message), message)
                    }
                },
            };
            results.push((channel.to_string(), result));
        }

        let delivered: Vec<&str> = results
            .iter()
            .filter(|(_, r)| matches!(r, ChannelResult::Delivered))
            .map(|(c, _)| c.as_str())
            .collect();
        let failures: Vec<(&str, &FailureClass, &str)> = results
            .iter()
            .filter_map(|(c, r)| match r {
                ChannelResult::Failed(class, message) => {
                    Some((c.as_str(), class, message.as_str()))
                }
                ChannelResult::Delivered => None,
            })
            .collect();

        // Partial success counts as success; the outcome records which
        // channels made it and which did not
        if !delivered.is_empty() {
            let mut message = format!("delivered via {}", delivered.join(", "));
            if !failures.is_empty() {
                let failed: Vec<String> = failures
                    .iter()
                    .map(|(c, _, m)| format!("{c}: {m}"))
                    .collect();
                message.push_str(&format!("; failed {}", failed.join("; ")));
            }
            return Ok(WorkOutcome::with_message(message));
        }

        let summary = failures
            .iter()
            .map(|(c, _, m)| format!("{c}: {m}"))
            .collect::<Vec<_>>()
            .join("; ");
        if failures
            .iter()
            .any(|(_, class, _)| **class == FailureClass::Transient)
        {
            Err(WorkError::transient(anyhow::anyhow!(
                "all channels failed: {summary}"
            )))
        } else {
            Err(WorkError::permanent(anyhow::anyhow!(
                "all channels failed: {summary}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{EnqueueResult, InMemoryJobStore, JobStore, NewJob};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    struct ScriptedTransport {
        name: &'static str,
        error: Option<&'static str>,
    }

    #[async_trait]
    impl NotificationTransport for ScriptedTransport {
        fn channel(&self) -> &'static str {
            self.name
        }

        async fn deliver(&self, _notification: &NotificationArgs) -> anyhow::Result<()> {
            match self.error {
                None => Ok(()),
                Some(message) => Err(anyhow::anyhow!("{message}")),
            }
        }
    }

    fn transport(name: &'static str, error: Option<&'static str>) -> Arc<dyn NotificationTransport> {
        Arc::new(ScriptedTransport { name, error })
    }

    async fn job_with_channels(channels: Vec<String>) -> Job {
        let store = InMemoryJobStore::new();
        let args = NotificationArgs {
            recipient: "owner@example.com".to_string(),
            subject: "subject".to_string(),
            body: "body".to_string(),
            channels,
        };
        match store
            .enqueue(NewJob::new(JobKind::NotificationDispatch, &args).unwrap())
            .await
            .unwrap()
        {
            EnqueueResult::Enqueued(job) => job,
            EnqueueResult::Duplicate => panic!("expected enqueue"),
        }
    }

    fn work_context() -> WorkContext {
        WorkContext {
            deadline: Utc::now() + chrono::Duration::minutes(5),
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_partial_success_is_success() {
        let worker = NotificationDispatchWorker::new(vec![
            transport("email", None),
            transport("webhook", Some("connection refused")),
        ]);
        let job = job_with_channels(vec!["email".to_string(), "webhook".to_string()]).await;

        let outcome = worker.work(&job, &work_context()).await.unwrap();
        let message = outcome.message.unwrap();
        assert!(message.contains("delivered via email"));
        assert!(message.contains("webhook: connection refused"));
    }

    #[tokio::test]
    async fn test_all_transient_failures_retry() {
        let worker = NotificationDispatchWorker::new(vec![
            transport("email", Some("smtp timeout")),
            transport("webhook", Some("503 service unavailable")),
        ]);
        let job = job_with_channels(vec![]).await;

        let err = worker.work(&job, &work_context()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_all_permanent_failures_are_terminal() {
        let worker =
            NotificationDispatchWorker::new(vec![transport("email", Some("invalid recipient"))]);
        let job = job_with_channels(vec![]).await;

        let err = worker.work(&job, &work_context()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_mixed_failures_prefer_retry() {
        // One channel permanently broken, one flaky: retrying can still
        // deliver, so the job stays retryable
        let worker = NotificationDispatchWorker::new(vec![
            transport("email", Some("invalid recipient")),
            transport("webhook", Some("gateway timeout")),
        ]);
        let job = job_with_channels(vec![]).await;

        let err = worker.work(&job, &work_context()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_permanent() {
        let worker = NotificationDispatchWorker::new(vec![transport("email", None)]);
        let job = job_with_channels(vec!["carrier-pigeon".to_string()]).await;

        let err = worker.work(&job, &work_context()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_log_transport_always_delivers() {
        let worker = NotificationDispatchWorker::new(vec![Arc::new(LogNotificationTransport)]);
        let job = job_with_channels(vec![]).await;

        let outcome = worker.work(&job, &work_context()).await.unwrap();
        assert!(outcome.message.unwrap().contains("delivered via log"));
    }
}
