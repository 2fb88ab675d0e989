use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ChannelKind, NotificationSettings};
use crate::error::{ConfigError, Result as ConfigResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineEvent {
    PipelineStart,
    StageSuccess,
    StageFailure,
    PipelineSuccess,
    PipelineFailure,
    RollbackStart,
    RollbackSuccess,
}

impl PipelineEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStart => "PIPELINE_START",
            PipelineEvent::StageSuccess => "STAGE_SUCCESS",
            PipelineEvent::StageFailure => "STAGE_FAILURE",
            PipelineEvent::PipelineSuccess => "PIPELINE_SUCCESS",
            PipelineEvent::PipelineFailure => "PIPELINE_FAILURE",
            PipelineEvent::RollbackStart => "ROLLBACK_START",
            PipelineEvent::RollbackSuccess => "ROLLBACK_SUCCESS",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            PipelineEvent::PipelineStart
            | PipelineEvent::StageSuccess
            | PipelineEvent::PipelineSuccess
            | PipelineEvent::RollbackSuccess => Severity::Info,
            PipelineEvent::StageFailure | PipelineEvent::RollbackStart => Severity::Warning,
            PipelineEvent::PipelineFailure => Severity::Critical,
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub event: PipelineEvent,
    pub severity: Severity,
    pub execution_id: String,
    pub pipeline: String,
    pub environment: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        event: PipelineEvent,
        execution_id: impl Into<String>,
        pipeline: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event,
            severity: event.default_severity(),
            execution_id: execution_id.into(),
            pipeline: pipeline.into(),
            environment: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn for_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook {url} returned status {status}")]
    Status { url: String, status: u16 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct LogNotifier {
    name: String,
}

impl LogNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            target: "pipeline.notify",
            channel = %self.name,
            event = notification.event.as_str(),
            severity = notification.severity.as_str(),
            execution_id = %notification.execution_id,
            environment = ?notification.environment,
            message = %notification.message,
            "pipeline notification"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Posts the notification as JSON to a webhook URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

impl WebhookNotifier {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Channel {
    min_severity: Severity,
    notifier: Arc<dyn Notifier>,
}

/// Fans notifications out to every channel whose minimum severity is met. Delivery
/// failures are logged and never returned to the caller.
#[derive(Default)]
pub struct NotificationRouter {
    channels: Vec<Channel>,
}

impl fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .channels
            .iter()
            .map(|channel| channel.notifier.name())
            .collect();
        f.debug_struct("NotificationRouter")
            .field("channels", &names)
            .finish()
    }
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, min_severity: Severity, notifier: Arc<dyn Notifier>) -> Self {
        self.channels.push(Channel {
            min_severity,
            notifier,
        });
        self
    }

    pub fn from_settings(settings: &NotificationSettings) -> ConfigResult<Self> {
        let mut router = Self::new();
        for channel in &settings.channels {
            let notifier: Arc<dyn Notifier> = match channel.kind {
                ChannelKind::Log => Arc::new(LogNotifier::new(&channel.name)),
                ChannelKind::Webhook => {
                    let url = channel.url.clone().ok_or_else(|| ConfigError::Invalid {
                        key: format!("notifications.channels.{}.url", channel.name),
                        reason: "webhook channels need a url".into(),
                    })?;
                    Arc::new(WebhookNotifier::new(&channel.name, url))
                }
            };
            router = router.with_channel(channel.min_severity, notifier);
        }
        Ok(router)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Returns how many channels accepted the notification.
    pub async fn dispatch(&self, notification: &Notification) -> usize {
        let mut delivered = 0;
        for channel in &self.channels {
            if notification.severity < channel.min_severity {
                continue;
            }
            match channel.notifier.notify(notification).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    target: "pipeline.notify",
                    channel = channel.notifier.name(),
                    event = notification.event.as_str(),
                    error = %err,
                    "notification delivery failed"
                ),
            }
        }
        delivered
    }
}

#[async_trait]
impl Notifier for NotificationRouter {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.dispatch(notification).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "router"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSettings;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<PipelineEvent>>,
    }

    #[async_trait]
    impl Notifier for Collecting {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(notification.event);
            Ok(())
        }

        fn name(&self) -> &str {
            "collecting"
        }
    }

    #[tokio::test]
    async fn router_filters_by_channel_severity() {
        let everything = Arc::new(Collecting::default());
        let pager = Arc::new(Collecting::default());
        let router = NotificationRouter::new()
            .with_channel(Severity::Info, everything.clone())
            .with_channel(Severity::Critical, pager.clone());

        for event in [
            PipelineEvent::PipelineStart,
            PipelineEvent::StageFailure,
            PipelineEvent::PipelineFailure,
        ] {
            router
                .dispatch(&Notification::new(event, "exec-1", "web", "test"))
                .await;
        }

        assert_eq!(everything.seen.lock().unwrap().len(), 3);
        assert_eq!(
            *pager.seen.lock().unwrap(),
            vec![PipelineEvent::PipelineFailure]
        );
    }

    #[test]
    fn events_serialize_in_screaming_snake_case() {
        let json = serde_json::to_string(&PipelineEvent::RollbackSuccess).unwrap();
        assert_eq!(json, "\"ROLLBACK_SUCCESS\"");
        assert!(Severity::Critical > Severity::Warning);
    }

    #[test]
    fn from_settings_builds_each_channel() {
        let settings = NotificationSettings {
            channels: vec![
                ChannelSettings {
                    name: "ops-log".into(),
                    kind: ChannelKind::Log,
                    min_severity: Severity::Info,
                    url: None,
                },
                ChannelSettings {
                    name: "pager".into(),
                    kind: ChannelKind::Webhook,
                    min_severity: Severity::Critical,
                    url: Some("http://127.0.0.1:9/hook".into()),
                },
            ],
        };
        let router = NotificationRouter::from_settings(&settings).unwrap();
        assert_eq!(router.channels.len(), 2);
    }
}
