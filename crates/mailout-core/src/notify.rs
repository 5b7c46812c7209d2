//! Operator notifications
//!
//! Suspensions, escalations and failed passes are reported to operators.
//! Notification failures are logged and never interrupt the scheduler.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailout_common::config::NotificationConfig;
use mailout_common::{Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Sink for operator-facing alerts
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl OperatorNotifier for TracingNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        warn!(subject, body, "Operator notification");
    }
}

/// Emails alerts to the configured operators through a relay
pub struct EmailNotifier {
    from: Mailbox,
    operators: Vec<Mailbox>,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailNotifier {
    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| Error::Config("notifications.smtp_host is required".to_string()))?;
        let from = config
            .from_address
            .as_deref()
            .ok_or_else(|| Error::Config("notifications.from_address is required".to_string()))?
            .parse::<Mailbox>()
            .map_err(|e| Error::Config(format!("Invalid notification sender: {}", e)))?;
        let operators = config
            .operator_emails
            .iter()
            .map(|address| {
                address
                    .parse::<Mailbox>()
                    .map_err(|e| Error::Config(format!("Invalid operator address {}: {}", address, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        if operators.is_empty() {
            return Err(Error::Config("notifications.operator_emails is empty".to_string()));
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| Error::Config(format!("Notification relay: {}", e)))?
            .port(config.smtp_port);
        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            from,
            operators,
            mailer: builder.build(),
        })
    }

    fn build(&self, subject: &str, body: &str) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("[mailout] {}", subject))
            .header(ContentType::TEXT_PLAIN);
        for operator in &self.operators {
            builder = builder.to(operator.clone());
        }
        builder
            .body(body.to_string())
            .map_err(|e| Error::Transport(format!("Failed to build notification: {}", e)))
    }
}

#[async_trait]
impl OperatorNotifier for EmailNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        warn!(subject, body, "Operator notification");
        let message = match self.build(subject, body) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Dropping operator notification");
                return;
            }
        };
        if let Err(e) = self.mailer.send(message).await {
            error!(error = %e, subject, "Failed to email operators");
        }
    }
}

/// Notifier for the configuration: email when enabled, log otherwise
pub fn notifier_from_config(config: &NotificationConfig) -> Result<Arc<dyn OperatorNotifier>> {
    if !config.enabled {
        return Ok(Arc::new(TracingNotifier));
    }
    let notifier = EmailNotifier::from_config(config)?;
    info!(operators = notifier.operators.len(), "Operator email notifications enabled");
    Ok(Arc::new(notifier))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NotificationConfig {
        NotificationConfig {
            enabled: true,
            operator_emails: vec!["ops@example.com".to_string(), "oncall@example.com".to_string()],
            from_address: Some("mailout@example.com".to_string()),
            smtp_host: Some("smtp.example.com".to_string()),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
        }
    }

    #[tokio::test]
    async fn test_email_notifier_builds_message() {
        let notifier = EmailNotifier::from_config(&config()).unwrap();
        let message = notifier.build("Account suspended", "sales@example.com").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: [mailout] Account suspended"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("oncall@example.com"));
    }

    #[test]
    fn test_email_notifier_requires_operators() {
        let mut config = config();
        config.operator_emails.clear();
        assert!(EmailNotifier::from_config(&config).is_err());
    }

    #[test]
    fn test_disabled_notifications_fall_back_to_log() {
        let mut config = config();
        config.enabled = false;
        config.smtp_host = None;
        assert!(notifier_from_config(&config).is_ok());
    }
}
