//! Bug reports relayed over SMTP.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{Mailbox, Message, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::MailConfig;
use crate::error::MailError;

const MAX_DESCRIPTION_LEN: usize = 10_000;
const MAX_SUBJECT_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BugReport {
    #[serde(default)]
    pub reporter: Option<String>,
    pub subject: String,
    pub description: String,
    /// Board view the report was filed from.
    #[serde(default)]
    pub page: Option<String>,
}

impl BugReport {
    pub fn validate(&self) -> Result<(), String> {
        if self.subject.trim().is_empty() {
            return Err("subject is required".to_string());
        }
        if self.description.trim().is_empty() {
            return Err("description is required".to_string());
        }
        if self.subject.len() > MAX_SUBJECT_LEN {
            return Err(format!("subject exceeds {} characters", MAX_SUBJECT_LEN));
        }
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "description exceeds {} characters",
                MAX_DESCRIPTION_LEN
            ));
        }
        Ok(())
    }

    fn body(&self) -> String {
        format!(
            "Reporter: {}\nPage: {}\n\n{}\n",
            self.reporter.as_deref().unwrap_or("N/A"),
            self.page.as_deref().unwrap_or("N/A"),
            self.description.trim()
        )
    }
}

#[async_trait]
pub trait BugReportMailer: Send + Sync {
    async fn send(&self, report: &BugReport) -> Result<(), MailError>;
}

fn mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|e: lettre::address::AddressError| MailError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

pub struct SmtpMailer {
    host: String,
    credentials: Option<(String, SecretString)>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig, host: &str, to: &str) -> Result<Self, MailError> {
        let credentials = match (&config.smtp_user, &config.smtp_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        Ok(Self {
            host: host.to_string(),
            credentials,
            from: mailbox(&config.from)?,
            to: mailbox(to)?,
        })
    }

    pub(crate) fn build_message(&self, report: &BugReport) -> Result<Message, MailError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(format!("[pipeboard] {}", report.subject.trim()))
            .header(ContentType::TEXT_PLAIN);
        if let Some(reporter) = report.reporter.as_deref()
            && let Ok(reply_to) = mailbox(reporter)
        {
            builder = builder.reply_to(reply_to);
        }
        builder
            .body(report.body())
            .map_err(|e| MailError::Build(e.to_string()))
    }

    fn transport(&self) -> Result<SmtpTransport, MailError> {
        match &self.credentials {
            Some((user, password)) => Ok(SmtpTransport::relay(&self.host)
                .map_err(|e| MailError::Transport(e.to_string()))?
                .credentials(Credentials::new(
                    user.clone(),
                    password.expose_secret().to_string(),
                ))
                .build()),
            None => Ok(SmtpTransport::builder_dangerous(&self.host).build()),
        }
    }
}

#[async_trait]
impl BugReportMailer for SmtpMailer {
    async fn send(&self, report: &BugReport) -> Result<(), MailError> {
        let message = self.build_message(report)?;
        let transport = self.transport()?;
        // lettre's SmtpTransport is blocking.
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?
            .map_err(|e| MailError::Transport(e.to_string()))?;
        tracing::info!("Bug report '{}' relayed", report.subject.trim());
        Ok(())
    }
}

/// Build the configured mailer, or `None` when bug reports are disabled.
pub fn mailer_from_config(config: &MailConfig) -> Result<Option<Arc<dyn BugReportMailer>>, MailError> {
    match (config.smtp_host.as_deref(), config.bug_report_to.as_deref()) {
        (Some(host), Some(to)) => Ok(Some(Arc::new(SmtpMailer::new(config, host, to)?))),
        _ => {
            tracing::info!("SMTP_HOST or BUG_REPORT_TO unset, bug reports disabled");
            Ok(None)
        }
    }
}
