use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{info, warn};
use url::Url;

use crate::config::{AppConfig, SmtpConfig};
use crate::entity::{email, user};

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), String>;
}

/// Used when no SMTP relay is configured. Messages only reach the log.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), String> {
        info!("mail to={} subject={:?}\n{}", to, subject, body);
        Ok(())
    }
}

pub struct SmtpEmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailSender {
    pub fn new(smtp: &SmtpConfig, from: &str) -> Result<Self, String> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host).map_err(|e| e.to_string())?;
        if let Some(port) = smtp.port {
            builder = builder.port(port);
        }
        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        let from = from.parse::<Mailbox>().map_err(|e| e.to_string())?;
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), String> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse::<Mailbox>().map_err(|e| e.to_string())?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| e.to_string())?;

        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Builds ThanksPress messages and hands them to an [`EmailSender`].
///
/// Delivery is best effort: a failure is logged and never rolls back the
/// change that triggered it.
#[derive(Clone)]
pub struct Notifier {
    sender: Arc<dyn EmailSender>,
    site_url: String,
}

impl Notifier {
    pub fn new(sender: Arc<dyn EmailSender>, site_url: impl Into<String>) -> Self {
        Self {
            sender,
            site_url: site_url.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, String> {
        let sender: Arc<dyn EmailSender> = match &config.smtp {
            Some(smtp) => {
                info!("mail delivery through smtp relay {}", smtp.host);
                Arc::new(SmtpEmailSender::new(smtp, &config.mail_from)?)
            }
            None => {
                info!("SMTP_HOST not set, mail goes to the log");
                Arc::new(LogEmailSender)
            }
        };
        Ok(Self::new(sender, config.site_url.clone()))
    }

    /// `{site}/api/email/verify/{address}?key={key}` with the address as one
    /// encoded path segment.
    pub fn verification_link(&self, email: &email::Model) -> String {
        let base = format!("{}/api/email/verify/", self.site_url.trim_end_matches('/'));
        let mut url = match Url::parse(&base) {
            Ok(url) => url,
            Err(e) => {
                warn!("SITE_URL {} is not a valid url: {}", self.site_url, e);
                return format!("{}{}?key={}", base, email.address, email.verification_key);
            }
        };
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&email.address);
        }
        url.query_pairs_mut().append_pair("key", &email.verification_key);
        url.to_string()
    }

    pub async fn send_verification_email(&self, email: &email::Model) {
        let body = format!(
            "Please confirm that {} belongs to your ThanksPress account by opening the link below:\n\n{}\n\nIf you did not add this address you can ignore this message.",
            email.address,
            self.verification_link(email)
        );
        self.deliver(&email.address, "Verify your email for ThanksPress", &body).await;
    }

    pub async fn send_follower_notification(&self, follower: &user::Model, followed: &user::Model, to: &str) {
        let follower_name = follower.display_name();
        let body = format!(
            "Hi {},\n\n{} is now following you on ThanksPress.\n\n{}/api/user/{}",
            followed.display_name(),
            follower_name,
            self.site_url,
            follower_name
        );
        let subject = format!("{} is now following you", follower_name);
        self.deliver(to, &subject, &body).await;
    }

    async fn deliver(&self, to: &str, subject: &str, body: &str) {
        if let Err(e) = self.sender.send_email(to, subject, body).await {
            warn!("mail to {} failed: {}", to, e);
        }
    }
}
