//! Email and email-to-SMS delivery over SMTP.
//!
//! [`SmtpGateway`] wraps the `lettre` async SMTP transport. Email goes to the
//! contact's address with an HTML alternative when one was rendered; text
//! messages go to `number@carrier-domain` as plain text. Configuration is read
//! from the environment and [`SmtpConfig::from_env`] returns `None` when
//! `SMTP_HOST` is unset.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use super::{DeliveryChannel, DeliveryError, Gateway, OutboundMessage};

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default sender when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "Vigil Monitor <noreply@vigil.local>";

/// Configuration for the SMTP gateway.
#[derive(Clone)]
pub struct SmtpConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    /// RFC 5322 "From" mailbox.
    pub from_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("from_address", &self.from_address)
            .field("smtp_user", &self.smtp_user)
            .field("smtp_password", &self.smtp_password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl SmtpConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable        | Required | Default                               |
    /// |-----------------|----------|---------------------------------------|
    /// | `SMTP_HOST`     | yes      |                                       |
    /// | `SMTP_PORT`     | no       | `587`                                 |
    /// | `SMTP_FROM`     | no       | `Vigil Monitor <noreply@vigil.local>` |
    /// | `SMTP_USER`     | no       |                                       |
    /// | `SMTP_PASSWORD` | no       |                                       |
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("SMTP_HOST").ok()?;
        let smtp_port = match std::env::var("SMTP_PORT") {
            Ok(port) => port.parse().unwrap_or_else(|_| {
                warn!(port = %port, "Invalid SMTP_PORT, using default");
                DEFAULT_SMTP_PORT
            }),
            Err(_) => DEFAULT_SMTP_PORT,
        };

        Some(Self {
            smtp_host,
            smtp_port,
            from_address: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }
}

/// Address a message is delivered to over SMTP.
fn recipient(message: &OutboundMessage) -> Result<Mailbox, DeliveryError> {
    let address = match message.channel {
        DeliveryChannel::Email => message.to.clone(),
        DeliveryChannel::Text => {
            let domain = message
                .sms_gateway
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .ok_or(DeliveryError::MissingAddress("sms gateway"))?;
            let number: String = message.to.chars().filter(char::is_ascii_digit).collect();
            format!("{number}@{domain}")
        }
    };

    Ok(Mailbox::new(Some(message.to_name.clone()), address.parse()?))
}

/// Build the MIME message for an outbound notification.
pub fn build_message(from: &Mailbox, message: &OutboundMessage) -> Result<Message, DeliveryError> {
    let builder = Message::builder()
        .from(from.clone())
        .to(recipient(message)?)
        .subject(&message.subject);

    let built = match (&message.channel, &message.html) {
        (DeliveryChannel::Email, Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
            message.body.clone(),
            html.clone(),
        )),
        _ => builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone()),
    };

    built.map_err(|e| DeliveryError::Build(e.to_string()))
}

/// Sends messages through an SMTP relay.
pub struct SmtpGateway {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpGateway {
    /// Build the transport once; connections are opened per send.
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let from: Mailbox = config.from_address.parse()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port);

        if let (Some(user), Some(pass)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            from,
            mailer: builder.build(),
        })
    }
}

#[async_trait]
impl Gateway for SmtpGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let email = build_message(&self.from, message)?;
        self.mailer.send(email).await?;

        info!(
            contact_id = message.contact_id,
            channel = %message.channel,
            "Notification mail sent"
        );
        Ok(())
    }
}
