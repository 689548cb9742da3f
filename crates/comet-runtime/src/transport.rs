use async_trait::async_trait;
use comet_config::SmtpConfig;
use comet_core::{ComposedMessage, MailAddress};
use lettre::message::{header, Mailbox};
use lettre::{
    transport::smtp::authentication::Credentials, AsyncSmtpTransport, AsyncTransport, Message,
    Tokio1Executor,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no outgoing mail transport is configured")]
    NotConfigured,
    #[error("invalid address {address}: {reason}")]
    Address { address: String, reason: String },
    #[error("message build error: {0}")]
    Build(String),
    #[error("smtp error: {0}")]
    Smtp(String),
    #[error("keychain error: {0}")]
    Secret(String),
}

/// Keychain service under which SMTP passwords are stored.
const KEYCHAIN_SERVICE: &str = "comet";

/// Hands composed messages to the outside world.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &ComposedMessage) -> Result<(), TransportError>;
}

/// Fails every send, so drafts stay visible instead of disappearing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredTransport;

#[async_trait]
impl Transport for UnconfiguredTransport {
    async fn send(&self, _message: &ComposedMessage) -> Result<(), TransportError> {
        Err(TransportError::NotConfigured)
    }
}

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    default_from: Option<MailAddress>,
}

impl SmtpTransport {
    pub fn from_config(config: &SmtpConfig) -> Result<Self, TransportError> {
        let mut mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|err| TransportError::Smtp(err.to_string()))?
            .port(config.port);

        if let Some(username) = &config.username {
            match smtp_password(config, username)? {
                Some(password) => {
                    mailer = mailer.credentials(Credentials::new(username.clone(), password));
                }
                None => tracing::warn!(
                    account = %keychain_account(config, username),
                    "no smtp password in the keychain; connecting without credentials"
                ),
            }
        }

        tracing::info!(host = %config.host, port = config.port, "smtp transport configured");
        Ok(Self {
            mailer: mailer.build(),
            default_from: config.from.clone().map(MailAddress::new),
        })
    }
}

/// Keychain account for the relay login, e.g. `smtp:alice@mail.example.com`.
fn keychain_account(config: &SmtpConfig, username: &str) -> String {
    format!("smtp:{username}@{}", config.host)
}

/// The environment variable named by `password_env` wins when set;
/// otherwise the password is read from the OS keychain.
fn smtp_password(config: &SmtpConfig, username: &str) -> Result<Option<String>, TransportError> {
    if let Some(var) = &config.password_env {
        match std::env::var(var) {
            Ok(password) => return Ok(Some(password)),
            Err(_) => tracing::debug!(var = %var, "smtp password variable is not set"),
        }
    }

    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, &keychain_account(config, username))
        .map_err(|err| TransportError::Secret(err.to_string()))?;
    match entry.get_password() {
        Ok(password) => Ok(Some(password)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(TransportError::Secret(err.to_string())),
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &ComposedMessage) -> Result<(), TransportError> {
        let email = build_message(message, self.default_from.as_ref())?;
        self.mailer
            .send(email)
            .await
            .map_err(|err| TransportError::Smtp(err.to_string()))?;
        tracing::info!(recipients = message.to.len(), "message handed to smtp relay");
        Ok(())
    }
}

pub(crate) fn build_message(
    message: &ComposedMessage,
    default_from: Option<&MailAddress>,
) -> Result<Message, TransportError> {
    let from = message
        .from
        .as_ref()
        .or(default_from)
        .ok_or_else(|| TransportError::Build("message has no sender".to_string()))?;

    let mut builder = Message::builder()
        .from(to_mailbox(from)?)
        .subject(message.subject.clone());

    for to in &message.to {
        builder = builder.to(to_mailbox(to)?);
    }
    for cc in &message.cc {
        builder = builder.cc(to_mailbox(cc)?);
    }
    for bcc in &message.bcc {
        builder = builder.bcc(to_mailbox(bcc)?);
    }

    builder
        .header(header::ContentType::TEXT_PLAIN)
        .body(message.body.clone())
        .map_err(|err| TransportError::Build(err.to_string()))
}

fn to_mailbox(address: &MailAddress) -> Result<Mailbox, TransportError> {
    let email = address
        .address
        .parse()
        .map_err(|err: lettre::address::AddressError| TransportError::Address {
            address: address.address.clone(),
            reason: err.to_string(),
        })?;

    Ok(Mailbox::new(address.name.clone(), email))
}
