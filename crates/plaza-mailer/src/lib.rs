//! Verification email dispatch.
//!
//! The rest of the system depends only on the [`Mailer`] trait; the SMTP
//! transport is one implementation of it. A dispatch failure is the
//! caller's to log and swallow — account creation never rolls back because
//! an email bounced.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp failure: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Send contract for the verification email.
pub trait Mailer: Send + Sync {
    fn send_verification(&self, to: &str, name: &str, link: &str) -> Result<(), MailerError>;
}

/// SMTP relay transport with required TLS and a short timeout so a slow
/// provider cannot stall a registration worker.
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(
        host: &str,
        port: u16,
        username: String,
        password: String,
        from: &str,
    ) -> Result<Self, MailerError> {
        let from: Mailbox = from.parse()?;

        let transport = SmtpTransport::relay(host)?
            .credentials(Credentials::new(username, password))
            .port(port)
            .pool_config(PoolConfig::new().max_size(2))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(Self { transport, from })
    }
}

impl Mailer for SmtpMailer {
    fn send_verification(&self, to: &str, name: &str, link: &str) -> Result<(), MailerError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject("Verify your Plaza account")
            .header(ContentType::TEXT_PLAIN)
            .body(verification_email_body(name, link))?;

        self.transport.send(&email)?;
        info!("Verification email sent to {}", to);
        Ok(())
    }
}

/// Logs the verification link instead of sending anything. Used when no
/// SMTP credentials are configured (local development).
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send_verification(&self, to: &str, _name: &str, link: &str) -> Result<(), MailerError> {
        info!("SMTP not configured; verification link for {}: {}", to, link);
        Ok(())
    }
}

pub fn verification_email_body(name: &str, link: &str) -> String {
    format!(
        "Hi {},\n\
        \n\
        Welcome to Plaza!\n\
        \n\
        Open the following link to verify your account:\n\
        \n\
        {}\n\
        \n\
        If you did not create this account, you can ignore this email.\n\
        \n\
        The Plaza team",
        name, link
    )
}
