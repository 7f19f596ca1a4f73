//! Mail handler collaborator

use std::sync::mpsc;

use crate::smtp::error::SmtpError;
use crate::smtp::mail::MailTx;
use crate::smtp::response::SmtpResponse;

/// Serves the requests a session or the delivery pipeline cannot answer alone.
///
/// Implementations are shared between connection threads and the delivery
/// workers, so they must be `Send + Sync`.
pub trait Handler: Send + Sync {
    /// Check `AUTH` credentials. Success answers 235.
    fn serve_auth(&self, _user: &str, _pass: &str) -> Result<SmtpResponse, SmtpError> {
        Err(SmtpError::AuthFailed)
    }

    /// Called once a transaction has been moved to the bounced partition.
    fn serve_bounce(&self, _mail: &MailTx) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::ok())
    }

    /// Answer `EXPN` for a mailing list.
    fn serve_expand(&self, _list: &str) -> Result<SmtpResponse, SmtpError> {
        Err(SmtpError::NotImplemented("EXPN".to_string()))
    }

    /// Deliver a single recipient transaction for a local domain.
    fn serve_mail_tx(&self, mail: &MailTx) -> Result<SmtpResponse, SmtpError>;

    /// Answer `VRFY` for a user.
    fn serve_verify(&self, _user: &str) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::new(
            252,
            "Cannot VRFY user, but will accept message and attempt delivery",
        ))
    }
}

/// Hands locally delivered mail to a channel
///
/// Bounced transactions are forwarded to an optional second channel.
#[derive(Debug)]
pub struct ChannelHandler {
    delivered: mpsc::Sender<MailTx>,
    bounced: Option<mpsc::Sender<MailTx>>,
}

impl ChannelHandler {
    pub fn new(delivered: mpsc::Sender<MailTx>) -> Self {
        Self {
            delivered,
            bounced: None,
        }
    }

    pub fn with_bounces(mut self, bounced: mpsc::Sender<MailTx>) -> Self {
        self.bounced = Some(bounced);
        self
    }
}

impl Handler for ChannelHandler {
    fn serve_bounce(&self, mail: &MailTx) -> Result<SmtpResponse, SmtpError> {
        if let Some(bounced) = &self.bounced {
            bounced
                .send(mail.clone())
                .map_err(|_| SmtpError::QueueClosed)?;
        }
        Ok(SmtpResponse::ok())
    }

    fn serve_mail_tx(&self, mail: &MailTx) -> Result<SmtpResponse, SmtpError> {
        // Fails when nobody listens any more, which the pipeline retries
        self.delivered
            .send(mail.clone())
            .map_err(|_| SmtpError::QueueClosed)?;
        Ok(SmtpResponse::ok())
    }
}
