//! Queued delivery of mail transactions
//!
//! A completed transaction is split into one transaction per recipient,
//! persisted, and pushed onto the mail queue. Three worker threads drain
//! the queues:
//!
//! - mail queue: local recipients go to [`Handler::serve_mail_tx`], others
//!   to the relay queue, malformed ones to the bounce queue
//! - relay queue: hands transactions to the configured [`Relay`]
//! - bounce queue: moves transactions to the bounced storage partition
//!
//! A transaction is owned by exactly one worker at a time. Failed attempts
//! are kept in the owning worker's deferred list until due again.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::smtp::error::SmtpError;
use crate::smtp::handler::Handler;
use crate::smtp::mail::MailTx;
use crate::smtp::path::Mailbox;
use crate::smtp::response::SmtpResponse;
use crate::smtp::storage::Storage;

/// Capacity of each pipeline queue
pub const QUEUE_CAPACITY: usize = 512;

/// Hands transactions for non-local domains to the outside world
pub trait Relay: Send + Sync {
    fn relay(&self, mail: &MailTx) -> Result<SmtpResponse, SmtpError>;
}

/// Refuses to relay; every non-local transaction bounces
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelay;

impl Relay for NoRelay {
    fn relay(&self, _mail: &MailTx) -> Result<SmtpResponse, SmtpError> {
        Err(SmtpError::Rejected {
            code: 550,
            message: "Relay access denied".to_string(),
        })
    }
}

/// When and how often failed deliveries are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt `n` is due `interval * n` after the transaction arrived
    pub interval: Duration,
    /// Bounce once this many attempts have failed
    pub max_attempts: u32,
    /// How often workers look at their deferred transactions
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            max_attempts: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct DeliveryConfig {
    pub local_domains: Vec<String>,
    pub handler: Arc<dyn Handler>,
    pub storage: Arc<dyn Storage>,
    pub relay: Arc<dyn Relay>,
    pub retry: RetryPolicy,
}

impl DeliveryConfig {
    /// Local domains, plus the bare `postmaster` alias
    fn is_local(&self, mailbox: &Mailbox) -> bool {
        if mailbox.domain.is_empty() {
            return mailbox.is_postmaster();
        }
        self.local_domains
            .iter()
            .any(|domain| domain.eq_ignore_ascii_case(&mailbox.domain))
    }
}

/// Entry point of the delivery pipeline, cheap to clone into each session
#[derive(Clone)]
pub struct Pipeline {
    mail_tx: SyncSender<MailTx>,
    storage: Arc<dyn Storage>,
}

impl Pipeline {
    /// Start the three worker threads
    pub fn spawn(config: DeliveryConfig) -> Result<Self, SmtpError> {
        let config = Arc::new(config);
        let (mail_tx, mail_rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let (relay_tx, relay_rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let (bounce_tx, bounce_rx) = mpsc::sync_channel(QUEUE_CAPACITY);

        let worker = MailTxWorker {
            config: Arc::clone(&config),
            relay_tx,
            bounce_tx: bounce_tx.clone(),
        };
        thread::Builder::new()
            .name("mail-tx-queue".to_string())
            .spawn(move || worker.run(mail_rx))?;

        let worker = RelayWorker {
            config: Arc::clone(&config),
            bounce_tx,
        };
        thread::Builder::new()
            .name("relay-queue".to_string())
            .spawn(move || worker.run(relay_rx))?;

        let worker = BounceWorker {
            config: Arc::clone(&config),
        };
        thread::Builder::new()
            .name("bounce-queue".to_string())
            .spawn(move || worker.run(bounce_rx))?;

        Ok(Self {
            mail_tx,
            storage: Arc::clone(&config.storage),
        })
    }

    /// Fan a transaction out per recipient, persist and queue each copy.
    ///
    /// Storage failures are logged; the copy is still queued. If the queue
    /// closes midway, the transaction counts as accepted and the copies not
    /// yet queued wait in storage for [`Pipeline::recover`]. If nothing was
    /// queued, the saved copies are removed and the error is returned.
    pub fn process_mail_tx(&self, mail: MailTx) -> Result<(), SmtpError> {
        let parts = mail.split();
        for part in &parts {
            if let Err(e) = self.storage.mail_save(part) {
                error!(id = part.id, error = %e, "failed to persist mail transaction");
            }
        }

        let ids: Vec<u64> = parts.iter().map(|part| part.id).collect();
        for (queued, part) in parts.into_iter().enumerate() {
            let id = part.id;
            if let Err(e) = self.enqueue(part) {
                if queued == 0 {
                    for &id in &ids {
                        if let Err(e) = self.storage.mail_delete(id) {
                            error!(id, error = %e, "failed to discard unqueued copy");
                        }
                    }
                    return Err(e);
                }
                warn!(
                    id = mail.id,
                    queued,
                    left = ids.len() - queued,
                    "queue closed during fan-out, remaining copies left in storage"
                );
                return Ok(());
            }
            debug!(id, "queued");
        }
        Ok(())
    }

    /// Queue an already persisted transaction
    pub fn enqueue(&self, mail: MailTx) -> Result<(), SmtpError> {
        self.mail_tx.send(mail).map_err(|_| SmtpError::QueueClosed)
    }

    /// Re-queue everything left in storage by a previous run
    pub fn recover(&self) -> Result<usize, SmtpError> {
        let pending = self.storage.mail_load_all()?;
        let count = pending.len();
        for mail in pending {
            self.enqueue(mail)?;
        }
        if count > 0 {
            info!(count, "recovered pending mail transactions");
        }
        Ok(count)
    }
}

/// Drains `rx`, re-running `process` on deferred transactions once due.
///
/// `process` returns the transaction back when it must be retried later.
fn run_stage<F>(stage: &str, rx: Receiver<MailTx>, poll: Duration, mut process: F)
where
    F: FnMut(MailTx) -> Option<MailTx>,
{
    let mut deferred: Vec<MailTx> = Vec::new();
    loop {
        let now = Utc::now();
        let (due, waiting): (Vec<_>, Vec<_>) = deferred
            .into_iter()
            .partition(|mail| !mail.is_postponed_at(now));
        deferred = waiting;
        for mail in due {
            deferred.extend(process(mail));
        }

        match rx.recv_timeout(poll) {
            Ok(mail) if mail.is_postponed() => deferred.push(mail),
            Ok(mail) => deferred.extend(process(mail)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if !deferred.is_empty() {
                    warn!(stage, count = deferred.len(), "queue closed with deferred mail left in storage");
                }
                break;
            }
        }
    }
    debug!(stage, "worker stopped");
}

fn send_bounce(bounce_tx: &SyncSender<MailTx>, mail: MailTx) {
    let id = mail.id;
    if bounce_tx.send(mail).is_err() {
        error!(id, "bounce queue closed");
    }
}

/// Postpone after a failed attempt, bouncing once attempts run out.
///
/// The stored copy is updated so a restart resumes the same schedule.
fn postpone_or_bounce(
    config: &DeliveryConfig,
    bounce_tx: &SyncSender<MailTx>,
    mut mail: MailTx,
    err: &SmtpError,
) -> Option<MailTx> {
    let retry = &config.retry;
    mail.postpone(retry.interval);
    if let Err(e) = config.storage.mail_save(&mail) {
        error!(id = mail.id, error = %e, "failed to persist retry state");
    }
    if mail.retry >= retry.max_attempts {
        warn!(id = mail.id, attempts = mail.retry, error = %err, "giving up");
        send_bounce(bounce_tx, mail);
        return None;
    }
    info!(id = mail.id, attempt = mail.retry, next = %mail.postpone, error = %err, "delivery postponed");
    Some(mail)
}

struct MailTxWorker {
    config: Arc<DeliveryConfig>,
    relay_tx: SyncSender<MailTx>,
    bounce_tx: SyncSender<MailTx>,
}

impl MailTxWorker {
    fn run(self, rx: Receiver<MailTx>) {
        let poll = self.config.retry.poll_interval;
        run_stage("mail-tx", rx, poll, |mail| self.route(mail));
    }

    fn route(&self, mail: MailTx) -> Option<MailTx> {
        let mailbox = match mail.recipients.first().map(|rcpt| Mailbox::parse(rcpt)) {
            Some(Ok(mailbox)) => mailbox,
            _ => {
                warn!(id = mail.id, rcpt = ?mail.recipients.first(), "malformed recipient");
                send_bounce(&self.bounce_tx, mail);
                return None;
            }
        };

        if !self.config.is_local(&mailbox) {
            debug!(id = mail.id, domain = %mailbox.domain, "relaying");
            let id = mail.id;
            if self.relay_tx.send(mail).is_err() {
                error!(id, "relay queue closed");
            }
            return None;
        }

        match self.config.handler.serve_mail_tx(&mail) {
            Ok(_) => {
                info!(id = mail.id, rcpt = %mailbox, "delivered");
                if let Err(e) = self.config.storage.mail_delete(mail.id) {
                    error!(id = mail.id, error = %e, "failed to delete delivered mail");
                }
                None
            }
            Err(e) => postpone_or_bounce(&self.config, &self.bounce_tx, mail, &e),
        }
    }
}

struct RelayWorker {
    config: Arc<DeliveryConfig>,
    bounce_tx: SyncSender<MailTx>,
}

impl RelayWorker {
    fn run(self, rx: Receiver<MailTx>) {
        let poll = self.config.retry.poll_interval;
        run_stage("relay", rx, poll, |mail| self.relay(mail));
    }

    fn relay(&self, mail: MailTx) -> Option<MailTx> {
        match self.config.relay.relay(&mail) {
            Ok(_) => {
                info!(id = mail.id, rcpt = ?mail.recipients.first(), "relayed");
                if let Err(e) = self.config.storage.mail_delete(mail.id) {
                    error!(id = mail.id, error = %e, "failed to delete relayed mail");
                }
                None
            }
            Err(e) if e.is_permanent() => {
                warn!(id = mail.id, error = %e, "relay refused");
                send_bounce(&self.bounce_tx, mail);
                None
            }
            Err(e) => postpone_or_bounce(&self.config, &self.bounce_tx, mail, &e),
        }
    }
}

struct BounceWorker {
    config: Arc<DeliveryConfig>,
}

impl BounceWorker {
    fn run(self, rx: Receiver<MailTx>) {
        for mail in rx {
            self.bounce(&mail);
        }
        debug!(stage = "bounce", "worker stopped");
    }

    fn bounce(&self, mail: &MailTx) {
        if let Err(e) = self.config.storage.mail_bounce(mail.id) {
            error!(id = mail.id, error = %e, "failed to move mail to bounced");
        }

        // Never notify about a notification
        if mail.from.is_empty() {
            info!(id = mail.id, "bounced mail with null sender");
            return;
        }
        match self.config.handler.serve_bounce(mail) {
            Ok(_) => info!(id = mail.id, from = %mail.from, "bounced"),
            Err(e) => warn!(id = mail.id, error = %e, "bounce handler failed"),
        }
    }
}
