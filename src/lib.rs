//! # Hakobi
//!
//! Hakobi is an embeddable SMTP protocol engine with a queued delivery
//! pipeline.
//!
//! It parses and sequences SMTP commands, frames DATA, seals every
//! transaction with a `Received:` trace header and hands it to a pipeline
//! that delivers locally, relays, retries or bounces.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hakobi::{ChannelHandler, DsnExtension, MemoryStorage, SmtpServer};
//! use std::sync::{mpsc, Arc};
//! use std::thread;
//! use std::time::Duration;
//!
//! let (tx, rx) = mpsc::channel();
//! let server = SmtpServer::new(
//!     "mx.example.com",
//!     Arc::new(ChannelHandler::new(tx)),
//!     Arc::new(MemoryStorage::new()),
//! )
//! .with_local_domain("example.com")
//! .with_extension(DsnExtension);
//!
//! thread::spawn(move || {
//!     server.start("127.0.0.1:2525").unwrap();
//! });
//!
//! // One transaction arrives per local recipient
//! if let Ok(mail) = rx.recv_timeout(Duration::from_secs(1)) {
//!     println!("Received mail {} from: {}", mail.id, mail.from);
//! }
//! ```
//!
//! ## Supported SMTP commands
//!
//! `HELO`, `EHLO`, `MAIL FROM`, `RCPT TO`, `DATA`, `RSET`, `VRFY`, `EXPN`,
//! `HELP`, `NOOP`, `QUIT`, and `AUTH PLAIN`/`AUTH LOGIN` in submission mode.
//!
//! ## Delivery
//!
//! - Local domains (and the bare `postmaster` alias) go to [`Handler::serve_mail_tx`]
//! - Other domains go to the configured [`Relay`]
//! - Failed attempts are retried with a linear backoff, then bounced
//!
//! ## Notes
//!
//! - TLS, DKIM and message (RFC 5322) parsing are left to the embedding application.
//! - Connections have no read timeout; set one on the socket if needed.
//!
//! ## Size Limits
//!
//! The server enforces RFC 5321 size limits:
//! - Local-parts: 64 characters max
//! - Domain names: 255 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//! - Recipients: 100 max per message

mod smtp;

pub use smtp::{
    ChannelHandler, Command, CommandKind, DeliveryConfig, DsnExtension, Extension, Handler,
    MailTx, Mailbox, MemoryStorage, NoRelay, Params, Pipeline, Relay, RetryPolicy,
    SessionConfig, SizeExtension, SmtpError, SmtpLimits, SmtpResponse, SmtpServer, SmtpSession,
    SmtpState, Storage, handle_client, parse_path,
};
