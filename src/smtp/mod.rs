//! SMTP protocol engine

pub mod commands;
pub mod delivery;
pub mod error;
pub mod extension;
pub mod handler;
pub mod mail;
pub mod path;
pub mod response;
pub mod server;
pub mod session;
pub mod storage;

pub use commands::{Command, CommandKind};
pub use delivery::{DeliveryConfig, NoRelay, Pipeline, Relay, RetryPolicy};
pub use error::{SmtpError, SmtpLimits};
pub use extension::{DsnExtension, Extension, SizeExtension};
pub use handler::{ChannelHandler, Handler};
pub use mail::MailTx;
pub use path::{Mailbox, Params, parse_path};
pub use response::SmtpResponse;
pub use server::{SmtpServer, handle_client};
pub use session::{SessionConfig, SmtpSession, SmtpState};
pub use storage::{MemoryStorage, Storage};
