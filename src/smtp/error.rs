//! Error types for the SMTP engine

use thiserror::Error;

use crate::smtp::response::SmtpResponse;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command line length out of range")]
    CmdTooLong,

    #[error("Syntax error: {0}")]
    CmdSyntaxError(String),

    #[error("Unknown command")]
    CmdUnknown,

    #[error("Bad sequence of commands: {0}")]
    BadSequence(String),

    #[error("Path too long (max {max} characters)")]
    PathTooLong { max: usize },

    #[error("Too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("Too much mail data (max {max} bytes)")]
    TooMuchData { max: usize },

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Command not implemented: {0}")]
    NotImplemented(String),

    #[error("invalid response length")]
    InvalidResponseLength,

    #[error("invalid response code")]
    InvalidResponseCode,

    #[error("inconsistent code")]
    InconsistentCode,

    #[error("missing CRLF")]
    MissingCrlf,

    #[error("trailing characters")]
    TrailingCharacters,

    #[error("{code} {message}")]
    Rejected { code: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Mail transaction {0} not found")]
    NotFound(u64),

    #[error("Delivery queue closed")]
    QueueClosed,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

/// SMTP size limits as defined in RFC 5321 section 4.5.3.1
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a local-part
    pub const USER_MAX_LENGTH: usize = 64;

    /// Maximum length of a domain name
    pub const DOMAIN_MAX_LENGTH: usize = 255;

    /// Maximum length of a path (reverse-path or forward-path)
    pub const PATH_MAX_LENGTH: usize = 256;

    /// Minimum length of a command line including CRLF
    pub const COMMAND_LINE_MIN_LENGTH: usize = 6;

    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a reply line including CRLF
    pub const REPLY_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a text line including CRLF
    pub const TEXT_LINE_MAX_LENGTH: usize = 1000;

    /// Maximum number of recipients per message
    pub const MAX_RECIPIENTS: usize = 100;

    /// Maximum total size of mail data held in memory
    pub const MAX_DATA_SIZE: usize = 10 * 1024 * 1024; // 10MB
}

/// Maps SMTP errors to reply codes
impl SmtpError {
    pub fn to_response_code(&self) -> u16 {
        match self {
            SmtpError::Io(_) => 421,
            SmtpError::CmdTooLong => 500,
            SmtpError::CmdSyntaxError(_) => 501,
            SmtpError::CmdUnknown => 500,
            SmtpError::BadSequence(_) => 503,
            SmtpError::PathTooLong { .. } => 501,
            SmtpError::TooManyRecipients { .. } => 452,
            SmtpError::TooMuchData { .. } => 552,
            SmtpError::AuthRequired => 530,
            SmtpError::AuthFailed => 535,
            SmtpError::NotImplemented(_) => 502,
            SmtpError::Rejected { code, .. } => *code,
            SmtpError::ConnectionClosed => 421,
            SmtpError::InvalidResponseLength
            | SmtpError::InvalidResponseCode
            | SmtpError::InconsistentCode
            | SmtpError::MissingCrlf
            | SmtpError::TrailingCharacters
            | SmtpError::Storage(_)
            | SmtpError::NotFound(_)
            | SmtpError::QueueClosed => 451,
        }
    }

    pub fn to_response_message(&self) -> String {
        match self {
            SmtpError::Io(_) | SmtpError::ConnectionClosed => {
                "Service not available, closing transmission channel".to_string()
            }
            SmtpError::CmdTooLong => "Line too long".to_string(),
            SmtpError::CmdSyntaxError(_) => "Syntax error in parameters or arguments".to_string(),
            SmtpError::CmdUnknown => "Syntax error, command unrecognized".to_string(),
            SmtpError::BadSequence(msg) => format!("Bad sequence of commands: {msg}"),
            SmtpError::PathTooLong { max } => format!("Path too long (max {max} characters)"),
            SmtpError::TooManyRecipients { .. } => {
                "Insufficient system storage: too many recipients".to_string()
            }
            SmtpError::TooMuchData { max } => format!("Too much mail data (max {max} bytes)"),
            SmtpError::AuthRequired => "Authentication required".to_string(),
            SmtpError::AuthFailed => "Authentication credentials invalid".to_string(),
            SmtpError::NotImplemented(_) => "Command not implemented".to_string(),
            SmtpError::Rejected { message, .. } => message.clone(),
            SmtpError::InvalidResponseLength
            | SmtpError::InvalidResponseCode
            | SmtpError::InconsistentCode
            | SmtpError::MissingCrlf
            | SmtpError::TrailingCharacters
            | SmtpError::Storage(_)
            | SmtpError::NotFound(_)
            | SmtpError::QueueClosed => {
                "Requested action aborted: local error in processing".to_string()
            }
        }
    }

    pub fn to_response(&self) -> SmtpResponse {
        SmtpResponse::error(self.to_response_code(), &self.to_response_message())
    }

    /// Returns true if this error must not be retried (5xx).
    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.to_response_code())
    }
}
