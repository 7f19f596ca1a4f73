//! SMTP session state management

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info, warn};

use crate::smtp::commands::{Command, CommandKind};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::extension::Extension;
use crate::smtp::handler::Handler;
use crate::smtp::mail::MailTx;
use crate::smtp::response::SmtpResponse;

/// Last successfully completed step of an SMTP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Waiting for HELO/EHLO
    Initial,
    /// HELO/EHLO received, ready for MAIL
    Greeted,
    /// MAIL FROM received, ready for RCPT
    Mail,
    /// At least one RCPT TO received, ready for DATA or more RCPT
    Rcpt,
    /// DATA accepted, collecting mail data
    Data,
    /// QUIT received
    Quit,
}

/// Per-server settings shared by all sessions
pub struct SessionConfig {
    pub hostname: String,
    pub handler: Arc<dyn Handler>,
    pub extensions: Vec<Arc<dyn Extension>>,
    /// Client submission mode: AUTH is offered and required before MAIL
    pub submission: bool,
}

/// A SASL exchange waiting for the client's next line
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthExchange {
    PlainResponse,
    LoginUser,
    LoginPass(String),
}

/// Manages the state and data for a single SMTP connection
pub struct SmtpSession {
    /// Current state of the session
    pub state: SmtpState,
    /// Transaction in progress
    pub mail: MailTx,
    /// Client domain from HELO/EHLO
    pub client_domain: Option<String>,
    pub client_address: String,
    pub local_address: String,
    pub authenticated: bool,
    auth: Option<AuthExchange>,
    config: Arc<SessionConfig>,
}

impl SmtpSession {
    /// Create a new SMTP session
    pub fn new(config: Arc<SessionConfig>, client_address: &str, local_address: &str) -> Self {
        Self {
            state: SmtpState::Initial,
            mail: MailTx::default(),
            client_domain: None,
            client_address: client_address.to_owned(),
            local_address: local_address.to_owned(),
            authenticated: false,
            auth: None,
            config,
        }
    }

    pub fn greeting(&self) -> SmtpResponse {
        SmtpResponse::greeting(&self.config.hostname)
    }

    /// Clear the transaction, keeping the greeting and authentication
    pub fn reset(&mut self) {
        self.mail = MailTx::default();
        self.auth = None;
        self.state = if self.client_domain.is_some() {
            SmtpState::Greeted
        } else {
            SmtpState::Initial
        };
    }

    /// True while a SASL exchange expects a raw response line
    pub fn is_authenticating(&self) -> bool {
        self.auth.is_some()
    }

    /// Check whether a command is allowed in the current state
    pub fn can_execute_command(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Mail => self.state == SmtpState::Greeted,
            CommandKind::Rcpt => matches!(self.state, SmtpState::Mail | SmtpState::Rcpt),
            CommandKind::Data => self.state == SmtpState::Rcpt,
            CommandKind::Auth => self.state == SmtpState::Greeted && !self.authenticated,
            _ => self.state != SmtpState::Quit,
        }
    }

    /// Process one command and return the reply to send.
    ///
    /// A sequencing error resets the transaction; other errors leave the
    /// session untouched.
    pub fn handle(&mut self, cmd: &Command) -> SmtpResponse {
        match self.process(cmd) {
            Ok(response) => response,
            Err(e) => {
                debug!(client = %self.client_address, kind = ?cmd.kind, error = %e, "command rejected");
                if matches!(e, SmtpError::BadSequence(_)) {
                    self.reset();
                }
                e.to_response()
            }
        }
    }

    fn process(&mut self, cmd: &Command) -> Result<SmtpResponse, SmtpError> {
        for ext in &self.config.extensions {
            ext.validate_command(cmd)?;
        }

        match cmd.kind {
            CommandKind::Helo => {
                self.set_client_domain(&cmd.arg);
                Ok(SmtpResponse::helo(&self.config.hostname, &cmd.arg))
            }
            CommandKind::Ehlo => {
                self.set_client_domain(&cmd.arg);
                Ok(SmtpResponse::ehlo(
                    &self.config.hostname,
                    &cmd.arg,
                    self.capabilities(),
                ))
            }
            CommandKind::Mail => self.set_sender(&cmd.arg),
            CommandKind::Rcpt => self.add_recipient(&cmd.arg),
            CommandKind::Data => self.start_data_mode(),
            CommandKind::Rset => {
                self.reset();
                Ok(SmtpResponse::ok())
            }
            CommandKind::Vrfy => self.config.handler.serve_verify(&cmd.arg),
            CommandKind::Expn => self.config.handler.serve_expand(&cmd.arg),
            CommandKind::Help => Ok(self.help()),
            CommandKind::Noop => Ok(SmtpResponse::ok()),
            CommandKind::Quit => {
                self.state = SmtpState::Quit;
                Ok(SmtpResponse::quit())
            }
            CommandKind::Auth => self.start_auth(cmd),
            CommandKind::Unknown => Err(SmtpError::CmdUnknown),
        }
    }

    fn capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = self
            .config
            .extensions
            .iter()
            .map(|ext| ext.ehlo_line())
            .collect();
        if self.config.submission {
            capabilities.push("AUTH PLAIN LOGIN".to_owned());
        }
        capabilities
    }

    fn help(&self) -> SmtpResponse {
        let mut verbs = "HELO EHLO MAIL RCPT DATA RSET VRFY EXPN HELP NOOP QUIT".to_owned();
        if self.config.submission {
            verbs.push_str(" AUTH");
        }
        SmtpResponse::new(214, &format!("Supported commands: {verbs}"))
    }

    fn set_client_domain(&mut self, domain: &str) {
        self.client_domain = Some(domain.to_owned());
        self.reset();
    }

    fn set_sender(&mut self, sender: &str) -> Result<SmtpResponse, SmtpError> {
        match self.state {
            SmtpState::Initial => {
                return Err(SmtpError::BadSequence("send HELO/EHLO first".to_string()));
            }
            SmtpState::Mail | SmtpState::Rcpt => {
                return Err(SmtpError::BadSequence("nested MAIL command".to_string()));
            }
            _ => {}
        }
        if self.config.submission && !self.authenticated {
            return Err(SmtpError::AuthRequired);
        }

        self.mail = MailTx {
            from: sender.to_owned(),
            ..Default::default()
        };
        self.state = SmtpState::Mail;
        Ok(SmtpResponse::ok())
    }

    fn add_recipient(&mut self, recipient: &str) -> Result<SmtpResponse, SmtpError> {
        if !self.can_execute_command(CommandKind::Rcpt) {
            return Err(SmtpError::BadSequence("need MAIL before RCPT".to_string()));
        }
        if recipient.is_empty() {
            return Err(SmtpError::CmdSyntaxError(
                "empty forward-path".to_string(),
            ));
        }
        if self.mail.recipients.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        self.mail.recipients.push(recipient.to_owned());
        self.state = SmtpState::Rcpt;
        Ok(SmtpResponse::ok())
    }

    fn start_data_mode(&mut self) -> Result<SmtpResponse, SmtpError> {
        if !self.can_execute_command(CommandKind::Data) {
            return Err(SmtpError::BadSequence("need RCPT before DATA".to_string()));
        }

        self.mail.data.clear();
        self.state = SmtpState::Data;
        Ok(SmtpResponse::data_start())
    }

    /// Strip the terminator, seal the transaction and hand it over.
    pub fn finish_data(&mut self) -> MailTx {
        self.mail.strip_terminator();
        let client_domain = self.client_domain.clone().unwrap_or_default();
        let server = format!("{} ({})", self.config.hostname, self.local_address);
        self.mail.seal(&client_domain, &self.client_address, &server);

        let mail = std::mem::take(&mut self.mail);
        self.reset();
        mail
    }

    fn start_auth(&mut self, cmd: &Command) -> Result<SmtpResponse, SmtpError> {
        if !self.config.submission {
            return Err(SmtpError::NotImplemented("AUTH".to_string()));
        }
        if self.authenticated {
            return Err(SmtpError::BadSequence("already authenticated".to_string()));
        }
        if !self.can_execute_command(CommandKind::Auth) {
            return Err(SmtpError::BadSequence(
                "AUTH not permitted here".to_string(),
            ));
        }

        match (cmd.arg.as_str(), cmd.initial_response()) {
            ("PLAIN", Some(initial)) => self.finish_plain(initial),
            ("PLAIN", None) => {
                self.auth = Some(AuthExchange::PlainResponse);
                Ok(SmtpResponse::new(334, ""))
            }
            ("LOGIN", Some(initial)) => {
                let user = decode(initial)?;
                self.auth = Some(AuthExchange::LoginPass(user));
                Ok(SmtpResponse::new(334, &BASE64.encode("Password:")))
            }
            ("LOGIN", None) => {
                self.auth = Some(AuthExchange::LoginUser);
                Ok(SmtpResponse::new(334, &BASE64.encode("Username:")))
            }
            _ => Err(SmtpError::Rejected {
                code: 504,
                message: "Unrecognized authentication type".to_string(),
            }),
        }
    }

    /// Feed the client's response line to a pending SASL exchange
    pub fn continue_auth(&mut self, line: &str) -> SmtpResponse {
        let Some(exchange) = self.auth.take() else {
            return SmtpError::BadSequence("no authentication in progress".to_string())
                .to_response();
        };

        let line = line.trim_end_matches(['\r', '\n']);
        if line == "*" {
            return SmtpResponse::new(501, "Authentication cancelled");
        }

        let result = match exchange {
            AuthExchange::PlainResponse => self.finish_plain(line),
            AuthExchange::LoginUser => decode(line).map(|user| {
                self.auth = Some(AuthExchange::LoginPass(user));
                SmtpResponse::new(334, &BASE64.encode("Password:"))
            }),
            AuthExchange::LoginPass(user) => {
                decode(line).and_then(|pass| self.check_credentials(&user, &pass))
            }
        };
        result.unwrap_or_else(|e| e.to_response())
    }

    fn finish_plain(&mut self, response: &str) -> Result<SmtpResponse, SmtpError> {
        let decoded = decode(response)?;
        if decoded.is_empty() {
            return Err(SmtpError::AuthFailed);
        }
        let mut parts = decoded.split('\0');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_authzid), Some(user), Some(pass), None) => self.check_credentials(user, pass),
            _ => Err(SmtpError::CmdSyntaxError(
                "malformed PLAIN response".to_string(),
            )),
        }
    }

    fn check_credentials(&mut self, user: &str, pass: &str) -> Result<SmtpResponse, SmtpError> {
        match self.config.handler.serve_auth(user, pass) {
            Ok(response) => {
                info!(client = %self.client_address, user, "authenticated");
                self.authenticated = true;
                Ok(response)
            }
            Err(e) => {
                warn!(client = %self.client_address, user, "authentication failed");
                Err(e)
            }
        }
    }
}

fn decode(encoded: &str) -> Result<String, SmtpError> {
    let encoded = encoded.trim();
    // A lone "=" is a zero-length response
    if encoded == "=" {
        return Ok(String::new());
    }
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| SmtpError::CmdSyntaxError("invalid base64".to_string()))?;
    String::from_utf8(bytes).map_err(|_| SmtpError::CmdSyntaxError("invalid UTF-8".to_string()))
}
