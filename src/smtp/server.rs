//! SMTP server implementation

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, trace, warn};

use crate::smtp::commands::Command;
use crate::smtp::delivery::{DeliveryConfig, NoRelay, Pipeline, Relay, RetryPolicy};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::extension::Extension;
use crate::smtp::handler::Handler;
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{SessionConfig, SmtpSession, SmtpState};
use crate::smtp::storage::Storage;

/// SMTP server: accepts connections and feeds the delivery pipeline
#[derive(Clone)]
pub struct SmtpServer {
    /// Server hostname
    hostname: String,
    local_domains: Vec<String>,
    handler: Arc<dyn Handler>,
    storage: Arc<dyn Storage>,
    relay: Arc<dyn Relay>,
    extensions: Vec<Arc<dyn Extension>>,
    submission: bool,
    retry: RetryPolicy,
}

impl SmtpServer {
    /// Create a new SMTP server; `hostname` is also its first local domain
    pub fn new(hostname: &str, handler: Arc<dyn Handler>, storage: Arc<dyn Storage>) -> Self {
        Self {
            hostname: hostname.to_owned(),
            local_domains: vec![hostname.to_owned()],
            handler,
            storage,
            relay: Arc::new(NoRelay),
            extensions: Vec::new(),
            submission: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Accept mail for another domain
    pub fn with_local_domain(mut self, domain: &str) -> Self {
        self.local_domains.push(domain.to_owned());
        self
    }

    /// Register an extension, advertised in EHLO in registration order
    pub fn with_extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Require AUTH before MAIL (client submission)
    pub fn with_submission(mut self, submission: bool) -> Self {
        self.submission = submission;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_relay(mut self, relay: impl Relay + 'static) -> Self {
        self.relay = Arc::new(relay);
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Start the server on the specified address (blocking)
    pub fn start(&self, addr: &str) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(addr)?;
        self.start_with_listener(listener)
    }

    /// Start the server with an existing listener (blocking)
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), SmtpError> {
        info!(addr = %listener.local_addr()?, hostname = %self.hostname, "SMTP server listening");

        let pipeline = self.spawn_pipeline()?;
        if let Err(e) = pipeline.recover() {
            error!(error = %e, "failed to recover pending mail");
        }

        let config = self.session_config();
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let config = Arc::clone(&config);
                    let pipeline = pipeline.clone();
                    let spawned = thread::Builder::new()
                        .name("smtp-session".to_string())
                        .spawn(move || {
                            if let Err(e) = serve_stream(stream, config, &pipeline) {
                                warn!(error = %e, "error handling client");
                            }
                        });
                    if let Err(e) = spawned {
                        error!(error = %e, "failed to spawn session thread");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "error accepting connection");
                }
            }
        }

        Ok(())
    }

    /// Start the delivery workers
    pub fn spawn_pipeline(&self) -> Result<Pipeline, SmtpError> {
        Pipeline::spawn(DeliveryConfig {
            local_domains: self.local_domains.clone(),
            handler: Arc::clone(&self.handler),
            storage: Arc::clone(&self.storage),
            relay: Arc::clone(&self.relay),
            retry: self.retry,
        })
    }

    pub fn session_config(&self) -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            hostname: self.hostname.clone(),
            handler: Arc::clone(&self.handler),
            extensions: self.extensions.clone(),
            submission: self.submission,
        })
    }
}

fn serve_stream(
    stream: TcpStream,
    config: Arc<SessionConfig>,
    pipeline: &Pipeline,
) -> Result<(), SmtpError> {
    let client = stream.peer_addr()?.to_string();
    let local = stream.local_addr()?.to_string();
    info!(client = %client, "connection opened");

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut session = SmtpSession::new(config, &client, &local);

    let result = handle_client(&mut session, &mut reader, &mut writer, pipeline);
    info!(client = %client, "connection closed");
    result
}

/// Run one session to completion: greeting, commands, DATA, QUIT.
///
/// Returns after QUIT or when the client goes away; the caller closes the
/// connection.
pub fn handle_client<R: BufRead, W: Write>(
    session: &mut SmtpSession,
    reader: &mut R,
    writer: &mut W,
    pipeline: &Pipeline,
) -> Result<(), SmtpError> {
    send_response(writer, &session.greeting())?;

    let mut line = Vec::new();
    loop {
        line.clear();
        if read_line(reader, &mut line, SmtpLimits::COMMAND_LINE_MAX_LENGTH)? == 0 {
            debug!(client = %session.client_address, "client disconnected");
            return Ok(());
        }

        if session.is_authenticating() {
            let response = session.continue_auth(&String::from_utf8_lossy(&line));
            send_response(writer, &response)?;
            continue;
        }

        let response = match Command::unpack(&line) {
            Ok(cmd) => {
                trace!(client = %session.client_address, "recv: {}", String::from_utf8_lossy(&line).trim_end());
                session.handle(&cmd)
            }
            Err(e) => e.to_response(),
        };
        send_response(writer, &response)?;

        match session.state {
            SmtpState::Quit => return Ok(()),
            SmtpState::Data => {
                let response = receive_data(session, reader, pipeline)?;
                send_response(writer, &response)?;
            }
            _ => {}
        }
    }
}

/// Read mail data until `<CRLF>.<CRLF>` and hand the transaction over.
fn receive_data<R: BufRead>(
    session: &mut SmtpSession,
    reader: &mut R,
    pipeline: &Pipeline,
) -> Result<SmtpResponse, SmtpError> {
    let mut too_large = false;
    loop {
        let n = reader
            .by_ref()
            .take(SmtpLimits::TEXT_LINE_MAX_LENGTH as u64)
            .read_until(b'\n', &mut session.mail.data)?;
        if n == 0 {
            return Err(SmtpError::ConnectionClosed);
        }
        if session.mail.data == b".\r\n" || session.mail.is_terminated() {
            break;
        }

        let data = &mut session.mail.data;
        if data.len() > SmtpLimits::MAX_DATA_SIZE {
            // Keep only what the terminator check needs
            too_large = true;
            let keep_from = data.len() - 4;
            data.drain(..keep_from);
        }
    }

    if too_large {
        session.reset();
        return Ok(SmtpError::TooMuchData {
            max: SmtpLimits::MAX_DATA_SIZE,
        }
        .to_response());
    }

    let mail = session.finish_data();
    let id = mail.id;
    info!(
        id,
        from = %mail.from,
        recipients = mail.recipients.len(),
        size = mail.data.len(),
        "mail transaction received"
    );

    match pipeline.process_mail_tx(mail) {
        Ok(()) => Ok(SmtpResponse::new(250, &format!("OK queued as {id}"))),
        Err(e) => {
            error!(id, error = %e, "failed to queue mail transaction");
            Ok(e.to_response())
        }
    }
}

/// Read one line of at most `max` bytes; longer lines are consumed up to
/// their end and returned truncated to `max + 1` bytes.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> Result<usize, SmtpError> {
    let limit = max as u64 + 1;
    let n = reader.by_ref().take(limit).read_until(b'\n', buf)?;
    if n as u64 == limit && buf.last() != Some(&b'\n') {
        let mut rest = Vec::new();
        loop {
            rest.clear();
            let m = reader.by_ref().take(limit).read_until(b'\n', &mut rest)?;
            if m == 0 || rest.last() == Some(&b'\n') {
                break;
            }
        }
    }
    Ok(n)
}

/// Send a response to the client
fn send_response<W: Write>(writer: &mut W, response: &SmtpResponse) -> Result<(), SmtpError> {
    let formatted = response.format();
    if response.body.is_empty() && formatted.len() > SmtpLimits::REPLY_LINE_MAX_LENGTH {
        let truncated = SmtpResponse::new(response.code, "Response too long (truncated)");
        writer.write_all(truncated.format().as_bytes())?;
    } else {
        writer.write_all(formatted.as_bytes())?;
    }
    writer.flush()?;
    trace!("send: {}", formatted.trim_end());
    Ok(())
}
