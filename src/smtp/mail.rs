//! Mail transaction, the unit of work moving through the delivery pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// End of mail data indicator
pub const TERMINATOR: &[u8] = b"\r\n.\r\n";

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Returns a nanosecond timestamp based id, strictly increasing within the process.
fn next_id(received: DateTime<Utc>) -> u64 {
    let nanos = received
        .timestamp_nanos_opt()
        .map_or(0, |n| u64::try_from(n).unwrap_or(0));
    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let id = nanos.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, id, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return id,
            Err(current) => last = current,
        }
    }
}

/// A mail transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailTx {
    /// Unique id, assigned once and never changed afterwards
    pub id: u64,
    /// Reverse-path; empty for the null sender `<>`
    pub from: String,
    /// Forward-paths in the order they were given
    pub recipients: Vec<String>,
    /// Raw message, transparency dots preserved
    pub data: Vec<u8>,
    /// When the transaction arrived
    pub received: DateTime<Utc>,
    /// Number of failed delivery attempts
    pub retry: u32,
    /// Not to be retried before this instant
    pub postpone: DateTime<Utc>,
}

impl Default for MailTx {
    fn default() -> Self {
        Self {
            id: 0,
            from: String::new(),
            recipients: Vec::new(),
            data: Vec::new(),
            received: DateTime::<Utc>::UNIX_EPOCH,
            retry: 0,
            postpone: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl MailTx {
    /// Create a transaction for locally submitted data.
    ///
    /// Lines starting with `.` are dot-stuffed and bare LF line endings are
    /// converted to CRLF.
    pub fn new(from: String, recipients: Vec<String>, data: &[u8]) -> Self {
        let received = Utc::now();
        Self {
            id: next_id(received),
            from,
            recipients,
            data: format(data),
            received,
            retry: 0,
            postpone: received,
        }
    }

    /// True iff the data ends with `<CRLF>.<CRLF>`
    pub fn is_terminated(&self) -> bool {
        self.data.ends_with(TERMINATOR)
    }

    /// Remove the final `.<CRLF>`, keeping the CRLF of the last text line.
    pub fn strip_terminator(&mut self) {
        if self.data == b".\r\n" {
            self.data.clear();
        } else if self.is_terminated() {
            self.data.truncate(self.data.len() - 3);
        }
    }

    /// Stamp the arrival time and id, and prepend the `Received:` trace header.
    pub fn seal(&mut self, client_domain: &str, client_address: &str, server_address: &str) {
        self.received = Utc::now();
        self.postpone = self.received;
        self.id = next_id(self.received);

        let trace = format!(
            "Received: from {client_domain} ({client_address})\r\n\
             \tby {server_address} with ESMTP id {};\r\n\
             \t{}\r\n",
            self.id,
            self.received.format("%a, %d %b %Y %H:%M:%S %z"),
        );

        let mut data = trace.into_bytes();
        data.append(&mut self.data);
        self.data = data;
    }

    /// Split into one transaction per recipient, each with its own id.
    pub fn split(&self) -> Vec<MailTx> {
        self.recipients
            .iter()
            .map(|recipient| MailTx {
                id: next_id(self.received),
                from: self.from.clone(),
                recipients: vec![recipient.clone()],
                data: self.data.clone(),
                received: self.received,
                retry: self.retry,
                postpone: self.postpone,
            })
            .collect()
    }

    /// Record a failed attempt and push the next one back linearly.
    pub fn postpone(&mut self, interval: Duration) {
        self.retry += 1;
        let delay = chrono::Duration::from_std(interval * self.retry)
            .unwrap_or(chrono::Duration::MAX);
        self.postpone = self
            .received
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// True while the next attempt is not due yet
    pub fn is_postponed(&self) -> bool {
        self.is_postponed_at(Utc::now())
    }

    pub fn is_postponed_at(&self, now: DateTime<Utc>) -> bool {
        now < self.postpone
    }

    /// The message with transparency dots removed
    pub fn content(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(self.data.len());
        let mut line_start = true;
        for &b in &self.data {
            if line_start && b == b'.' {
                line_start = false;
                continue;
            }
            line_start = b == b'\n';
            content.push(b);
        }
        content
    }
}

/// Dot-stuff lines starting with `.` and normalize line endings to CRLF.
pub fn format(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64);
    let mut line_start = true;
    let mut prev = 0u8;
    for &b in data {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        line_start = b == b'\n';
        prev = b;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail_with_data(data: &[u8]) -> MailTx {
        MailTx {
            data: data.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_mail_creation() {
        let mail = MailTx::new(
            "sender@example.com".to_string(),
            vec!["recipient@example.com".to_string()],
            b"Subject: Test\r\n\r\nHello World\r\n",
        );

        assert_eq!(mail.from, "sender@example.com");
        assert_eq!(mail.recipients, vec!["recipient@example.com"]);
        assert_eq!(mail.data, b"Subject: Test\r\n\r\nHello World\r\n");
        assert_eq!(mail.retry, 0);
        assert!(mail.id > 0);
        assert!(!mail.is_postponed());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = MailTx::new("a@b".to_string(), vec!["c@d".to_string()], b"x\r\n");
        let b = MailTx::new("a@b".to_string(), vec!["c@d".to_string()], b"x\r\n");
        assert!(b.id > a.id);
    }

    #[test]
    fn test_is_terminated() {
        assert!(mail_with_data(b"hello\r\n.\r\n").is_terminated());
        assert!(mail_with_data(b"\r\n.\r\n").is_terminated());
        assert!(!mail_with_data(b".\r\n").is_terminated());
        assert!(!mail_with_data(b"hello\r\n").is_terminated());
        assert!(!mail_with_data(b"hello\n.\n").is_terminated());
        assert!(!mail_with_data(b"").is_terminated());
    }

    #[test]
    fn test_strip_terminator() {
        let mut mail = mail_with_data(b"hello\r\n.\r\n");
        mail.strip_terminator();
        assert_eq!(mail.data, b"hello\r\n");

        let mut mail = mail_with_data(b".\r\n");
        mail.strip_terminator();
        assert!(mail.data.is_empty());
    }

    #[test]
    fn test_format_dot_stuffing_and_line_endings() {
        let formatted = format(b".\n..\r\na.text.\n.message\r\n.\r\n");
        assert_eq!(
            formatted,
            b"..\r\n...\r\na.text.\r\n..message\r\n..\r\n".to_vec()
        );
    }

    #[test]
    fn test_format_is_idempotent_for_clean_input() {
        let clean = b"Subject: hi\r\n\r\nbody text\r\n";
        assert_eq!(format(clean), clean.to_vec());
        assert_eq!(format(&format(clean)), clean.to_vec());
    }

    #[test]
    fn test_content_unstuffs() {
        let mail = mail_with_data(b"..leading\r\nplain.\r\n...\r\n");
        assert_eq!(mail.content(), b".leading\r\nplain.\r\n..\r\n".to_vec());
    }

    #[test]
    fn test_seal_prepends_trace() {
        let mut mail = mail_with_data(b"hello\r\n");
        mail.seal("client.local", "127.0.0.1:5000", "127.0.0.1:25");

        let text = String::from_utf8(mail.data.clone()).unwrap();
        assert!(text.starts_with("Received: from client.local (127.0.0.1:5000)\r\n"));
        assert!(text.contains(&format!("with ESMTP id {};", mail.id)));
        assert!(text.ends_with("\r\nhello\r\n"));
        assert!(mail.id > 0);
    }

    #[test]
    fn test_split_per_recipient() {
        let mail = MailTx::new(
            "a@b".to_string(),
            vec!["x@y".to_string(), "z@w".to_string()],
            b"data\r\n",
        );
        let parts = mail.split();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].recipients, vec!["x@y"]);
        assert_eq!(parts[1].recipients, vec!["z@w"]);
        assert_ne!(parts[0].id, parts[1].id);
        assert_ne!(parts[0].id, mail.id);
        assert!(parts.iter().all(|p| p.data == mail.data && p.from == mail.from));
    }

    #[test]
    fn test_postpone_is_linear() {
        let mut mail = MailTx::new("a@b".to_string(), vec!["c@d".to_string()], b"x\r\n");
        let interval = Duration::from_secs(30 * 60);

        mail.postpone(interval);
        assert_eq!(mail.retry, 1);
        assert_eq!(mail.postpone - mail.received, chrono::Duration::minutes(30));
        assert!(mail.is_postponed());

        mail.postpone(interval);
        assert_eq!(mail.retry, 2);
        assert_eq!(mail.postpone - mail.received, chrono::Duration::minutes(60));
        assert!(!mail.is_postponed_at(mail.received + chrono::Duration::minutes(61)));
    }

    #[test]
    fn test_zero_interval_is_never_postponed() {
        let mut mail = MailTx::new("a@b".to_string(), vec!["c@d".to_string()], b"x\r\n");
        mail.postpone(Duration::ZERO);
        assert_eq!(mail.retry, 1);
        assert!(!mail.is_postponed());
    }
}
