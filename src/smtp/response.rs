//! SMTP reply formatting and parsing

use crate::smtp::error::SmtpError;

/// An SMTP reply, either built by the server or parsed from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// The three digit reply code (e.g. 250, 354, 500)
    pub code: u16,
    /// Text of the first reply line
    pub message: String,
    /// Additional lines of a multi-line reply, in order
    pub body: Vec<String>,
}

impl SmtpResponse {
    /// Create a new single line response
    pub fn new(code: u16, message: &str) -> Self {
        Self {
            code,
            message: message.to_owned(),
            body: Vec::new(),
        }
    }

    /// Create a new multi-line response
    pub fn new_multiline(code: u16, message: &str, body: Vec<String>) -> Self {
        Self {
            code,
            message: message.to_owned(),
            body,
        }
    }

    /// Parse a raw reply as received from a server.
    ///
    /// Single line: `250 OK\r\n`.
    /// Multi-line: `250-first\r\n250-second\r\n250 last\r\n`, where every
    /// continuation line repeats the code and the last one uses a space.
    pub fn parse(raw: &[u8]) -> Result<Self, SmtpError> {
        if raw.len() < 5 {
            return Err(SmtpError::InvalidResponseLength);
        }

        let code_bytes = &raw[..3];
        if !code_bytes.iter().all(u8::is_ascii_digit) {
            return Err(SmtpError::InvalidResponseCode);
        }
        let code = code_bytes
            .iter()
            .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'));

        let multiline = match raw[3] {
            b'-' => true,
            b' ' => false,
            _ => return Err(SmtpError::InvalidResponseCode),
        };

        let (first, mut rest) = split_line(&raw[4..])?;
        let message = String::from_utf8_lossy(first).trim().to_owned();

        let mut body = Vec::new();
        if multiline {
            loop {
                if rest.is_empty() {
                    return Err(SmtpError::MissingCrlf);
                }
                if rest.len() < 4 {
                    return Err(SmtpError::InvalidResponseLength);
                }
                if &rest[..3] != code_bytes {
                    return Err(SmtpError::InconsistentCode);
                }
                let last = match rest[3] {
                    b'-' => false,
                    b' ' => true,
                    _ => return Err(SmtpError::InvalidResponseCode),
                };

                let (line, next) = split_line(&rest[4..])?;
                let line = String::from_utf8_lossy(line).trim().to_owned();
                if !line.is_empty() {
                    body.push(line);
                }
                rest = next;

                if last {
                    break;
                }
            }
        }

        if !rest.is_empty() {
            return Err(SmtpError::TrailingCharacters);
        }

        Ok(Self {
            code,
            message,
            body,
        })
    }

    /// Create a success response (250 OK)
    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// Create a greeting response (220)
    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, &format!("{hostname} ESMTP Service ready"))
    }

    /// Create a HELO response (250)
    pub fn helo(hostname: &str, client_domain: &str) -> Self {
        Self::new(250, &format!("{hostname} Hello {client_domain}"))
    }

    /// Create an EHLO response (250) advertising one line per extension
    pub fn ehlo(hostname: &str, client_domain: &str, capabilities: Vec<String>) -> Self {
        Self::new_multiline(
            250,
            &format!("{hostname} Hello {client_domain}"),
            capabilities,
        )
    }

    /// Create a DATA intermediate response (354)
    pub fn data_start() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    /// Create a QUIT response (221)
    pub fn quit() -> Self {
        Self::new(221, "Service closing transmission channel")
    }

    /// Create an error response
    pub fn error(code: u16, message: &str) -> Self {
        Self::new(code, message)
    }

    /// Format the response for sending over the wire
    pub fn format(&self) -> String {
        if self.body.is_empty() {
            return format!("{} {}\r\n", self.code, self.message);
        }

        let mut result = format!("{}-{}\r\n", self.code, self.message);
        for (i, line) in self.body.iter().enumerate() {
            let sep = if i == self.body.len() - 1 { ' ' } else { '-' };
            result.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        result
    }

    /// Check if this is a success response (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is an intermediate response (3xx)
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Check if this is an error response (4xx or 5xx)
    pub fn is_error(&self) -> bool {
        (400..600).contains(&self.code)
    }
}

/// Splits off one CRLF terminated line.
fn split_line(input: &[u8]) -> Result<(&[u8], &[u8]), SmtpError> {
    input
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| (&input[..pos], &input[pos + 2..]))
        .ok_or(SmtpError::MissingCrlf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_creation() {
        let response = SmtpResponse::new(250, "OK");
        assert_eq!(response.code, 250);
        assert_eq!(response.message, "OK");
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_greeting_response() {
        let response = SmtpResponse::greeting("mx.local");
        assert_eq!(response.code, 220);
        assert!(response.message.starts_with("mx.local"));
    }

    #[test]
    fn test_helo_response() {
        let response = SmtpResponse::helo("server.local", "client.local");
        assert_eq!(response.code, 250);
        assert_eq!(response.message, "server.local Hello client.local");
    }

    #[test]
    fn test_ehlo_response() {
        let response = SmtpResponse::ehlo(
            "server.local",
            "client.local",
            vec!["DSN".to_owned(), "SIZE 1000".to_owned()],
        );
        let formatted = response.format();
        assert_eq!(
            formatted,
            "250-server.local Hello client.local\r\n250-DSN\r\n250 SIZE 1000\r\n"
        );
    }

    #[test]
    fn test_format() {
        assert_eq!(SmtpResponse::ok().format(), "250 OK\r\n");
        assert_eq!(
            SmtpResponse::quit().format(),
            "221 Service closing transmission channel\r\n"
        );
    }

    #[test]
    fn test_parse_single_line() {
        let response = SmtpResponse::parse(b"250 OK\r\n").unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message, "OK");
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_parse_multiline() {
        let response = SmtpResponse::parse(b"220-a\r\n220-b\r\n220 c\r\n").unwrap();
        assert_eq!(response.code, 220);
        assert_eq!(response.message, "a");
        assert_eq!(response.body, vec!["b", "c"]);
    }

    #[test]
    fn test_parse_formatted_ehlo() {
        let response = SmtpResponse::ehlo("mx", "client", vec!["DSN".to_owned()]);
        let parsed = SmtpResponse::parse(response.format().as_bytes()).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_parse_skips_empty_body_lines() {
        let response = SmtpResponse::parse(b"250-a\r\n250- \r\n250 c\r\n").unwrap();
        assert_eq!(response.body, vec!["c"]);
    }

    #[test]
    fn test_parse_inconsistent_code() {
        let result = SmtpResponse::parse(b"220-a\r\n210-b\r\n220 c\r\n");
        assert!(matches!(result, Err(SmtpError::InconsistentCode)));
        assert_eq!(result.unwrap_err().to_string(), "inconsistent code");
    }

    #[test]
    fn test_parse_too_short() {
        assert!(matches!(
            SmtpResponse::parse(b"250\r"),
            Err(SmtpError::InvalidResponseLength)
        ));
    }

    #[test]
    fn test_parse_bad_code() {
        assert!(matches!(
            SmtpResponse::parse(b"2x0 OK\r\n"),
            Err(SmtpError::InvalidResponseCode)
        ));
        assert!(matches!(
            SmtpResponse::parse(b"250_OK\r\n"),
            Err(SmtpError::InvalidResponseCode)
        ));
    }

    #[test]
    fn test_parse_missing_terminal_line() {
        assert!(matches!(
            SmtpResponse::parse(b"250-a\r\n250-b\r\n"),
            Err(SmtpError::MissingCrlf)
        ));
        assert!(matches!(
            SmtpResponse::parse(b"250 OK"),
            Err(SmtpError::MissingCrlf)
        ));
    }

    #[test]
    fn test_parse_trailing_characters() {
        assert!(matches!(
            SmtpResponse::parse(b"250 OK\r\nextra"),
            Err(SmtpError::TrailingCharacters)
        ));
        assert!(matches!(
            SmtpResponse::parse(b"250-a\r\n250 b\r\n250 c\r\n"),
            Err(SmtpError::TrailingCharacters)
        ));
    }

    #[test]
    fn test_is_success() {
        assert!(SmtpResponse::new(250, "OK").is_success());
        assert!(!SmtpResponse::new(500, "Error").is_success());
        assert!(SmtpResponse::data_start().is_intermediate());
    }

    #[test]
    fn test_is_error() {
        assert!(SmtpResponse::new(500, "Error").is_error());
        assert!(SmtpResponse::new(421, "Service not available").is_error());
        assert!(!SmtpResponse::new(250, "OK").is_error());
    }
}
