//! SMTP command grammar

use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::path::{Params, parse_path};

/// The verb of a client command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    #[default]
    Unknown,
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Vrfy,
    Expn,
    Help,
    Noop,
    Quit,
    Auth,
}

/// Keyword table, longest keywords first so `MAIL FROM:` wins over a bare verb.
const KEYWORDS: &[(&str, CommandKind)] = &[
    ("MAIL FROM:", CommandKind::Mail),
    ("RCPT TO:", CommandKind::Rcpt),
    ("HELO", CommandKind::Helo),
    ("EHLO", CommandKind::Ehlo),
    ("DATA", CommandKind::Data),
    ("RSET", CommandKind::Rset),
    ("VRFY", CommandKind::Vrfy),
    ("EXPN", CommandKind::Expn),
    ("HELP", CommandKind::Help),
    ("NOOP", CommandKind::Noop),
    ("QUIT", CommandKind::Quit),
    ("AUTH", CommandKind::Auth),
];

/// Parameter key holding the optional initial response of `AUTH`
pub const AUTH_INITIAL_RESPONSE: &str = "INITIAL-RESPONSE";

/// One parsed client command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub arg: String,
    pub params: Params,
}

impl Command {
    /// Parse one CRLF terminated command line
    pub fn unpack(raw: &[u8]) -> Result<Self, SmtpError> {
        if raw.len() < SmtpLimits::COMMAND_LINE_MIN_LENGTH
            || raw.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH
        {
            return Err(SmtpError::CmdTooLong);
        }

        let line = raw
            .strip_suffix(b"\r\n")
            .ok_or_else(|| SmtpError::CmdSyntaxError("line must end with CRLF".to_string()))?;
        let line = std::str::from_utf8(line)
            .map_err(|_| SmtpError::CmdSyntaxError("non UTF-8 command".to_string()))?
            .trim_end_matches(' ');

        let (keyword, kind) = KEYWORDS
            .iter()
            .find(|(keyword, _)| {
                line.get(..keyword.len())
                    .is_some_and(|verb| verb.eq_ignore_ascii_case(keyword))
            })
            .ok_or(SmtpError::CmdUnknown)?;

        let rest = &line[keyword.len()..];
        let is_verb_only = !keyword.ends_with(':');
        if is_verb_only && !rest.is_empty() && !rest.starts_with(' ') {
            // e.g. "DATAX"
            return Err(SmtpError::CmdUnknown);
        }
        let rest = rest.trim_start_matches(' ');

        let mut command = Command {
            kind: *kind,
            ..Default::default()
        };

        match command.kind {
            CommandKind::Mail | CommandKind::Rcpt => {
                let (mailbox, params) = parse_path(rest)?;
                command.arg = mailbox;
                command.params = params;
            }
            CommandKind::Helo | CommandKind::Ehlo => {
                if rest.is_empty() {
                    return Err(SmtpError::CmdSyntaxError(
                        "domain argument required".to_string(),
                    ));
                }
                command.arg = rest.to_owned();
            }
            CommandKind::Vrfy | CommandKind::Expn => {
                if rest.is_empty() {
                    return Err(SmtpError::CmdSyntaxError("argument required".to_string()));
                }
                command.arg = rest.to_owned();
            }
            CommandKind::Auth => {
                let mut tokens = rest.split(' ').filter(|t| !t.is_empty());
                let mechanism = tokens.next().ok_or_else(|| {
                    SmtpError::CmdSyntaxError("mechanism argument required".to_string())
                })?;
                command.arg = mechanism.to_ascii_uppercase();
                if let Some(initial) = tokens.next() {
                    command
                        .params
                        .insert(AUTH_INITIAL_RESPONSE.to_owned(), initial.to_owned());
                }
                if tokens.next().is_some() {
                    return Err(SmtpError::CmdSyntaxError(
                        "too many AUTH arguments".to_string(),
                    ));
                }
            }
            CommandKind::Data | CommandKind::Rset | CommandKind::Quit => {
                if !rest.is_empty() {
                    return Err(SmtpError::CmdSyntaxError(
                        "command takes no arguments".to_string(),
                    ));
                }
            }
            CommandKind::Help | CommandKind::Noop => command.arg = rest.to_owned(),
            CommandKind::Unknown => return Err(SmtpError::CmdUnknown),
        }

        Ok(command)
    }

    /// Initial SASL response supplied on the `AUTH` line, if any
    pub fn initial_response(&self) -> Option<&str> {
        self.params.get(AUTH_INITIAL_RESPONSE).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpack(line: &str) -> Result<Command, SmtpError> {
        Command::unpack(line.as_bytes())
    }

    #[test]
    fn test_mail_with_params() {
        let command = unpack("MAIL FROM:<local@domain.com> key=value\r\n").unwrap();
        assert_eq!(command.kind, CommandKind::Mail);
        assert_eq!(command.arg, "local@domain.com");
        assert_eq!(command.params.len(), 1);
        assert_eq!(command.params["key"], "value");
    }

    #[test]
    fn test_rcpt() {
        let command = unpack("rcpt to:<@relay:a@b.c>\r\n").unwrap();
        assert_eq!(command.kind, CommandKind::Rcpt);
        assert_eq!(command.arg, "a@b.c");
        assert!(command.params.is_empty());
    }

    #[test]
    fn test_mail_null_path() {
        let command = unpack("MAIL FROM:<>\r\n").unwrap();
        assert_eq!(command.kind, CommandKind::Mail);
        assert_eq!(command.arg, "");
    }

    #[test]
    fn test_mail_space_after_colon() {
        let command = unpack("MAIL FROM: <x@y>\r\n").unwrap();
        assert_eq!(command.arg, "x@y");
    }

    #[test]
    fn test_mail_bad_path() {
        assert!(matches!(
            unpack("MAIL FROM:x@y\r\n"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
        assert!(matches!(
            unpack("RCPT TO:<x..y@z>\r\n"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
    }

    #[test]
    fn test_helo_and_ehlo() {
        let command = unpack("HELO client.local\r\n").unwrap();
        assert_eq!(command.kind, CommandKind::Helo);
        assert_eq!(command.arg, "client.local");

        let command = unpack("ehlo client.local   \r\n").unwrap();
        assert_eq!(command.kind, CommandKind::Ehlo);
        assert_eq!(command.arg, "client.local");

        assert!(matches!(
            unpack("HELO\r\n"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
    }

    #[test]
    fn test_simple_verbs() {
        for (line, kind) in [
            ("DATA\r\n", CommandKind::Data),
            ("RSET\r\n", CommandKind::Rset),
            ("NOOP\r\n", CommandKind::Noop),
            ("HELP\r\n", CommandKind::Help),
            ("quit\r\n", CommandKind::Quit),
        ] {
            assert_eq!(unpack(line).unwrap().kind, kind, "{line:?}");
        }
        assert_eq!(unpack("NOOP ping\r\n").unwrap().arg, "ping");
        assert!(unpack("DATA now\r\n").is_err());
    }

    #[test]
    fn test_vrfy_and_expn_require_argument() {
        let command = unpack("VRFY postmaster\r\n").unwrap();
        assert_eq!(command.kind, CommandKind::Vrfy);
        assert_eq!(command.arg, "postmaster");
        assert_eq!(unpack("EXPN staff\r\n").unwrap().kind, CommandKind::Expn);

        assert!(matches!(
            unpack("VRFY\r\n"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
        assert!(matches!(
            unpack("EXPN  \r\n"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
    }

    #[test]
    fn test_auth() {
        let command = unpack("AUTH plain AGZvbwBiYXI=\r\n").unwrap();
        assert_eq!(command.kind, CommandKind::Auth);
        assert_eq!(command.arg, "PLAIN");
        assert_eq!(command.initial_response(), Some("AGZvbwBiYXI="));

        let command = unpack("AUTH LOGIN\r\n").unwrap();
        assert_eq!(command.arg, "LOGIN");
        assert_eq!(command.initial_response(), None);

        assert!(unpack("AUTH\r\n").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(unpack("STARTTLS\r\n"), Err(SmtpError::CmdUnknown)));
        assert!(matches!(unpack("DATAX\r\n"), Err(SmtpError::CmdUnknown)));
        assert!(matches!(unpack("MAIL x@y\r\n"), Err(SmtpError::CmdUnknown)));
    }

    #[test]
    fn test_length_limits() {
        assert!(matches!(unpack("QUI\r\n"), Err(SmtpError::CmdTooLong)));

        let long = format!("HELO {}\r\n", "a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH));
        assert!(matches!(unpack(&long), Err(SmtpError::CmdTooLong)));
    }

    #[test]
    fn test_crlf_required() {
        assert!(matches!(
            unpack("NOOP ping\n"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
    }
}
