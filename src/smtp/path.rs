//! Reverse-path and forward-path grammar (RFC 5321 section 4.1.2)
//!
//! A path is `<[@route[,@route...]:]local@domain>` optionally followed by
//! `key=value` extension parameters. The source route is accepted and
//! discarded, comments inside the local-part are skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::smtp::error::{SmtpError, SmtpLimits};

/// Extension parameters following a path, e.g. `SIZE=1000`
pub type Params = BTreeMap<String, String>;

const ATEXT_SYMBOLS: &[u8] = b"!#$%&'*+-/=?^_`{|}~";

/// A canonical mailbox with comments and source route removed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox {
    /// Local-part, quoted strings kept verbatim including the quotes
    pub local: String,
    /// Domain or address literal; empty only for the bare `postmaster` alias
    pub domain: String,
}

impl Mailbox {
    /// Parse an unbracketed mailbox such as `user@example.com`
    pub fn parse(input: &str) -> Result<Self, SmtpError> {
        if input.eq_ignore_ascii_case("postmaster") {
            return Ok(Self {
                local: input.to_owned(),
                domain: String::new(),
            });
        }

        let (local, at) = parse_local_part(input)?;
        let domain = &input[at + 1..];
        parse_domain(domain)?;

        if local.len() > SmtpLimits::USER_MAX_LENGTH {
            return Err(syntax("local-part too long"));
        }

        Ok(Self {
            local,
            domain: domain.to_owned(),
        })
    }

    /// True for the `postmaster` alias, with or without a domain
    pub fn is_postmaster(&self) -> bool {
        self.local.eq_ignore_ascii_case("postmaster")
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{}@{}", self.local, self.domain)
        }
    }
}

impl FromStr for Mailbox {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse a bracketed path and its trailing parameters.
///
/// Returns the canonical mailbox string (empty for the null path `<>`).
pub fn parse_path(input: &str) -> Result<(String, Params), SmtpError> {
    let bytes = input.as_bytes();
    if bytes.first() != Some(&b'<') {
        return Err(syntax("path must start with '<'"));
    }

    let end = closing_bracket(bytes).ok_or_else(|| syntax("path must end with '>'"))?;
    if end + 1 > SmtpLimits::PATH_MAX_LENGTH {
        return Err(SmtpError::PathTooLong {
            max: SmtpLimits::PATH_MAX_LENGTH,
        });
    }

    let rest = &input[end + 1..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return Err(syntax("unexpected characters after path"));
    }

    let mut inner = &input[1..end];
    if inner.is_empty() {
        return Ok((String::new(), parse_params(rest)));
    }

    if inner.starts_with('@') {
        let colon = inner
            .find(':')
            .ok_or_else(|| syntax("source route without ':'"))?;
        for hop in inner[..colon].split(',') {
            let domain = hop
                .strip_prefix('@')
                .ok_or_else(|| syntax("source route hop must start with '@'"))?;
            parse_domain(domain)?;
        }
        inner = &inner[colon + 1..];
    }

    let mailbox = Mailbox::parse(inner)?;
    Ok((mailbox.to_string(), parse_params(rest)))
}

/// Split `key=value` pairs on spaces; keys without a value are ignored.
pub fn parse_params(input: &str) -> Params {
    input
        .split(' ')
        .filter_map(|param| param.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

fn syntax(msg: &str) -> SmtpError {
    SmtpError::CmdSyntaxError(msg.to_owned())
}

fn is_atext(c: u8) -> bool {
    c.is_ascii_alphanumeric() || ATEXT_SYMBOLS.contains(&c)
}

fn is_qtext(c: u8) -> bool {
    (32..=126).contains(&c)
}

/// Index of the first `>` outside quoted strings, comments and address literals.
fn closing_bracket(bytes: &[u8]) -> Option<usize> {
    let mut quoted = false;
    let mut literal = false;
    let mut comment = 0usize;
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quoted || comment > 0 => i += 1,
            b'"' if comment == 0 && !literal => quoted = !quoted,
            _ if quoted => {}
            b'(' if !literal => comment += 1,
            b')' if comment > 0 => comment -= 1,
            _ if comment > 0 => {}
            b'[' => literal = true,
            b']' => literal = false,
            b'>' if !literal => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Returns the index just past the closing `"` of a quoted string.
fn quoted_string_end(bytes: &[u8], start: usize) -> Result<usize, SmtpError> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok(i + 1),
            b'\\' => match bytes.get(i + 1) {
                Some(&c) if is_qtext(c) => i += 2,
                _ => return Err(syntax("invalid quoted-pair")),
            },
            c if is_qtext(c) => i += 1,
            _ => return Err(syntax("invalid character in quoted string")),
        }
    }
    Err(syntax("unterminated quoted string"))
}

/// Returns the index just past the closing `)` of a (possibly nested) comment.
fn comment_end(bytes: &[u8], start: usize) -> Result<usize, SmtpError> {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(syntax("unterminated comment"))
}

/// Parses the local-part, returning its canonical form and the index of `@`.
fn parse_local_part(input: &str) -> Result<(String, usize), SmtpError> {
    let bytes = input.as_bytes();
    let mut local = String::new();
    let mut quoted = false;
    let mut i = 0;

    loop {
        let Some(&c) = bytes.get(i) else {
            return Err(syntax("mailbox without '@'"));
        };
        match c {
            b'@' => break,
            b'(' => i = comment_end(bytes, i)?,
            b'"' => {
                if quoted || !local.is_empty() {
                    return Err(syntax("quoted string must be the whole local-part"));
                }
                let end = quoted_string_end(bytes, i)?;
                local.push_str(&input[i..end]);
                quoted = true;
                i = end;
            }
            b'.' if !quoted => {
                local.push('.');
                i += 1;
            }
            c if !quoted && is_atext(c) => {
                local.push(char::from(c));
                i += 1;
            }
            _ => return Err(syntax("invalid character in local-part")),
        }
    }

    if local.is_empty() {
        return Err(syntax("empty local-part"));
    }
    if !quoted && (local.starts_with('.') || local.ends_with('.') || local.contains("..")) {
        return Err(syntax("misplaced '.' in local-part"));
    }

    Ok((local, i))
}

fn parse_domain(domain: &str) -> Result<(), SmtpError> {
    if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
        return Err(syntax("domain too long"));
    }

    if let Some(literal) = domain.strip_prefix('[') {
        return match literal.strip_suffix(']') {
            Some(inner) if !inner.is_empty() && !inner.contains(['[', ']']) => Ok(()),
            _ => Err(syntax("malformed address literal")),
        };
    }

    if domain.is_empty() {
        return Err(syntax("empty domain"));
    }

    let valid = domain.split('.').all(|label| {
        !label.is_empty()
            && label
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
    });
    if !valid {
        return Err(syntax("invalid domain"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(path: &str) -> String {
        parse_path(path).unwrap().0
    }

    #[test]
    fn test_simple_path() {
        let (mailbox, params) = parse_path("<local@domain.com>").unwrap();
        assert_eq!(mailbox, "local@domain.com");
        assert!(params.is_empty());
    }

    #[test]
    fn test_null_path() {
        let (mailbox, params) = parse_path("<>").unwrap();
        assert_eq!(mailbox, "");
        assert!(params.is_empty());
    }

    #[test]
    fn test_postmaster() {
        assert_eq!(mailbox("<postmaster>"), "postmaster");
        assert_eq!(mailbox("<Postmaster>"), "Postmaster");
        assert!(Mailbox::parse("PostMaster").unwrap().is_postmaster());
        assert!(parse_path("<somebody>").is_err());
    }

    #[test]
    fn test_source_route_discarded() {
        assert_eq!(
            mailbox("<@a.example,@b.example:local@domain.com>"),
            mailbox("<local@domain.com>")
        );
        assert_eq!(mailbox("<@relay.example:x@y>"), "x@y");
        assert!(parse_path("<@relay.example,relay2:x@y>").is_err());
        assert!(parse_path("<@relay.example x@y>").is_err());
    }

    #[test]
    fn test_brackets_required() {
        assert!(matches!(
            parse_path("local@domain.com"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
        assert!(matches!(
            parse_path("<local@domain.com"),
            Err(SmtpError::CmdSyntaxError(_))
        ));
    }

    #[test]
    fn test_params() {
        let (mailbox, params) = parse_path("<a@b.c> SIZE=1000 RET=HDRS BODY").unwrap();
        assert_eq!(mailbox, "a@b.c");
        assert_eq!(params.len(), 2);
        assert_eq!(params["SIZE"], "1000");
        assert_eq!(params["RET"], "HDRS");
        assert!(parse_path("<a@b.c>SIZE=1").is_err());
    }

    #[test]
    fn test_local_part_dots() {
        assert_eq!(mailbox("<first.last@d.com>"), "first.last@d.com");
        assert!(parse_path("<.first@d.com>").is_err());
        assert!(parse_path("<first.@d.com>").is_err());
        assert!(parse_path("<first..last@d.com>").is_err());
    }

    #[test]
    fn test_local_part_symbols() {
        assert_eq!(mailbox("<a!#$%&'*+-/=?^_`{|}~z@d.com>"), "a!#$%&'*+-/=?^_`{|}~z@d.com");
        assert!(parse_path("<a,b@d.com>").is_err());
        assert!(parse_path("<a b@d.com>").is_err());
    }

    #[test]
    fn test_quoted_local_part() {
        assert_eq!(mailbox("<\"john doe\"@d.com>"), "\"john doe\"@d.com");
        assert_eq!(mailbox("<\"a\\\"b\"@d.com>"), "\"a\\\"b\"@d.com");
        assert_eq!(mailbox("<\"a>b\"@d.com>"), "\"a>b\"@d.com");
        assert!(parse_path("<\"unterminated@d.com>").is_err());
        assert!(parse_path("<\"a\"b@d.com>").is_err());
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(mailbox("<(comment)john@d.com>"), "john@d.com");
        assert_eq!(mailbox("<john(nested (comment)).doe@d.com>"), "john.doe@d.com");
        assert!(parse_path("<john(open@d.com>").is_err());

        // Comments may hold `>` and `"`
        assert_eq!(mailbox("<john(a>b)@d.com>"), "john@d.com");
        assert_eq!(mailbox("<john(say \"hi)@d.com>"), "john@d.com");
        assert_eq!(mailbox("<john(x \\) y>)@d.com> SIZE=10"), "john@d.com");
    }

    #[test]
    fn test_domains() {
        assert_eq!(mailbox("<a@sub_1.example-2.com>"), "a@sub_1.example-2.com");
        assert_eq!(mailbox("<a@[192.168.0.1]>"), "a@[192.168.0.1]");
        assert_eq!(mailbox("<a@[IPv6:::1]>"), "a@[IPv6:::1]");
        assert!(parse_path("<a@>").is_err());
        assert!(parse_path("<a@.com>").is_err());
        assert!(parse_path("<a@d..com>").is_err());
        assert!(parse_path("<a@d!.com>").is_err());
        assert!(parse_path("<a@[]>").is_err());

        // Literals are only bracket-matched
        assert_eq!(mailbox("<a@[x>y]>"), "a@[x>y]");
        assert!(parse_path("<a@[x>").is_err());
    }

    #[test]
    fn test_length_limits() {
        let long_local = "a".repeat(SmtpLimits::USER_MAX_LENGTH + 1);
        assert!(parse_path(&format!("<{long_local}@d.com>")).is_err());

        let long_path = format!("<user@{}>", "a".repeat(SmtpLimits::PATH_MAX_LENGTH));
        assert!(matches!(
            parse_path(&long_path),
            Err(SmtpError::PathTooLong { .. })
        ));
    }

    #[test]
    fn test_mailbox_roundtrip_is_stable() {
        for input in [
            "user@example.com",
            "(c)user(c)@example.com",
            "\"quoted \\\" local\"@example.com",
            "a.b.c@[10.0.0.1]",
            "postmaster",
        ] {
            let once = Mailbox::parse(input).unwrap();
            let twice = Mailbox::parse(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{input}");
        }
    }

    #[test]
    fn test_mailbox_from_str() {
        let mailbox: Mailbox = "x@y".parse().unwrap();
        assert_eq!(mailbox.local, "x");
        assert_eq!(mailbox.domain, "y");
        assert!("x@".parse::<Mailbox>().is_err());
    }
}
