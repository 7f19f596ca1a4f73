//! SMTP service extensions advertised in the EHLO reply

use crate::smtp::commands::{Command, CommandKind};
use crate::smtp::error::SmtpError;

/// A service extension.
///
/// Every command is passed through `validate_command` before the session
/// acts on it; the first error becomes the reply.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn params(&self) -> Vec<String> {
        Vec::new()
    }

    fn validate_command(&self, cmd: &Command) -> Result<(), SmtpError>;

    /// The EHLO keyword line, e.g. `SIZE 10485760`
    fn ehlo_line(&self) -> String {
        let params = self.params();
        if params.is_empty() {
            self.name().to_owned()
        } else {
            format!("{} {}", self.name(), params.join(" "))
        }
    }
}

fn invalid_param(message: &str) -> SmtpError {
    SmtpError::Rejected {
        code: 501,
        message: message.to_owned(),
    }
}

/// Delivery status notifications (RFC 3461)
#[derive(Debug, Default, Clone, Copy)]
pub struct DsnExtension;

impl Extension for DsnExtension {
    fn name(&self) -> &str {
        "DSN"
    }

    fn validate_command(&self, cmd: &Command) -> Result<(), SmtpError> {
        match cmd.kind {
            CommandKind::Mail => {
                let ret_valid = |ret: &String| {
                    ret.eq_ignore_ascii_case("FULL") || ret.eq_ignore_ascii_case("HDRS")
                };
                if cmd.params.get("RET").is_some_and(|ret| !ret_valid(ret)) {
                    return Err(invalid_param("RET must be FULL or HDRS"));
                }
                if cmd.params.get("ENVID").is_some_and(String::is_empty) {
                    return Err(invalid_param("ENVID must not be empty"));
                }
            }
            CommandKind::Rcpt => {
                if let Some(notify) = cmd.params.get("NOTIFY") {
                    let values: Vec<&str> = notify.split(',').collect();
                    let never = values.iter().any(|v| v.eq_ignore_ascii_case("NEVER"));
                    let known = values.iter().all(|v| {
                        ["NEVER", "SUCCESS", "FAILURE", "DELAY"]
                            .iter()
                            .any(|k| v.eq_ignore_ascii_case(k))
                    });
                    if !known || (never && values.len() > 1) {
                        return Err(invalid_param(
                            "NOTIFY must be NEVER or a list of SUCCESS, FAILURE, DELAY",
                        ));
                    }
                }
                if cmd.params.get("ORCPT").is_some_and(|o| !o.contains(';')) {
                    return Err(invalid_param("ORCPT must be addr-type;address"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Message size declaration (RFC 1870)
#[derive(Debug, Clone, Copy)]
pub struct SizeExtension {
    max: usize,
}

impl SizeExtension {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl Extension for SizeExtension {
    fn name(&self) -> &str {
        "SIZE"
    }

    fn params(&self) -> Vec<String> {
        vec![self.max.to_string()]
    }

    fn validate_command(&self, cmd: &Command) -> Result<(), SmtpError> {
        if cmd.kind != CommandKind::Mail {
            return Ok(());
        }
        let Some(size) = cmd.params.get("SIZE") else {
            return Ok(());
        };
        let size: usize = size
            .parse()
            .map_err(|_| invalid_param("SIZE must be numeric"))?;
        if size > self.max {
            return Err(SmtpError::Rejected {
                code: 552,
                message: "Message size exceeds fixed maximum message size".to_string(),
            });
        }
        Ok(())
    }
}
