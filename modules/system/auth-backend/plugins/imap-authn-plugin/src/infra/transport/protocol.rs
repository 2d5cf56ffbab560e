//! IMAP line grammar needed for an authenticated login.
//!
//! Only greetings, tagged status responses and quoted strings are handled;
//! everything else a server sends is treated as an opaque untagged line.

use std::fmt;

use crate::config::MAX_CREDENTIAL_LEN;

/// Longest response line accepted from a server, terminator included.
pub const MAX_LINE: usize = 8 * 1024;

/// Status keyword of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    Preauth,
    Bye,
}

impl Status {
    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "NO" => Some(Self::No),
            "BAD" => Some(Self::Bad),
            "PREAUTH" => Some(Self::Preauth),
            "BYE" => Some(Self::Bye),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::No => "NO",
            Self::Bad => "BAD",
            Self::Preauth => "PREAUTH",
            Self::Bye => "BYE",
        })
    }
}

/// One parsed response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    /// `+ ...`
    Continuation(&'a str),
    /// `* ...`
    Untagged {
        status: Option<Status>,
        text: &'a str,
    },
    /// `A001 OK ...`
    Tagged {
        tag: &'a str,
        status: Option<Status>,
        text: &'a str,
    },
}

impl<'a> Response<'a> {
    #[must_use]
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix('+') {
            return Self::Continuation(rest.trim_start());
        }

        let (tag, rest) = line.split_once(' ').unwrap_or((line, ""));
        let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = Status::parse(word);
        let text = if status.is_some() { text } else { rest };

        if tag == "*" {
            Self::Untagged { status, text }
        } else {
            Self::Tagged { tag, status, text }
        }
    }
}

/// Generates command tags (`A001`, `A002`, ...).
#[derive(Debug, Default)]
pub struct Tagger {
    issued: u32,
}

impl Tagger {
    pub fn next_tag(&mut self) -> String {
        self.issued = self.issued.wrapping_add(1);
        format!("A{:03}", self.issued)
    }
}

/// Reasons a credential cannot be carried by a `LOGIN` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("must not contain CR, LF or NUL")]
    ControlCharacter,
    #[error("exceeds {MAX_CREDENTIAL_LEN} bytes")]
    TooLong,
}

/// Check that `value` fits in a quoted string.
///
/// # Errors
///
/// Returns the first constraint `value` violates.
pub fn check_login_field(value: &str) -> Result<(), FieldError> {
    if value.len() > MAX_CREDENTIAL_LEN {
        return Err(FieldError::TooLong);
    }
    if value.bytes().any(|b| matches!(b, b'\r' | b'\n' | b'\0')) {
        return Err(FieldError::ControlCharacter);
    }
    Ok(())
}

/// Render `value` as an IMAP quoted string.
#[must_use]
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if matches!(ch, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}
