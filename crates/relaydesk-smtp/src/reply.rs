//! SMTP replies and their wire parser.
//!
//! Replies can be single-line or multi-line:
//! - Single: `250 OK`
//! - Multi: `250-first`, `250-second`, `250 last`

use crate::error::{Error, Result};

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_OK: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 334 Continue with authentication
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 535 Authentication credentials invalid
    pub const AUTH_FAILED: Self = Self(535);
    /// 550 Mailbox unavailable
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);

    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true for 2xx.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true for 3xx.
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }

    /// Returns true for 4xx.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true for 5xx.
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A complete (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code.
    pub code: ReplyCode,
    /// Text of each line, code and separator stripped.
    pub lines: Vec<String>,
}

impl Reply {
    /// Parses reply lines as read off the wire (CRLF already removed).
    ///
    /// # Errors
    ///
    /// Returns an error if the lines are empty, a code is not numeric, or
    /// the lines disagree on the code.
    pub fn parse(raw: &[String]) -> Result<Self> {
        let first = raw
            .first()
            .ok_or_else(|| Error::Protocol("empty reply".into()))?;
        let code = parse_code(first)?;

        let mut lines = Vec::with_capacity(raw.len());
        for line in raw {
            if parse_code(line)? != code {
                return Err(Error::Protocol(format!("mixed reply codes: {line}")));
            }
            lines.push(line.get(4..).unwrap_or_default().to_string());
        }

        Ok(Self { code, lines })
    }

    /// Returns true if this is a success reply.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns the full text joined with spaces.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Converts a non-success reply into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] unless the code is 2xx.
    pub fn ensure_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::rejected(self.code.as_u16(), self.text()))
        }
    }
}

/// Returns true if `line` terminates a reply (`NNN text` or bare `NNN`).
#[must_use]
pub fn is_last_line(line: &str) -> bool {
    line.len() == 3 || line.as_bytes().get(3) == Some(&b' ')
}

fn parse_code(line: &str) -> Result<ReplyCode> {
    let digits = line
        .get(0..3)
        .ok_or_else(|| Error::Protocol(format!("reply too short: {line}")))?;
    match line.as_bytes().get(3) {
        None | Some(b' ' | b'-') => {}
        Some(_) => return Err(Error::Protocol(format!("malformed reply line: {line}"))),
    }
    digits
        .parse::<u16>()
        .map(ReplyCode::new)
        .map_err(|_| Error::Protocol(format!("invalid reply code: {digits}")))
}
