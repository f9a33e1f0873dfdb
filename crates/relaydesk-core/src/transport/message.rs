//! Outgoing campaign message.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Sender address.
    pub from_email: String,
    /// Sender display name; may be empty.
    pub from_name: String,
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Body, HTML or plain text.
    pub body: String,
    /// Whether `body` is HTML.
    pub is_html: bool,
}

impl OutgoingMessage {
    /// Creates a plain-text message.
    #[must_use]
    pub fn new(
        from_email: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from_email: from_email.into(),
            from_name: String::new(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            is_html: false,
        }
    }

    /// Sets the sender display name.
    #[must_use]
    pub fn with_from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = name.into();
        self
    }

    /// Marks the body as HTML.
    #[must_use]
    pub const fn html(mut self, is_html: bool) -> Self {
        self.is_html = is_html;
        self
    }

    /// `From` header value with the display name, if any.
    #[must_use]
    pub fn from_header(&self) -> String {
        let name = self.from_name.trim();
        if name.is_empty() {
            return self.from_email.clone();
        }
        if name.is_ascii() {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{escaped}\" <{}>", self.from_email)
        } else {
            format!("{} <{}>", encode_word(name), self.from_email)
        }
    }

    /// Renders the message as RFC 5322 text, CRLF line endings.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        self.render_at(Utc::now(), &Uuid::new_v4().to_string())
    }

    fn render_at(&self, date: DateTime<Utc>, unique: &str) -> String {
        use std::fmt::Write;

        let domain = self
            .from_email
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain);
        let content_type = if self.is_html { "text/html" } else { "text/plain" };

        let mut message = String::new();
        let _ = write!(message, "Date: {}\r\n", date.to_rfc2822());
        let _ = write!(message, "Message-ID: <{unique}@{domain}>\r\n");
        let _ = write!(message, "From: {}\r\n", self.from_header());
        let _ = write!(message, "To: {}\r\n", self.to);
        let _ = write!(message, "Subject: {}\r\n", encode_word(&self.subject));
        message.push_str("MIME-Version: 1.0\r\n");
        let _ = write!(message, "Content-Type: {content_type}; charset=utf-8\r\n");
        message.push_str("Content-Transfer-Encoding: 8bit\r\n");
        message.push_str("\r\n");

        for line in self.body.lines() {
            message.push_str(line);
            message.push_str("\r\n");
        }
        message
    }
}

/// RFC 2047 encoded word, only when the text needs it.
fn encode_word(text: &str) -> String {
    if text.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != '=' && c != '?') {
        return text.to_string();
    }
    format!("=?utf-8?B?{}?=", BASE64.encode(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rendered(message: &OutgoingMessage) -> String {
        let date = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default();
        message.render_at(date, "fixed")
    }

    #[test]
    fn renders_headers_and_body() {
        let message = OutgoingMessage::new("news@corp.io", "amy@example.org", "Hello", "Line one\nLine two")
            .with_from_name("Corp News");
        let text = rendered(&message);
        assert!(text.starts_with("Date: Sun, 1 Mar 2026 12:00:00 +0000\r\n"));
        assert!(text.contains("Message-ID: <fixed@corp.io>\r\n"));
        assert!(text.contains("From: \"Corp News\" <news@corp.io>\r\n"));
        assert!(text.contains("Subject: Hello\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.ends_with("\r\n\r\nLine one\r\nLine two\r\n"));
    }

    #[test]
    fn html_body_sets_content_type() {
        let message = OutgoingMessage::new("a@b.io", "c@d.io", "Hi", "<p>x</p>").html(true);
        assert!(rendered(&message).contains("Content-Type: text/html; charset=utf-8"));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        let message = OutgoingMessage::new("a@b.io", "c@d.io", "Café", "x").with_from_name("Zoë");
        let text = rendered(&message);
        assert!(text.contains("Subject: =?utf-8?B?Q2Fmw6k=?=\r\n"));
        assert!(text.contains("From: =?utf-8?B?Wm/Dqw==?= <a@b.io>"));
    }

    #[test]
    fn bare_address_without_name() {
        let message = OutgoingMessage::new("a@b.io", "c@d.io", "Hi", "x");
        assert_eq!(message.from_header(), "a@b.io");
    }
}
