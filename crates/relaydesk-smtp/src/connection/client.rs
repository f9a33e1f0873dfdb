//! Type-state SMTP client.

use super::{ServerInfo, SmtpStream};
use crate::address::Envelope;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::extension::{AuthMechanism, Extension};
use crate::reply::{Reply, ReplyCode, is_last_line};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::marker::PhantomData;
use tracing::trace;

/// Type-state marker: greeted, not yet authenticated.
#[derive(Debug)]
pub struct Connected;

/// Type-state marker: credentials accepted, mail may be submitted.
#[derive(Debug)]
pub struct Authenticated;

/// SMTP client with type-state pattern.
#[derive(Debug)]
pub struct Client<State> {
    stream: SmtpStream,
    server_info: ServerInfo,
    _state: PhantomData<State>,
}

impl<S> Client<S> {
    /// Returns what the server advertised.
    pub const fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    fn into_state<T>(self) -> Client<T> {
        Client {
            stream: self.stream,
            server_info: self.server_info,
            _state: PhantomData,
        }
    }

    async fn send_command(&mut self, cmd: Command) -> Result<Reply> {
        if cmd.is_sensitive() {
            trace!("C: <credentials>");
        } else {
            trace!("C: {}", String::from_utf8_lossy(&cmd.serialize()).trim_end());
        }
        self.stream.write_all(&cmd.serialize()).await?;
        read_reply(&mut self.stream).await
    }

    /// Sends QUIT and closes the connection (available in any state).
    ///
    /// # Errors
    ///
    /// Returns an error if the QUIT exchange fails.
    pub async fn quit(mut self) -> Result<()> {
        let reply = self.send_command(Command::Quit).await?;
        if !reply.is_success() && reply.code != ReplyCode::CLOSING {
            return Err(Error::rejected(reply.code.as_u16(), reply.text()));
        }
        Ok(())
    }
}

impl Client<Connected> {
    /// Creates a client from a stream and reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if the greeting cannot be read or is not 220.
    pub async fn from_stream(mut stream: SmtpStream) -> Result<Self> {
        let greeting = read_reply(&mut stream).await?.ensure_success()?;

        let hostname = greeting
            .lines
            .first()
            .and_then(|line| line.split_whitespace().next())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            stream,
            server_info: ServerInfo {
                hostname,
                ..ServerInfo::default()
            },
            _state: PhantomData,
        })
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects EHLO.
    pub async fn ehlo(mut self, client_hostname: &str) -> Result<Self> {
        let reply = self
            .send_command(Command::Ehlo {
                hostname: client_hostname.to_string(),
            })
            .await?
            .ensure_success()?;

        // First line echoes the server name; the rest are keywords.
        self.server_info.extensions = reply
            .lines
            .iter()
            .skip(1)
            .map(|line| Extension::parse(line))
            .collect();
        self.server_info.client_hostname = client_hostname.to_string();
        Ok(self)
    }

    /// Upgrades the connection with STARTTLS and repeats EHLO.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS is not advertised, is refused, or the
    /// handshake fails.
    pub async fn starttls(mut self, hostname: &str) -> Result<Self> {
        if !self.server_info.supports_starttls() {
            return Err(Error::NotSupported("STARTTLS".into()));
        }

        self.send_command(Command::StartTls).await?.ensure_success()?;
        self.stream = self.stream.upgrade_to_tls(hostname).await?;

        let client_hostname = self.server_info.client_hostname.clone();
        self.ehlo(&client_hostname).await
    }

    /// Authenticates with the best mechanism the server offers.
    ///
    /// PLAIN is preferred; LOGIN is used when it is the only option. A
    /// server that advertises no mechanisms is tried with PLAIN.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the credentials.
    pub async fn authenticate(self, username: &str, password: &str) -> Result<Client<Authenticated>> {
        let offered = self.server_info.auth_mechanisms();
        if offered.contains(&AuthMechanism::Login) && !offered.contains(&AuthMechanism::Plain) {
            self.auth_login(username, password).await
        } else {
            self.auth_plain(username, password).await
        }
    }

    /// Authenticates using PLAIN with an initial response.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn auth_plain(mut self, username: &str, password: &str) -> Result<Client<Authenticated>> {
        let token = BASE64.encode(format!("\0{username}\0{password}"));
        self.send_command(Command::Auth {
            mechanism: AuthMechanism::Plain,
            initial_response: Some(token),
        })
        .await?
        .ensure_success()?;

        Ok(self.into_state())
    }

    /// Authenticates using LOGIN (username and password challenges).
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not follow the LOGIN exchange or
    /// rejects the credentials.
    pub async fn auth_login(mut self, username: &str, password: &str) -> Result<Client<Authenticated>> {
        let mut reply = self
            .send_command(Command::Auth {
                mechanism: AuthMechanism::Login,
                initial_response: None,
            })
            .await?;

        for secret in [username, password] {
            if reply.code != ReplyCode::AUTH_CONTINUE {
                return Err(Error::rejected(reply.code.as_u16(), reply.text()));
            }
            reply = self
                .send_command(Command::AuthContinuation(BASE64.encode(secret)))
                .await?;
        }

        reply.ensure_success()?;
        Ok(self.into_state())
    }
}

impl Client<Authenticated> {
    /// Runs one MAIL/RCPT/DATA transaction.
    ///
    /// The message should be RFC 5322 formatted. Line endings are normalized
    /// to CRLF, leading dots are stuffed and the terminating `.` is added.
    ///
    /// # Errors
    ///
    /// Returns an error if any command or the message body is rejected.
    pub async fn send_mail(mut self, envelope: &Envelope, message: &[u8]) -> Result<Self> {
        if envelope.to.is_empty() {
            return Err(Error::InvalidAddress("no recipients".into()));
        }
        if let Some(limit) = self.server_info.max_message_size()
            && message.len() > limit
        {
            return Err(Error::rejected(
                552,
                format!("message of {} bytes exceeds server limit {limit}", message.len()),
            ));
        }

        let eight_bit = !message.is_ascii() && self.server_info.supports(&Extension::EightBitMime);
        self.envelope(envelope, eight_bit).await?;

        for line in message.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b".\r\n").await?;

        read_reply(&mut self.stream).await?.ensure_success()?;
        Ok(self)
    }

    async fn envelope(&mut self, envelope: &Envelope, eight_bit: bool) -> Result<()> {
        self.send_command(Command::MailFrom {
            from: envelope.from.clone(),
            eight_bit,
        })
        .await?
        .ensure_success()?;

        for to in &envelope.to {
            self.send_command(Command::RcptTo { to: to.clone() })
                .await?
                .ensure_success()?;
        }

        let reply = self.send_command(Command::Data).await?;
        if reply.code != ReplyCode::START_DATA {
            return Err(Error::rejected(reply.code.as_u16(), reply.text()));
        }
        Ok(())
    }
}

async fn read_reply(stream: &mut SmtpStream) -> Result<Reply> {
    let mut lines = Vec::new();
    loop {
        let line = stream.read_line().await?;
        if line.is_empty() {
            continue;
        }
        trace!("S: {line}");

        let last = is_last_line(&line);
        lines.push(line);
        if last {
            break;
        }
    }
    Reply::parse(&lines)
}
