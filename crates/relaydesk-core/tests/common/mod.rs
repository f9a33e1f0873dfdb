//! Shared fixtures: a scripted transport and a loopback SMTP server.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use relaydesk_core::relay::{RelayEndpoint, Security, SmtpDetails};
use relaydesk_core::transport::OutgoingMessage;
use relaydesk_core::{DeliveryError, RelayCredential, RelayHealth, RelayId, RelayTransport};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A relay that is already known good.
pub fn valid_relay(username: &str, quota: Option<u32>) -> RelayCredential {
    let mut relay = smtp_relay(username, "pw", "smtp.example.com", 587, Security::StartTls).with_daily_quota(quota);
    relay.health = RelayHealth::Valid;
    relay
}

pub fn smtp_relay(username: &str, secret: &str, host: &str, port: u16, security: Security) -> RelayCredential {
    RelayCredential::new(
        username,
        secret,
        RelayEndpoint::Smtp(SmtpDetails {
            host: host.into(),
            port,
            security,
            host_guessed: false,
        }),
    )
}

/// Behaves according to the relay's username prefix:
///
/// `ok` sends, `broken` refuses credentials, `flaky` fails twice then sends,
/// `down` always times out, `reject` refuses every recipient.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: AtomicUsize,
    sent: Mutex<Vec<(RelayId, String)>>,
    tries: Mutex<HashMap<RelayId, u32>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels `token` once the `n`th send completes.
    pub fn cancelling_after(n: usize, token: CancellationToken) -> Self {
        Self {
            cancel_after: Some((n, token)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(RelayId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn delivered_by(&self, relay: RelayId) -> usize {
        self.delivered().iter().filter(|(id, _)| *id == relay).count()
    }

    fn outcome(&self, relay: &RelayCredential) -> Result<(), DeliveryError> {
        let tries = {
            let mut tries = self.tries.lock().unwrap();
            let n = tries.entry(relay.id).or_insert(0);
            *n += 1;
            *n
        };
        match relay.username.as_str() {
            u if u.starts_with("ok") => Ok(()),
            u if u.starts_with("broken") => Err(DeliveryError::relay_broken("SMTP error 535: bad credentials")),
            u if u.starts_with("flaky") && tries > 2 => Ok(()),
            u if u.starts_with("flaky") || u.starts_with("down") => Err(DeliveryError::transient("connection reset")),
            _ => Err(DeliveryError::permanent("SMTP error 550: no such user")),
        }
    }
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    async fn verify(&self, relay: &RelayCredential) -> Result<(), DeliveryError> {
        if relay.username.starts_with("ok") {
            Ok(())
        } else {
            Err(DeliveryError::relay_broken("SMTP error 535: bad credentials"))
        }
    }

    async fn send(&self, relay: &RelayCredential, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.outcome(relay);
        if result.is_ok() {
            self.sent.lock().unwrap().push((relay.id, message.to.clone()));
        }
        if let Some((after, token)) = &self.cancel_after
            && n == *after
        {
            token.cancel();
        }
        result
    }
}

/// Minimal SMTP server on 127.0.0.1 accepting one username/password.
pub struct FakeSmtpServer {
    pub port: u16,
    messages: Arc<Mutex<Vec<String>>>,
}

impl FakeSmtpServer {
    pub async fn start(username: &str, password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let expected = BASE64.encode(format!("\0{username}\0{password}"));
        let messages = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(&messages);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let expected = expected.clone();
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let _ = session(socket, &expected, &store).await;
                });
            }
        });

        Self { port, messages }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

async fn session(
    socket: tokio::net::TcpStream,
    expected: &str,
    messages: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"220 fake.test ESMTP\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        let upper = line.to_ascii_uppercase();
        let reply: &[u8] = if upper.starts_with("EHLO") {
            b"250-fake.test\r\n250 AUTH PLAIN LOGIN\r\n"
        } else if upper.starts_with("AUTH PLAIN") {
            if line.split_whitespace().nth(2) == Some(expected) {
                b"235 2.7.0 Authentication successful\r\n"
            } else {
                b"535 5.7.8 Username and Password not accepted\r\n"
            }
        } else if upper.starts_with("MAIL") || upper.starts_with("RCPT") {
            b"250 OK\r\n"
        } else if upper == "DATA" {
            write.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;
            let mut body = String::new();
            while let Some(data) = lines.next_line().await? {
                if data == "." {
                    break;
                }
                body.push_str(&data);
                body.push('\n');
            }
            messages.lock().unwrap().push(body);
            b"250 OK queued\r\n"
        } else if upper == "QUIT" {
            write.write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else {
            b"502 Command not implemented\r\n"
        };
        write.write_all(reply).await?;
    }
    Ok(())
}
