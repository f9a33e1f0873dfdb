//! Client sessions against a scripted loopback server.

#![allow(clippy::unwrap_used)]

use relaydesk_smtp::connection::connect;
use relaydesk_smtp::{Address, Client, Envelope, Error};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serves one connection: answers each client line with the next scripted
/// reply and returns everything the client sent.
async fn scripted(greeting: &'static str, replies: Vec<&'static str>) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut seen = Vec::new();
        write.write_all(greeting.as_bytes()).await.unwrap();

        let mut replies = replies.into_iter();
        let mut in_data = false;
        while let Ok(Some(line)) = lines.next_line().await {
            seen.push(line.clone());
            if in_data && line != "." {
                continue;
            }
            in_data = false;
            let Some(reply) = replies.next() else { break };
            write.write_all(reply.as_bytes()).await.unwrap();
            if reply.starts_with("354") {
                in_data = true;
            }
        }
        seen
    });
    (port, handle)
}

#[tokio::test]
async fn login_is_used_when_plain_is_not_offered() {
    let (port, server) = scripted(
        "220 mx.test ready\r\n",
        vec![
            "250-mx.test\r\n250 AUTH LOGIN\r\n",
            "334 VXNlcm5hbWU6\r\n",
            "334 UGFzc3dvcmQ6\r\n",
            "235 ok\r\n",
            "221 bye\r\n",
        ],
    )
    .await;

    let client = Client::from_stream(connect("127.0.0.1", port).await.unwrap()).await.unwrap();
    let client = client.ehlo("relay.local").await.unwrap();
    let client = client.authenticate("user", "pass").await.unwrap();
    client.quit().await.unwrap();

    let seen = server.await.unwrap();
    assert_eq!(seen[0], "EHLO relay.local");
    assert_eq!(seen[1], "AUTH LOGIN");
    assert_eq!(seen[2], "dXNlcg==");
    assert_eq!(seen[3], "cGFzcw==");
}

#[tokio::test]
async fn send_mail_stuffs_dots_and_terminates() {
    let (port, server) = scripted(
        "220 mx.test ready\r\n",
        vec![
            "250-mx.test\r\n250 AUTH PLAIN\r\n",
            "235 ok\r\n",
            "250 sender ok\r\n",
            "250 rcpt ok\r\n",
            "354 go ahead\r\n",
            "250 queued\r\n",
            "221 bye\r\n",
        ],
    )
    .await;

    let client = Client::from_stream(connect("127.0.0.1", port).await.unwrap()).await.unwrap();
    let client = client.ehlo("relay.local").await.unwrap();
    let client = client.authenticate("user", "pass").await.unwrap();
    let envelope = Envelope::new(
        Address::new("user@example.com").unwrap(),
        Address::new("to@example.org").unwrap(),
    );
    let client = client
        .send_mail(&envelope, b"Subject: t\n\n.hidden\nlast")
        .await
        .unwrap();
    client.quit().await.unwrap();

    let seen = server.await.unwrap();
    assert_eq!(seen[2], "MAIL FROM:<user@example.com>");
    assert_eq!(seen[3], "RCPT TO:<to@example.org>");
    assert_eq!(seen[4], "DATA");
    assert_eq!(&seen[5..10], ["Subject: t", "", "..hidden", "last", "."]);
}

#[tokio::test]
async fn rejected_credentials_are_an_auth_rejection() {
    let (port, _server) = scripted(
        "220 mx.test ready\r\n",
        vec!["250-mx.test\r\n250 AUTH PLAIN\r\n", "535 5.7.8 bad credentials\r\n"],
    )
    .await;

    let client = Client::from_stream(connect("127.0.0.1", port).await.unwrap()).await.unwrap();
    let client = client.ehlo("relay.local").await.unwrap();
    let err = client.authenticate("user", "wrong").await.unwrap_err();
    assert!(err.is_auth_rejection());
    assert_eq!(err.code(), Some(535));
}

#[tokio::test]
async fn starttls_requires_advertisement() {
    let (port, _server) = scripted("220 mx.test ready\r\n", vec!["250 mx.test\r\n"]).await;

    let client = Client::from_stream(connect("127.0.0.1", port).await.unwrap()).await.unwrap();
    let client = client.ehlo("relay.local").await.unwrap();
    let err = client.starttls("127.0.0.1").await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
}

#[tokio::test]
async fn overlong_greeting_is_a_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let line = format!("220 {}\r\n", "x".repeat(20_000));
        let _ = socket.write_all(line.as_bytes()).await;
    });

    let err = Client::from_stream(connect("127.0.0.1", port).await.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
}
