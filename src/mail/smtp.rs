//! SMTP submission of notification mails.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

use super::MailError;
use super::stream::MailStream;
use crate::config::Config;
use crate::notification::{Notification, NotificationSink};

/// Port on which the server expects TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;
const BASE64_LINE: usize = 76;

/// One SMTP reply (possibly multi-line).
#[derive(Debug)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }

    fn into_error(self) -> MailError {
        MailError::Smtp {
            code: self.code,
            message: self.lines.join(" "),
        }
    }
}

async fn read_reply(stream: &mut MailStream) -> Result<Reply, MailError> {
    let mut lines = Vec::new();
    loop {
        let line = stream.read_line().await?;
        let code = line
            .get(..3)
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| MailError::Protocol(format!("malformed reply: {line}")))?;
        let last = line.as_bytes().get(3) != Some(&b'-');
        lines.push(line.get(4..).unwrap_or_default().to_string());

        if last {
            return Ok(Reply { code, lines });
        }
    }
}

async fn expect(stream: &mut MailStream, command: Option<&str>) -> Result<Reply, MailError> {
    if let Some(command) = command {
        stream.write_all(format!("{command}\r\n").as_bytes()).await?;
    }
    let reply = read_reply(stream).await?;
    if reply.is_positive() {
        Ok(reply)
    } else {
        Err(reply.into_error())
    }
}

/// Sends notifications through an authenticated SMTP relay.
pub struct SmtpNotifier {
    server: String,
    port: u16,
    username: String,
    password: String,
    from: String,
    timeout: Duration,
}

impl SmtpNotifier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: config.smtp_server.clone(),
            port: config.smtp_port,
            username: config.email_address.clone(),
            password: config.email_password.clone(),
            from: config.email_address.clone(),
            timeout: config.request_timeout * 4,
        }
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), MailError> {
        let mut stream = if self.port == IMPLICIT_TLS_PORT {
            MailStream::connect_tls(&self.server, self.port).await?
        } else {
            MailStream::connect(&self.server, self.port).await?
        };

        expect(&mut stream, None).await?;
        let ehlo = expect(&mut stream, Some("EHLO localhost")).await?;

        if self.port != IMPLICIT_TLS_PORT {
            let supports_starttls = ehlo
                .lines
                .iter()
                .any(|l| l.trim().eq_ignore_ascii_case("STARTTLS"));
            if !supports_starttls {
                return Err(MailError::Protocol("server does not offer STARTTLS".into()));
            }
            expect(&mut stream, Some("STARTTLS")).await?;
            stream = stream.upgrade_to_tls(&self.server).await?;
            expect(&mut stream, Some("EHLO localhost")).await?;
        }

        let credentials = STANDARD.encode(format!("\0{}\0{}", self.username, self.password));
        expect(&mut stream, Some(&format!("AUTH PLAIN {credentials}"))).await?;

        expect(&mut stream, Some(&format!("MAIL FROM:<{}>", self.from))).await?;
        expect(&mut stream, Some(&format!("RCPT TO:<{}>", notification.recipient))).await?;
        expect(&mut stream, Some("DATA")).await?;

        let message = format_message(&self.from, notification, Utc::now());
        stream.write_all(dot_stuff(&message).as_bytes()).await?;
        expect(&mut stream, Some(".")).await?;

        // The message is accepted at this point; a failed QUIT changes nothing.
        let _ = expect(&mut stream, Some("QUIT")).await;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for SmtpNotifier {
    async fn send(&self, notification: &Notification) {
        match timeout(self.timeout, self.deliver(notification)).await {
            Ok(Ok(())) => info!(to = %notification.recipient, subject = %notification.subject, "notification sent"),
            Ok(Err(e)) => error!(to = %notification.recipient, error = %e, "SMTP error"),
            Err(_) => error!(to = %notification.recipient, "SMTP delivery timed out"),
        }
    }
}

/// RFC 5322 message with a base64 HTML body.
fn format_message(from: &str, notification: &Notification, date: DateTime<Utc>) -> String {
    let body = STANDARD.encode(notification.html_body.as_bytes());
    let wrapped: Vec<&str> = body
        .as_bytes()
        .chunks(BASE64_LINE)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect();

    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         Date: {date}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         {body}\r\n",
        to = notification.recipient,
        subject = encode_header(&notification.subject),
        date = date.to_rfc2822(),
        body = wrapped.join("\r\n"),
    )
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

fn dot_stuff(message: &str) -> String {
    message
        .split("\r\n")
        .map(|line| {
            if line.starts_with('.') {
                format!(".{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}
