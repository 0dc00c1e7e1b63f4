//! Minimal IMAP4rev1 client that drains unread messages for waybills.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::MailError;
use super::mime::Part;
use super::stream::MailStream;
use crate::config::Config;
use crate::ingest::{WaybillSource, dedupe_batch, extract_waybills};
use crate::models::IngestedWaybill;

/// Untagged server data, with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    line: String,
    literals: Vec<Vec<u8>>,
}

struct ImapSession {
    stream: MailStream,
    next_tag: u32,
    timeout: Duration,
}

impl ImapSession {
    /// Wraps an open stream and consumes the server greeting.
    async fn start(stream: MailStream, timeout_after: Duration) -> Result<Self, MailError> {
        let mut session = Self {
            stream,
            next_tag: 1,
            timeout: timeout_after,
        };

        let greeting = session.read_line().await?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(MailError::Protocol(format!("unexpected greeting: {greeting}")));
        }

        Ok(session)
    }

    async fn read_line(&mut self) -> Result<String, MailError> {
        timeout(self.timeout, self.stream.read_line())
            .await
            .map_err(|_| MailError::Timeout)?
    }

    /// Sends a tagged command and collects untagged responses until completion.
    async fn command(&mut self, command: &str) -> Result<Vec<Untagged>, MailError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        self.stream
            .write_all(format!("{tag} {command}\r\n").as_bytes())
            .await?;

        let verb = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let mut responses = Vec::new();
        let mut current: Option<Untagged> = None;

        loop {
            let line = self.read_line().await?;

            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if let Some(done) = current.take() {
                    responses.push(done);
                }
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                return Err(MailError::Imap {
                    command: verb,
                    response: status.to_string(),
                });
            }

            // Lines that do not start a new untagged response continue the
            // previous one (the tail after a literal).
            if line.starts_with('*') {
                if let Some(done) = current.take() {
                    responses.push(done);
                }
            }
            let entry = current.get_or_insert_with(Untagged::default);
            entry.line.push_str(&line);

            if let Some(len) = literal_length(&line) {
                let literal = timeout(self.timeout, self.stream.read_exact(len))
                    .await
                    .map_err(|_| MailError::Timeout)??;
                entry.literals.push(literal);
            }
        }
    }
}

/// Parses a trailing `{123}` literal announcement.
fn literal_length(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].trim_end_matches('+').parse().ok()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_search(responses: &[Untagged]) -> Vec<u32> {
    responses
        .iter()
        .filter_map(|r| r.line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Mailbox scanned for shipping confirmations.
pub struct ImapMailbox {
    server: String,
    port: u16,
    username: String,
    password: String,
    recipient_override: Option<String>,
    timeout: Duration,
}

impl ImapMailbox {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: config.imap_server.clone(),
            port: config.imap_port,
            username: config.email_address.clone(),
            password: config.email_password.clone(),
            recipient_override: config.recipient_email.clone(),
            timeout: config.request_timeout,
        }
    }

    fn waybills_in(&self, raw: &[u8]) -> Vec<IngestedWaybill> {
        let message = Part::parse(&String::from_utf8_lossy(raw));

        let recipient = match self.recipient_override.clone().or_else(|| message.sender_address()) {
            Some(recipient) => recipient,
            None => {
                warn!("message without a usable sender address skipped");
                return Vec::new();
            }
        };

        extract_waybills(&message.text_content())
            .into_iter()
            .map(|(waybill, courier)| IngestedWaybill {
                waybill,
                courier,
                recipient: recipient.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl WaybillSource for ImapMailbox {
    async fn drain(&self) -> Result<Vec<IngestedWaybill>, MailError> {
        let stream = timeout(self.timeout, MailStream::connect_tls(&self.server, self.port))
            .await
            .map_err(|_| MailError::Timeout)??;
        let mut session = ImapSession::start(stream, self.timeout).await?;
        self.drain_session(&mut session).await
    }
}

impl ImapMailbox {
    /// Collects waybills from every unread message.
    ///
    /// Messages are flagged `\Seen` once read, so a failure partway through
    /// still returns what was already read instead of an error.
    async fn drain_session(&self, session: &mut ImapSession) -> Result<Vec<IngestedWaybill>, MailError> {
        session
            .command(&format!("LOGIN {} {}", quote(&self.username), quote(&self.password)))
            .await?;
        session.command("SELECT INBOX").await?;

        let unseen = parse_search(&session.command("UID SEARCH UNSEEN").await?);
        debug!(count = unseen.len(), "unread messages");

        let mut found = Vec::new();
        for uid in unseen {
            if let Err(e) = self.take_message(session, uid, &mut found).await {
                warn!(uid, error = %e, kept = found.len(), "mailbox read interrupted");
                return Ok(dedupe_batch(found));
            }
        }

        if let Err(e) = session.command("LOGOUT").await {
            debug!(error = %e, "logout did not complete cleanly");
        }

        Ok(dedupe_batch(found))
    }

    /// Reads one message into `found`, then flags it seen.
    async fn take_message(
        &self,
        session: &mut ImapSession,
        uid: u32,
        found: &mut Vec<IngestedWaybill>,
    ) -> Result<(), MailError> {
        let responses = session.command(&format!("UID FETCH {uid} BODY.PEEK[]")).await?;
        let Some(raw) = responses.iter().flat_map(|r| r.literals.iter()).next() else {
            warn!(uid, "fetch returned no message body");
            return Ok(());
        };

        let waybills = self.waybills_in(raw);
        if !waybills.is_empty() {
            info!(uid, count = waybills.len(), "waybills found in message");
        }
        found.extend(waybills);

        session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CourierKind;

    #[test]
    fn literal_announcements() {
        assert_eq!(literal_length("* 1 FETCH (UID 7 BODY[] {342}"), Some(342));
        assert_eq!(literal_length("A0001 LOGIN {5+}"), Some(5));
        assert_eq!(literal_length("* OK ready"), None);
    }

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn search_results_are_parsed() {
        let responses = vec![Untagged {
            line: "* SEARCH 4 8 15".to_string(),
            literals: Vec::new(),
        }];
        assert_eq!(parse_search(&responses), vec![4, 8, 15]);
        assert!(parse_search(&[]).is_empty());
    }

    fn mailbox(recipient_override: Option<&str>) -> ImapMailbox {
        ImapMailbox {
            server: "imap.example.com".to_string(),
            port: 993,
            username: "u".to_string(),
            password: "p".to_string(),
            recipient_override: recipient_override.map(str::to_string),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn sender_is_recipient_without_override() {
        let raw = b"From: Buyer <buyer@example.com>\r\n\r\nAWB 12345678901\r\n";
        let waybills = mailbox(None).waybills_in(raw);
        assert_eq!(
            waybills,
            vec![IngestedWaybill {
                waybill: "12345678901".to_string(),
                courier: CourierKind::Bluedart,
                recipient: "buyer@example.com".to_string(),
            }]
        );
    }

    #[test]
    fn override_wins_over_sender() {
        let raw = b"From: buyer@example.com\r\n\r\nDelhivery 1234567890123\r\n";
        let waybills = mailbox(Some("owner@example.com")).waybills_in(raw);
        assert_eq!(waybills[0].recipient, "owner@example.com");
        assert_eq!(waybills[0].courier, CourierKind::Delhivery);
    }

    /// Plays an IMAP server that answers each tagged command from `script`
    /// and hangs up at the first command it has no answer for.
    async fn scripted_server(script: Vec<(&'static str, String)>) -> u16 {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            socket.get_mut().write_all(b"* OK ready\r\n").await.unwrap();

            let mut line = String::new();
            while socket.read_line(&mut line).await.unwrap_or(0) > 0 {
                let (tag, command) = line.trim_end().split_once(' ').unwrap();
                let Some((_, reply)) = script.iter().find(|(prefix, _)| command.starts_with(prefix)) else {
                    return;
                };
                let reply = format!("{reply}{tag} OK done\r\n");
                socket.get_mut().write_all(reply.as_bytes()).await.unwrap();
                line.clear();
            }
        });
        port
    }

    #[tokio::test]
    async fn interrupted_drain_keeps_messages_already_read() {
        let message = "From: buyer@example.com\r\n\r\nAWB 12345678901\r\n";
        let port = scripted_server(vec![
            ("LOGIN", String::new()),
            ("SELECT", String::new()),
            ("UID SEARCH", "* SEARCH 1 2\r\n".to_string()),
            (
                "UID FETCH 1 ",
                format!("* 1 FETCH (UID 1 BODY[] {{{}}}\r\n{message})\r\n", message.len()),
            ),
            ("UID STORE 1 ", String::new()),
        ])
        .await;

        let stream = MailStream::connect("127.0.0.1", port).await.unwrap();
        let mut session = ImapSession::start(stream, Duration::from_secs(5)).await.unwrap();

        let waybills = mailbox(None).drain_session(&mut session).await.unwrap();
        assert_eq!(waybills.len(), 1);
        assert_eq!(waybills[0].waybill, "12345678901");
        assert_eq!(waybills[0].recipient, "buyer@example.com");
    }

    #[tokio::test]
    async fn login_failure_is_an_error() {
        let port = scripted_server(Vec::new()).await;
        let stream = MailStream::connect("127.0.0.1", port).await.unwrap();
        let mut session = ImapSession::start(stream, Duration::from_secs(5)).await.unwrap();

        assert!(mailbox(None).drain_session(&mut session).await.is_err());
    }
}
