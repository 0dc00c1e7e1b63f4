//! Mailbox ingestion (IMAP) and notification delivery (SMTP).

mod imap;
pub mod mime;
mod smtp;
mod stream;

pub use imap::ImapMailbox;
pub use smtp::SmtpNotifier;

use std::io;

/// Errors raised by the mail transports.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP command {command} failed: {response}")]
    Imap { command: String, response: String },

    #[error("SMTP error {code}: {message}")]
    Smtp { code: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out")]
    Timeout,
}
