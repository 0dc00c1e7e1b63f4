//! Line-oriented TCP/TLS stream shared by the IMAP and SMTP clients.

use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use super::MailError;

/// Maximum accepted line length.
const MAX_LINE_LENGTH: usize = 1024 * 1024;
/// Maximum accepted IMAP literal (one raw message).
const MAX_LITERAL_LENGTH: usize = MAX_LINE_LENGTH * 64;

pub enum MailStream {
    Tcp(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl MailStream {
    pub async fn connect(hostname: &str, port: u16) -> Result<Self, MailError> {
        let stream = TcpStream::connect((hostname, port)).await?;
        Ok(Self::Tcp(BufReader::new(stream)))
    }

    pub async fn connect_tls(hostname: &str, port: u16) -> Result<Self, MailError> {
        let tcp_stream = TcpStream::connect((hostname, port)).await?;
        let tls_stream = handshake(hostname, tcp_stream).await?;
        Ok(Self::Tls(Box::new(BufReader::new(tls_stream))))
    }

    /// Upgrades a plain connection after STARTTLS.
    pub async fn upgrade_to_tls(self, hostname: &str) -> Result<Self, MailError> {
        let tcp_stream = match self {
            Self::Tcp(reader) => reader.into_inner(),
            Self::Tls(_) => return Err(MailError::Protocol("already using TLS".into())),
        };

        let tls_stream = handshake(hostname, tcp_stream).await?;
        Ok(Self::Tls(Box::new(BufReader::new(tls_stream))))
    }

    /// Reads one line, without its CRLF terminator.
    pub async fn read_line(&mut self) -> Result<String, MailError> {
        let mut line = Vec::new();
        let limit = MAX_LINE_LENGTH as u64 + 1;
        let read = match self {
            Self::Tcp(reader) => reader.take(limit).read_until(b'\n', &mut line).await?,
            Self::Tls(reader) => (&mut **reader).take(limit).read_until(b'\n', &mut line).await?,
        };

        if read == 0 {
            return Err(MailError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(MailError::Protocol("line too long".into()));
        }

        let text = String::from_utf8_lossy(&line);
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads exactly `len` raw bytes (an IMAP literal).
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, MailError> {
        if len > MAX_LITERAL_LENGTH {
            return Err(MailError::Protocol(format!("literal of {len} bytes refused")));
        }
        let mut buffer = vec![0u8; len];
        match self {
            Self::Tcp(reader) => reader.read_exact(&mut buffer).await?,
            Self::Tls(reader) => reader.read_exact(&mut buffer).await?,
        };
        Ok(buffer)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), MailError> {
        match self {
            Self::Tcp(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
        }
        Ok(())
    }
}

async fn handshake(hostname: &str, tcp_stream: TcpStream) -> Result<TlsStream<TcpStream>, MailError> {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| MailError::Tls(format!("invalid hostname: {hostname}")))?;

    connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| MailError::Tls(e.to_string()))
}
