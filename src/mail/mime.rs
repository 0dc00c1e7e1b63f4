//! Just enough MIME to pull readable text and the sender out of a message.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Multipart nesting deeper than this is ignored.
const MAX_DEPTH: usize = 8;

/// A parsed message or body part.
#[derive(Debug, Clone)]
pub struct Part {
    headers: Vec<(String, String)>,
    body: String,
}

impl Part {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.replace("\r\n", "\n");
        let (head, body) = if let Some(body) = raw.strip_prefix('\n') {
            ("", body)
        } else {
            match raw.find("\n\n") {
                Some(pos) => (&raw[..pos], &raw[pos + 2..]),
                None => (raw.as_str(), ""),
            }
        };

        Self {
            headers: parse_headers(head),
            body: body.to_string(),
        }
    }

    /// First header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Lowercased `type/subtype`, defaulting to `text/plain`.
    pub fn mime_type(&self) -> String {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "text/plain".to_string())
    }

    fn content_type_param(&self, param: &str) -> Option<String> {
        let content_type = self.header("content-type")?;
        content_type.split(';').skip(1).find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case(param)
                .then(|| value.trim().trim_matches('"').to_string())
        })
    }

    /// Body after undoing the transfer encoding.
    pub fn decoded_body(&self) -> String {
        let encoding = self
            .header("content-transfer-encoding")
            .map(|e| e.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match encoding.as_str() {
            "base64" => {
                let cleaned: String = self.body.chars().filter(|c| !c.is_whitespace()).collect();
                STANDARD
                    .decode(cleaned)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default()
            }
            "quoted-printable" => decode_quoted_printable(&self.body),
            _ => self.body.clone(),
        }
    }

    /// Child parts of a `multipart/*` part; empty otherwise.
    pub fn subparts(&self) -> Vec<Part> {
        if !self.mime_type().starts_with("multipart/") {
            return Vec::new();
        }
        let Some(boundary) = self.content_type_param("boundary") else {
            return Vec::new();
        };

        let delimiter = format!("--{boundary}");
        let mut parts = Vec::new();
        let mut current: Option<Vec<&str>> = None;

        for line in self.body.lines() {
            if line.starts_with(&delimiter) {
                if let Some(lines) = current.take() {
                    parts.push(Part::parse(&lines.join("\n")));
                }
                if line.trim_end() == format!("{delimiter}--") {
                    break;
                }
                current = Some(Vec::new());
            } else if let Some(lines) = current.as_mut() {
                lines.push(line);
            }
        }

        parts
    }

    /// Readable text of the message: all text/plain parts, or the stripped
    /// HTML parts when there is no plain text.
    pub fn text_content(&self) -> String {
        let mut plain = Vec::new();
        let mut html = Vec::new();
        self.collect_text(&mut plain, &mut html, 0);

        if plain.is_empty() {
            html.iter().map(|h| strip_tags(h)).collect::<Vec<_>>().join("\n")
        } else {
            plain.join("\n")
        }
    }

    fn collect_text(&self, plain: &mut Vec<String>, html: &mut Vec<String>, depth: usize) {
        if depth > MAX_DEPTH {
            return;
        }
        match self.mime_type().as_str() {
            "text/plain" => plain.push(self.decoded_body()),
            "text/html" => html.push(self.decoded_body()),
            t if t.starts_with("multipart/") => {
                for part in self.subparts() {
                    part.collect_text(plain, html, depth + 1);
                }
            }
            _ => {}
        }
    }

    /// Bare address from the `From` header.
    pub fn sender_address(&self) -> Option<String> {
        self.header("from").and_then(extract_address)
    }
}

fn parse_headers(head: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    headers
}

/// `"Name" <user@host>` or `user@host` to `user@host`.
pub fn extract_address(header: &str) -> Option<String> {
    let candidate = match (header.rfind('<'), header.rfind('>')) {
        (Some(start), Some(end)) if start < end => &header[start + 1..end],
        _ => header,
    };
    let candidate = candidate.trim();
    (candidate.contains('@') && !candidate.contains(char::is_whitespace))
        .then(|| candidate.to_string())
}

fn decode_quoted_printable(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'=' if bytes.get(i + 1) == Some(&b'\n') => i += 2,
            b'=' if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') => i += 3,
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        decoded.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        decoded.push(b'=');
                        i += 1;
                    }
                }
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.replace("&nbsp;", " ")
}
