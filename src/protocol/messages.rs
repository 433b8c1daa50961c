//! Protocol payload types
//!
//! `INFO` and `CONNECT` carry JSON bodies; `MSG`/`HMSG` deliveries are surfaced as
//! [`Message`]. Header blocks use the `NATS/1.0` format.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Server `INFO` body
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub proto: i8,
    /// Largest payload the server accepts, in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub jetstream: bool,
}

fn default_max_payload() -> usize {
    1024 * 1024
}

/// Client `CONNECT` body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
    pub headers: bool,
    pub no_responders: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "pass")]
    pub password: Option<String>,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            echo: true,
            headers: true,
            no_responders: false,
            auth_token: None,
            user: None,
            password: None,
        }
    }
}

/// Ordered multimap of message headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

pub const HEADER_VERSION_LINE: &str = "NATS/1.0";

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, keeping any existing values for the same name
    pub fn append<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for `name`
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        let name = name.into();
        self.entries.retain(|(existing, _)| existing != &name);
        self.entries.push((name, value.into()));
    }

    /// Last value stored for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize into the wire header block, including the trailing blank line
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = Vec::with_capacity(16 + self.entries.len() * 32);
        block.extend_from_slice(HEADER_VERSION_LINE.as_bytes());
        block.extend_from_slice(b"\r\n");
        for (name, value) in &self.entries {
            block.extend_from_slice(name.as_bytes());
            block.extend_from_slice(b": ");
            block.extend_from_slice(value.as_bytes());
            block.extend_from_slice(b"\r\n");
        }
        block.extend_from_slice(b"\r\n");
        block
    }

    /// Parse a wire header block. Returns the headers plus an optional inline status
    /// code and description from the version line (e.g. `NATS/1.0 503`).
    pub fn parse_block(block: &[u8]) -> Result<(HeaderMap, Option<u16>, Option<String>), String> {
        let text = std::str::from_utf8(block).map_err(|_| "header block is not UTF-8".to_string())?;
        let mut lines = text.split("\r\n");

        let version_line = lines.next().unwrap_or_default();
        let rest = version_line
            .strip_prefix(HEADER_VERSION_LINE)
            .ok_or_else(|| format!("unexpected header version line: {version_line}"))?;
        let rest = rest.trim();
        let (status, description) = if rest.is_empty() {
            (None, None)
        } else {
            let (code, desc) = match rest.split_once(' ') {
                Some((code, desc)) => (code, Some(desc.trim().to_string())),
                None => (rest, None),
            };
            let code = code
                .parse::<u16>()
                .map_err(|_| format!("invalid status code in header block: {code}"))?;
            (Some(code), desc.filter(|d| !d.is_empty()))
        };

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| format!("malformed header line: {line}"))?;
            headers.append(name.trim(), value.trim());
        }

        Ok((headers, status, description))
    }
}

/// A message delivered to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
    /// Inline status from an `HMSG` header block (e.g. 503 no responders)
    pub status: Option<u16>,
    pub description: Option<String>,
    pub(crate) sid: u64,
}

impl Message {
    pub fn sid(&self) -> u64 {
        self.sid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_parses_with_defaults() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"server_id":"abc","version":"2.10.0","max_payload":1048576,"headers":true}"#,
        )
        .unwrap();
        assert_eq!(info.server_id, "abc");
        assert_eq!(info.max_payload, 1048576);
        assert!(info.headers);
        assert!(!info.auth_required);

        let minimal: ServerInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(minimal.max_payload, 1024 * 1024);
    }

    #[test]
    fn test_connect_info_omits_absent_credentials() {
        let json = serde_json::to_string(&ConnectInfo::default()).unwrap();
        assert!(!json.contains("auth_token"));
        assert!(!json.contains("\"pass\""));
        assert!(json.contains("\"lang\":\"rust\""));

        let with_user = ConnectInfo {
            user: Some("alice".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&with_user).unwrap();
        assert!(json.contains("\"pass\":\"pw\""));
    }

    #[test]
    fn test_header_block_layout() {
        let mut headers = HeaderMap::new();
        headers.append("Trace-Id", "1");
        headers.append("Trace-Id", "2");
        assert_eq!(
            headers.to_block(),
            b"NATS/1.0\r\nTrace-Id: 1\r\nTrace-Id: 2\r\n\r\n".to_vec()
        );
        assert_eq!(headers.get("Trace-Id"), Some("2"));
        assert_eq!(headers.get_all("Trace-Id").count(), 2);
    }

    #[test]
    fn test_header_insert_replaces() {
        let mut headers = HeaderMap::new();
        headers.append("A", "1");
        headers.append("A", "2");
        headers.insert("A", "3");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("A"), Some("3"));
    }

    #[test]
    fn test_parse_header_block_with_status() {
        let (headers, status, description) =
            HeaderMap::parse_block(b"NATS/1.0 503 No Responders\r\n\r\n").unwrap();
        assert!(headers.is_empty());
        assert_eq!(status, Some(503));
        assert_eq!(description.as_deref(), Some("No Responders"));
    }

    #[test]
    fn test_parse_header_block_rejects_bad_version() {
        assert!(HeaderMap::parse_block(b"HTTP/1.1\r\n\r\n").is_err());
        assert!(HeaderMap::parse_block(b"NATS/1.0\r\nbroken-line\r\n\r\n").is_err());
    }
}
