//! Network access for streamed sources.
//!
//! The engine only needs three verbs from the network: a HEAD pre-flight, a
//! full GET of the asset, and a cheap liveness probe of the origin. They sit
//! behind [`MediaFetcher`] so players can be driven from in-memory fixtures.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub status: u16,
    pub content_type: Option<String>,
}

impl HeadInfo {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No HTTP response at all (DNS, refused connection, timeout, blocked request).
    #[error("network error: {0}")]
    Network(String),
}

pub trait MediaFetcher: Send + Sync {
    fn head(&self, url: &str) -> Result<HeadInfo, FetchError>;

    fn get(&self, url: &str) -> Result<(HeadInfo, Vec<u8>), FetchError>;

    /// Status code of a GET against `url`; any response proves the host is up.
    fn probe(&self, url: &str) -> Result<u16, FetchError> {
        self.get(url).map(|(info, _)| info.status)
    }
}

/// Content types a media asset may legitimately be served with.
pub fn is_audio_content_type(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ct.starts_with("audio/")
        || ct == "application/octet-stream"
        || ct == "binary/octet-stream"
        || ct == "application/ogg"
}

/// `scheme://host[:port]` of an http(s) URL.
pub fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{host}/"))
}

/// Blocking HTTP fetcher backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    fn info(resp: &reqwest::blocking::Response) -> HeadInfo {
        HeadInfo {
            status: resp.status().as_u16(),
            content_type: resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

impl MediaFetcher for HttpFetcher {
    fn head(&self, url: &str) -> Result<HeadInfo, FetchError> {
        let resp = self
            .client
            .head(url)
            .send()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self::info(&resp))
    }

    fn get(&self, url: &str) -> Result<(HeadInfo, Vec<u8>), FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let info = Self::info(&resp);
        let bytes = resp
            .bytes()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok((info, bytes.to_vec()))
    }

    fn probe(&self, url: &str) -> Result<u16, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(resp.status().as_u16())
    }
}

#[derive(Debug, Clone)]
struct StaticResponse {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

/// In-memory fetcher serving fixed responses; unknown URLs answer 404.
///
/// Used by offline renders of prepared assets and by tests.
#[derive(Default)]
pub struct StaticFetcher {
    responses: Mutex<HashMap<String, StaticResponse>>,
    head_blocked: Mutex<bool>,
    offline_hosts: Mutex<Vec<String>>,
    gets: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, content_type: &str, body: Vec<u8>) {
        self.serve_status(url, 200, Some(content_type), body);
    }

    pub fn serve_status(&self, url: &str, status: u16, content_type: Option<&str>, body: Vec<u8>) {
        self.responses.lock().insert(
            url.to_string(),
            StaticResponse {
                status,
                content_type: content_type.map(str::to_string),
                body,
            },
        );
    }

    /// Make every HEAD fail at the network level while GET keeps working.
    pub fn block_head(&self, blocked: bool) {
        *self.head_blocked.lock() = blocked;
    }

    /// Make every request to URLs starting with `prefix` fail at the network level.
    pub fn take_offline(&self, prefix: &str) {
        self.offline_hosts.lock().push(prefix.to_string());
    }

    /// URLs fetched with GET so far, in order.
    pub fn get_log(&self) -> Vec<String> {
        self.gets.lock().clone()
    }

    fn check_online(&self, url: &str) -> Result<(), FetchError> {
        if self.offline_hosts.lock().iter().any(|p| url.starts_with(p)) {
            return Err(FetchError::Network(format!("connection refused: {url}")));
        }
        Ok(())
    }

    fn lookup(&self, url: &str) -> StaticResponse {
        self.responses
            .lock()
            .get(url)
            .cloned()
            .unwrap_or(StaticResponse {
                status: 404,
                content_type: Some("text/html".to_string()),
                body: Vec::new(),
            })
    }
}

impl MediaFetcher for StaticFetcher {
    fn head(&self, url: &str) -> Result<HeadInfo, FetchError> {
        self.check_online(url)?;
        if *self.head_blocked.lock() {
            return Err(FetchError::Network("HEAD request blocked".to_string()));
        }
        let resp = self.lookup(url);
        Ok(HeadInfo {
            status: resp.status,
            content_type: resp.content_type,
        })
    }

    fn get(&self, url: &str) -> Result<(HeadInfo, Vec<u8>), FetchError> {
        self.check_online(url)?;
        self.gets.lock().push(url.to_string());
        let resp = self.lookup(url);
        Ok((
            HeadInfo {
                status: resp.status,
                content_type: resp.content_type,
            },
            resp.body,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_content_types() {
        assert!(is_audio_content_type("audio/mpeg"));
        assert!(is_audio_content_type("audio/wav; charset=binary"));
        assert!(is_audio_content_type("application/octet-stream"));
        assert!(!is_audio_content_type("text/html; charset=utf-8"));
        assert!(!is_audio_content_type("application/json"));
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(
            origin_of("https://cdn.example.com/a/b.mp3?sig=1"),
            Some("https://cdn.example.com/".to_string())
        );
        assert_eq!(
            origin_of("http://localhost:8000/assets/x.wav"),
            Some("http://localhost:8000/".to_string())
        );
        assert_eq!(origin_of("assets/x.wav"), None);
    }

    #[test]
    fn static_fetcher_defaults_to_404() {
        let f = StaticFetcher::new();
        assert_eq!(f.head("http://x/y").unwrap().status, 404);
        f.serve("http://x/y", "audio/wav", vec![1, 2, 3]);
        let (info, body) = f.get("http://x/y").unwrap();
        assert!(info.is_success());
        assert_eq!(body, vec![1, 2, 3]);
        f.block_head(true);
        assert!(f.head("http://x/y").is_err());
        assert!(f.probe("http://x/").is_ok());
        f.take_offline("http://x");
        assert!(f.probe("http://x/").is_err());
    }
}
