use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};

use crate::error::{CoreError, CoreResult};

/// Outcome of a HEAD probe against the origin.
#[derive(Debug, Clone)]
pub struct Probe {
    pub status: u16,
    pub total_bytes: Option<u64>,
    pub accept_ranges: bool,
}

impl Probe {
    /// Range requests are only worth attempting when the origin advertises
    /// byte ranges and a positive length.
    pub fn supports_ranges(&self) -> bool {
        (200..300).contains(&self.status)
            && self.accept_ranges
            && self.total_bytes.map(|n| n > 0).unwrap_or(false)
    }
}

/// A GET in flight. The body is abstract so tests can serve from memory.
pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range_total: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

pub trait HttpClient: Send + Sync {
    fn head(&self, url: &str) -> CoreResult<Probe>;
    fn fetch(&self, url: &str, range: Option<(u64, u64)>) -> CoreResult<FetchResponse>;
}

pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(user_agent: &str) -> CoreResult<Self> {
        // The default whole-request timeout would sever long transfers;
        // cancellation is handled by the caller's token instead.
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn head(&self, url: &str) -> CoreResult<Probe> {
        let resp = self
            .client
            .head(url)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let status = resp.status().as_u16();
        let headers = resp.headers();
        let total_bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Ok(Probe {
            status,
            total_bytes,
            accept_ranges,
        })
    }

    fn fetch(&self, url: &str, range: Option<(u64, u64)>) -> CoreResult<FetchResponse> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            let value = format!("bytes={start}-{end}");
            let value = HeaderValue::from_str(&value)
                .map_err(|err| CoreError::Network(err.to_string()))?;
            request = request.header(RANGE, value);
        }
        let resp = request
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let status = resp.status().as_u16();
        let content_length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let content_range_total = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total);
        Ok(FetchResponse {
            status,
            content_length,
            content_range_total,
            body: Box::new(resp),
        })
    }
}

/// Extract the total from a `Content-Range: bytes 0-0/<N>` header.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let total = rest.rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.parse().ok()
}
