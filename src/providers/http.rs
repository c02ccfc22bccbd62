use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::AtlasregError;

pub const CHUNK_SIZE: usize = 8192;
const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

/// Blocking HTTP client shared by the upstream adapters. Errors are
/// attributed to `provider`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    provider: String,
}

impl HttpFetcher {
    pub fn new(provider: &str, timeout: Option<Duration>) -> Result<Self, AtlasregError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("atlasreg/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AtlasregError::Filesystem(err.to_string()))?,
        );
        let mut builder = Client::builder().default_headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|err| AtlasregError::NetworkFailure {
            provider: provider.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            client,
            provider: provider.to_string(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, AtlasregError>
    where
        F: FnMut(&Client) -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match make_req(&self.client).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        debug!(provider = %self.provider, status, attempt, "retrying request");
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        debug!(provider = %self.provider, error = %err, attempt, "retrying request");
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(self.network(err));
                }
            }
        }
    }

    pub fn handle_status(&self, response: Response) -> Result<Response, AtlasregError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| format!("{} request failed", self.provider));
        Err(AtlasregError::HttpStatus {
            provider: self.provider.clone(),
            status,
            message,
        })
    }

    pub fn get(&self, url: &str) -> Result<Response, AtlasregError> {
        let response = self.send_with_retries(|client| client.get(url))?;
        self.handle_status(response)
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, AtlasregError> {
        self.get(url)?.json().map_err(|err| self.network(err))
    }

    pub fn get_text(&self, url: &str) -> Result<String, AtlasregError> {
        self.get(url)?.text().map_err(|err| self.network(err))
    }

    pub fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, AtlasregError>
    where
        B: serde::Serialize,
        T: DeserializeOwned,
    {
        let response = self.send_with_retries(|client| client.post(url).json(body))?;
        self.handle_status(response)?
            .json()
            .map_err(|err| self.network(err))
    }

    /// Streams `url` into `destination`, reporting `(downloaded, total)`.
    pub fn download_to(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, AtlasregError> {
        let mut response = self.get(url)?;
        let total = response.content_length().unwrap_or(0);
        let mut file =
            File::create(destination).map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
        let written = copy_with_progress(&mut response, &mut file, total, progress)
            .map_err(|err| AtlasregError::NetworkFailure {
                provider: self.provider.clone(),
                message: format!("{url}: {err}"),
            })?;
        file.flush()
            .map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
        debug!(provider = %self.provider, url, bytes = written, "download finished");
        Ok(written)
    }

    fn network(&self, err: reqwest::Error) -> AtlasregError {
        AtlasregError::NetworkFailure {
            provider: self.provider.clone(),
            message: err.to_string(),
        }
    }
}

/// Copies in fixed chunks. With a known `total` progress is reported after
/// every chunk; otherwise once as `(n, n)` at the end.
pub fn copy_with_progress<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    progress: &mut dyn FnMut(u64, u64),
) -> std::io::Result<u64> {
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut downloaded = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        downloaded += read as u64;
        if total > 0 {
            progress(downloaded, total);
        }
    }
    if total == 0 {
        progress(downloaded, downloaded);
    }
    Ok(downloaded)
}

fn backoff(attempt: usize) {
    thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Percent-encodes a query component.
pub fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn progress_reports_each_chunk_with_known_total() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let mut out = Vec::new();
        let mut calls = Vec::new();
        let written = copy_with_progress(
            &mut Cursor::new(&data),
            &mut out,
            data.len() as u64,
            &mut |done, total| calls.push((done, total)),
        )
        .unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.last(), Some(&(data.len() as u64, data.len() as u64)));
    }

    #[test]
    fn progress_reports_once_without_total() {
        let data = vec![1u8; 100];
        let mut out = Vec::new();
        let mut calls = Vec::new();
        copy_with_progress(&mut Cursor::new(&data), &mut out, 0, &mut |done, total| {
            calls.push((done, total))
        })
        .unwrap();
        assert_eq!(calls, vec![(100, 100)]);
    }

    #[test]
    fn encodes_query_components() {
        assert_eq!(encode_component("Mus musculus"), "Mus%20musculus");
        assert_eq!(encode_component("VISp"), "VISp");
    }
}
