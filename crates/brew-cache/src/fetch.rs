use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::io::Read;
use std::path::PathBuf;

use crate::util::PAYLOAD_LIMIT_BYTES;

const URL_REDACTION: &str = "<redacted>";

/// The network collaborator that produces image bytes.
///
/// Timeouts and retries are the source's concern; the cache treats any error as
/// "no value produced" and leaves its state untouched.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Reads `file://` URLs or plain paths from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSource;

#[async_trait]
impl RemoteSource for FileSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let path = match url.strip_prefix("file://") {
            Some(stripped) => PathBuf::from(stripped),
            None => PathBuf::from(url),
        };

        if path.is_dir() {
            return Err(CacheError::UnsupportedFetchUrl {
                url: sanitize_fetch_url(url),
            });
        }

        tokio::fs::read(&path).await.map_err(|err| CacheError::Network {
            message: format!("failed to read {}: {err}", sanitize_fetch_url(url)),
        })
    }
}

/// Blocking HTTP(S) downloads via `ureq`, run on tokio's blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpSource;

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || http_get(&url))
            .await
            .map_err(|err| CacheError::Network {
                message: format!("download task failed: {err}"),
            })?
    }
}

fn http_get(url: &str) -> Result<Vec<u8>> {
    let safe_url = sanitize_fetch_url(url);
    let response = ureq::get(url).call().map_err(|err| {
        let message = match err {
            ureq::Error::Status(code, _response) => {
                format!("server returned status {code} for {safe_url}")
            }
            ureq::Error::Transport(transport) => {
                format!("transport error for {safe_url}: {transport}")
            }
        };
        CacheError::Network { message }
    })?;

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(PAYLOAD_LIMIT_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| CacheError::Network {
            message: format!("failed to read body of {safe_url}: {err}"),
        })?;
    if bytes.len() > PAYLOAD_LIMIT_BYTES {
        return Err(CacheError::Network {
            message: format!("body of {safe_url} exceeds {PAYLOAD_LIMIT_BYTES} bytes"),
        });
    }
    Ok(bytes)
}

/// Picks a source from the URL scheme.
pub fn source_for_url(url: &str) -> Result<Box<dyn RemoteSource>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpSource));
    }
    if url.starts_with("file://") || !url.contains("://") {
        return Ok(Box::new(FileSource));
    }
    Err(CacheError::UnsupportedFetchUrl {
        url: sanitize_fetch_url(url),
    })
}

/// Routes each URL to [`HttpSource`] or [`FileSource`] by scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemeSource;

#[async_trait]
impl RemoteSource for SchemeSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        source_for_url(url)?.fetch(url).await
    }
}

/// Redacts userinfo, query values, and fragments so signed URLs never reach logs.
pub(crate) fn sanitize_fetch_url(url: &str) -> String {
    let Some(scheme_idx) = url.find("://") else {
        return url.to_owned();
    };

    let (scheme, rest) = url.split_at(scheme_idx + 3);
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);

    let authority = match authority.rfind('@') {
        Some(at_pos) => format!("{URL_REDACTION}@{}", &authority[at_pos + 1..]),
        None => authority.to_owned(),
    };

    let (before_fragment, has_fragment) = match tail.find('#') {
        Some(pos) => (&tail[..pos], true),
        None => (tail, false),
    };

    let mut sanitized = match before_fragment.split_once('?') {
        Some((path, query)) => format!("{path}?{}", sanitize_query(query)),
        None => before_fragment.to_owned(),
    };
    if has_fragment {
        sanitized.push('#');
        sanitized.push_str(URL_REDACTION);
    }
    format!("{scheme}{authority}{sanitized}")
}

fn sanitize_query(query: &str) -> String {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let key = part.split_once('=').map_or(part, |(key, _)| key);
            format!("{key}={URL_REDACTION}")
        })
        .collect::<Vec<_>>()
        .join("&")
}
