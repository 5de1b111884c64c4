//! SSRF-safe media fetching
//!
//! Remote attachments are fetched with bounded size and time, and URLs that
//! resolve to private or link-local address ranges are refused unless the
//! config explicitly allows them.

use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

use futures::StreamExt;

use crate::config::MediaConfig;
use crate::{Error, Result};

use super::{MediaRef, MediaStore};

/// Fetch a URL into the media store.
///
/// # Errors
///
/// Returns [`Error::Media`] when the URL is refused, the response exceeds
/// the size budget, or the fetch times out.
pub async fn fetch_into_store(
    store: &MediaStore,
    url: &str,
    filename: Option<&str>,
) -> Result<MediaRef> {
    let config = store.config().clone();
    check_url(url, &config)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Media(format!(
            "fetch failed with status {}: {url}",
            response.status()
        )));
    }

    if let Some(len) = response.content_length() {
        if len > config.max_fetch_bytes {
            return Err(Error::Media(format!(
                "attachment exceeds size cap ({len} > {} bytes)",
                config.max_fetch_bytes
            )));
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .split(';')
        .next()
        .unwrap_or("application/octet-stream")
        .to_string();

    // Content-Length can lie; enforce the cap while streaming
    let mut data = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (data.len() + chunk.len()) as u64 > config.max_fetch_bytes {
            return Err(Error::Media(format!(
                "attachment exceeds size cap ({} bytes)",
                config.max_fetch_bytes
            )));
        }
        data.extend_from_slice(&chunk);
    }

    store.put(&data, &content_type, filename)
}

/// Refuse URLs whose host resolves to a private range
fn check_url(url: &str, config: &MediaConfig) -> Result<()> {
    let parsed: reqwest::Url = url
        .parse()
        .map_err(|_| Error::Media(format!("invalid url: {url}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(Error::Media(format!("refusing scheme {other}: {url}"))),
    }

    if config.allow_private_networks {
        return Ok(());
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Media(format!("url has no host: {url}")))?;
    let port = parsed.port_or_known_default().unwrap_or(443);

    // Resolve now and vet every address; the request re-resolves, which
    // leaves a small TOCTOU window acceptable for a local-first gateway.
    let addrs: Vec<IpAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Media(format!("dns resolution failed for {host}: {e}")))?
        .map(|a| a.ip())
        .collect();

    if addrs.is_empty() {
        return Err(Error::Media(format!("dns returned no addresses: {host}")));
    }

    for addr in addrs {
        if is_private(addr) {
            return Err(Error::Media(format!(
                "refusing private address {addr} for {host}"
            )));
        }
    }

    Ok(())
}

/// Loopback, RFC1918, link-local, CGNAT and unique-local ranges
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 (CGNAT)
                || (o[0] == 100 && (64..128).contains(&o[1]))
                // 169.254.169.254 and friends are covered by link_local
                || o[0] == 0
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (seg[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (seg[0] & 0xffc0) == 0xfe80
                // v4-mapped
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private(IpAddr::V4(v4)))
        }
    }
}
