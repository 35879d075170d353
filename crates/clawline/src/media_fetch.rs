// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSRF-hardened media fetch (spec §4.6 step 7, §9 "SSRF defence"):
//! resolves a reply-dispatcher media URL's hostname, rejects loopback/
//! link-local/private destinations, pins the resolved IP into the HTTP
//! client so DNS can't rebind between resolve and connect, then downloads
//! and (for images) re-encodes to fit `maxUploadBytes`.

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use futures_util::StreamExt;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use reqwest::redirect::Policy;
use reqwest::Url;

const MAX_REDIRECTS: usize = 5;
const MAX_REENCODE_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Fetch `url`, enforcing the SSRF and size policy, then re-encode images
/// to fit `max_bytes` where the format supports it.
pub async fn fetch_and_optimize(url: &str, max_bytes: usize, timeout: Duration) -> anyhow::Result<FetchedMedia> {
    let parsed = Url::parse(url).map_err(|e| anyhow::anyhow!("malformed media url: {e}"))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        anyhow::bail!("unsupported media url scheme: {}", parsed.scheme());
    }
    let host = parsed.host_str().ok_or_else(|| anyhow::anyhow!("media url has no host"))?.to_owned();
    let port = parsed.port_or_known_default().unwrap_or(443);

    let pinned_ip = resolve_pinned(&host, port).await?;

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .resolve(&host, SocketAddr::new(pinned_ip, port))
        .build()?;

    let response = client.get(parsed).send().await?.error_for_status()?;
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .split(';')
        .next()
        .unwrap_or("application/octet-stream")
        .to_owned();

    let bytes = download_capped(response, max_bytes).await?;
    let optimized = optimize_image(bytes, &mime_type, max_bytes)?;

    Ok(FetchedMedia { mime_type, bytes: optimized })
}

/// Resolve `host`, reject every candidate IP in loopback/link-local/
/// private ranges, and pin to the first remaining one. Rejecting the
/// whole resolution (rather than just skipping bad candidates) avoids a
/// dispatcher quietly being routed to an internal address on a later
/// retry against the same hostname.
async fn resolve_pinned(host: &str, port: u16) -> anyhow::Result<IpAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        anyhow::bail!("media url host did not resolve to any address");
    }
    if addrs.iter().any(|a| is_disallowed_ip(a.ip())) {
        anyhow::bail!("media url resolves to a disallowed (loopback/link-local/private) address");
    }
    Ok(addrs[0].ip())
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4 == Ipv4Addr::new(169, 254, 169, 254) // cloud metadata endpoint
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || is_ipv6_unique_local(&v6) || is_ipv6_link_local(&v6),
    }
}

fn is_ipv6_unique_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_ipv6_link_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

async fn download_capped(response: reqwest::Response, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > max_bytes {
            anyhow::bail!("media fetch exceeded maxUploadBytes");
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Optimise an image to fit `max_bytes` (spec §4.6: "PNG→PNG if alpha,
/// JPEG→JPEG, GIF passthrough"). Non-image MIME types and images already
/// within budget pass through untouched.
fn optimize_image(bytes: Vec<u8>, mime_type: &str, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
    if bytes.len() <= max_bytes || mime_type == "image/gif" {
        return Ok(bytes);
    }

    let format = match mime_type {
        "image/png" => ImageFormat::Png,
        "image/jpeg" => ImageFormat::Jpeg,
        _ => return Ok(bytes),
    };

    let Ok(mut image) = image::load_from_memory_with_format(&bytes, format) else {
        return Ok(bytes);
    };

    let has_alpha = image.color().has_alpha();
    let mut quality: u8 = 85;

    for _ in 0..MAX_REENCODE_ATTEMPTS {
        let encoded = encode(&image, format, has_alpha, quality)?;
        if encoded.len() <= max_bytes {
            return Ok(encoded);
        }
        if format == ImageFormat::Jpeg && quality > 20 {
            quality -= 15;
        } else {
            let (w, h) = (image.width(), image.height());
            image = image.resize(
                (w as f32 * 0.8) as u32,
                (h as f32 * 0.8) as u32,
                image::imageops::FilterType::Triangle,
            );
        }
    }

    // Best effort: return the last re-encode even if still over budget,
    // rather than the original (which is guaranteed larger).
    encode(&image, format, has_alpha, quality)
}

fn encode(image: &DynamicImage, format: ImageFormat, has_alpha: bool, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        ImageFormat::Png if has_alpha => image.write_to(&mut buf, ImageFormat::Png)?,
        ImageFormat::Png => image.to_rgb8().write_to(&mut buf, ImageFormat::Png)?,
        ImageFormat::Jpeg => {
            let rgb = image.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            encoder.encode_image(&rgb)?;
        }
        _ => image.write_to(&mut buf, format)?,
    }
    Ok(buf.into_inner())
}
