//! AWS Signature Version 4 request signing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue, Method};
use relay_core::{AwsCredential, RelayError, RelayResult};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use url::Url;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Headers that take part in the signature, in canonical (sorted) order
const SIGNED_HEADER_ORDER: [&str; 5] = [
    "content-type",
    "host",
    "x-amz-content-sha256",
    "x-amz-date",
    "x-amz-security-token",
];

/// Signs requests for one AWS service with one credential
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    credential: AwsCredential,
    service: &'static str,
}

impl SigV4Signer {
    /// Create a signer for `service` (e.g. `bedrock`)
    #[must_use]
    pub fn new(credential: AwsCredential, service: &'static str) -> Self {
        Self {
            credential,
            service,
        }
    }

    /// Region requests are signed for
    #[must_use]
    pub fn region(&self) -> &str {
        &self.credential.region
    }

    /// Add `x-amz-*` and `authorization` headers to `headers`.
    ///
    /// The `host` header is signed but not inserted; the HTTP client derives the
    /// same value from the URL.
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        headers: &mut HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> RelayResult<()> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(sha256_hash(body));

        headers.insert("x-amz-date", header_value(&amz_date)?);
        headers.insert("x-amz-content-sha256", header_value(&payload_hash)?);
        if let Some(token) = &self.credential.session_token {
            headers.insert("x-amz-security-token", header_value(token.expose_secret())?);
        }

        let host = host_header(url)?;
        let (canonical_headers, signed_headers) = canonical_headers(headers, &host);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri(url),
            canonical_query(url),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            self.credential.region, self.service
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
            hex::encode(sha256_hash(canonical_request.as_bytes()))
        );

        let signing_key = signing_key(
            self.credential.secret_access_key.expose_secret(),
            &date_stamp,
            &self.credential.region,
            self.service,
        )?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credential.access_key_id
        );
        headers.insert(http::header::AUTHORIZATION, header_value(&authorization)?);

        Ok(())
    }
}

/// Derive the date/region/service scoped signing key
pub fn signing_key(
    secret: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> RelayResult<[u8; 32]> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn canonical_headers(headers: &HeaderMap, host: &str) -> (String, String) {
    let mut canonical = String::new();
    let mut signed = Vec::new();

    for name in SIGNED_HEADER_ORDER {
        let value = if name == "host" {
            Some(host.to_string())
        } else {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        if let Some(value) = value {
            canonical.push_str(name);
            canonical.push(':');
            canonical.push_str(&value);
            canonical.push('\n');
            signed.push(name);
        }
    }

    (canonical, signed.join(";"))
}

/// Path with every segment URI-encoded once more, as required for every
/// service except S3
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn host_header(url: &Url) -> RelayResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::channel_config(format!("URL has no host: {url}")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn header_value(value: &str) -> RelayResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| RelayError::channel_config(format!("invalid signing header value: {e}")))
}

/// Calculate SHA-256 hash
fn sha256_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Calculate HMAC-SHA256
fn hmac_sha256(key: &[u8], data: &[u8]) -> RelayResult<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| RelayError::internal(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
