//! HMAC-SHA256 request signing for the cloud APIs the gateway calls.
//!
//! Both the knowledge-base OpenAPI and object storage use the same V4-style
//! construction: a canonical request is hashed into a string-to-sign, which
//! is signed with a key derived from the secret via the chain
//! `date -> region -> service -> "request"`. They differ only in algorithm
//! name and header names, captured by [`SigningScheme`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Payload hash used by pre-signed URLs, whose body is unknown up front.
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Algorithm and header names that distinguish one signing flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningScheme {
    pub algorithm: &'static str,
    pub date_header: &'static str,
    pub content_sha_header: &'static str,
    /// Prefix for query parameters in pre-signed URLs.
    pub query_prefix: &'static str,
}

impl SigningScheme {
    /// Knowledge-base OpenAPI.
    pub const OPENAPI: Self = Self {
        algorithm: "HMAC-SHA256",
        date_header: "X-Date",
        content_sha_header: "X-Content-Sha256",
        query_prefix: "X-",
    };

    /// Object storage.
    pub const TOS: Self = Self {
        algorithm: "TOS4-HMAC-SHA256",
        date_header: "x-tos-date",
        content_sha_header: "x-tos-content-sha256",
        query_prefix: "X-Tos-",
    };
}

/// Access key pair. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// The parts of an HTTP request that go into a signature.
#[derive(Debug, Clone)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Unencoded absolute path, e.g. `/uploads/u1/report.pdf`.
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// Extra headers to sign (e.g. `Content-Type`). `Host` and the scheme's
    /// date/content headers are added automatically.
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    region: String,
    service: String,
    scheme: SigningScheme,
}

impl Signer {
    pub fn new(
        credentials: Credentials,
        region: impl Into<String>,
        service: impl Into<String>,
        scheme: SigningScheme,
    ) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
            scheme,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Compute the headers to attach to `request`: the date header, the
    /// payload hash header, and `Authorization`.
    pub fn sign(&self, request: &SignableRequest<'_>, now: DateTime<Utc>) -> Vec<(String, String)> {
        let timestamp = long_date(now);
        let payload_hash = hex_sha256(request.body);

        let mut headers: BTreeMap<String, String> = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.insert("host".to_string(), request.host.to_string());
        headers.insert(self.scheme.date_header.to_ascii_lowercase(), timestamp.clone());
        headers.insert(
            self.scheme.content_sha_header.to_ascii_lowercase(),
            payload_hash.clone(),
        );

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical = canonical_request(
            request.method,
            request.path,
            &canonical_query(request.query),
            &headers,
            &signed_headers,
            &payload_hash,
        );
        let scope = self.scope(now);
        let signature = self.signature(&timestamp, &scope, &canonical, now);

        let authorization = format!(
            "{} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.scheme.algorithm, self.credentials.access_key
        );

        vec![
            (self.scheme.date_header.to_string(), timestamp),
            (self.scheme.content_sha_header.to_string(), payload_hash),
            ("Authorization".to_string(), authorization),
        ]
    }

    /// Build a query-string signed URL for `method path` on `host`, valid
    /// for `expires`.
    pub fn presign_url(
        &self,
        method: &str,
        url_scheme: &str,
        host: &str,
        path: &str,
        expires: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let timestamp = long_date(now);
        let scope = self.scope(now);
        let prefix = self.scheme.query_prefix;

        let mut query = vec![
            (format!("{prefix}Algorithm"), self.scheme.algorithm.to_string()),
            (
                format!("{prefix}Credential"),
                format!("{}/{scope}", self.credentials.access_key),
            ),
            (format!("{prefix}Date"), timestamp.clone()),
            (format!("{prefix}Expires"), expires.as_secs().to_string()),
            (format!("{prefix}SignedHeaders"), "host".to_string()),
        ];

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host.to_string());
        let canonical_qs = canonical_query(&query);
        let canonical = canonical_request(
            method,
            path,
            &canonical_qs,
            &headers,
            "host",
            UNSIGNED_PAYLOAD,
        );
        let signature = self.signature(&timestamp, &scope, &canonical, now);
        query.push((format!("{prefix}Signature"), signature));

        format!(
            "{url_scheme}://{host}{}?{}",
            uri_encode(path, false),
            canonical_query(&query)
        )
    }

    fn scope(&self, now: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/request",
            short_date(now),
            self.region,
            self.service
        )
    }

    fn signature(
        &self,
        timestamp: &str,
        scope: &str,
        canonical_request: &str,
        now: DateTime<Utc>,
    ) -> String {
        let string_to_sign = format!(
            "{}\n{timestamp}\n{scope}\n{}",
            self.scheme.algorithm,
            hex_sha256(canonical_request.as_bytes())
        );
        let key = signing_key(
            &self.credentials.secret_key,
            &short_date(now),
            &self.region,
            &self.service,
        );
        hex::encode(hmac(&key, string_to_sign.as_bytes()))
    }
}

fn canonical_request(
    method: &str,
    path: &str,
    canonical_query: &str,
    headers: &BTreeMap<String, String>,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in headers {
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(value);
        canonical_headers.push('\n');
    }
    let path = if path.is_empty() { "/" } else { path };
    format!(
        "{}\n{}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        method.to_ascii_uppercase(),
        uri_encode(path, false),
    )
}

/// Encode and sort query parameters into their canonical form. The same
/// string is used on the wire so the server sees exactly what was signed.
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encode everything except RFC 3986 unreserved characters.
/// `/` is left alone unless `encode_slash` is set.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(secret.as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn long_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

fn short_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}
