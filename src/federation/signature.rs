//! HTTP Signatures for ActivityPub
//!
//! Header parsing, signed-string reconstruction, outbound signing and
//! RSA-SHA256 verification per draft-cavage-http-signatures-06 as used by
//! https://docs.joinmastodon.org/spec/security/

use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, NaiveDateTime, Utc};
use http::{HeaderMap, HeaderValue};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Pseudo-header covering the method and path of the request.
pub const REQUEST_TARGET: &str = "(request-target)";

const DEFAULT_SIGNED_HEADERS: &str = "date";

/// Parameters of a `Signature` header.
///
/// Holds every well-formed `name="value"` pair. Names keep the case they
/// were sent with (`keyId`), values are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureParameters {
    params: HashMap<String, String>,
}

impl SignatureParameters {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn key_id(&self) -> Option<&str> {
        self.non_blank("keyId")
    }

    /// Base64-encoded signature
    pub fn signature(&self) -> Option<&str> {
        self.non_blank("signature")
    }

    pub fn algorithm(&self) -> Option<&str> {
        self.non_blank("algorithm")
    }

    /// Ordered, lower-cased list of signed header names.
    ///
    /// Falls back to `date` when the parameter is absent or blank.
    pub fn signed_headers(&self) -> Vec<String> {
        self.non_blank("headers")
            .unwrap_or(DEFAULT_SIGNED_HEADERS)
            .split_whitespace()
            .map(|name| name.to_ascii_lowercase())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn non_blank(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|value| !value.trim().is_empty())
    }
}

/// Parse a `Signature` header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// Segments that are not exactly `name="value"` are skipped. A repeated
/// name keeps its last value.
pub fn parse_signature_params(header: &str) -> SignatureParameters {
    let mut params = HashMap::new();

    for segment in header.split(',') {
        if let Some((name, value)) = parse_segment(segment.trim()) {
            params.insert(name.to_string(), value.to_string());
        }
    }

    SignatureParameters { params }
}

fn parse_segment(segment: &str) -> Option<(&str, &str)> {
    let (name, quoted) = segment.split_once('=')?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }

    let value = quoted.strip_prefix('"')?.strip_suffix('"')?;
    if value.is_empty() || value.contains('"') {
        return None;
    }

    Some((name, value))
}

/// Extract keyId from the Signature header without verifying anything.
pub fn extract_signature_key_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("signature")?;
    let raw = String::from_utf8_lossy(raw.as_bytes());
    parse_signature_params(&raw).key_id().map(ToOwned::to_owned)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    strip_fragment(key_id) == strip_fragment(actor_id)
}

pub(crate) fn strip_fragment(uri: &str) -> &str {
    uri.split('#').next().unwrap_or(uri)
}

/// Canonical Header-Case form of a header name (`x-forwarded-for` → `X-Forwarded-For`).
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Rebuild the string the remote signed.
///
/// `digest` is always recomputed from `body` so a forged `Digest` header
/// cannot stand in for the real payload.
pub fn build_signed_string(
    signed_headers: &[String],
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> String {
    signed_headers
        .iter()
        .map(|name| match name.as_str() {
            REQUEST_TARGET => format!("{}: {} {}", REQUEST_TARGET, method.to_lowercase(), path),
            "digest" => format!("digest: {}", generate_digest(body)),
            _ => format!("{}: {}", name, header_value(headers, name)),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    let canonical = canonical_header_name(name);
    headers
        .get_all(canonical.as_str())
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).trim().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse an HTTP-date (IMF-fixdate, with RFC 850 and asctime fallbacks).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }

    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Format a timestamp as an IMF-fixdate `Date` header value.
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Verify an RSASSA-PKCS1-v1_5 / SHA-256 signature.
///
/// Malformed keys, bad base64 and signatures of the wrong length all count
/// as "does not match"; nothing here returns an error.
pub fn verify_rsa_sha256(public_key_pem: &str, signed_string: &str, signature_b64: &str) -> bool {
    let Ok(signature_bytes) = BASE64.decode(signature_b64.trim()) else {
        tracing::debug!("Signature is not valid base64");
        return false;
    };

    let Some(public_key) = decode_public_key(public_key_pem) else {
        tracing::debug!("Stored public key could not be decoded");
        return false;
    };

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    let Ok(signature) = Pkcs1v15Signature::try_from(signature_bytes.as_slice()) else {
        return false;
    };

    verifier.verify(signed_string.as_bytes(), &signature).is_ok()
}

fn decode_public_key(pem: &str) -> Option<RsaPublicKey> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .ok()
}

/// Sign a string with an RSA private key (PKCS#8 PEM) and return it base64-encoded.
pub fn sign_string(private_key_pem: &str, signing_string: &str) -> Result<String, AppError> {
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Host header value the signature covers
    pub host: String,
    /// Date header value (IMF-fixdate)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request
///
/// Covers `(request-target) host date` plus `digest` when a body is sent.
/// Used for authorized-fetch GETs of remote actor documents.
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "GET",
///     "https://remote.server/users/alice",
///     None,
///     &private_key,
///     "https://my.server/actor#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = match (parsed_url.host_str(), parsed_url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(AppError::Validation("Missing host in URL".to_string())),
    };

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = format_http_date(Utc::now());
    let digest = body.map(generate_digest);

    let mut headers = HeaderMap::new();
    let mut signed_headers = vec![REQUEST_TARGET.to_string(), "host".to_string(), "date".to_string()];
    headers.insert("host", header_value_from(&host)?);
    headers.insert("date", header_value_from(&date)?);
    if let Some(ref digest_value) = digest {
        headers.insert("digest", header_value_from(digest_value)?);
        signed_headers.push("digest".to_string());
    }

    let signing_string = build_signed_string(
        &signed_headers,
        method,
        &path_and_query,
        &headers,
        body.unwrap_or_default(),
    );
    let signature_b64 = sign_string(private_key_pem, &signing_string)?;

    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        signed_headers.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature,
        host,
        date,
        digest,
    })
}

fn header_value_from(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Validation(format!("Invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    fn generate_test_keypair() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key pem")
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem");

        (private_key_pem, public_key_pem)
    }

    #[test]
    fn parse_reads_all_well_formed_parameters() {
        let params = parse_signature_params(
            "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\"",
        );

        assert_eq!(params.key_id(), Some("https://remote.example/users/alice#main-key"));
        assert_eq!(params.algorithm(), Some("rsa-sha256"));
        assert_eq!(params.signature(), Some("ZmFrZQ=="));
        assert_eq!(params.signed_headers(), vec!["(request-target)", "host", "date"]);
    }

    #[test]
    fn parse_skips_malformed_segments() {
        let params = parse_signature_params(
            "keyId=\"a\", bogus, x=unquoted, key-id=\"dash\", empty=\"\",signature=\"c2ln\"",
        );

        assert_eq!(params.len(), 2);
        assert_eq!(params.key_id(), Some("a"));
        assert_eq!(params.signature(), Some("c2ln"));
        assert_eq!(params.get("x"), None);
    }

    #[test]
    fn parse_keeps_last_repeated_parameter() {
        let params = parse_signature_params("keyId=\"first\",keyId=\"second\"");
        assert_eq!(params.key_id(), Some("second"));
    }

    #[test]
    fn signed_headers_default_to_date() {
        assert_eq!(parse_signature_params("keyId=\"a\"").signed_headers(), vec!["date"]);
        assert_eq!(
            parse_signature_params("keyId=\"a\",headers=\"   \"").signed_headers(),
            vec!["date"]
        );
    }

    #[test]
    fn extract_signature_key_id_reads_key_id() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static(
                "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\"",
            ),
        );

        assert_eq!(
            extract_signature_key_id(&headers).as_deref(),
            Some("https://remote.example/users/alice#main-key")
        );
        assert_eq!(extract_signature_key_id(&HeaderMap::new()), None);
    }

    #[test]
    fn canonical_header_name_capitalizes_segments() {
        assert_eq!(canonical_header_name("date"), "Date");
        assert_eq!(canonical_header_name("x-forwarded-FOR"), "X-Forwarded-For");
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
    }

    #[test]
    fn build_signed_string_matches_known_layout() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("date", HeaderValue::from_static("Tue, 01 Jan 2024 00:00:00 GMT"));
        headers.insert("digest", HeaderValue::from_static("SHA-256=forged"));

        let signed_headers: Vec<String> = "(request-target) host date digest"
            .split(' ')
            .map(String::from)
            .collect();
        let signed = build_signed_string(&signed_headers, "POST", "/inbox", &headers, b"{}");

        let expected = format!(
            "(request-target): post /inbox\nhost: example.com\ndate: Tue, 01 Jan 2024 00:00:00 GMT\ndigest: SHA-256={}",
            BASE64.encode(Sha256::digest(b"{}"))
        );
        assert_eq!(signed, expected);
    }

    #[test]
    fn build_signed_string_renders_missing_header_empty() {
        let signed = build_signed_string(
            &["accept".to_string()],
            "GET",
            "/",
            &HeaderMap::new(),
            b"",
        );
        assert_eq!(signed, "accept: ");
    }

    #[test]
    fn parse_http_date_reads_imf_fixdate() {
        let parsed = parse_http_date("Mon, 01 Jan 2024 00:00:00 GMT").expect("valid date");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn format_http_date_round_trips() {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(format_http_date(date), "Mon, 01 Jan 2024 00:00:00 GMT");
    }

    #[test]
    fn sign_request_output_verifies() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let signed = sign_request(
            "POST",
            "https://remote.example:8443/inbox?foo=bar",
            Some(body),
            &private_key_pem,
            "https://local.example/actor#main-key",
        )
        .expect("signed");

        assert_eq!(signed.host, "remote.example:8443");
        assert_eq!(signed.digest.as_deref(), Some(generate_digest(body).as_str()));

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).unwrap());
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());

        let params = parse_signature_params(&signed.signature);
        let signing_string = build_signed_string(
            &params.signed_headers(),
            "POST",
            "/inbox?foo=bar",
            &headers,
            body,
        );

        assert!(verify_rsa_sha256(
            &public_key_pem,
            &signing_string,
            params.signature().unwrap()
        ));
    }

    #[test]
    fn verify_rejects_garbage_without_error() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let signature = sign_string(&private_key_pem, "date: x").unwrap();

        assert!(verify_rsa_sha256(&public_key_pem, "date: x", &signature));
        assert!(!verify_rsa_sha256(&public_key_pem, "date: y", &signature));
        assert!(!verify_rsa_sha256(&public_key_pem, "date: x", "!!not base64!!"));
        assert!(!verify_rsa_sha256("not a pem", "date: x", &signature));
        assert!(!verify_rsa_sha256(&public_key_pem, "date: x", "ZmFrZQ=="));
    }

    #[test]
    fn verify_accepts_pkcs1_public_keys() {
        use rsa::pkcs1::EncodeRsaPublicKey;

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        let pkcs1_pem = RsaPublicKey::from(&private_key)
            .to_pkcs1_pem(LineEnding::LF)
            .expect("pkcs1 pem");
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();

        let signature = sign_string(&private_key_pem, "date: x").unwrap();
        assert!(verify_rsa_sha256(&pkcs1_pem, "date: x", &signature));
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
