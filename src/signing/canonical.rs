//! Canonicalization primitives shared by V2 and V4 signing.
//!
//! The V4 algorithm:
//! 1. Build a canonical request
//! 2. Build a string-to-sign binding the algorithm, timestamp, credential
//!    scope, and the SHA-256 of the canonical request
//! 3. Sign it (RSA-SHA256, a remote signBlob call, or an HMAC key chain)
//!
//! Every function here is pure.  A single byte of difference from the
//! service's own canonicalization invalidates the signature.

use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// RFC 3986 unreserved characters stay literal; everything else,
/// including `/`, is percent-encoded with upper-case hex.
const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// As [`RFC3986`] but keeps `/` for object paths.
const RFC3986_PATH: &AsciiSet = &RFC3986.remove(b'/');

/// Payload hash used when the body is not part of the signature.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Header that carries a signed payload hash.
pub const CONTENT_SHA256_HEADER: &str = "x-goog-content-sha256";

/// Region component of every credential scope.
pub const SCOPE_REGION: &str = "auto";

/// Service component of every credential scope.
pub const SCOPE_SERVICE: &str = "storage";

/// Terminator of every credential scope.
pub const SCOPE_TERMINATOR: &str = "goog4_request";

// ── Encoding ────────────────────────────────────────────────────────

/// RFC 3986 encoding.
///
/// - Characters A-Z, a-z, 0-9, -, _, ., ~ are NOT encoded.
/// - All other bytes of the UTF-8 form are percent-encoded.
/// - If `encode_slash` is false, `/` is NOT encoded (for paths).
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let set = if encode_slash { RFC3986 } else { RFC3986_PATH };
    utf8_percent_encode(input, set).to_string()
}

// ── Query string ────────────────────────────────────────────────────

/// Build the canonical query string from decoded `(name, value)` pairs.
///
/// Names and values are encoded with [`uri_encode`] (slash encoded),
/// sorted by encoded name then value, and joined with `&`.  A parameter
/// with no value renders as `name=`.
pub fn canonical_query_string<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut encoded: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

// ── Headers ─────────────────────────────────────────────────────────

/// Canonical header block and signed-header list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalHeaders {
    /// `name:value\n` lines sorted by name.
    pub block: String,
    /// Semicolon-separated, sorted, lower-case names.
    pub signed: String,
}

/// Canonicalize request headers.
///
/// Names are lower-cased and sorted; values are trimmed with runs of
/// internal whitespace collapsed to a single space.  Values of headers
/// that collide after lower-casing are joined with a comma.
pub fn canonical_headers<'a, I>(headers: I) -> CanonicalHeaders
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        grouped
            .entry(name.trim().to_ascii_lowercase())
            .or_default()
            .push(collapse_whitespace(value));
    }

    let mut block = String::new();
    for (name, values) in &grouped {
        block.push_str(name);
        block.push(':');
        block.push_str(&values.join(","));
        block.push('\n');
    }
    let signed = grouped.keys().cloned().collect::<Vec<_>>().join(";");

    CanonicalHeaders { block, signed }
}

/// Collapse consecutive whitespace in a header value to a single space,
/// and trim leading/trailing whitespace.
pub fn collapse_whitespace(s: &str) -> String {
    let trimmed = s.trim();
    let mut result = String::with_capacity(trimmed.len());
    let mut last_was_space = false;
    for ch in trimmed.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                result.push(' ');
                last_was_space = true;
            }
        } else {
            result.push(ch);
            last_was_space = false;
        }
    }
    result
}

// ── Canonical request ───────────────────────────────────────────────

/// Build the canonical request string.
///
/// ```text
/// HTTPMethod + '\n' +
/// CanonicalURI + '\n' +
/// CanonicalQueryString + '\n' +
/// CanonicalHeaders + '\n' +
/// SignedHeaders + '\n' +
/// HashedPayload
/// ```
///
/// The header block already ends in `\n`, so the request contains an
/// empty line between the headers and the signed-header list.
pub fn build_canonical_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &CanonicalHeaders,
    payload_hash: &str,
) -> String {
    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{}\n{}\n{payload_hash}",
        headers.block, headers.signed
    )
}

// ── String to sign ──────────────────────────────────────────────────

/// `DATE/auto/storage/goog4_request`.
pub fn credential_scope(date_stamp: &str) -> String {
    format!("{date_stamp}/{SCOPE_REGION}/{SCOPE_SERVICE}/{SCOPE_TERMINATOR}")
}

/// Build the string to sign.
///
/// ```text
/// Algorithm + '\n' +
/// Timestamp + '\n' +
/// CredentialScope + '\n' +
/// HexEncode(SHA256(CanonicalRequest))
/// ```
pub fn build_string_to_sign(
    algorithm: &str,
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hex_sha256(canonical_request.as_bytes());
    format!("{algorithm}\n{timestamp}\n{credential_scope}\n{hash}")
}

/// Lower-case hex SHA-256.
pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ── HMAC key chain ──────────────────────────────────────────────────

/// Derive the HMAC signing key for a date.
///
/// ```text
/// kDate    = HMAC-SHA256("GOOG4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, "auto")
/// kService = HMAC-SHA256(kRegion, "storage")
/// kSigning = HMAC-SHA256(kService, "goog4_request")
/// ```
pub fn derive_signing_key(secret: &str, date_stamp: &str) -> Vec<u8> {
    let k_secret = format!("GOOG4{secret}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, SCOPE_REGION.as_bytes());
    let k_service = hmac_sha256(&k_region, SCOPE_SERVICE.as_bytes());
    hmac_sha256(&k_service, SCOPE_TERMINATOR.as_bytes())
}

/// Compute HMAC-SHA256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── uri_encode ──────────────────────────────────────────────────

    #[test]
    fn test_uri_encode_unreserved() {
        assert_eq!(uri_encode("hello", true), "hello");
        assert_eq!(uri_encode("A-Z_a-z.0~9", true), "A-Z_a-z.0~9");
    }

    #[test]
    fn test_uri_encode_spaces_and_sub_delims() {
        assert_eq!(uri_encode("hello world", true), "hello%20world");
        assert_eq!(uri_encode("a!b'c(d)e*f", true), "a%21b%27c%28d%29e%2Af");
        assert_eq!(uri_encode("foo=bar&baz+", true), "foo%3Dbar%26baz%2B");
    }

    #[test]
    fn test_uri_encode_slash() {
        assert_eq!(uri_encode("path/to/key", true), "path%2Fto%2Fkey");
        assert_eq!(uri_encode("path/to/key", false), "path/to/key");
    }

    #[test]
    fn test_uri_encode_unicode() {
        assert_eq!(uri_encode("ü", true), "%C3%BC");
        assert_eq!(uri_encode("日本", false), "%E6%97%A5%E6%9C%AC");
    }

    // ── canonical_query_string ──────────────────────────────────────

    #[test]
    fn test_canonical_query_empty() {
        assert_eq!(canonical_query_string(Vec::<(&str, &str)>::new()), "");
    }

    #[test]
    fn test_canonical_query_sorted() {
        assert_eq!(
            canonical_query_string([("z", "3"), ("a", "1"), ("m", "2")]),
            "a=1&m=2&z=3"
        );
    }

    #[test]
    fn test_canonical_query_sorts_by_encoded_bytes() {
        // Upper-case sorts before lower-case.
        assert_eq!(
            canonical_query_string([("x-goog-a", "1"), ("X-Goog-Date", "2")]),
            "X-Goog-Date=2&x-goog-a=1"
        );
    }

    #[test]
    fn test_canonical_query_no_value_and_encoding() {
        assert_eq!(
            canonical_query_string([("acl", ""), ("prefix", "a/b c")]),
            "acl=&prefix=a%2Fb%20c"
        );
    }

    // ── canonical_headers ───────────────────────────────────────────

    #[test]
    fn test_canonical_headers_sorted_lowercase() {
        let headers = canonical_headers([
            ("Host", "storage.googleapis.com"),
            ("X-Goog-Meta-Owner", "  Jane    Doe "),
            ("Content-Type", "text/plain"),
        ]);
        assert_eq!(
            headers.block,
            "content-type:text/plain\nhost:storage.googleapis.com\nx-goog-meta-owner:Jane Doe\n"
        );
        assert_eq!(headers.signed, "content-type;host;x-goog-meta-owner");
    }

    #[test]
    fn test_canonical_headers_merges_duplicates() {
        let headers = canonical_headers([("x-goog-meta-a", "1"), ("X-Goog-Meta-A", "2")]);
        assert_eq!(headers.block, "x-goog-meta-a:1,2\n");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  hello   world  "), "hello world");
        assert_eq!(collapse_whitespace("tab\t\tsep"), "tab sep");
        assert_eq!(collapse_whitespace("no-extra"), "no-extra");
    }

    // ── build_canonical_request ─────────────────────────────────────

    #[test]
    fn test_build_canonical_request() {
        let headers = canonical_headers([("host", "storage.googleapis.com")]);
        let result = build_canonical_request("GET", "/b/o", "a=1", &headers, UNSIGNED_PAYLOAD);
        assert_eq!(
            result,
            "GET\n/b/o\na=1\nhost:storage.googleapis.com\n\nhost\nUNSIGNED-PAYLOAD"
        );
    }

    // ── build_string_to_sign ────────────────────────────────────────

    #[test]
    fn test_build_string_to_sign() {
        let result = build_string_to_sign(
            "GOOG4-RSA-SHA256",
            "20260115T103000Z",
            &credential_scope("20260115"),
            "",
        );
        assert_eq!(
            result,
            "GOOG4-RSA-SHA256\n20260115T103000Z\n20260115/auto/storage/goog4_request\n\
             e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    // ── derive_signing_key ──────────────────────────────────────────

    #[test]
    fn test_derive_signing_key_chain() {
        let key = derive_signing_key("secret", "20260115");
        assert_eq!(key.len(), 32);

        let k_date = hmac_sha256(b"GOOG4secret", b"20260115");
        let k_region = hmac_sha256(&k_date, b"auto");
        let k_service = hmac_sha256(&k_region, b"storage");
        let expected = hmac_sha256(&k_service, b"goog4_request");
        assert_eq!(key, expected);
    }

    #[test]
    fn test_derive_signing_key_different_date() {
        assert_ne!(
            derive_signing_key("secret", "20260115"),
            derive_signing_key("secret", "20260116")
        );
    }
}
