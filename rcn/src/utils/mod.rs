use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Content-addressed layout: two-character fan-out directory, then the full
/// hash as the file name. `abcd...` lives at `ab/abcd...`.
pub fn hash_to_filename(hash: &str) -> String {
    format!("{}/{}", &hash[..2.min(hash.len())], hash)
}

/// Verify downloaded content against its manifest hash.
pub fn validate_file(content: &[u8], hash: &str) -> bool {
    let digest = hex::encode(Sha256::digest(content));
    digest.eq_ignore_ascii_case(hash)
}

pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Check the `s`/`e` query signature on a served path. `e` is the expiry in
/// unix millis, radix-36 encoded; `s` is the url-safe base64 digest of
/// secret ‖ path ‖ e. Unsigned or expired requests fail.
pub fn check_sign(path: &str, secret: &str, query: &HashMap<String, String>, now_ms: i64) -> bool {
    let (Some(sign), Some(expiry)) = (query.get("s"), query.get("e")) else {
        return false;
    };
    let expected = compute_sign(path, secret, expiry);
    let Ok(expires_at) = i64::from_str_radix(expiry, 36) else {
        return false;
    };
    expected == *sign && now_ms < expires_at
}

pub fn compute_sign(path: &str, secret: &str, expiry: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(expiry.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Encode unix millis as the radix-36 expiry string used in signed urls.
pub fn encode_expiry(ms: i64) -> String {
    let mut n = ms as u64;
    if n == 0 {
        return "0".to_string();
    }
    let digits = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(digits[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("radix-36 digits are ascii")
}

/// A parsed, satisfiable `Range: bytes=start-end` request, clamped to the
/// object size. Only single ranges are honored; anything else falls back to
/// serving the whole object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

pub fn parse_range(header: &str, total: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') || total == 0 {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    let range = if start_s.is_empty() {
        // suffix range: last N bytes
        let n: u64 = end_s.parse().ok()?;
        let n = n.min(total);
        ByteRange {
            start: total - n,
            end: total - 1,
        }
    } else {
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = if end_s.is_empty() {
            total - 1
        } else {
            end_s.parse().ok()?
        };
        ByteRange {
            start,
            end: end.min(total - 1),
        }
    };
    if range.start > range.end || range.start >= total {
        return None;
    }
    Some(range)
}

/// Bytes a response will carry given the object size and an optional Range
/// header. Redirecting backends use this to account traffic they do not
/// stream themselves.
pub fn served_size(total: u64, range: Option<&str>) -> u64 {
    match range.and_then(|h| parse_range(h, total)) {
        Some(r) => r.len(),
        None => total,
    }
}
