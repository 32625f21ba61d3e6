//! Password schemes — verify/generate plus the credential translator.
//!
//! A stored credential is a scheme-tagged string `{SCHEME}data`, where
//! `SCHEME` may carry an encoding suffix (`.b64`, `.hex`) overriding
//! the scheme's native text encoding. The translator converts a stored
//! credential into the scheme a mechanism asked for, when possible.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use md5::Md5;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// RFC 5802: iteration count SHOULD be at least 4096; cap keeps
/// hostile passdb entries from stalling verification.
pub const SCRAM_MIN_ITERATIONS: u32 = 4096;
pub const SCRAM_MAX_ITERATIONS: u32 = i32::MAX as u32;
const SCRAM_DEFAULT_ITERATIONS: u32 = 4096;

const SSHA_SALT_LEN: usize = 4;
const SHA1_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeError {
    UnknownScheme(String),
    /// Credential data does not parse under its declared scheme.
    InvalidFormat(String),
}

impl std::fmt::Display for SchemeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownScheme(s) => write!(f, "unknown password scheme {s}"),
            Self::InvalidFormat(msg) => write!(f, "invalid credential: {msg}"),
        }
    }
}

impl std::error::Error for SchemeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Plain,
    PlainMd5,
    Sha256,
    Ssha256,
    ScramSha1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Native,
    Base64,
    Hex,
}

impl Scheme {
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" | "CLEARTEXT" => Some(Self::Plain),
            "PLAIN-MD5" => Some(Self::PlainMd5),
            "SHA256" => Some(Self::Sha256),
            "SSHA256" => Some(Self::Ssha256),
            "SCRAM-SHA-1" => Some(Self::ScramSha1),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::PlainMd5 => "PLAIN-MD5",
            Self::Sha256 => "SHA256",
            Self::Ssha256 => "SSHA256",
            Self::ScramSha1 => "SCRAM-SHA-1",
        }
    }
}

/// Two scheme names are aliases when they resolve to the same scheme
/// (e.g. PLAIN and CLEARTEXT). Unknown names alias nothing.
pub fn scheme_is_alias(a: &str, b: &str) -> bool {
    match (Scheme::by_name(base_of(a)), Scheme::by_name(base_of(b))) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Split `{SCHEME}data` into `(scheme, data)`.
pub fn extract_scheme(credential: &str) -> Option<(&str, &str)> {
    let rest = credential.strip_prefix('{')?;
    let end = rest.find('}')?;
    Some((&rest[..end], &rest[end + 1..]))
}

fn base_of(scheme: &str) -> &str {
    scheme
        .rsplit_once('.')
        .filter(|(_, enc)| matches!(enc.to_ascii_lowercase().as_str(), "b64" | "base64" | "hex"))
        .map(|(base, _)| base)
        .unwrap_or(scheme)
}

fn split_encoding(scheme: &str) -> Result<(Scheme, Encoding), SchemeError> {
    let (base, enc) = match scheme.rsplit_once('.') {
        Some((base, suffix)) => match suffix.to_ascii_lowercase().as_str() {
            "b64" | "base64" => (base, Encoding::Base64),
            "hex" => (base, Encoding::Hex),
            _ => (scheme, Encoding::Native),
        },
        None => (scheme, Encoding::Native),
    };
    let parsed =
        Scheme::by_name(base).ok_or_else(|| SchemeError::UnknownScheme(scheme.to_string()))?;
    Ok((parsed, enc))
}

fn native_encoding(scheme: Scheme) -> Encoding {
    match scheme {
        // PLAIN and SCRAM-SHA-1 store text, not a digest
        Scheme::Plain | Scheme::ScramSha1 => Encoding::Native,
        Scheme::PlainMd5 => Encoding::Hex,
        Scheme::Sha256 | Scheme::Ssha256 => Encoding::Base64,
    }
}

fn hex_decode(data: &str) -> Result<Vec<u8>, SchemeError> {
    if data.len() % 2 != 0 {
        return Err(SchemeError::InvalidFormat("odd hex length".into()));
    }
    (0..data.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&data[i..i + 2], 16)
                .map_err(|_| SchemeError::InvalidFormat("bad hex digit".into()))
        })
        .collect()
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decode a credential's data portion into the scheme's raw byte form.
pub fn decode(data: &str, scheme: &str) -> Result<Vec<u8>, SchemeError> {
    let (parsed, mut enc) = split_encoding(scheme)?;
    if enc == Encoding::Native {
        enc = native_encoding(parsed);
    }
    let raw = match enc {
        Encoding::Native => data.as_bytes().to_vec(),
        Encoding::Base64 => B64
            .decode(data)
            .map_err(|_| SchemeError::InvalidFormat("bad base64".into()))?,
        Encoding::Hex => hex_decode(data)?,
    };
    validate_raw(parsed, &raw)?;
    Ok(raw)
}

fn validate_raw(scheme: Scheme, raw: &[u8]) -> Result<(), SchemeError> {
    match scheme {
        Scheme::Plain => Ok(()),
        Scheme::PlainMd5 => (raw.len() == 16)
            .then_some(())
            .ok_or_else(|| SchemeError::InvalidFormat("MD5 digest must be 16 bytes".into())),
        Scheme::Sha256 => (raw.len() == 32)
            .then_some(())
            .ok_or_else(|| SchemeError::InvalidFormat("SHA256 digest must be 32 bytes".into())),
        Scheme::Ssha256 => (raw.len() > 32)
            .then_some(())
            .ok_or_else(|| SchemeError::InvalidFormat("SSHA256 entry too short".into())),
        Scheme::ScramSha1 => parse_scram(raw).map(|_| ()),
    }
}

/// Base64 for wire encodings of raw credentials.
pub fn b64_encode(raw: &[u8]) -> String {
    B64.encode(raw)
}

/// Encode raw credential bytes into the scheme's native text form.
pub fn encode_native(raw: &[u8], scheme: Scheme) -> String {
    match native_encoding(scheme) {
        Encoding::Native => String::from_utf8_lossy(raw).into_owned(),
        Encoding::Base64 => B64.encode(raw),
        Encoding::Hex => hex_encode(raw),
    }
}

// ─── SCRAM-SHA-1 ────────────────────────────────────────────────────────────

struct ScramEntry {
    iterations: u32,
    salt: Vec<u8>,
    stored_key: [u8; SHA1_LEN],
    server_key: [u8; SHA1_LEN],
}

/// Stored format: `iterations,salt_b64,stored_key_b64,server_key_b64`.
fn parse_scram(raw: &[u8]) -> Result<ScramEntry, SchemeError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| SchemeError::InvalidFormat("SCRAM entry is not UTF-8".into()))?;
    let fields: Vec<&str> = text.split(',').collect();
    if fields.len() != 4 {
        return Err(SchemeError::InvalidFormat("SCRAM entry needs 4 fields".into()));
    }
    let iterations: u32 = fields[0]
        .parse()
        .map_err(|_| SchemeError::InvalidFormat("bad SCRAM iteration count".into()))?;
    if !(SCRAM_MIN_ITERATIONS..=SCRAM_MAX_ITERATIONS).contains(&iterations) {
        return Err(SchemeError::InvalidFormat("SCRAM iteration count out of range".into()));
    }
    let salt = B64
        .decode(fields[1])
        .map_err(|_| SchemeError::InvalidFormat("bad SCRAM salt".into()))?;
    let stored_key: [u8; SHA1_LEN] = B64
        .decode(fields[2])
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| SchemeError::InvalidFormat("bad SCRAM StoredKey".into()))?;
    let server_key: [u8; SHA1_LEN] = B64
        .decode(fields[3])
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| SchemeError::InvalidFormat("bad SCRAM ServerKey".into()))?;
    Ok(ScramEntry {
        iterations,
        salt,
        stored_key,
        server_key,
    })
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; SHA1_LEN] {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn scram_keys(plain: &str, salt: &[u8], iterations: u32) -> ([u8; SHA1_LEN], [u8; SHA1_LEN]) {
    let mut salted = [0u8; SHA1_LEN];
    pbkdf2_hmac::<Sha1>(plain.as_bytes(), salt, iterations, &mut salted);
    let client_key = hmac_sha1(&salted, b"Client Key");
    let stored_key: [u8; SHA1_LEN] = Sha1::digest(client_key).into();
    let server_key = hmac_sha1(&salted, b"Server Key");
    (stored_key, server_key)
}

fn scram_verify(plain: &str, raw: &[u8]) -> Result<bool, SchemeError> {
    let entry = parse_scram(raw)?;
    let (stored_key, server_key) = scram_keys(plain, &entry.salt, entry.iterations);
    Ok(stored_key == entry.stored_key && server_key == entry.server_key)
}

fn scram_generate(plain: &str) -> Vec<u8> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let (stored_key, server_key) = scram_keys(plain, &salt, SCRAM_DEFAULT_ITERATIONS);
    format!(
        "{},{},{},{}",
        SCRAM_DEFAULT_ITERATIONS,
        B64.encode(salt),
        B64.encode(stored_key),
        B64.encode(server_key)
    )
    .into_bytes()
}

// ─── Verify / generate ──────────────────────────────────────────────────────

/// Verify `plain` against a stored credential's data portion.
///
/// `user` participates for schemes that bind the username into the
/// hash; none of the built-in schemes do, but the contract keeps it.
pub fn verify(
    plain: &str,
    data: &str,
    scheme: &str,
    _user: &str,
) -> Result<bool, SchemeError> {
    let (parsed, _) = split_encoding(scheme)?;
    let raw = decode(data, scheme)?;
    match parsed {
        Scheme::Plain => Ok(raw == plain.as_bytes()),
        Scheme::PlainMd5 => {
            let digest: [u8; 16] = Md5::digest(plain.as_bytes()).into();
            Ok(raw == digest)
        }
        Scheme::Sha256 => {
            let digest: [u8; 32] = Sha256::digest(plain.as_bytes()).into();
            Ok(raw == digest)
        }
        Scheme::Ssha256 => {
            let (digest, salt) = raw.split_at(32);
            let mut hasher = Sha256::new();
            hasher.update(plain.as_bytes());
            hasher.update(salt);
            Ok(digest == &hasher.finalize()[..])
        }
        Scheme::ScramSha1 => scram_verify(plain, &raw),
    }
}

/// Generate raw credential bytes for `scheme` from a plaintext password.
pub fn generate(plain: &str, _user: &str, scheme: &str) -> Result<Vec<u8>, SchemeError> {
    let (parsed, _) = split_encoding(scheme)?;
    Ok(match parsed {
        Scheme::Plain => plain.as_bytes().to_vec(),
        Scheme::PlainMd5 => Md5::digest(plain.as_bytes()).to_vec(),
        Scheme::Sha256 => Sha256::digest(plain.as_bytes()).to_vec(),
        Scheme::Ssha256 => {
            let mut salt = [0u8; SSHA_SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            let mut hasher = Sha256::new();
            hasher.update(plain.as_bytes());
            hasher.update(salt);
            let mut out = hasher.finalize().to_vec();
            out.extend_from_slice(&salt);
            out
        }
        Scheme::ScramSha1 => scram_generate(plain),
    })
}

/// Generate a `{SCHEME}data` tagged credential in the native encoding.
pub fn generate_tagged(plain: &str, user: &str, scheme: &str) -> Result<String, SchemeError> {
    let (parsed, _) = split_encoding(scheme)?;
    let raw = generate(plain, user, scheme)?;
    Ok(format!("{{{}}}{}", parsed.name(), encode_native(&raw, parsed)))
}

// ─── Credential translator ──────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum Translated {
    /// Raw credential bytes plus the scheme they are in.
    Ok(Vec<u8>, String),
    /// The stored credential cannot be presented in the wanted scheme.
    SchemeNotAvailable,
}

/// Convert a stored credential into `wanted_scheme`.
///
/// An empty wanted scheme accepts whatever was stored; aliases pass
/// through; anything else can only be derived when the stored scheme
/// is plaintext. Decode failures surface as errors so the caller can
/// log them apart from plain unavailability.
pub fn translate(
    data: &str,
    input_scheme: &str,
    wanted_scheme: &str,
    user: &str,
) -> Result<Translated, SchemeError> {
    let raw = decode(data, input_scheme)?;

    if wanted_scheme.is_empty() {
        return Ok(Translated::Ok(raw, base_of(input_scheme).to_string()));
    }

    if scheme_is_alias(input_scheme, wanted_scheme) {
        return Ok(Translated::Ok(raw, wanted_scheme.to_string()));
    }

    if !scheme_is_alias(input_scheme, "PLAIN") {
        return Ok(Translated::SchemeNotAvailable);
    }

    // anything can be generated out of a plaintext credential
    let plaintext = String::from_utf8_lossy(&raw).into_owned();
    let generated = generate(&plaintext, user, wanted_scheme)?;
    Ok(Translated::Ok(generated, wanted_scheme.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Scheme names and aliases ────────────────────────────────────────

    #[test]
    fn names_resolve_case_insensitively() {
        assert_eq!(Scheme::by_name("plain"), Some(Scheme::Plain));
        assert_eq!(Scheme::by_name("CLEARTEXT"), Some(Scheme::Plain));
        assert_eq!(Scheme::by_name("scram-sha-1"), Some(Scheme::ScramSha1));
        assert_eq!(Scheme::by_name("NTLM"), None);
    }

    #[test]
    fn alias_checks() {
        assert!(scheme_is_alias("PLAIN", "CLEARTEXT"));
        assert!(scheme_is_alias("plain", "PLAIN"));
        assert!(!scheme_is_alias("PLAIN", "SHA256"));
        assert!(!scheme_is_alias("NOPE", "NOPE"));
    }

    #[test]
    fn extract_scheme_parsing() {
        assert_eq!(extract_scheme("{PLAIN}secret"), Some(("PLAIN", "secret")));
        assert_eq!(extract_scheme("{SHA256.hex}aabb"), Some(("SHA256.hex", "aabb")));
        assert_eq!(extract_scheme("secret"), None);
        assert_eq!(extract_scheme("{unclosed"), None);
    }

    // ─── Verification ────────────────────────────────────────────────────

    #[test]
    fn plain_verify() {
        assert!(verify("secret", "secret", "PLAIN", "u").unwrap());
        assert!(!verify("secret", "other", "PLAIN", "u").unwrap());
        assert!(verify("secret", "secret", "CLEARTEXT", "u").unwrap());
    }

    #[test]
    fn plain_md5_known_vector() {
        // md5("password")
        let stored = "5f4dcc3b5aa765d61d8327deb882cf99";
        assert!(verify("password", stored, "PLAIN-MD5", "u").unwrap());
        assert!(!verify("passwerd", stored, "PLAIN-MD5", "u").unwrap());
    }

    #[test]
    fn sha256_known_vector_via_hex_suffix() {
        // sha256("password")
        let stored = "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8";
        assert!(verify("password", stored, "SHA256.hex", "u").unwrap());
        assert!(!verify("other", stored, "SHA256.hex", "u").unwrap());
    }

    #[test]
    fn generated_credentials_verify() {
        for scheme in ["PLAIN", "PLAIN-MD5", "SHA256", "SSHA256", "SCRAM-SHA-1"] {
            let raw = generate("secret", "alice", scheme).unwrap();
            let parsed = Scheme::by_name(scheme).unwrap();
            let data = encode_native(&raw, parsed);
            assert!(verify("secret", &data, scheme, "alice").unwrap(), "{scheme}");
            assert!(!verify("wrong", &data, scheme, "alice").unwrap(), "{scheme}");
        }
    }

    #[test]
    fn ssha256_salts_differ() {
        let a = generate("secret", "u", "SSHA256").unwrap();
        let b = generate("secret", "u", "SSHA256").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn generate_tagged_form() {
        let tagged = generate_tagged("secret", "u", "cleartext").unwrap();
        assert_eq!(tagged, "{PLAIN}secret");
        let tagged = generate_tagged("secret", "u", "SHA256").unwrap();
        assert!(tagged.starts_with("{SHA256}"));
    }

    #[test]
    fn unknown_scheme_errors() {
        assert!(matches!(
            verify("x", "y", "NTLM", "u"),
            Err(SchemeError::UnknownScheme(_))
        ));
        assert!(matches!(
            generate("x", "u", "NTLM"),
            Err(SchemeError::UnknownScheme(_))
        ));
    }

    #[test]
    fn base64_suffix_decodes_plain() {
        // {PLAIN.b64}c2VjcmV0 is "secret"
        assert!(verify("secret", "c2VjcmV0", "PLAIN.b64", "u").unwrap());
    }

    // ─── SCRAM entry parsing ─────────────────────────────────────────────

    #[test]
    fn scram_rejects_bad_entries() {
        let cases = [
            "not-enough-fields",
            "4096,only,three",
            "abc,c2FsdA==,AAAA,AAAA",
            // iteration count below the RFC minimum
            "100,c2FsdA==,AAAA,AAAA",
        ];
        for c in cases {
            assert!(verify("x", c, "SCRAM-SHA-1", "u").is_err(), "{c}");
        }
    }

    #[test]
    fn scram_entry_round_trip_fields() {
        let raw = generate("secret", "u", "SCRAM-SHA-1").unwrap();
        let text = String::from_utf8(raw).unwrap();
        let fields: Vec<&str> = text.split(',').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "4096");
        assert_eq!(B64.decode(fields[2]).unwrap().len(), 20);
        assert_eq!(B64.decode(fields[3]).unwrap().len(), 20);
    }

    // ─── Translator ──────────────────────────────────────────────────────

    #[test]
    fn empty_wanted_scheme_accepts_anything() {
        let out = translate("5f4dcc3b5aa765d61d8327deb882cf99", "PLAIN-MD5", "", "u").unwrap();
        match out {
            Translated::Ok(_, scheme) => assert_eq!(scheme, "PLAIN-MD5"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn alias_passes_through() {
        let out = translate("secret", "CLEARTEXT", "PLAIN", "u").unwrap();
        assert_eq!(out, Translated::Ok(b"secret".to_vec(), "PLAIN".to_string()));
    }

    #[test]
    fn plaintext_generates_wanted_scheme() {
        let out = translate("secret", "PLAIN", "SHA256", "alice").unwrap();
        match out {
            Translated::Ok(raw, scheme) => {
                assert_eq!(scheme, "SHA256");
                let data = encode_native(&raw, Scheme::Sha256);
                assert!(verify("secret", &data, "SHA256", "alice").unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn digest_cannot_become_other_scheme() {
        let out = translate(
            "5f4dcc3b5aa765d61d8327deb882cf99",
            "PLAIN-MD5",
            "SHA256",
            "u",
        )
        .unwrap();
        assert_eq!(out, Translated::SchemeNotAvailable);
    }

    #[test]
    fn invalid_input_data_is_an_error() {
        assert!(translate("zz-not-hex", "PLAIN-MD5", "", "u").is_err());
    }
}
