//! Username normalization — realm, byte translation, allowed characters.
//!
//! The optional `username_format` template is applied by the request
//! afterwards, since it needs the request's variable table.

pub const DEFAULT_USERNAME_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ01234567890.-_@";

/// Compiled normalization rules, built once from configuration.
#[derive(Debug, Clone)]
pub struct UsernameRules {
    pub default_realm: Option<String>,
    /// 256-entry byte map, 0 = unchanged.
    translation: [u8; 256],
    allowed: [bool; 256],
    pub format: Option<String>,
}

impl UsernameRules {
    /// `translation` is a string of from/to byte pairs ("%@" maps '%'
    /// to '@'); an odd trailing byte is ignored. `chars` is the set of
    /// allowed bytes; empty means all bytes allowed.
    pub fn new(
        default_realm: Option<String>,
        translation: &str,
        chars: &str,
        format: Option<String>,
    ) -> Self {
        let mut table = [0u8; 256];
        let mut pairs = translation.bytes();
        while let (Some(from), Some(to)) = (pairs.next(), pairs.next()) {
            table[from as usize] = to;
        }

        let mut allowed = [chars.is_empty(); 256];
        for b in chars.bytes() {
            allowed[b as usize] = true;
        }

        Self {
            default_realm,
            translation: table,
            allowed,
            format,
        }
    }

    /// Append the default realm (when the name has none), translate
    /// bytes, and reject disallowed ones.
    pub fn fix(&self, username: &str) -> Result<String, &'static str> {
        let mut name = username.to_string();
        if !name.contains('@')
            && let Some(realm) = &self.default_realm
        {
            name = format!("{name}@{realm}");
        }

        let mut out = Vec::with_capacity(name.len());
        for mut b in name.bytes() {
            if self.translation[b as usize] != 0 {
                b = self.translation[b as usize];
            }
            if !self.allowed[b as usize] {
                return Err("Username contains disallowed characters");
            }
            out.push(b);
        }
        // translation output stays in the allowed set, which is ASCII
        String::from_utf8(out).map_err(|_| "Username contains disallowed characters")
    }
}

impl Default for UsernameRules {
    fn default() -> Self {
        Self::new(None, "", DEFAULT_USERNAME_CHARS, None)
    }
}
