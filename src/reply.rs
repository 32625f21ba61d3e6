//! Reply buffer — tab-separated `key` / `key=value` accumulator.
//!
//! Used for serializing lookup results to front-ends, to workers, and
//! into the cache. Values are escaped so that TAB/LF never appear raw
//! inside a record; keys are required to be clean.

/// Escape a value for embedding in a reply record.
///
/// `0x01` → `0x01 '1'`, TAB → `0x01 't'`, LF → `0x01 'n'`,
/// everything else passes through.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\u{1}' => out.push_str("\u{1}1"),
            '\t' => out.push_str("\u{1}t"),
            '\n' => out.push_str("\u{1}n"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape_value`]. Unknown escape pairs are dropped.
pub fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\u{1}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('1') => out.push('\u{1}'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            _ => {}
        }
    }
    out
}

/// Split one record into `(key, value)`. A record without `=` is a
/// bare flag and yields `(key, None)`.
pub fn parse_field(record: &str) -> (&str, Option<&str>) {
    match record.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (record, None),
    }
}

/// A growable tab-separated reply.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    buf: String,
}

impl Reply {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    fn push_separator(&mut self) {
        if !self.buf.is_empty() {
            self.buf.push('\t');
        }
    }

    fn check_key(key: &str) {
        // Broken keys are a bug in the caller, not peer input.
        if key.is_empty() || key.contains('\t') || key.contains('\n') {
            panic!("reply key {key:?} contains disallowed characters");
        }
    }

    /// Append `key=value` with the value escaped.
    pub fn add(&mut self, key: &str, value: &str) {
        Self::check_key(key);
        self.push_separator();
        self.buf.push_str(key);
        self.buf.push('=');
        self.buf.push_str(&escape_value(value));
    }

    /// Append a bare `key` flag record.
    pub fn add_flag(&mut self, key: &str) {
        Self::check_key(key);
        self.push_separator();
        self.buf.push_str(key);
    }

    /// Append an already-serialized fragment verbatim, separator included.
    pub fn import(&mut self, serialized: &str) {
        if serialized.is_empty() {
            return;
        }
        self.push_separator();
        self.buf.push_str(serialized);
    }

    /// Delete one record matching `key` (bare or `key=value`), collapsing
    /// the surrounding separator.
    pub fn remove(&mut self, key: &str) {
        let mut start = 0;
        let bytes = self.buf.as_bytes();
        while start < bytes.len() {
            let end = self.buf[start..]
                .find('\t')
                .map(|p| start + p)
                .unwrap_or(bytes.len());
            let record = &self.buf[start..end];
            let matches = record == key
                || (record.len() > key.len()
                    && record.starts_with(key)
                    && record.as_bytes()[key.len()] == b'=');
            if matches {
                if end < bytes.len() {
                    // interior record: remove trailing separator too
                    self.buf.replace_range(start..end + 1, "");
                } else if start > 0 {
                    // last record: remove the separator before it
                    self.buf.replace_range(start - 1..end, "");
                } else {
                    self.buf.clear();
                }
                return;
            }
            start = end + 1;
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The serialized form.
    pub fn export(&self) -> &str {
        &self.buf
    }

    /// Lazy iterator over the raw records.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.buf.split('\t').filter(|r| !r.is_empty())
    }

    /// Lazy iterator over `(key, unescaped value)` pairs.
    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<String>)> {
        self.split()
            .map(|rec| {
                let (k, v) = parse_field(rec);
                (k, v.map(unescape_value))
            })
    }
}
