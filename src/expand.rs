//! Variable expansion — `%u`-style templates resolved from request state.
//!
//! Used by cache keys, `username_format`, and driver templates. The
//! resolved values are collected into a [`VarTable`] by the request so
//! this module stays free of request internals.

/// Request-derived variable values. Unset entries expand to "".
#[derive(Debug, Clone, Default)]
pub struct VarTable {
    /// `%u` — full username
    pub user: String,
    /// `%s` — service name
    pub service: String,
    /// `%h` — home directory, when a userdb already provided one
    pub home: Option<String>,
    /// `%l` — local IP
    pub local_ip: Option<String>,
    /// `%r` — remote IP
    pub remote_ip: Option<String>,
    /// `%p` — client process id
    pub client_pid: Option<u32>,
    /// `%w` — mechanism-provided plaintext password
    pub password: Option<String>,
    /// `%i` — connect uid
    pub connect_uid: Option<u32>,
}

impl VarTable {
    /// `%n` — username without the domain part.
    fn username(&self) -> &str {
        self.user.split('@').next().unwrap_or("")
    }

    /// `%d` — domain part of the username, "" when absent.
    fn domain(&self) -> &str {
        match self.user.split_once('@') {
            Some((_, d)) => d,
            None => "",
        }
    }
}

/// Expand `template`, resolving `%c` codes from `table`.
///
/// `escape` is applied to the values that may carry user-controlled
/// bytes (user, domain parts, password); `%%` yields a literal `%`;
/// unknown codes pass through literally.
pub fn expand(template: &str, table: &VarTable, escape: Option<&dyn Fn(&str) -> String>) -> String {
    let esc = |s: &str| match escape {
        Some(f) => f(s),
        None => s.to_string(),
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('u') => out.push_str(&esc(&table.user)),
            Some('n') => out.push_str(&esc(table.username())),
            Some('d') => out.push_str(&esc(table.domain())),
            Some('s') => out.push_str(&table.service),
            Some('h') => out.push_str(&esc(table.home.as_deref().unwrap_or(""))),
            Some('l') => out.push_str(table.local_ip.as_deref().unwrap_or("")),
            Some('r') => out.push_str(table.remote_ip.as_deref().unwrap_or("")),
            Some('p') => {
                if let Some(pid) = table.client_pid {
                    out.push_str(&pid.to_string());
                }
            }
            Some('w') => out.push_str(&esc(table.password.as_deref().unwrap_or(""))),
            Some('i') => {
                if let Some(uid) = table.connect_uid {
                    out.push_str(&uid.to_string());
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
