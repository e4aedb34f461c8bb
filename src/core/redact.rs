//! Masking of credentials in diagnostic text.
//!
//! VPN command lines, subprocess stderr and device-agent details can all carry
//! secrets. Anything that ends up in a log line, an RPC error or a job's
//! failure reason goes through [`redact`] first.

use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

pub const MASK: &str = "****";

/// A resolved credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // key=value and key: value forms
            (
                r"(?i)\b(password|passwd|pass|secret|token|psk|private_?key)(\s*[=:]\s*)\S+",
                "${1}${2}****",
            ),
            // WireGuard config lines
            (r"(?im)^(\s*(?:PrivateKey|PresharedKey)\s*=\s*).+$", "${1}****"),
            // openfortivpn / generic short flag
            (r"(\s-p\s+)\S+", "${1}****"),
            // --password x, --password=x, --passwd=x
            (r"(?i)(--pass(?:word|wd)?(?:=|\s+))\S+", "${1}****"),
            (r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+", "${1}****"),
            // userinfo in URLs
            (r"(://[^/\s:@]+:)[^@\s]+@", "${1}****@"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
    })
}

/// Mask well-known secret-bearing fields.
pub fn redact(text: &str) -> Cow<'_, str> {
    let mut result = Cow::Borrowed(text);
    for (re, replacement) in patterns() {
        if re.is_match(&result) {
            result = Cow::Owned(re.replace_all(&result, *replacement).into_owned());
        }
    }
    result
}

/// Mask well-known fields plus every occurrence of the given secret values.
pub fn redact_with(text: &str, secrets: &[&Secret]) -> String {
    let mut result = redact(text).into_owned();
    for secret in secrets {
        if !secret.is_empty() {
            result = result.replace(secret.expose(), MASK);
        }
    }
    result
}
