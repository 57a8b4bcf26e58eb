//! Masks sensitive substrings in text bound for the chat transport.

use regex::Regex;
use std::sync::OnceLock;

const MASKED_IPV4: &str = "***.***.***.**";

const RULES: &[(&str, &str)] = &[
    (r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b", MASKED_IPV4),
    (r"(?i)password[:\s=]+\S+", "password: ********"),
    (r"(?i)key[:\s=]+\S+", "key: ********"),
];

static COMPILED: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

fn compiled() -> &'static [(Regex, &'static str)] {
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(regex) => Some((regex, *replacement)),
                Err(e) => {
                    tracing::error!(pattern, error = %e, "redaction pattern failed to compile");
                    None
                }
            })
            .collect()
    })
}

/// IPv4 literals, `password ...` and `key ...` values are replaced, in that
/// order. Idempotent.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for (regex, replacement) in compiled() {
        out = regex.replace_all(&out, *replacement).into_owned();
    }
    out
}
