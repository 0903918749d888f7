//! Credential obfuscation for journaled request headers.
//!
//! Raw request headers are copied into the journal verbatim except for
//! credentials, which are reduced to `<prefix>...<last-4>`. The transform is
//! pure and idempotent: already-obfuscated values pass through unchanged, so
//! re-logging a journal line never degrades it further.

use std::collections::BTreeMap;

use hyper::HeaderMap;

/// Header names whose values are always obfuscated, matched
/// case-insensitively.
const SENSITIVE_KEYS: &[&str] = &["authorization", "x-api-key"];

/// Value prefixes that mark a credential regardless of header name.
/// Ordered longest-first so `sk-ant-` wins over `sk-`.
const SECRET_PREFIXES: &[&str] = &["sk-ant-", "sk-proj-", "sk-", "Bearer "];

/// Obfuscate a full header map into a serializable form.
pub fn obfuscate_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_string();
        let value_str = String::from_utf8_lossy(value.as_bytes()).into_owned();
        let obfuscated = obfuscate_header(&name_str, &value_str);
        out.entry(name_str).or_default().push(obfuscated);
    }
    out
}

/// Obfuscate a single header value given its (case-insensitive) name.
pub fn obfuscate_header(name: &str, value: &str) -> String {
    let sensitive_key = SENSITIVE_KEYS
        .iter()
        .any(|k| name.eq_ignore_ascii_case(k));

    for prefix in SECRET_PREFIXES {
        if let Some(rest) = value.strip_prefix(prefix) {
            return mask(prefix, rest);
        }
    }

    if sensitive_key {
        return mask("", value);
    }

    value.to_string()
}

fn mask(prefix: &str, rest: &str) -> String {
    // Already masked; leave untouched so the transform is idempotent.
    if rest.starts_with("...") {
        return format!("{prefix}{rest}");
    }
    let chars: Vec<char> = rest.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("{prefix}...{tail}")
}
