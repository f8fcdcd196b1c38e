//! `key=value` settings parsing.
//!
//! Sources are whitespace-separated tokens (a kernel command line, or a
//! settings blob with one pair per line). Tokens without `=` are ignored.

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_u64(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u64>().ok()
    }
}

/// Parse bare hex digits (no prefix), as used in quirk table keys.
pub fn parse_hex_u64(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(value, 16).ok()
}

/// Iterate over the `key=value` pairs of a settings source.
pub fn pairs(source: &str) -> impl Iterator<Item = (&str, &str)> {
    source
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .filter(|(key, _)| !key.is_empty())
}
