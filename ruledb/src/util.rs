use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

const ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Length of generated record, collection and field ids.
pub const ID_LENGTH: usize = 15;

/// Generate a random 15-character lowercase alphanumeric id.
pub fn new_id() -> String {
    nanoid::nanoid!(ID_LENGTH, &ID_ALPHABET)
}

/// Quote an SQL identifier. Names are validated before they reach SQL, but
/// quoting keeps reserved words usable as field names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Current UTC time in the stored timestamp format (`2024-01-02 03:04:05.678Z`).
pub fn now_timestamp() -> String {
    Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replacen('T', " ", 1)
}

pub fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(id, new_id());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("posts"), "\"posts\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_timestamp_format() {
        let ts = now_timestamp();
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], " ");
    }

    #[test]
    fn test_sha256_parts_are_delimited() {
        assert_ne!(sha256_hex(&["ab", "c"]), sha256_hex(&["a", "bc"]));
        assert_eq!(sha256_hex(&["x"]), sha256_hex(&["x"]));
    }
}
