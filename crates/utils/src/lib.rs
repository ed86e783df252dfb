#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_ROOT: &str = "/etc/decoyd";

pub fn config_root() -> PathBuf {
    std::env::var("DECOY_CONFIG_ROOT")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_ROOT))
}

/// Resolve `path` against the config root when it is relative.
pub fn resolve_config_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_root().join(p)
    }
}

pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }
    hex::decode(&cleaned).map_err(|e| format!("invalid hex: {e}"))
}

/// Strict decode of ASCII hex digits; `None` on odd length or any non-hex byte.
pub fn decode_hex(ascii: &[u8]) -> Option<Vec<u8>> {
    hex::decode(ascii).ok()
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_helpers() {
        assert_eq!(hex_to_bytes("de ad\nBE ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(hex_to_bytes("abc").is_err());
        assert!(hex_to_bytes("zz").is_err());
        assert_eq!(decode_hex(b"0aFF"), Some(vec![0x0a, 0xff]));
        assert_eq!(decode_hex(b"0g"), None);
        assert_eq!(bytes_to_hex(&[0x00, 0x7f, 0xab]), "007fab");
    }

    #[test]
    fn absolute_paths_bypass_root() {
        assert_eq!(
            resolve_config_path("/tmp/router.yaml"),
            PathBuf::from("/tmp/router.yaml")
        );
        assert!(resolve_config_path("router.yaml").ends_with("router.yaml"));
    }
}
