use crate::mrtr::generate_key;

/// A fresh base64 AES-256 key for `token.key`.
pub fn run_keygen() -> String {
    generate_key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mrtr::decode_key;

    #[test]
    fn test_generated_key_decodes() {
        let key = run_keygen();
        assert!(decode_key(&key).is_ok());
        assert_ne!(key, run_keygen());
    }
}
