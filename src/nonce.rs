use rand::Rng;

/// Alphabet for correlation nonces (upper/lower-case letters only).
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of a correlation nonce in characters.
pub const NONCE_LEN: usize = 9;

/// Generate a random correlation token for a `LISTEN` request.
///
/// The upstream service echoes the nonce back on the matching `RESPONSE`,
/// which is how pending add-topic requests are correlated.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_shape() {
        for _ in 0..100 {
            let nonce = generate();
            assert_eq!(nonce.len(), NONCE_LEN);
            assert!(nonce.chars().all(|c| c.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn test_nonces_vary() {
        let a = generate();
        let b = generate();
        // 52^9 possibilities; a collision here means the RNG is broken.
        assert_ne!(a, b);
    }
}
