//! Opaque ID generation shared by call IDs and peer IDs (`spec.md` §3).

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 16;

/// Generate a fresh 16-character URL-safe opaque identifier.
///
/// Sampled from a 62-character alphabet, giving ~95 bits of entropy — enough
/// that collisions across any realistic number of calls are not a practical
/// concern (`spec.md` §8, "Unique IDs").
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_ids_of_fixed_length() {
        for _ in 0..50 {
            assert_eq!(generate().len(), ID_LEN);
        }
    }

    #[test]
    fn generates_url_safe_characters_only() {
        let id = generate();
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generates_distinct_ids() {
        let ids: HashSet<String> = (0..1000).map(|_| generate()).collect();
        assert_eq!(ids.len(), 1000, "1000 generated IDs must all be distinct");
    }
}
