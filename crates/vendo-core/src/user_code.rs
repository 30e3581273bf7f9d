//! Printable, unambiguous redemption codes for new users.

use rand::Rng;

const PREFIX: &str = "CJ-";
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a `CJ-XXXXXX` code from an alphabet excluding visually
/// ambiguous characters (`I`, `O`, `0`, `1`).
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let body: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{PREFIX}{body}")
}

/// Whether `code` matches the `CJ-[A-HJ-NP-Z2-9]{6}` shape.
pub fn is_well_formed(code: &str) -> bool {
    let Some(body) = code.strip_prefix(PREFIX) else { return false };
    body.len() == 6 && body.bytes().all(|b| ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_well_formed() {
        for _ in 0..100 {
            let code = generate();
            assert!(is_well_formed(&code), "{code} not well formed");
        }
    }

    #[test]
    fn rejects_ambiguous_characters() {
        assert!(!is_well_formed("CJ-IIIIII"));
        assert!(!is_well_formed("CJ-OOOOOO"));
        assert!(!is_well_formed("CJ-000000"));
        assert!(!is_well_formed("CJ-111111"));
    }

    #[test]
    fn rejects_wrong_length_or_prefix() {
        assert!(!is_well_formed("CJ-ABCDE"));
        assert!(!is_well_formed("XX-ABCDEF"));
    }
}
