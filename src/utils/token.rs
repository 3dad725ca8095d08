use rand::{distributions::Alphanumeric, thread_rng, Rng};

pub const ATTEMPT_CODE_LENGTH: usize = 32;

/// Opaque code handed to the review vendor to identify an attempt.
pub fn generate_attempt_code() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ATTEMPT_CODE_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_alphanumeric_and_distinct() {
        let a = generate_attempt_code();
        let b = generate_attempt_code();
        assert_eq!(a.len(), ATTEMPT_CODE_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
