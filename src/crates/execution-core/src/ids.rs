//! Opaque identifier generation.
//!
//! Execution ids use prefix `"EX"`, event ids use prefix `"EV"`, both
//! followed by 24 characters drawn from a no-look-alike alphabet (no `0`/`O`,
//! `1`/`I`/`l`, to keep ids legible when read aloud or copied by hand).

const ALPHABET: [char; 57] = [
    '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'k', 'm',
    'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G',
    'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

const ID_LEN: usize = 24;

/// Generate an opaque id with the given prefix (`"EX"` or `"EV"`).
pub fn generate(prefix: &str) -> String {
    let mut id = String::with_capacity(prefix.len() + ID_LEN);
    id.push_str(prefix);
    id.push_str(&nanoid::nanoid!(ID_LEN, &ALPHABET));
    id
}

/// Generate a new execution id.
pub fn execution_id() -> String {
    generate("EX")
}

/// Generate a new event id.
pub fn event_id() -> String {
    generate("EV")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_ids_carry_the_ex_prefix_and_expected_length() {
        let id = execution_id();
        assert!(id.starts_with("EX"));
        assert_eq!(id.len(), 2 + ID_LEN);
    }

    #[test]
    fn event_ids_carry_the_ev_prefix() {
        let id = event_id();
        assert!(id.starts_with("EV"));
        assert_eq!(id.len(), 2 + ID_LEN);
    }

    #[test]
    fn ids_avoid_look_alike_characters() {
        for _ in 0..200 {
            let id = execution_id();
            for c in id.chars().skip(2) {
                assert!(!matches!(c, '0' | 'O' | '1' | 'I' | 'l'), "look-alike char {c} in {id}");
            }
        }
    }

    #[test]
    fn ids_are_unique_across_many_draws() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(execution_id()));
        }
    }
}
