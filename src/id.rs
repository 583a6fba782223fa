use nanoid::nanoid;

/// Canonical alphabet for engine-generated identifiers (no ambiguous glyphs).
const ID_ALPHABET: &[char] = &[
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y',
    'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'm', 'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];
/// Default generated-id length, shared by document `$id`s and junction
/// collection name suffixes.
const ID_LENGTH: usize = 20;

/// Generates a random, collision-resistant `$id` for a document whose
/// caller didn't supply one.
pub fn generate_document_id() -> String {
    nanoid!(ID_LENGTH, ID_ALPHABET)
}

/// Generates a random `$id` for an attribute or index whose caller didn't
/// supply an explicit key.
pub fn generate_attribute_id() -> String {
    nanoid!(ID_LENGTH, ID_ALPHABET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_has_expected_length_and_charset() {
        let id = generate_document_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(id.chars().all(|c| ID_ALPHABET.contains(&c)));
    }

    #[test]
    fn ids_are_not_trivially_repeated() {
        let a = generate_document_id();
        let b = generate_document_id();
        assert_ne!(a, b);
    }
}
