use std::collections::HashSet;

/// Lowercases and collects the set of 3-character substrings of `text`,
/// the hand-rolled stand-in for a `pg_trgm`-style trigram index: SurrealDB
/// has no native trigram operator, so similarity is computed in Rust over
/// whatever candidate rows the caller has already fetched.
pub fn trigrams(text: &str) -> HashSet<String> {
    let normalized: Vec<char> = text.to_lowercase().chars().collect();
    if normalized.len() < 3 {
        return HashSet::from([normalized.iter().collect::<String>()]);
    }

    normalized
        .windows(3)
        .map(|window| window.iter().collect::<String>())
        .collect()
}

/// Sorensen-Dice coefficient between the trigram sets of `a` and `b`, in
/// `[0.0, 1.0]`.
pub fn dice_coefficient(a: &str, b: &str) -> f32 {
    let set_a = trigrams(a);
    let set_b = trigrams(b);

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    #[allow(clippy::cast_precision_loss)]
    let score = (2 * intersection) as f32 / (set_a.len() + set_b.len()) as f32;
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_one() {
        assert!((dice_coefficient("hello world", "hello world") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn disjoint_strings_score_zero() {
        assert_eq!(dice_coefficient("abc", "xyz"), 0.0);
    }

    #[test]
    fn similar_strings_score_between_bounds() {
        let score = dice_coefficient("rust programming", "rust programing");
        assert!(score > 0.5 && score < 1.0);
    }
}
