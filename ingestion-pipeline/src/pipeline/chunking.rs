/// Splits `text` on blank lines into paragraphs, then groups consecutive
/// paragraphs into chunks of at most `chunk_size` paragraphs each. Used by
/// `extract_entities` and `extract_facts` to bound a single LLM call's
/// input and to parallelize across chunks.
pub fn chunk_paragraphs(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if paragraphs.is_empty() {
        return Vec::new();
    }

    paragraphs
        .chunks(chunk_size)
        .map(|group| group.join("\n\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_paragraphs_into_chunks_of_given_size() {
        let text = "a\n\nb\n\nc\n\nd\n\ne";
        let chunks = chunk_paragraphs(text, 2);
        assert_eq!(chunks, vec!["a\n\nb", "c\n\nd", "e"]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_paragraphs("   \n\n  ", 5).is_empty());
    }

    #[test]
    fn zero_chunk_size_is_treated_as_one() {
        let chunks = chunk_paragraphs("a\n\nb", 0);
        assert_eq!(chunks, vec!["a", "b"]);
    }
}
