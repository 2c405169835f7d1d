use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

static WORD: OnceLock<Option<Regex>> = OnceLock::new();

/// Lowercased word tokens of length > 1.
pub fn tokenize(text: &str) -> HashSet<String> {
    let word = WORD.get_or_init(|| Regex::new(r"[\p{L}\p{N}_]+").ok());
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = match word {
        Some(re) => re.find_iter(&lower).map(|m| m.as_str()).collect(),
        None => lower.split_whitespace().collect(),
    };
    tokens
        .into_iter()
        .filter(|t| t.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

/// Fraction of query tokens that occur in `text`, in `[0, 1]`.
///
/// An empty query scores 0.
pub fn overlap_score(query: &str, text: &str) -> f32 {
    let wanted = tokenize(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let present = tokenize(text);
    let hits = wanted.iter().filter(|t| present.contains(*t)).count();
    hits as f32 / wanted.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_drops_short() {
        let tokens = tokenize("Q4 sales: a North-Region report");
        assert!(tokens.contains("q4"));
        assert!(tokens.contains("north"));
        assert!(tokens.contains("region"));
        assert!(!tokens.contains("a"));
    }

    #[test]
    fn test_overlap_score() {
        assert_eq!(overlap_score("north sales", "Sales in the north region"), 1.0);
        assert_eq!(overlap_score("north sales", "south sales"), 0.5);
        assert_eq!(overlap_score("north", "inventory"), 0.0);
        assert_eq!(overlap_score("", "anything"), 0.0);
    }
}
