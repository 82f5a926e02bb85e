//! Snippet rendering (spec §6 "Snippet rendering").

/// Lowercases, squeezes whitespace, and trims `content_text`, then centers a
/// 220-char window around the first query token found, or returns the squeezed
/// text as-is when it's already short enough.
pub fn render(content_text: &str, query: &str) -> String {
    let squeezed = squeeze_whitespace(&content_text.to_lowercase());
    if squeezed.chars().count() <= 220 {
        return squeezed;
    }

    let tokens = tokenize(query);
    let byte_pos = tokens
        .iter()
        .find_map(|t| squeezed.find(t.as_str()));

    let chars: Vec<char> = squeezed.chars().collect();
    let center_char_idx = match byte_pos {
        Some(bp) => squeezed[..bp].chars().count(),
        None => 0,
    };

    let lead = 60usize;
    let window = 220usize;
    let start = center_char_idx.saturating_sub(lead);
    let end = (start + window).min(chars.len());
    let start = end.saturating_sub(window).min(start);

    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.extend(chars[start..end].iter());
    if end < chars.len() {
        out.push_str("...");
    }
    out
}

fn squeeze_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// `[^a-z0-9]+`-split tokens, lowercased, non-empty.
fn tokenize(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_returned_as_is() {
        let text = "A short sentence about retries.";
        assert_eq!(render(text, "retries"), "a short sentence about retries.");
    }

    #[test]
    fn long_text_centers_on_first_token_match() {
        let filler_a = "x".repeat(300);
        let text = format!("{filler_a} retry logic lives here {filler_a}");
        let snippet = render(&text, "retry");
        assert!(snippet.contains("retry"));
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
        assert!(snippet.chars().count() <= 226);
    }

    #[test]
    fn tokenize_splits_on_non_alphanumeric() {
        assert_eq!(tokenize("retry-python_sdk!"), vec!["retry", "python", "sdk"]);
    }
}
