//! Text helpers for values persisted alongside jobs.

/// Normalise a free-form tag to lowercase `[a-z0-9_-]`.
pub fn sanitize_key(input: &str) -> String {
    input
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            (c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-').then_some(c)
        })
        .collect()
}

/// Remove `<...>` markup and trim surrounding whitespace.
///
/// An unterminated `<` swallows the rest of the input.
pub fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Keep at most `max_words` whitespace-separated words of `input` (after
/// stripping markup), appending `more` to the last kept word when anything
/// was cut.
pub fn trim_words(input: &str, max_words: usize, more: &str) -> String {
    let stripped = strip_tags(input);
    let words: Vec<&str> = stripped.split_whitespace().collect();
    if words.len() > max_words {
        let mut trimmed = words[..max_words].join(" ");
        trimmed.push_str(more);
        trimmed
    } else {
        words.join(" ")
    }
}
