use uuid::Uuid;

/// First segment of a uuid, enough to disambiguate in branch names and logs.
pub fn short_uuid(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// Turns arbitrary text into a git-ref-safe slug.
pub fn git_branch_id(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    slug.chars().take(32).collect()
}

/// Head of a possibly long string, for safe error payloads.
pub fn head(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
