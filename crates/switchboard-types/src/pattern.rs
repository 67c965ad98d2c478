/// Glob pattern matching for tool policies and permission overrides.
///
/// Patterns support `*` matching any character sequence (including empty).
/// Everything else matches literally. This is the whole grammar; policies
/// that need more than prefix/suffix/infix wildcards have historically been
/// a sign the tool naming is wrong, not the matcher.

/// Match `name` against a single glob pattern.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut remainder = name;

    // First segment must anchor at the start.
    let first = segments[0];
    if !remainder.starts_with(first) {
        return false;
    }
    remainder = &remainder[first.len()..];

    // Middle segments match greedily left-to-right.
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match remainder.find(segment) {
            Some(pos) => remainder = &remainder[pos + segment.len()..],
            None => return false,
        }
    }

    // Last segment must anchor at the end.
    let last = segments[segments.len() - 1];
    last.is_empty() || remainder.ends_with(last)
}

/// True if `name` matches any of the patterns.
pub fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, name))
}
