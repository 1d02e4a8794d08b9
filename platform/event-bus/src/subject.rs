//! Subject pattern matching shared by the in-memory bus and queue bindings

/// Check if a subject matches a subscription pattern
///
/// Supports NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens
///
/// # Examples
/// - `notification.restaurant.>` matches `notification.restaurant.reservation_new`
/// - `notification.*.system_alert` matches `notification.admin.system_alert`
/// - `notification.admin.*` does NOT match `notification.admin.a.b` (too many tokens)
pub fn matches_pattern(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == ">" {
            return true;
        } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    // Both must be exhausted for a full match (unless pattern ended with `>`)
    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

/// Reject patterns a broker would refuse: empty tokens, or `>` anywhere but last
pub(crate) fn validate_pattern(pattern: &str) -> Result<(), String> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(format!("empty token in pattern '{}'", pattern));
    }
    if let Some(pos) = tokens.iter().position(|t| *t == ">") {
        if pos != tokens.len() - 1 {
            return Err(format!("'>' must be the last token in '{}'", pattern));
        }
    }
    Ok(())
}
