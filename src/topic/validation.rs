//! Topic name and filter validation, and the reference matcher
//!
//! Rules:
//! - Topic names never contain wildcards (+ or #)
//! - `#` occupies a whole level and is always the last level
//! - `+` occupies a whole level
//! - A filter whose first level is a wildcard never matches a `$` topic

/// Maximum encoded length of a topic name or filter
const MAX_TOPIC_LEN: usize = 65535;

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE).
///
/// Shared filters (`$share/{group}/{filter}`) are checked on both parts.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let actual = match filter.strip_prefix("$share/") {
        Some(rest) => {
            let (group, actual) = rest
                .split_once('/')
                .ok_or("invalid shared subscription format")?;
            if group.is_empty() {
                return Err("shared subscription group name cannot be empty");
            }
            if group.contains(['+', '#']) {
                return Err("shared subscription group name cannot contain wildcards");
            }
            if actual.is_empty() {
                return Err("shared subscription filter cannot be empty");
            }
            actual
        }
        None => filter,
    };

    let mut levels = actual.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Whether a filter contains a wildcard level
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

/// Check if a topic filter matches a topic name.
///
/// Case-sensitive; walks both strings level by level without allocating.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // # matches the parent level and everything below it
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
