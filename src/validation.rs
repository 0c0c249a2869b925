//! Input validation for topics and message text.
//!
//! MQTT places few restrictions on topic strings, but the ones it does place
//! are enforced by brokers by closing the connection. Rejecting bad input here
//! turns that into a 400 instead of a broker error.

use crate::error::{AppError, AppResult};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum encoded length of an MQTT topic (two-byte length prefix).
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: char = '+';

/// Multi-level wildcard, only valid as the last level of a filter.
pub const MULTI_LEVEL_WILDCARD: char = '#';

/// Checks shared by topic names and topic filters.
fn validate_topic_common(topic: &str, kind: &str) -> AppResult<()> {
    if topic.is_empty() {
        return Err(AppError::BadRequest(format!("{kind} cannot be empty")));
    }

    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(AppError::BadRequest(format!(
            "{kind} cannot exceed {MAX_TOPIC_LENGTH} bytes"
        )));
    }

    if topic.contains('\0') {
        return Err(AppError::BadRequest(format!(
            "{kind} cannot contain the NUL character"
        )));
    }

    Ok(())
}

/// Validate a topic name used for publishing.
///
/// Rules:
/// - 1 to 65535 bytes
/// - No NUL character
/// - No wildcards (`+`, `#`)
pub fn validate_topic_name(topic: &str) -> AppResult<()> {
    validate_topic_common(topic, "Topic")?;

    if let Some(pos) = topic.find([SINGLE_LEVEL_WILDCARD, MULTI_LEVEL_WILDCARD]) {
        return Err(AppError::BadRequest(format!(
            "Topic cannot contain wildcards (found at position {pos})"
        )));
    }

    Ok(())
}

/// Validate a topic filter used for subscribing.
///
/// Rules:
/// - 1 to 65535 bytes
/// - No NUL character
/// - `+` must occupy a whole level
/// - `#` must occupy a whole level and be the last one
pub fn validate_topic_filter(filter: &str) -> AppResult<()> {
    validate_topic_common(filter, "Topic filter")?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();

        if level.contains(MULTI_LEVEL_WILDCARD) && (level.len() != 1 || !is_last) {
            return Err(AppError::BadRequest(
                "Topic filter '#' must be a whole level at the end of the filter".to_string(),
            ));
        }

        if level.contains(SINGLE_LEVEL_WILDCARD) && level.len() != 1 {
            return Err(AppError::BadRequest(
                "Topic filter '+' must occupy a whole level".to_string(),
            ));
        }
    }

    Ok(())
}

/// Check whether `topic` is matched by `filter`.
///
/// Both arguments are assumed to be valid. Topics starting with `$` are not
/// matched by filters starting with a wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with([SINGLE_LEVEL_WILDCARD, MULTI_LEVEL_WILDCARD])
    {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate message text before it is published.
///
/// Rules:
/// - At most `max_length` bytes
/// - No NUL character
///
/// Empty text is allowed; brokers accept empty payloads.
pub fn validate_message_text(text: &str, max_length: usize) -> AppResult<()> {
    if text.len() > max_length {
        return Err(AppError::BadRequest(format!(
            "Message cannot exceed {max_length} bytes (got {})",
            text.len()
        )));
    }

    if text.contains('\0') {
        return Err(AppError::BadRequest(
            "Message cannot contain the NUL character".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name_valid() {
        assert!(validate_topic_name("demo/messages").is_ok());
        assert!(validate_topic_name("aspire/demo/messages").is_ok());
        assert!(validate_topic_name("/leading/slash").is_ok());
        assert!(validate_topic_name("with space").is_ok());
    }

    #[test]
    fn test_topic_name_rejects_wildcards() {
        assert!(validate_topic_name("demo/+").is_err());
        assert!(validate_topic_name("demo/#").is_err());
        assert!(
            validate_topic_name("a+b")
                .unwrap_err()
                .to_string()
                .contains("wildcards")
        );
    }

    #[test]
    fn test_topic_name_rejects_empty_and_nul() {
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("demo\0messages").is_err());
        assert!(validate_topic_name(&"a".repeat(MAX_TOPIC_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_topic_filter_wildcard_placement() {
        assert!(validate_topic_filter("demo/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+/messages").is_ok());
        assert!(validate_topic_filter("demo/+/x/#").is_ok());

        assert!(validate_topic_filter("demo/#/x").is_err());
        assert!(validate_topic_filter("demo/mess#").is_err());
        assert!(validate_topic_filter("demo/a+").is_err());
    }

    #[test]
    fn test_topic_matches_exact_and_wildcards() {
        assert!(topic_matches("demo/messages", "demo/messages"));
        assert!(!topic_matches("demo/messages", "demo/other"));
        assert!(topic_matches("demo/+", "demo/messages"));
        assert!(!topic_matches("demo/+", "demo/messages/extra"));
        assert!(topic_matches("demo/#", "demo/messages/extra"));
        assert!(topic_matches("demo/#", "demo"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("demo/messages/x", "demo/messages"));
    }

    #[test]
    fn test_topic_matches_skips_system_topics_for_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_message_text_limits() {
        assert!(validate_message_text("hello", 10).is_ok());
        assert!(validate_message_text("", 10).is_ok());
        assert!(validate_message_text("hello world", 5).is_err());
        assert!(validate_message_text("bad\0byte", 100).is_err());
    }
}
