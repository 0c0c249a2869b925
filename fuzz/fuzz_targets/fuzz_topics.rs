//! Fuzz testing for topic validation and filter matching.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_topics -- -max_total_time=60
//! ```
//!
//! The input is split on the first NUL byte into a filter and a topic name.
//! A valid topic name is always a valid filter that matches itself.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mqtt_relay::validation::{
    topic_matches, validate_message_text, validate_topic_filter, validate_topic_name,
};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let (filter, topic) = s.split_once('\0').unwrap_or((s, s));

    let _ = validate_message_text(s, 256);
    let _ = validate_topic_filter(filter);

    // Matching is defined for any pair of strings and must not panic.
    let _ = topic_matches(filter, topic);

    if validate_topic_name(topic).is_ok() {
        assert!(validate_topic_filter(topic).is_ok());
        assert!(topic_matches(topic, topic));
    }
});
