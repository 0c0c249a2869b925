//! Fuzz testing for broker payload decoding.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_payload
//! ```
//!
//! Any byte sequence must decode to a message without panicking, and the
//! decoded message must encode and decode again.

#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use mqtt_relay::broker::BrokerMessage;
use mqtt_relay::models::StreamFrame;

fuzz_target!(|data: &[u8]| {
    let message = BrokerMessage::new("demo/messages", data).decode();
    let _ = StreamFrame::from(&message);

    if let Ok(payload) = message.to_payload() {
        let _ = mqtt_relay::models::RelayMessage::from_payload(&payload, Utc::now());
    }
});
