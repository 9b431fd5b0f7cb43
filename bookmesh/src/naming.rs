//! Queue and exchange naming.
//!
//! Operation queues are addressed as `<domain>.<action>` and exchanges as
//! `<domain>.exchange`. Callers hardcode these strings, so the scheme is part
//! of the wire contract.

use crate::error::{BridgeError, Result};

/// Verify an access token and return its claims
pub const AUTH_VERIFY_TOKEN: &str = "auth.verify_token";

/// Check that a doctor's schedule exists and is available
pub const DOCTOR_CHECK_SCHEDULE: &str = "doctor.check_schedule";

const EXCHANGE_SUFFIX: &str = "exchange";

pub fn operation_queue(domain: &str, action: &str) -> String {
    format!("{}.{}", domain, action)
}

pub fn exchange_name(domain: &str) -> String {
    format!("{}.{}", domain, EXCHANGE_SUFFIX)
}

/// Check that `name` follows `<domain>.<action>`
pub fn validate_operation(name: &str) -> Result<()> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };

    match name.split_once('.') {
        Some((domain, action)) if valid_part(domain) && valid_part(action) => Ok(()),
        _ => Err(BridgeError::config_error(format!(
            "operation queue '{}' must be named <domain>.<action>",
            name
        ))),
    }
}
