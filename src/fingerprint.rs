//! Stable grouping keys for events
//!
//! A fingerprint is a SHA-256 digest (64 lowercase hex characters) over an
//! event's identity fields. Every field is length-prefixed and each event kind
//! carries its own domain tag, so shifting a separator between two fields or
//! reusing an exception field as a log field cannot produce the same digest.

use crate::events::{Event, EventKind, Level};
use sha2::{Digest, Sha256};

const EXCEPTION_TAG: &[u8] = b"errwatch/exception/v1";
const LOG_TAG: &[u8] = b"errwatch/log/v1";

/// Length of a fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 64;

/// Fingerprint for an exception occurrence
pub fn exception_fingerprint(
    class: &str,
    message: &str,
    file: Option<&str>,
    line: Option<u32>,
    environment: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(EXCEPTION_TAG);
    update_field(&mut hasher, class.as_bytes());
    update_field(&mut hasher, message.as_bytes());
    update_optional(&mut hasher, file.map(str::as_bytes));
    let line = line.map(|l| l.to_be_bytes());
    update_optional(&mut hasher, line.as_ref().map(|l| l.as_slice()));
    update_field(&mut hasher, environment.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint for a log occurrence
pub fn log_fingerprint(level: Level, message: &str, environment: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(LOG_TAG);
    update_field(&mut hasher, level.as_str().as_bytes());
    update_field(&mut hasher, message.as_bytes());
    update_field(&mut hasher, environment.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint an event using the fields that define its identity
///
/// Callers are expected to pass a normalized event so that the same logical
/// error always hashes the same regardless of payload size.
pub fn fingerprint(event: &Event) -> String {
    match &event.kind {
        EventKind::Exception {
            class, file, line, ..
        } => exception_fingerprint(
            class,
            &event.message,
            file.as_deref(),
            *line,
            &event.environment,
        ),
        EventKind::Log => log_fingerprint(event.level, &event.message, &event.environment),
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

// Absent and present-but-empty hash differently.
fn update_optional(hasher: &mut Sha256, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            hasher.update([1u8]);
            update_field(hasher, b);
        }
        None => hasher.update([0u8]),
    }
}
