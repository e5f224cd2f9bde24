//! Time-sortable identifiers for conversation entities.
//!
//! Ids look like `call_0190f3a2b4c1Xy7...`: a short prefix, twelve hex digits
//! encoding the creation millisecond plus a per-millisecond counter, and a
//! random base62 tail. Ids created later sort after ids created earlier.

use parking_lot::Mutex;
use rand::Rng;

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LENGTH: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Conversation,
    Message,
    Call,
    Checkpoint,
}

impl Prefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prefix::Conversation => "cnv",
            Prefix::Message => "msg",
            Prefix::Call => "call",
            Prefix::Checkpoint => "cpt",
        }
    }
}

struct Clock {
    last_timestamp: u64,
    counter: u64,
}

static CLOCK: Mutex<Clock> = parking_lot::const_mutex(Clock {
    last_timestamp: 0,
    counter: 0,
});

fn random_base62(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| BASE62_CHARS[rng.gen_range(0..62)] as char)
        .collect()
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn create(prefix: Prefix, timestamp: Option<u64>) -> String {
    let current = timestamp.unwrap_or_else(now_millis);

    let counter = {
        let mut clock = CLOCK.lock();
        if clock.last_timestamp != current {
            clock.last_timestamp = current;
            clock.counter = 0;
        }
        clock.counter += 1;
        clock.counter
    };

    // 48 bits: timestamp shifted by 12 bits, low 12 bits hold the counter.
    let encoded = (current.wrapping_mul(0x1000) + (counter & 0xfff)) & 0xffff_ffff_ffff;
    format!(
        "{}_{:012x}{}",
        prefix.as_str(),
        encoded,
        random_base62(LENGTH - 12)
    )
}

pub fn call_id() -> String {
    create(Prefix::Call, None)
}

pub fn message_id() -> String {
    create(Prefix::Message, None)
}

pub fn checkpoint_id() -> String {
    create(Prefix::Checkpoint, None)
}

pub fn timestamp(id: &str) -> Option<u64> {
    let (_, rest) = id.split_once('_')?;
    let hex = rest.get(0..12)?;
    let encoded = u64::from_str_radix(hex, 16).ok()?;
    Some(encoded / 0x1000)
}

pub fn validate_prefix(id: &str, expected: Prefix) -> bool {
    id.split_once('_')
        .is_some_and(|(prefix, _)| prefix == expected.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_uses_prefix_and_fixed_length() {
        let id = create(Prefix::Call, None);
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + LENGTH);
    }

    #[test]
    fn timestamp_round_trips_through_id() {
        let id = create(Prefix::Message, Some(1_700_000_000_000));
        assert_eq!(timestamp(&id), Some(1_700_000_000_000));
    }

    #[test]
    fn ids_created_in_sequence_sort_in_order() {
        let first = create(Prefix::Call, Some(1_700_000_000_000));
        let second = create(Prefix::Call, Some(1_700_000_000_001));
        assert!(first[..17] < second[..17]);
    }

    #[test]
    fn validate_prefix_rejects_other_kinds() {
        let id = checkpoint_id();
        assert!(validate_prefix(&id, Prefix::Checkpoint));
        assert!(!validate_prefix(&id, Prefix::Call));
    }
}
