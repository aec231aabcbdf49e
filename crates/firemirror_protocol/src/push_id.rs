//! Chronologically sortable push ids.
//!
//! A push id is 20 characters drawn from a 64-symbol alphabet whose ASCII
//! order matches its numeric order:
//!
//! ```text
//! ┌──────────── 8 chars ───────────┬──────────── 12 chars ───────────┐
//! │ wall-clock millis, MSB first   │ random suffix / counter         │
//! └────────────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! When a call lands on a millisecond that is not strictly newer than the
//! previous one (same millisecond, or the clock stepped backward), the previous
//! suffix is incremented as a big-endian base-64 counter instead of drawing
//! fresh randomness, and the previous timestamp is kept. Ids produced by one
//! generator therefore sort in call order.

use parking_lot::Mutex;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Alphabet used for push ids, in ascending ASCII order.
pub const PUSH_CHARS: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Length of every push id.
pub const PUSH_ID_LEN: usize = 20;

const TIMESTAMP_LEN: usize = 8;
const SUFFIX_LEN: usize = PUSH_ID_LEN - TIMESTAMP_LEN;

static GLOBAL: PushIdGenerator = PushIdGenerator::new();

/// Generates a push id from the process-wide generator.
pub fn generate_push_id() -> String {
    GLOBAL.generate()
}

#[derive(Debug)]
struct GeneratorState {
    last_millis: Option<u64>,
    suffix: [u8; SUFFIX_LEN],
}

/// Serialized push id generator.
///
/// All callers share one counter state behind a lock, so ids handed out by
/// the same generator are strictly increasing in real-time call order.
#[derive(Debug)]
pub struct PushIdGenerator {
    state: Mutex<GeneratorState>,
}

impl PushIdGenerator {
    /// Creates a generator with no history.
    pub const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(GeneratorState {
                last_millis: None,
                suffix: [0; SUFFIX_LEN],
            }),
        }
    }

    /// Generates an id stamped with the current wall-clock time.
    pub fn generate(&self) -> String {
        self.generate_at(now_millis())
    }

    /// Generates an id as if the clock read `millis`.
    pub fn generate_at(&self, millis: u64) -> String {
        let mut state = self.state.lock();

        let stamp = match state.last_millis {
            Some(last) if millis <= last => {
                if increment_suffix(&mut state.suffix) {
                    // Suffix wrapped; move the prefix forward to stay ordered.
                    last + 1
                } else {
                    last
                }
            }
            _ => {
                let mut rng = rand::thread_rng();
                for digit in state.suffix.iter_mut() {
                    *digit = rng.gen_range(0..64);
                }
                millis
            }
        };
        state.last_millis = Some(stamp);

        encode(stamp, &state.suffix)
    }
}

impl Default for PushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Adds one to the suffix counter. Returns true when the counter wrapped.
fn increment_suffix(suffix: &mut [u8; SUFFIX_LEN]) -> bool {
    for digit in suffix.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return false;
        }
    }
    true
}

fn encode(millis: u64, suffix: &[u8; SUFFIX_LEN]) -> String {
    let mut out = [0u8; PUSH_ID_LEN];
    let mut remaining = millis;
    for slot in out[..TIMESTAMP_LEN].iter_mut().rev() {
        *slot = PUSH_CHARS[(remaining % 64) as usize];
        remaining /= 64;
    }
    for (slot, digit) in out[TIMESTAMP_LEN..].iter_mut().zip(suffix) {
        *slot = PUSH_CHARS[*digit as usize];
    }
    out.iter().map(|&b| b as char).collect()
}

fn symbol_value(symbol: u8) -> Option<u64> {
    PUSH_CHARS
        .iter()
        .position(|&c| c == symbol)
        .map(|pos| pos as u64)
}

/// Returns true if `candidate` has the shape of a push id.
pub fn is_push_id(candidate: &str) -> bool {
    candidate.len() == PUSH_ID_LEN && candidate.bytes().all(|b| symbol_value(b).is_some())
}

/// Recovers the millisecond timestamp encoded in a push id.
pub fn decode_timestamp(id: &str) -> Option<u64> {
    if !is_push_id(id) {
        return None;
    }
    id.as_bytes()[..TIMESTAMP_LEN]
        .iter()
        .try_fold(0u64, |acc, &b| Some(acc * 64 + symbol_value(b)?))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
