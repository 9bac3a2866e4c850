use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z in milliseconds since Unix epoch.
const HUB_EPOCH_MS: u64 = 1_735_689_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1; // 4095

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit snowflake generator for connection ids.
///
/// Layout (MSB → LSB):
/// - Bits 63-22: Timestamp (42 bits), ms since the hub epoch
/// - Bits 21-12: Worker ID (10 bits)
/// - Bits 11-0:  Sequence (12 bits), per-ms counter
///
/// Ids are strictly increasing within one generator. If the wall clock
/// moves backwards the generator keeps counting on the last timestamp it
/// saw instead of failing.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Create a generator. Worker ids wider than 10 bits are masked.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id) & WORKER_MASK,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> u64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond: borrow the next one.
                state.last_ms += 1;
            }
        } else {
            state.sequence = 0;
            state.last_ms = now_ms;
        }

        let ts = state.last_ms.saturating_sub(HUB_EPOCH_MS);
        (ts << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker_id << SEQUENCE_BITS) | state.sequence
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(HUB_EPOCH_MS)
}
