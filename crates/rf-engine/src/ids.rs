//! # Snowflake ids
//!
//! 63-bit, time-sortable ids generated locally: 41 bits of milliseconds since a configured
//! epoch, 10 bits of machine id, 12 bits of per-millisecond sequence.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rf_core::{FeedError, Result};

const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_MACHINE_ID: u16 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Midnight UTC of a `YYYY-MM-DD` date.
pub fn epoch_from_date(date: &str) -> Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| FeedError::Validation(format!("id epoch {date:?}: {e}")))?;
    day.and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .ok_or_else(|| FeedError::Validation(format!("id epoch {date:?} has no midnight")))
}

#[derive(Debug)]
struct State {
    last_ms: i64,
    sequence: i64,
}

#[derive(Debug)]
pub struct IdGenerator {
    epoch_ms: i64,
    machine_id: i64,
    state: Mutex<State>,
}

impl IdGenerator {
    pub fn new(epoch: DateTime<Utc>, machine_id: u16) -> Result<Self> {
        if machine_id > MAX_MACHINE_ID {
            return Err(FeedError::Validation(format!(
                "machine id {machine_id} exceeds {MAX_MACHINE_ID}"
            )));
        }
        Ok(Self {
            epoch_ms: epoch.timestamp_millis(),
            machine_id: i64::from(machine_id),
            state: Mutex::new(State {
                last_ms: -1,
                sequence: 0,
            }),
        })
    }

    /// Epoch given as `YYYY-MM-DD` (midnight UTC).
    pub fn from_epoch_date(date: &str, machine_id: u16) -> Result<Self> {
        Self::new(epoch_from_date(date)?, machine_id)
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        // A clock stepping backwards keeps using the last millisecond so ids stay monotonic.
        let mut now = self.elapsed_ms().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = self.elapsed_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        (now << (MACHINE_BITS + SEQUENCE_BITS))
            | (self.machine_id << SEQUENCE_BITS)
            | state.sequence
    }

    /// When the id was minted.
    pub fn timestamp_of(&self, id: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis((id >> (MACHINE_BITS + SEQUENCE_BITS)) + self.epoch_ms)
    }

    fn elapsed_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.epoch_ms
    }
}
