//! Snowflake request identifiers.
//!
//! 42 bits of milliseconds since a custom epoch, 5 bits of worker id,
//! 5 bits of data-center id and a 12-bit per-millisecond sequence. The
//! process-wide generator is mutex-guarded, so ids are strictly monotonic.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use kasa_types::KasaError;

/// Custom epoch in milliseconds (2015-01-01).
const EPOCH: u64 = 1_420_041_600_000;
const WORKER_ID_BITS: u32 = 5;
const DATA_CENTER_ID_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;

const MAX_WORKER_ID: u64 = (1 << WORKER_ID_BITS) - 1;
const MAX_DATA_CENTER_ID: u64 = (1 << DATA_CENTER_ID_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

pub struct SnowflakeGenerator {
    worker_id: u64,
    data_center_id: u64,
    sequence: u64,
    last_timestamp: u64,
}

impl SnowflakeGenerator {
    pub fn new(worker_id: u64, data_center_id: u64) -> Result<Self, KasaError> {
        if worker_id > MAX_WORKER_ID {
            return Err(KasaError::protocol(format!(
                "worker id can't be greater than {MAX_WORKER_ID}"
            )));
        }
        if data_center_id > MAX_DATA_CENTER_ID {
            return Err(KasaError::protocol(format!(
                "data center id can't be greater than {MAX_DATA_CENTER_ID}"
            )));
        }
        Ok(Self {
            worker_id,
            data_center_id,
            sequence: 0,
            last_timestamp: 0,
        })
    }

    fn current_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub fn generate_id(&mut self) -> u64 {
        // A clock that stepped backwards is treated as standing still;
        // the sequence keeps ids unique and monotonic either way.
        let mut timestamp = Self::current_millis().max(self.last_timestamp);

        if timestamp == self.last_timestamp {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            if self.sequence == 0 {
                // Sequence exhausted; wait for the next millisecond.
                while timestamp <= self.last_timestamp {
                    timestamp = Self::current_millis();
                }
            }
        } else {
            self.sequence = 0;
        }
        self.last_timestamp = timestamp;

        ((timestamp - EPOCH) << (WORKER_ID_BITS + DATA_CENTER_ID_BITS + SEQUENCE_BITS))
            | (self.data_center_id << (SEQUENCE_BITS + WORKER_ID_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | self.sequence
    }
}

static GENERATOR: Mutex<Option<SnowflakeGenerator>> = Mutex::new(None);

/// Next id from the process-wide generator.
pub fn next_id() -> u64 {
    let mut guard = GENERATOR.lock().expect("snowflake generator lock");
    guard
        .get_or_insert_with(|| SnowflakeGenerator::new(1, 1).expect("ids in range"))
        .generate_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_ids_rejected() {
        assert!(SnowflakeGenerator::new(32, 0).is_err());
        assert!(SnowflakeGenerator::new(0, 32).is_err());
        assert!(SnowflakeGenerator::new(31, 31).is_ok());
    }

    #[test]
    fn test_monotonic_and_unique() {
        let mut generator = SnowflakeGenerator::new(1, 1).unwrap();
        let mut last = 0u64;
        for _ in 0..10_000 {
            let id = generator.generate_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_global_generator_is_monotonic() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }
}
