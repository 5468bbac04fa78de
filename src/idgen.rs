//! Distributed unique id generator
//!
//! Ids are 63-bit, roughly time ordered, and unique across nodes as long as
//! each node uses a distinct machine id:
//!
//! ```text
//!  | 39 bits: time since epoch (10 ms units) | 8 bits: sequence | 16 bits: machine |
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const BITS_TIME: u32 = 39;
const BITS_SEQUENCE: u32 = 8;
const BITS_MACHINE: u32 = 16;

const SEQUENCE_MASK: u16 = (1 << BITS_SEQUENCE) - 1;
const TIME_UNIT_MS: u64 = 10;

/// Default epoch: 2014-09-01T00:00:00Z
pub const DEFAULT_EPOCH_MS: u64 = 1_409_529_600_000;

#[derive(Debug)]
struct State {
    elapsed: u64,
    sequence: u16,
}

/// Thread-safe id generator
#[derive(Debug)]
pub struct IdGenerator {
    machine_id: u16,
    epoch_ms: u64,
    state: Mutex<State>,
}

impl IdGenerator {
    /// Create a generator for `machine_id`
    pub fn new(machine_id: u16) -> Self {
        Self::with_epoch(machine_id, DEFAULT_EPOCH_MS)
    }

    /// Create a generator with a custom epoch (milliseconds since Unix epoch)
    pub fn with_epoch(machine_id: u16, epoch_ms: u64) -> Self {
        Self {
            machine_id,
            epoch_ms,
            state: Mutex::new(State {
                elapsed: 0,
                sequence: SEQUENCE_MASK,
            }),
        }
    }

    /// Machine id embedded in every generated id
    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    fn current_elapsed(&self) -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        now_ms.saturating_sub(self.epoch_ms) / TIME_UNIT_MS
    }

    /// Generate the next id
    pub fn next_id(&self) -> Result<u64> {
        let current = self.current_elapsed();
        let mut state = self.state.lock();

        if state.elapsed < current {
            state.elapsed = current;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this tick: borrow the next one
                state.elapsed += 1;
            }
        }

        if state.elapsed >= 1 << BITS_TIME {
            return Err(Error::IdGenerator("time bits exhausted".into()));
        }

        Ok((state.elapsed << (BITS_SEQUENCE + BITS_MACHINE))
            | ((state.sequence as u64) << BITS_MACHINE)
            | self.machine_id as u64)
    }
}

/// Split an id into (elapsed ticks, sequence, machine id)
pub fn decompose(id: u64) -> (u64, u16, u16) {
    let machine = (id & ((1 << BITS_MACHINE) - 1)) as u16;
    let sequence = ((id >> BITS_MACHINE) & SEQUENCE_MASK as u64) as u16;
    let elapsed = id >> (BITS_SEQUENCE + BITS_MACHINE);
    (elapsed, sequence, machine)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let gen = IdGenerator::new(7);
        let mut last = 0;
        let mut seen = HashSet::new();

        for _ in 0..5_000 {
            let id = gen.next_id().unwrap();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_machine_id_is_embedded() {
        let gen = IdGenerator::new(0xBEEF);
        let (elapsed, _, machine) = decompose(gen.next_id().unwrap());

        assert_eq!(machine, 0xBEEF);
        assert!(elapsed > 0);
    }

    #[test]
    fn test_concurrent_generation() {
        let gen = Arc::new(IdGenerator::new(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || {
                    (0..1_000).map(|_| gen.next_id().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 4_000);
    }

    #[test]
    fn test_fits_in_63_bits() {
        let gen = IdGenerator::new(u16::MAX);
        assert!(gen.next_id().unwrap() < 1 << 63);
    }
}
