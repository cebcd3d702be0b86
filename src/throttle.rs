// src/throttle.rs

use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Duration, Instant};

/// Up to one second of unused bandwidth may be spent at once.
const BURST: Duration = Duration::from_secs(1);

/// Bandwidth cap shared by every transfer the manager runs.
///
/// Each call books a time slot on a shared schedule: `n` bytes occupy
/// `n / rate` seconds after the previous booking, and the caller sleeps until
/// its slot has passed. A rate of 0 disables the cap.
#[derive(Clone, Debug)]
pub struct Throttle {
    bytes_per_sec: u64,
    /// End of the last booked slot.
    booked_until: Arc<Mutex<Instant>>,
}

impl Throttle {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            booked_until: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Waits until `amount` bytes may pass.
    pub async fn take(&self, amount: u64) {
        if self.bytes_per_sec == 0 || amount == 0 {
            return;
        }
        let cost = Duration::from_secs_f64(amount as f64 / self.bytes_per_sec as f64);
        let now = Instant::now();
        let slot_end = {
            let mut booked = self.booked_until.lock().unwrap_or_else(PoisonError::into_inner);
            // idle time earns at most one burst of credit
            let earliest = now.checked_sub(BURST).unwrap_or(now);
            *booked = (*booked).max(earliest) + cost;
            *booked
        };
        if slot_end > now {
            tokio::time::sleep_until(slot_end).await;
        }
    }
}
