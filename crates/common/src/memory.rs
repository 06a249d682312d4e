//! Engine-level memory budget and flush-pressure helpers.
//!
//! Executors reserve bytes for their partial aggregation state when a batch
//! group is created. The reservation carries a pressure signal that tells the
//! aggregator when accumulated state must be flushed as a partial result and
//! reset instead of growing further.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pressure level derived from requested vs granted memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Plenty of budget available.
    Normal,
    /// Budget is tight; flush earlier.
    Elevated,
    /// Budget is heavily constrained.
    Critical,
}

/// Flush guidance derived from memory pressure.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPressureSignal {
    /// Pressure classification.
    pub pressure: MemoryPressure,
    /// Effective budget granted to this executor.
    pub effective_mem_budget_bytes: usize,
    /// Flush trigger ratio numerator.
    pub flush_trigger_ratio_num: u32,
    /// Flush trigger ratio denominator.
    pub flush_trigger_ratio_den: u32,
}

impl MemoryPressureSignal {
    /// Return `estimated_bytes > flush_threshold` in a ratio-safe way.
    #[must_use]
    pub fn should_flush(&self, estimated_bytes: usize) -> bool {
        if self.effective_mem_budget_bytes == 0 {
            return true;
        }
        let estimated = estimated_bytes as u128;
        let den = self.flush_trigger_ratio_den.max(1) as u128;
        let num = self.flush_trigger_ratio_num as u128;
        let budget = self.effective_mem_budget_bytes as u128;
        estimated.saturating_mul(den) > budget.saturating_mul(num)
    }
}

/// Shared engine-level budget manager.
#[derive(Debug)]
pub struct MemoryManager {
    engine_budget_bytes: usize,
    in_use_bytes: AtomicUsize,
}

impl MemoryManager {
    /// Create a manager with an engine-level budget.
    #[must_use]
    pub fn new(engine_budget_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            engine_budget_bytes,
            in_use_bytes: AtomicUsize::new(0),
        })
    }

    /// Bytes not currently reserved.
    #[must_use]
    pub fn available_bytes(&self) -> usize {
        self.engine_budget_bytes
            .saturating_sub(self.in_use_bytes.load(Ordering::Acquire))
    }

    /// Reserve memory for one executor and compute pressure guidance.
    #[must_use]
    pub fn reserve(self: &Arc<Self>, requested_bytes: usize) -> MemoryReservation {
        if self.engine_budget_bytes == usize::MAX || requested_bytes == 0 {
            return MemoryReservation {
                manager: Arc::clone(self),
                reserved_bytes: 0,
                signal: normal_signal(requested_bytes),
            };
        }

        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let available = self.engine_budget_bytes.saturating_sub(current);
            let granted = requested_bytes.min(available);
            let next = current.saturating_add(granted);
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return MemoryReservation {
                    manager: Arc::clone(self),
                    reserved_bytes: granted,
                    signal: signal_for(requested_bytes, granted),
                };
            }
        }
    }
}

fn normal_signal(granted: usize) -> MemoryPressureSignal {
    MemoryPressureSignal {
        pressure: MemoryPressure::Normal,
        effective_mem_budget_bytes: granted,
        flush_trigger_ratio_num: 1,
        flush_trigger_ratio_den: 1,
    }
}

fn signal_for(requested: usize, granted: usize) -> MemoryPressureSignal {
    if requested == 0 {
        return normal_signal(granted);
    }
    let ratio = granted as f64 / requested as f64;
    if ratio >= 0.75 {
        normal_signal(granted)
    } else if ratio >= 0.40 {
        MemoryPressureSignal {
            pressure: MemoryPressure::Elevated,
            effective_mem_budget_bytes: granted,
            flush_trigger_ratio_num: 4,
            flush_trigger_ratio_den: 5,
        }
    } else {
        MemoryPressureSignal {
            pressure: MemoryPressure::Critical,
            effective_mem_budget_bytes: granted,
            flush_trigger_ratio_num: 3,
            flush_trigger_ratio_den: 5,
        }
    }
}

/// RAII reservation that releases engine budget on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    manager: Arc<MemoryManager>,
    reserved_bytes: usize,
    signal: MemoryPressureSignal,
}

impl MemoryReservation {
    /// Pressure signal for this reservation.
    #[must_use]
    pub fn signal(&self) -> MemoryPressureSignal {
        self.signal
    }

    /// Bytes actually granted.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.reserved_bytes > 0 {
            self.manager
                .in_use_bytes
                .fetch_sub(self.reserved_bytes, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_releases_budget_on_drop() {
        let manager = MemoryManager::new(100);
        {
            let r1 = manager.reserve(80);
            assert_eq!(r1.signal().effective_mem_budget_bytes, 80);
            let r2 = manager.reserve(80);
            assert_eq!(r2.signal().effective_mem_budget_bytes, 20);
            assert_eq!(r2.signal().pressure, MemoryPressure::Critical);
            assert_eq!(manager.available_bytes(), 0);
        }
        let r3 = manager.reserve(100);
        assert_eq!(r3.signal().effective_mem_budget_bytes, 100);
        assert_eq!(r3.signal().pressure, MemoryPressure::Normal);
    }

    #[test]
    fn should_flush_uses_ratio() {
        let manager = MemoryManager::new(50);
        let reservation = manager.reserve(100);
        let signal = reservation.signal();
        assert_eq!(signal.flush_trigger_ratio_num, 4);
        assert_eq!(signal.flush_trigger_ratio_den, 5);
        assert!(!signal.should_flush(39));
        assert!(signal.should_flush(41));
    }

    #[test]
    fn empty_grant_always_flushes() {
        let manager = MemoryManager::new(10);
        let _hog = manager.reserve(10);
        let starved = manager.reserve(10);
        assert_eq!(starved.reserved_bytes(), 0);
        assert!(starved.signal().should_flush(1));
    }
}
