//! Timing wheel for datapath retransmission deadlines, and TSC helpers.
//!
//! The wheel gives O(1) insertion and expiry checking for per-slot
//! retransmit timers. Cancellation is lazy: the engine revalidates each
//! expired entry against the slot's current request number.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Instant;

/// Entry in the timing wheel, identifying one in-flight request.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    /// Local session number.
    pub session_num: u16,
    /// Request slot index within the session.
    pub sslot_idx: usize,
    /// Request number the timer was armed for.
    pub req_num: u64,
    /// Expiration timestamp in microseconds.
    pub expires_at: u64,
}

impl TimerEntry {
    /// True iff this entry was armed for the given request.
    #[inline]
    fn is_for(&self, session_num: u16, sslot_idx: usize, req_num: u64) -> bool {
        self.session_num == session_num
            && self.sslot_idx == sslot_idx
            && self.req_num == req_num
    }
}

/// Timing wheel: a ring of fixed-duration buckets. A timer lands in the
/// bucket covering its expiry; deadlines past the ring's span park in the
/// last bucket and re-land as the wheel turns.
pub struct TimingWheel {
    buckets: Vec<VecDeque<TimerEntry>>,
    bucket_us: u64,
    cursor: usize,
    now_us: u64,
}

impl TimingWheel {
    /// Create a wheel of `num_buckets` buckets of `bucket_us` each,
    /// starting at timestamp `now_us`.
    pub fn new(num_buckets: usize, bucket_us: u64, now_us: u64) -> Self {
        assert!(num_buckets >= 2);
        assert!(bucket_us > 0);
        Self {
            buckets: vec![VecDeque::new(); num_buckets],
            bucket_us,
            cursor: 0,
            now_us,
        }
    }

    /// Wheel sized for datapath RTO tracking: 256 buckets of 1ms.
    pub fn default_for_rpc(now_us: u64) -> Self {
        Self::new(256, 1000, now_us)
    }

    /// Insert a timer entry. Entries already expired are not inserted.
    pub fn insert(&mut self, entry: TimerEntry) {
        let Some(delta) = entry.expires_at.checked_sub(self.now_us) else {
            return;
        };
        if delta == 0 {
            return;
        }
        let ahead = ((delta / self.bucket_us) as usize).min(self.buckets.len() - 1);
        let bucket = (self.cursor + ahead) % self.buckets.len();
        self.buckets[bucket].push_back(entry);
    }

    /// Advance the wheel to `ts`, pushing expired entries into `out`.
    pub fn advance_into(&mut self, ts: u64, out: &mut Vec<TimerEntry>) {
        if ts <= self.now_us {
            return;
        }

        let len = self.buckets.len();
        let steps = (((ts - self.now_us) / self.bucket_us) as usize).min(len);

        for _ in 0..steps {
            let mut not_due = VecDeque::new();
            while let Some(entry) = self.buckets[self.cursor].pop_front() {
                if entry.expires_at <= ts {
                    out.push(entry);
                } else {
                    not_due.push_back(entry);
                }
            }
            // Parked long deadlines re-land relative to the new timestamp,
            // never back into the bucket being drained.
            for entry in not_due {
                let ahead = (((entry.expires_at - ts) / self.bucket_us) as usize)
                    .clamp(1, len - 1);
                let bucket = (self.cursor + ahead) % len;
                self.buckets[bucket].push_back(entry);
            }
            self.cursor = (self.cursor + 1) % len;
        }

        self.now_us = ts;
    }

    /// Disarm every timer for `(session_num, sslot_idx, req_num)`.
    /// Returns true if at least one entry was removed.
    pub fn cancel(&mut self, session_num: u16, sslot_idx: usize, req_num: u64) -> bool {
        let mut removed = 0usize;
        for bucket in &mut self.buckets {
            bucket.retain(|e| {
                let hit = e.is_for(session_num, sslot_idx, req_num);
                removed += usize::from(hit);
                !hit
            });
        }
        removed > 0
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.buckets.iter().fold(0, |acc, b| acc + b.len())
    }

    /// True if no timers are armed.
    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }
}

/// Monotonic microseconds since the first call in this process.
#[inline]
pub fn current_time_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// Read the CPU timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        current_time_us() * 1000
    }
}

/// Measure the TSC frequency in GHz against the OS clock.
pub fn measure_freq_ghz() -> f64 {
    let t0 = Instant::now();
    let c0 = rdtsc();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let c1 = rdtsc();
    let nanos = t0.elapsed().as_nanos() as f64;
    (c1 - c0) as f64 / nanos
}

/// Convert a TSC cycle count to milliseconds.
#[inline]
pub fn to_msec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(req_num: u64, expires_at: u64) -> TimerEntry {
        TimerEntry {
            session_num: 1,
            sslot_idx: 0,
            req_num,
            expires_at,
        }
    }

    #[test]
    fn test_wheel_basic() {
        let mut wheel = TimingWheel::new(8, 100, 1000);
        wheel.insert(entry(42, 1500));
        assert_eq!(wheel.active_count(), 1);

        let mut expired = Vec::new();
        wheel.advance_into(1200, &mut expired);
        assert!(expired.is_empty());

        wheel.advance_into(1600, &mut expired);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].req_num, 42);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_wheel_expired_not_inserted() {
        let mut wheel = TimingWheel::new(8, 100, 1000);
        wheel.insert(entry(1, 900));
        wheel.insert(entry(2, 1000));
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_wheel_cancel() {
        let mut wheel = TimingWheel::new(8, 100, 1000);
        wheel.insert(entry(42, 1500));
        // A re-armed duplicate for the same request goes too.
        wheel.insert(entry(42, 1700));

        assert!(wheel.cancel(1, 0, 42));
        assert!(!wheel.cancel(1, 0, 42));
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_wheel_cancel_is_selective() {
        let mut wheel = TimingWheel::new(8, 100, 1000);
        wheel.insert(entry(7, 1300));
        wheel.insert(entry(8, 1300));

        assert!(wheel.cancel(1, 0, 7));
        assert_eq!(wheel.active_count(), 1);
        assert!(!wheel.cancel(2, 0, 8)); // wrong session
        assert!(wheel.cancel(1, 0, 8));
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_wheel_multiple() {
        let mut wheel = TimingWheel::new(8, 100, 1000);
        for i in 0..5u64 {
            wheel.insert(entry(i, 1100 + i * 200));
        }
        assert_eq!(wheel.active_count(), 5);

        let mut expired = Vec::new();
        wheel.advance_into(1400, &mut expired);
        assert_eq!(expired.len(), 2); // 1100 and 1300
        assert_eq!(wheel.active_count(), 3);
    }

    #[test]
    fn test_wheel_far_future() {
        let mut wheel = TimingWheel::new(4, 100, 0);
        // Expiry beyond the wheel span parks in the last bucket and
        // survives repeated advances until due.
        wheel.insert(entry(7, 10_000));
        let mut expired = Vec::new();
        wheel.advance_into(395, &mut expired);
        assert!(expired.is_empty());
        wheel.advance_into(11_000, &mut expired);
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_freq_measurement() {
        let ghz = measure_freq_ghz();
        assert!(ghz > 0.0);
        assert!(to_msec((ghz * 1_000_000.0) as u64, ghz) > 0.9);
    }
}
