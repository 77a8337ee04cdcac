//! Timing-wheel scheduler for timed message delivery.
//!
//! Two independent wheels exist — one keyed by the synchronized ensemble
//! clock, one by the process's local (unsynchronized) clock — so a handler
//! can schedule relative to either without waiting on clock sync.

use crate::codec::Packet;

/// Number of slots in each timing wheel.
pub const WHEEL_SLOTS: usize = 128;

struct Entry {
    due: f64,
    packet: Packet,
}

/// A single timing wheel: `due mod WHEEL_SLOTS` buckets entries, each
/// bucket kept in ascending due-time order so a slot drain never needs to
/// re-sort.
pub struct TimingWheel {
    slots: Vec<Vec<Entry>>,
    cursor: usize,
    /// The `now` passed to the last `advance()` call, used to detect a gap
    /// of a full revolution or more so `advance()` can tell "no time has
    /// passed" apart from "exactly `WHEEL_SLOTS` seconds (or a multiple of
    /// it) have passed", which the cursor position alone cannot.
    last_time: f64,
}

impl Default for TimingWheel {
    fn default() -> Self {
        TimingWheel::new()
    }
}

impl TimingWheel {
    pub fn new() -> Self {
        TimingWheel {
            slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
            cursor: 0,
            last_time: f64::NEG_INFINITY,
        }
    }

    fn slot_for(due: f64) -> usize {
        (due.floor() as i64).rem_euclid(WHEEL_SLOTS as i64) as usize
    }

    /// Schedule `packet` for delivery at or after `due`.
    pub fn schedule(&mut self, due: f64, packet: Packet) {
        let slot = Self::slot_for(due);
        let bucket = &mut self.slots[slot];
        let pos = bucket.partition_point(|e| e.due <= due);
        bucket.insert(pos, Entry { due, packet });
    }

    /// Advance the wheel to `now`, returning every packet now due, in
    /// ascending due-time order. Walking wraps across the `WHEEL_SLOTS`
    /// ring when `now` has advanced past a full revolution's worth of time.
    ///
    /// The target slot itself is always drained: the loop processes the
    /// current slot first and only then checks whether it has reached the
    /// target, so a single-slot advance still drains that slot.
    ///
    /// If `now` has moved at least `WHEEL_SLOTS` seconds past the last call
    /// (a long poll gap, or a clock jump of a multiple of the wheel's
    /// period), the cursor could land back on the same slot it started
    /// from, making the step-walk below a zero-step no-op that would skip
    /// every other slot's now-due entries. That case is swept in full
    /// instead of walked.
    pub fn advance(&mut self, now: f64) -> Vec<Packet> {
        let mut due_now = Vec::new();
        let slot = Self::slot_for(now);

        if now - self.last_time >= WHEEL_SLOTS as f64 {
            for bucket in &mut self.slots {
                let pos = bucket.partition_point(|e| e.due <= now);
                due_now.extend(bucket.drain(0..pos).map(|e| e.packet));
            }
            self.cursor = slot;
            self.last_time = now;
            return due_now;
        }

        let mut steps = 0;
        loop {
            let bucket = &mut self.slots[self.cursor];
            let pos = bucket.partition_point(|e| e.due <= now);
            due_now.extend(bucket.drain(0..pos).map(|e| e.packet));
            if self.cursor == slot {
                break;
            }
            self.cursor = (self.cursor + 1) % WHEEL_SLOTS;
            steps += 1;
            if steps > WHEEL_SLOTS {
                break;
            }
        }
        self.last_time = now;
        due_now
    }

    /// Rewrite every pending entry's due time by `delta`, re-bucketing as
    /// needed, so a clock jump doesn't strand entries in the wrong slot or
    /// leave them due at a time that no longer makes sense once the global
    /// clock has been corrected.
    pub fn shift_all(&mut self, delta: f64) {
        if delta == 0.0 {
            return;
        }
        let mut entries = Vec::new();
        for bucket in &mut self.slots {
            entries.extend(bucket.drain(..));
        }
        for entry in entries {
            self.schedule(entry.due + delta, entry.packet);
        }
    }

    /// Force every pending entry out immediately, regardless of due time
    /// (used when tearing down or by an explicit flush request).
    pub fn flush(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        for bucket in &mut self.slots {
            out.extend(bucket.drain(..).map(|e| e.packet));
        }
        out
    }
}

/// The two clock-domain wheels a context owns.
#[derive(Default)]
pub struct Scheduler {
    pub global: TimingWheel,
    pub local: TimingWheel,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;

    fn packet(addr: &str) -> Packet {
        Packet::Message(Message {
            address: addr.into(),
            args: vec![],
            ttl: 0,
            reliable: true,
            timestamp: 0.0,
        })
    }

    #[test]
    fn entries_due_in_the_past_are_delivered_on_advance() {
        let mut wheel = TimingWheel::new();
        wheel.schedule(1.0, packet("/a"));
        wheel.schedule(2.0, packet("/b"));
        let due = wheel.advance(2.5);
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn entries_due_in_the_future_are_withheld() {
        let mut wheel = TimingWheel::new();
        wheel.schedule(100.0, packet("/a"));
        let due = wheel.advance(1.0);
        assert!(due.is_empty());
    }

    #[test]
    fn same_slot_entries_drain_in_ascending_due_order() {
        let mut wheel = TimingWheel::new();
        wheel.schedule(5.0, packet("/second"));
        wheel.schedule(3.0, packet("/first"));
        let due = wheel.advance(5.0);
        let addrs: Vec<&str> = due
            .iter()
            .map(|p| match p {
                Packet::Message(m) => m.address.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(addrs, ["/first", "/second"]);
    }

    #[test]
    fn flush_drains_everything_regardless_of_due_time() {
        let mut wheel = TimingWheel::new();
        wheel.schedule(999.0, packet("/a"));
        wheel.schedule(1000.0, packet("/b"));
        assert_eq!(wheel.flush().len(), 2);
        assert_eq!(wheel.advance(2000.0).len(), 0);
    }
}
