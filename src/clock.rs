//! Clock synchronization: reference election, RTT sampling, and the
//! offset/rate model used to translate local time into ensemble time.

use rand::Rng;
use tracing::{debug, info};

use crate::process::ProcessName;

/// How often a non-reference process sends a ping to the elected reference.
pub const PING_INTERVAL: f64 = 0.1;

/// Number of RTT samples kept in the ring buffer; the minimum observed RTT
/// anchors the offset estimate.
const RTT_SAMPLE_COUNT: usize = 5;

/// An offset correction large enough that smoothing it in would be audibly
/// disruptive; applied as a hard jump instead.
pub const JUMP_THRESHOLD: f64 = 1.0;

/// How far the effective rate is allowed to deviate from `1.0` while
/// smoothing a correction in, so local time never runs backwards.
const SMOOTHING_RATE_DEVIATION: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockStatus {
    Unsynchronized,
    Reference,
    Synchronized,
}

struct RttSample {
    rtt: f64,
    offset: f64,
}

/// Fixed-capacity ring buffer of the last [`RTT_SAMPLE_COUNT`] RTT
/// measurements; the sample with the smallest RTT gives the least noisy
/// offset estimate.
#[derive(Default)]
struct RttRing {
    samples: Vec<RttSample>,
    next: usize,
}

impl RttRing {
    fn push(&mut self, rtt: f64, offset: f64) {
        if self.samples.len() < RTT_SAMPLE_COUNT {
            self.samples.push(RttSample { rtt, offset });
        } else {
            self.samples[self.next] = RttSample { rtt, offset };
            self.next = (self.next + 1) % RTT_SAMPLE_COUNT;
        }
    }

    fn best_offset(&self) -> Option<f64> {
        self.samples
            .iter()
            .min_by(|a, b| a.rtt.partial_cmp(&b.rtt).unwrap())
            .map(|s| s.offset)
    }
}

/// Linear model translating local monotonic time into ensemble (global)
/// time: `global = local * rate + offset`.
#[derive(Debug, Clone, Copy)]
pub struct LinearModel {
    pub offset: f64,
    pub rate: f64,
}

impl Default for LinearModel {
    fn default() -> Self {
        LinearModel { offset: 0.0, rate: 1.0 }
    }
}

impl LinearModel {
    pub fn apply(&self, local: f64) -> f64 {
        local * self.rate + self.offset
    }
}

/// An in-progress smooth correction: the model's `rate` has been nudged
/// away from `1.0` by [`SMOOTHING_RATE_DEVIATION`] so the offset it reports
/// converges on `target_offset` by `close_local` instead of jumping there,
/// keeping local time monotonic the whole way.
struct Smoothing {
    target_offset: f64,
    close_local: f64,
}

/// One outstanding ping awaiting its pong, keyed by serial number so stray
/// or duplicate replies are ignored.
struct PendingPing {
    serial: u32,
    sent_at: f64,
}

/// Tracks this process's clock-sync state: whether it is the elected
/// reference, the current RTT-derived offset model, and outstanding pings.
pub struct Clock {
    status: ClockStatus,
    reference: Option<ProcessName>,
    self_name: ProcessName,
    model: LinearModel,
    ring: RttRing,
    pending: Option<PendingPing>,
    smoothing: Option<Smoothing>,
    /// Consulted before applying a correction larger than [`JUMP_THRESHOLD`].
    /// Takes `(local_now, old_global, new_global)` and returns whether the
    /// jump should actually be applied; returning `false` leaves the clock
    /// as it was.
    jump_callback: Option<Box<dyn FnMut(f64, f64, f64) -> bool + Send>>,
}

impl Clock {
    pub fn new(self_name: ProcessName) -> Self {
        Clock {
            status: ClockStatus::Unsynchronized,
            reference: None,
            self_name,
            model: LinearModel::default(),
            ring: RttRing::default(),
            pending: None,
            smoothing: None,
            jump_callback: None,
        }
    }

    pub fn set_jump_callback(&mut self, cb: Box<dyn FnMut(f64, f64, f64) -> bool + Send>) {
        self.jump_callback = Some(cb);
    }

    pub fn status(&self) -> ClockStatus {
        self.status
    }

    /// Run the reference election against a candidate process name
    /// advertising itself on the `_cs` service; the highest-priority
    /// process name in the ensemble wins.
    pub fn consider_candidate(&mut self, candidate: &ProcessName) {
        let winner_is_self = match &self.reference {
            Some(current) => self.self_name.outranks(current) && self.self_name.outranks(candidate),
            None => self.self_name.outranks(candidate),
        };
        if winner_is_self {
            self.reference = Some(self.self_name.clone());
            self.status = ClockStatus::Reference;
            info!(process = %self.self_name, "elected_clock_reference");
            return;
        }
        if self.reference.as_ref().map(|r| candidate.outranks(r)).unwrap_or(true) {
            self.reference = Some(candidate.clone());
            debug!(reference = %candidate, "accepted_clock_reference");
        }
    }

    pub fn is_reference(&self) -> bool {
        self.status == ClockStatus::Reference
    }

    /// Begin a ping round: returns the serial number to embed in the
    /// outgoing `/_cs/get` message, or `None` if a ping is already
    /// outstanding.
    pub fn start_ping(&mut self, now_local: f64) -> Option<u32> {
        if self.pending.is_some() || self.is_reference() {
            return None;
        }
        let serial: u32 = rand::thread_rng().gen();
        self.pending = Some(PendingPing {
            serial,
            sent_at: now_local,
        });
        Some(serial)
    }

    /// Process a pong reply carrying the reference's timestamp at receipt.
    /// Ignores replies whose serial doesn't match the outstanding ping.
    ///
    /// A correction within [`JUMP_THRESHOLD`] is smoothed in by nudging
    /// `rate` rather than overwriting `offset` outright, so local time
    /// stays monotonic; a larger correction is a discontinuous jump, and is
    /// only applied if the jump callback approves it.
    pub fn handle_pong(&mut self, serial: u32, reference_time: f64, now_local: f64) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.serial != serial {
            self.pending = Some(pending);
            return;
        }
        let rtt = now_local - pending.sent_at;
        let midpoint_local = pending.sent_at + rtt / 2.0;
        let offset = reference_time - midpoint_local;
        self.ring.push(rtt, offset);

        let Some(best_offset) = self.ring.best_offset() else {
            return;
        };

        // A fresh correction supersedes whatever smoothing was already in
        // flight; let it complete instantly rather than layering ramps.
        if let Some(s) = self.smoothing.take() {
            self.model.offset = s.target_offset;
            self.model.rate = 1.0;
        }

        let delta = best_offset - self.model.offset;
        if delta.abs() > JUMP_THRESHOLD {
            let old_global = self.model.apply(now_local);
            let new_global = now_local + best_offset;
            let adjust = match self.jump_callback.as_mut() {
                Some(cb) => cb(now_local, old_global, new_global),
                None => true,
            };
            if adjust {
                self.apply_jump(now_local, new_global);
            }
        } else if delta != 0.0 {
            self.begin_smoothing(now_local, best_offset);
        }
        self.status = ClockStatus::Synchronized;
    }

    /// Ramp the offset from its current (settled) value to `target_offset`
    /// at a `rate` bounded to within [`SMOOTHING_RATE_DEVIATION`] of `1.0`.
    fn begin_smoothing(&mut self, now_local: f64, target_offset: f64) {
        let delta = target_offset - self.model.offset;
        if delta == 0.0 {
            return;
        }
        let direction = delta.signum();
        let close_local = now_local + delta.abs() / SMOOTHING_RATE_DEVIATION;
        self.model.offset -= now_local * direction * SMOOTHING_RATE_DEVIATION;
        self.model.rate = 1.0 + direction * SMOOTHING_RATE_DEVIATION;
        self.smoothing = Some(Smoothing { target_offset, close_local });
    }

    /// Force the model so that `local` maps to exactly `global`, cancelling
    /// any in-flight smoothing. Returns the delta between `global` and what
    /// the model previously reported at `local` — the amount a caller
    /// owning a scheduler needs to shift pending global-clock entries by to
    /// keep them valid across the jump. See [`crate::context::Context::clock_jump`].
    pub fn apply_jump(&mut self, local: f64, global: f64) -> f64 {
        let previous = self.model.apply(local);
        self.smoothing = None;
        self.model.rate = 1.0;
        self.model.offset = global - local;
        self.status = ClockStatus::Synchronized;
        global - previous
    }

    /// Settle any smoothing whose ramp has completed as of `now_local`,
    /// snapping the model back to a plain `rate = 1.0` translation.
    fn settle_if_due(&mut self, now_local: f64) {
        if let Some(s) = &self.smoothing {
            if now_local >= s.close_local {
                self.model.offset = s.target_offset;
                self.model.rate = 1.0;
                self.smoothing = None;
            }
        }
    }

    pub fn global_time(&mut self, local: f64) -> Option<f64> {
        self.settle_if_due(local);
        match self.status {
            ClockStatus::Unsynchronized => None,
            ClockStatus::Reference => Some(local),
            ClockStatus::Synchronized => Some(self.model.apply(local)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: u32) -> ProcessName {
        ProcessName::new(n, 0, 0)
    }

    #[test]
    fn higher_priority_process_elects_itself_reference() {
        let mut clock = Clock::new(name(9));
        clock.consider_candidate(&name(2));
        assert!(clock.is_reference());
    }

    #[test]
    fn lower_priority_process_accepts_peer_as_reference() {
        let mut clock = Clock::new(name(2));
        clock.consider_candidate(&name(9));
        assert!(!clock.is_reference());
        assert_eq!(clock.status(), ClockStatus::Unsynchronized);
    }

    #[test]
    fn pong_with_stale_serial_is_ignored() {
        let mut clock = Clock::new(name(2));
        clock.consider_candidate(&name(9));
        let serial = clock.start_ping(10.0).unwrap();
        clock.handle_pong(serial.wrapping_add(1), 100.0, 10.05);
        assert_eq!(clock.status(), ClockStatus::Unsynchronized);
    }

    #[test]
    fn matching_pong_synchronizes_clock() {
        let mut clock = Clock::new(name(2));
        clock.consider_candidate(&name(9));
        let serial = clock.start_ping(10.0).unwrap();
        clock.handle_pong(serial, 1000.0, 10.1);
        assert_eq!(clock.status(), ClockStatus::Synchronized);
        assert!(clock.global_time(10.1).is_some());
    }

    #[test]
    fn large_offset_correction_triggers_jump_callback() {
        let mut clock = Clock::new(name(2));
        clock.consider_candidate(&name(9));
        let jumped = std::sync::Arc::new(std::sync::Mutex::new(false));
        let jumped2 = jumped.clone();
        clock.set_jump_callback(Box::new(move |_local, _old, _new| {
            *jumped2.lock().unwrap() = true;
            true
        }));
        let serial = clock.start_ping(0.0).unwrap();
        clock.handle_pong(serial, 10_000.0, 0.01);
        assert!(*jumped.lock().unwrap());
        assert_eq!(clock.model.rate, 1.0);
    }

    #[test]
    fn jump_callback_returning_false_leaves_the_clock_unmoved() {
        let mut clock = Clock::new(name(2));
        clock.consider_candidate(&name(9));
        clock.set_jump_callback(Box::new(|_local, _old, _new| false));
        let serial = clock.start_ping(0.0).unwrap();
        clock.handle_pong(serial, 10_000.0, 0.01);
        assert_eq!(clock.model.offset, 0.0);
        assert_eq!(clock.global_time(0.01), Some(0.01));
    }

    #[test]
    fn small_correction_smooths_rate_instead_of_jumping_offset() {
        let mut clock = Clock::new(name(2));
        clock.consider_candidate(&name(9));
        let serial = clock.start_ping(0.0).unwrap();
        // Reference is 0.5s ahead, well under JUMP_THRESHOLD of 1s.
        clock.handle_pong(serial, 0.5, 0.0);
        assert_eq!(clock.status(), ClockStatus::Synchronized);
        assert_ne!(clock.model.rate, 1.0, "a smoothed correction should bend the rate");
        let far_future = 0.5 / SMOOTHING_RATE_DEVIATION + 1.0;
        assert_eq!(clock.global_time(far_future), Some(far_future + 0.5));
        assert_eq!(clock.model.rate, 1.0, "smoothing should settle back to rate 1.0 once closed");
    }
}
