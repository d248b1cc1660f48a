// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock & Deadline Service (C1): wall-clock/monotonic reads and the
//! synchronized-start algorithm of §4.1.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{ArgusError, Result};

/// Minimum preparation headroom the synchronized-start algorithm guarantees
/// (§4.1 step 3).
const MIN_HEADROOM_SECS: i64 = 10;
/// Grid width the synchronized-start algorithm aligns to.
const GRID_SECS: i64 = 100;
/// Fixed offset into each grid window.
const GRID_OFFSET_SECS: i64 = 30;

/// Abstraction over wall-clock/monotonic time so the orchestrator can be
/// driven by a `FakeClock` in tests without sleeping real seconds.
pub trait Clock: Send + Sync {
    fn now_wall(&self) -> SystemTime;
    fn now_monotonic(&self) -> Instant;
}

/// Production implementation backed by the OS clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_wall(&self) -> SystemTime {
        SystemTime::now()
    }
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Unix seconds for a `SystemTime`, saturating at zero (never panics on a
/// time before the epoch, which cannot legitimately happen here but keeps
/// the conversion infallible).
fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Computes the shared synchronized-start instant per §4.1:
///
/// 1. `epoch_boundary = ((t + 30) / 100 + 1) * 100`
/// 2. `target = epoch_boundary + 30`
/// 3. if `target - t < 10`, `target += 100`
///
/// Any two stations whose wall clocks lie in the same 100s window compute
/// the identical `target`.
pub fn compute_sync_deadline(now_wall: SystemTime) -> SystemTime {
    let t = unix_secs(now_wall);
    let epoch_boundary = ((t + GRID_OFFSET_SECS) / GRID_SECS + 1) * GRID_SECS;
    let mut target = epoch_boundary + GRID_OFFSET_SECS;
    if target - t < MIN_HEADROOM_SECS {
        target += GRID_SECS;
    }
    UNIX_EPOCH + Duration::from_secs(target as u64)
}

/// Resolves the capture start instant from the operator's configuration.
///
/// - `explicit_unix` takes priority when set: accepted only if it lies in
///   the future or no more than 10s in the past, else `InvalidDeadline`.
/// - Otherwise, if `synced_start`, uses `compute_sync_deadline`.
/// - Otherwise, starts immediately (`target = now`).
pub fn resolve_start_instant(
    clock: &dyn Clock,
    synced_start: bool,
    explicit_unix: Option<i64>,
) -> Result<SystemTime> {
    let now = clock.now_wall();
    if let Some(target) = explicit_unix {
        let now_secs = unix_secs(now);
        if target - now_secs < -MIN_HEADROOM_SECS {
            return Err(ArgusError::InvalidDeadline(format!(
                "explicit start {} is more than {}s in the past (now={})",
                target, MIN_HEADROOM_SECS, now_secs
            )));
        }
        return Ok(UNIX_EPOCH + Duration::from_secs(target.max(0) as u64));
    }
    if synced_start {
        return Ok(compute_sync_deadline(now));
    }
    Ok(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(unix_secs: i64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(unix_secs as u64)
    }

    #[test]
    fn s2_scenario_deadline() {
        // Now = 13:00:45 UTC (unix=1754589645). Expected deadline:
        // unix=1754589730 (13:02:10.000).
        let now = at(1754589645);
        let deadline = compute_sync_deadline(now);
        assert_eq!(unix_secs(deadline), 1754589730);
    }

    #[test]
    fn deadline_is_always_at_least_10s_ahead() {
        for t in 0..300 {
            let now = at(1_700_000_000 + t);
            let deadline = compute_sync_deadline(now);
            assert!(unix_secs(deadline) - (1_700_000_000 + t) >= MIN_HEADROOM_SECS);
        }
    }

    #[test]
    fn invariant_under_same_grid_window() {
        // property 9: two now_wall values in the same 100s grid produce
        // bit-identical deadlines, except near the boundary where the
        // headroom rule pushes one of them forward by exactly 100s.
        let base = 1_700_000_000i64 - (1_700_000_000i64 % GRID_SECS);
        let d0 = compute_sync_deadline(at(base));
        for delta in 0..GRID_SECS {
            let now = at(base + delta);
            let d = compute_sync_deadline(now);
            let diff = unix_secs(d) - unix_secs(d0);
            assert!(diff == 0 || diff == GRID_SECS, "delta={} diff={}", delta, diff);
        }
    }

    #[test]
    fn explicit_deadline_in_future_accepted() {
        let now = at(1_700_000_000);
        let result = resolve_start_instant(&SystemClock, false, Some(1_700_000_100));
        let _ = now;
        assert!(result.is_ok());
    }

    #[test]
    fn explicit_deadline_too_far_past_rejected() {
        struct Fixed(SystemTime);
        impl Clock for Fixed {
            fn now_wall(&self) -> SystemTime {
                self.0
            }
            fn now_monotonic(&self) -> Instant {
                Instant::now()
            }
        }
        let clock = Fixed(at(1_700_000_000));
        let result = resolve_start_instant(&clock, false, Some(1_700_000_000 - 11));
        assert!(matches!(result, Err(ArgusError::InvalidDeadline(_))));
    }

    #[test]
    fn explicit_deadline_within_10s_past_accepted() {
        struct Fixed(SystemTime);
        impl Clock for Fixed {
            fn now_wall(&self) -> SystemTime {
                self.0
            }
            fn now_monotonic(&self) -> Instant {
                Instant::now()
            }
        }
        let clock = Fixed(at(1_700_000_000));
        let result = resolve_start_instant(&clock, false, Some(1_700_000_000 - 10));
        assert!(result.is_ok());
    }

    #[test]
    fn no_synced_start_no_explicit_uses_now() {
        struct Fixed(SystemTime);
        impl Clock for Fixed {
            fn now_wall(&self) -> SystemTime {
                self.0
            }
            fn now_monotonic(&self) -> Instant {
                Instant::now()
            }
        }
        let now = at(1_700_000_000);
        let clock = Fixed(now);
        let result = resolve_start_instant(&clock, false, None).unwrap();
        assert_eq!(result, now);
    }
}
