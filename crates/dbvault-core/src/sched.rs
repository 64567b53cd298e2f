//! Backup scheduler: next-run computation and the decision loop
//!
//! The decision loop is single-threaded; it wakes at least every 30 seconds
//! and on every schedule mutation, dispatching due schedules into the
//! engine's bounded worker pool. Runs of the same schedule are serialized by
//! a per-schedule lock; a lock that is already held means a run is active
//! and the tick skips the schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, LocalResult, TimeZone, Utc};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::models::{Schedule, TimeOfDay, Trigger, ANCHOR_MIN_INTERVAL_SECONDS};

/// Decision-loop tick period.
pub const TICK_PERIOD: Duration = Duration::from_secs(30);

/// Runs older than this are presumed dead on startup.
pub const ABANDONED_AFTER: chrono::Duration = chrono::Duration::minutes(10);

/// Compute the next fire instant for a schedule.
///
/// Without an anchor, `next = base + interval`. With a `run_at_time` anchor
/// (intervals of an hour or more), the next instant is the earliest slot
/// `T + k*interval` of the local day at or after `max(base, now)`; a slot
/// that overflows the day rolls to the next day at `T`.
pub fn compute_next_run(
    interval_seconds: i64,
    run_at_time: Option<TimeOfDay>,
    base: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let interval = chrono::Duration::seconds(interval_seconds.max(1));
    let anchor_time = match run_at_time {
        Some(t) if interval_seconds >= ANCHOR_MIN_INTERVAL_SECONDS => t,
        _ => return base + interval,
    };

    let reference = base.max(now);
    let local_ref = reference.with_timezone(&Local);
    let local_day = local_ref.date_naive();

    let anchor = match local_day_at(local_day, anchor_time) {
        Some(anchor) => anchor,
        None => return base + interval,
    };

    if anchor >= reference {
        return anchor;
    }

    // Smallest k with anchor + k*interval >= reference
    let behind = (reference - anchor).num_seconds();
    let k = (behind + interval_seconds - 1) / interval_seconds;
    let candidate = anchor + chrono::Duration::seconds(k * interval_seconds);

    // A slot that leaves the anchor's day rolls to the next day at T
    if candidate.with_timezone(&Local).date_naive() != local_day {
        if let Some(next_day) = local_day
            .succ_opt()
            .and_then(|day| local_day_at(day, anchor_time))
        {
            return next_day;
        }
    }
    candidate
}

/// Local wall-clock instant for `day` at `time`, resolved to UTC. DST gaps
/// collapse to the earliest valid interpretation.
fn local_day_at(day: chrono::NaiveDate, time: TimeOfDay) -> Option<DateTime<Utc>> {
    let naive = day.and_hms_opt(u32::from(time.hour), u32::from(time.minute), 0)?;
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            // Spring-forward gap: take the instant an hour later
            let shifted = naive + chrono::Duration::hours(1);
            Local
                .from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}

/// Startup recovery: finalize abandoned runs and recompute every enabled
/// schedule's `next_run_at`.
pub(crate) fn recover(engine: &Engine) {
    let store = engine.store();

    match store.sweep_abandoned_runs(Utc::now() - ABANDONED_AFTER) {
        Ok(swept) if !swept.is_empty() => {
            warn!("Finalized {} abandoned run(s) from a previous process", swept.len());
        }
        Ok(_) => {}
        Err(e) => error!("Failed to sweep abandoned runs: {}", e),
    }

    match store.list_enabled_schedules() {
        Ok(schedules) => {
            let now = Utc::now();
            for schedule in schedules {
                let base = schedule.last_run_at.unwrap_or(schedule.created_at);
                let next = compute_next_run(
                    schedule.interval_seconds,
                    schedule.retention.run_at_time,
                    base,
                    now,
                );
                if let Err(e) = store.set_schedule_next_run(&schedule.id, next) {
                    error!("Failed to reset next_run_at for {}: {}", schedule.name, e);
                }
            }
        }
        Err(e) => error!("Failed to list schedules during recovery: {}", e),
    }
}

/// The decision loop. Runs until engine shutdown.
pub(crate) async fn run_loop(engine: Arc<Engine>) {
    info!("Scheduler started (tick every {:?})", TICK_PERIOD);
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = engine.scheduler_woken() => {}
            _ = engine.shutdown_signal() => {
                info!("Scheduler stopping");
                return;
            }
        }
        if let Err(e) = tick(&engine).await {
            error!("Scheduler tick failed: {}", e);
        }
    }
}

/// One decision pass: dispatch every due, unlocked, enabled schedule.
async fn tick(engine: &Arc<Engine>) -> crate::error::Result<()> {
    let now = Utc::now();
    let due: Vec<Schedule> = engine
        .store()
        .list_enabled_schedules()?
        .into_iter()
        .filter(|s| s.next_run_at.map(|next| next <= now).unwrap_or(true))
        .collect();

    for schedule in due {
        let guard = match engine.try_lock_schedule(&schedule.id) {
            Some(guard) => guard,
            None => {
                debug!("Schedule '{}' still running, skipping tick", schedule.name);
                continue;
            }
        };

        let next = compute_next_run(
            schedule.interval_seconds,
            schedule.retention.run_at_time,
            now,
            now,
        );
        engine
            .store()
            .mark_schedule_dispatched(&schedule.id, now, next)?;

        info!(
            "Dispatching schedule '{}' (next run {})",
            schedule.name, next
        );
        engine
            .clone()
            .spawn_schedule_run(schedule, Trigger::Scheduled, guard);
    }
    Ok(())
}

/// True when the timestamp's local wall clock matches some anchored slot
/// `T + k*interval` of its day. Lives here so the invariant is testable
/// against `compute_next_run` output.
#[cfg(test)]
fn on_anchor_grid(ts: DateTime<Utc>, anchor: TimeOfDay, interval_seconds: i64) -> bool {
    let local = ts.with_timezone(&Local);
    let day_anchor = match local_day_at(local.date_naive(), anchor) {
        Some(a) => a,
        None => return false,
    };
    let offset = (ts - day_anchor).num_seconds();
    offset >= 0 && offset % interval_seconds == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn t(h: u8, m: u8) -> TimeOfDay {
        TimeOfDay { hour: h, minute: m }
    }

    /// Build a UTC instant from local wall-clock parts so anchored tests are
    /// timezone-independent.
    fn local_utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_unanchored_next_is_base_plus_interval() {
        let base = Utc::now();
        let next = compute_next_run(300, None, base, base);
        assert_eq!(next, base + chrono::Duration::seconds(300));
    }

    #[test]
    fn test_anchor_ignored_for_short_intervals() {
        let base = Utc::now();
        let next = compute_next_run(300, Some(t(3, 30)), base, base);
        assert_eq!(next, base + chrono::Duration::seconds(300));
    }

    #[test]
    fn test_daily_anchor_before_todays_slot() {
        // Now is 01:00 local, slot at 03:30 is still ahead today
        let now = local_utc(2025, 3, 10, 1, 0);
        let next = compute_next_run(86400, Some(t(3, 30)), now, now);
        assert_eq!(next, local_utc(2025, 3, 10, 3, 30));
    }

    #[test]
    fn test_daily_anchor_after_todays_slot_rolls_over() {
        // Daily at 03:30 with now at 10:00 rolls to tomorrow 03:30
        let now = local_utc(2025, 3, 1, 10, 0);
        let next = compute_next_run(86400, Some(t(3, 30)), now, now);
        assert_eq!(next, local_utc(2025, 3, 2, 3, 30));
    }

    #[test]
    fn test_twelve_hour_slots() {
        // 12 h + T=03:30: slots 03:30 and 15:30; at 10:00 the 15:30 slot is next
        let now = local_utc(2025, 3, 1, 10, 0);
        let next = compute_next_run(43200, Some(t(3, 30)), now, now);
        assert_eq!(next, local_utc(2025, 3, 1, 15, 30));

        // Past the last slot of the day, roll to tomorrow's anchor
        let now = local_utc(2025, 3, 1, 16, 0);
        let next = compute_next_run(43200, Some(t(3, 30)), now, now);
        assert_eq!(next, local_utc(2025, 3, 2, 3, 30));
    }

    #[test]
    fn test_anchored_next_is_on_grid_and_not_before_base() {
        let base = local_utc(2025, 3, 1, 10, 0);
        for (interval, anchor) in [
            (3600, t(0, 15)),
            (7200, t(3, 30)),
            (43200, t(3, 30)),
            (86400, t(23, 59)),
        ] {
            let next = compute_next_run(interval, Some(anchor), base, base);
            assert!(next >= base, "interval {}", interval);
            assert!(
                on_anchor_grid(next, anchor, interval),
                "interval {} anchor {} gave {}",
                interval,
                anchor,
                next
            );
        }
    }

    #[test]
    fn test_stale_base_catches_up_to_now() {
        // last_run_at a week ago must not schedule runs in the past
        let now = local_utc(2025, 3, 10, 10, 0);
        let base = now - chrono::Duration::days(7);
        let next = compute_next_run(86400, Some(t(3, 30)), base, now);
        assert_eq!(next, local_utc(2025, 3, 11, 3, 30));
    }

    #[test]
    fn test_hourly_anchor_minute() {
        // Hourly with T=02:15 keeps firing at :15 past each hour
        let now = local_utc(2025, 3, 1, 7, 40);
        let next = compute_next_run(3600, Some(t(2, 15)), now, now);
        assert_eq!(next, local_utc(2025, 3, 1, 8, 15));
        assert_eq!(next.with_timezone(&Local).minute(), 15);
    }

    #[test]
    fn test_abandoned_cutoff_is_ten_minutes() {
        assert_eq!(ABANDONED_AFTER.num_minutes(), 10);
    }
}
