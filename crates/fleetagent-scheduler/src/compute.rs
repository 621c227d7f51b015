use chrono::{Datelike, Duration, NaiveDateTime};

use crate::{ScheduledTask, Trigger, Weekdays};

/// A due firing older than this is treated as missed rather than late.
pub const MISSED_TOLERANCE_SECS: i64 = 120;

/// First firing for a freshly registered (or re-enabled) trigger, evaluated at `now`.
///
/// Once triggers always report their start, even in the past; [`evaluate`] decides
/// whether a past start still runs.
pub fn initial_fire(trigger: &Trigger, now: NaiveDateTime) -> Option<NaiveDateTime> {
    match trigger {
        Trigger::Once { start, .. } => Some(*start),
        Trigger::Weekly { days, start } => weekly_occurrence(*days, *start, now, true),
        Trigger::Manual => None,
    }
}

/// Firing that follows one handled at `after`.
pub fn next_fire_after(trigger: &Trigger, after: NaiveDateTime) -> Option<NaiveDateTime> {
    match trigger {
        Trigger::Weekly { days, start } => weekly_occurrence(*days, *start, after, false),
        Trigger::Once { .. } | Trigger::Manual => None,
    }
}

fn weekly_occurrence(
    days: Weekdays,
    start: NaiveDateTime,
    from: NaiveDateTime,
    inclusive: bool,
) -> Option<NaiveDateTime> {
    if days.is_empty() {
        return None;
    }
    let (from, inclusive) = if from < start {
        (start, true)
    } else {
        (from, inclusive)
    };
    let time = start.time();
    let mut date = from.date();
    for _ in 0..=7 {
        let candidate = date.and_time(time);
        let after_from = if inclusive {
            candidate >= from
        } else {
            candidate > from
        };
        if after_from && days.contains(date.weekday()) {
            return Some(candidate);
        }
        date = date.succ_opt()?;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    NotDue,
    Run,
    /// Due, but a previous instance is still running and the task disallows parallel runs.
    SkipRunning,
    /// Due long ago (or past its end boundary) and not allowed to catch up.
    Missed,
}

pub fn evaluate(
    task: &ScheduledTask,
    next_run_at: Option<NaiveDateTime>,
    running: u32,
    now: NaiveDateTime,
) -> Firing {
    if !task.enabled {
        return Firing::NotDue;
    }
    let Some(next) = next_run_at else {
        return Firing::NotDue;
    };
    if next > now {
        return Firing::NotDue;
    }
    if let Trigger::Once { end: Some(end), .. } = task.trigger {
        if now > end {
            return Firing::Missed;
        }
    }
    if now - next > Duration::seconds(MISSED_TOLERANCE_SECS) && !task.run_asap_after_missed {
        return Firing::Missed;
    }
    if running > 0 && !task.parallel {
        return Firing::SkipRunning;
    }
    Firing::Run
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::TaskAction;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn task(trigger: Trigger) -> ScheduledTask {
        ScheduledTask {
            name: "FleetAgent_x".into(),
            action: TaskAction::Reboot,
            trigger,
            enabled: true,
            delete_after: false,
            parallel: false,
            run_asap_after_missed: false,
        }
    }

    // 2026-10-19 is a Monday.
    const MONDAY: u16 = 2;
    const WEDNESDAY: u16 = 8;

    #[test]
    fn weekly_fires_later_today_when_time_not_reached() {
        let trigger = Trigger::Weekly {
            days: Weekdays::from_bits(MONDAY),
            start: at(2026, 10, 19, 18, 0),
        };
        assert_eq!(
            initial_fire(&trigger, at(2026, 10, 19, 9, 0)),
            Some(at(2026, 10, 19, 18, 0))
        );
    }

    #[test]
    fn weekly_skips_to_next_selected_day() {
        let trigger = Trigger::Weekly {
            days: Weekdays::from_bits(MONDAY | WEDNESDAY),
            start: at(2026, 10, 19, 8, 0),
        };
        assert_eq!(
            initial_fire(&trigger, at(2026, 10, 19, 9, 0)),
            Some(at(2026, 10, 21, 8, 0))
        );
        assert_eq!(
            next_fire_after(&trigger, at(2026, 10, 21, 8, 0)),
            Some(at(2026, 10, 26, 8, 0))
        );
    }

    #[test]
    fn weekly_never_fires_before_start() {
        let trigger = Trigger::Weekly {
            days: Weekdays::ALL,
            start: at(2026, 11, 2, 6, 30),
        };
        assert_eq!(
            next_fire_after(&trigger, at(2026, 10, 19, 9, 0)),
            Some(at(2026, 11, 2, 6, 30))
        );
    }

    #[test]
    fn once_and_manual() {
        let once = Trigger::Once {
            start: at(2026, 12, 1, 0, 0),
            end: None,
        };
        assert_eq!(
            initial_fire(&once, at(2026, 10, 19, 0, 0)),
            Some(at(2026, 12, 1, 0, 0))
        );
        assert_eq!(next_fire_after(&once, at(2026, 12, 1, 0, 0)), None);
        assert_eq!(initial_fire(&Trigger::Manual, at(2026, 10, 19, 0, 0)), None);
    }

    #[test]
    fn evaluate_due_and_not_due() {
        let t = task(Trigger::Once {
            start: at(2026, 10, 19, 10, 0),
            end: None,
        });
        let next = Some(at(2026, 10, 19, 10, 0));
        assert_eq!(evaluate(&t, next, 0, at(2026, 10, 19, 9, 59)), Firing::NotDue);
        assert_eq!(evaluate(&t, next, 0, at(2026, 10, 19, 10, 0)), Firing::Run);
        assert_eq!(evaluate(&t, None, 0, at(2026, 10, 19, 10, 0)), Firing::NotDue);
    }

    #[test]
    fn evaluate_disabled_never_runs() {
        let mut t = task(Trigger::Manual);
        t.enabled = false;
        let now = at(2026, 10, 19, 10, 0);
        assert_eq!(evaluate(&t, Some(now), 0, now), Firing::NotDue);
    }

    #[test]
    fn evaluate_missed_depends_on_catch_up_flag() {
        let mut t = task(Trigger::Weekly {
            days: Weekdays::ALL,
            start: at(2026, 10, 1, 10, 0),
        });
        let next = Some(at(2026, 10, 19, 10, 0));
        let late = at(2026, 10, 19, 14, 0);
        assert_eq!(evaluate(&t, next, 0, late), Firing::Missed);
        t.run_asap_after_missed = true;
        assert_eq!(evaluate(&t, next, 0, late), Firing::Run);
    }

    #[test]
    fn evaluate_respects_end_boundary_even_with_catch_up() {
        let mut t = task(Trigger::Once {
            start: at(2026, 10, 19, 10, 0),
            end: Some(at(2026, 10, 19, 10, 10)),
        });
        t.run_asap_after_missed = true;
        let next = Some(at(2026, 10, 19, 10, 0));
        assert_eq!(evaluate(&t, next, 0, at(2026, 10, 19, 10, 5)), Firing::Run);
        assert_eq!(evaluate(&t, next, 0, at(2026, 10, 19, 10, 11)), Firing::Missed);
    }

    #[test]
    fn evaluate_parallel_policy() {
        let mut t = task(Trigger::Manual);
        let now = at(2026, 10, 19, 10, 0);
        assert_eq!(evaluate(&t, Some(now), 1, now), Firing::SkipRunning);
        t.parallel = true;
        assert_eq!(evaluate(&t, Some(now), 1, now), Firing::Run);
    }
}
