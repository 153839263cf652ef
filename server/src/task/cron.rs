use chrono::{DateTime, Datelike, Local, Timelike};

/// A single position in a 6-field (`sec min hour dom month dow`) schedule.
/// Kept deliberately minimal: a bare `*` or a comma-separated list of
/// integers. No ranges, no step values, no named months/weekdays — nothing
/// in `spec.md`'s `scan.cron` default (`0 0 2 * * *`) needs more than this.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Field {
    Any,
    List(Vec<u32>),
}

impl Field {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();

        if raw == "*" {
            return Ok(Field::Any);
        }

        let values = raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|_| anyhow::Error::msg(format!("invalid cron field value '{part}'")))
            })
            .collect::<anyhow::Result<Vec<u32>>>()?;

        if values.is_empty() {
            return Err(anyhow::Error::msg("cron field has no values"));
        }

        Ok(Field::List(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::List(values) => values.contains(&value),
        }
    }
}

/// A parsed `sec min hour dom month dow` schedule, checked against local
/// time (`spec.md` §4.7: "the default is `0 0 2 * * *` (daily 02:00 local
/// time)"). `dow` is 0-6 with Sunday as 0, matching `chrono::Weekday`'s
/// `num_days_from_sunday`.
#[derive(Clone, Debug)]
pub struct CronSchedule {
    sec: Field,
    min: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

impl CronSchedule {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = raw.split_whitespace().collect();

        if fields.len() != 6 {
            return Err(anyhow::Error::msg(format!(
                "cron schedule '{raw}' must have 6 fields (sec min hour dom month dow), got {}",
                fields.len()
            )));
        }

        Ok(CronSchedule {
            sec: Field::parse(fields[0])?,
            min: Field::parse(fields[1])?,
            hour: Field::parse(fields[2])?,
            dom: Field::parse(fields[3])?,
            month: Field::parse(fields[4])?,
            dow: Field::parse(fields[5])?,
        })
    }

    pub fn matches(&self, at: DateTime<Local>) -> bool {
        self.sec.matches(at.second())
            && self.min.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.dom.matches(at.day())
            && self.month.matches(at.month())
            && self.dow.matches(at.weekday().num_days_from_sunday())
    }
}

/// Injected so the scheduler is testable without sleeping real wall-clock
/// time (`spec.md` §9 Design Notes: "this makes the scheduler testable by
/// injecting a virtual clock").
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Tracks whether the schedule has already fired for the current minute,
/// so a poll loop calling `poll` more than once a second doesn't double-fire.
pub struct CronTicker {
    schedule: CronSchedule,
    clock: Box<dyn Clock>,
    last_fired: Option<DateTime<Local>>,
}

impl CronTicker {
    pub fn new(schedule: CronSchedule, clock: Box<dyn Clock>) -> Self {
        CronTicker {
            schedule,
            clock,
            last_fired: None,
        }
    }

    /// Returns `true` at most once per matching minute. Callers poll this
    /// on a short interval (e.g. every second) and, on `true`, attempt a
    /// scan start.
    pub fn poll(&mut self) -> bool {
        let now = self.clock.now();

        if !self.schedule.matches(now) {
            return false;
        }

        if let Some(last) = self.last_fired {
            if last.year() == now.year()
                && last.month() == now.month()
                && last.day() == now.day()
                && last.hour() == now.hour()
                && last.minute() == now.minute()
            {
                return false;
            }
        }

        self.last_fired = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct FixedClock(Mutex<DateTime<Local>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Local> {
            *self.0.lock().unwrap()
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn parses_default_daily_schedule() {
        let schedule = CronSchedule::parse("0 0 2 * * *").unwrap();

        assert!(schedule.matches(at(2026, 7, 28, 2, 0, 0)));
        assert!(!schedule.matches(at(2026, 7, 28, 2, 0, 1)));
        assert!(!schedule.matches(at(2026, 7, 28, 3, 0, 0)));
    }

    #[test]
    fn comma_list_matches_any_listed_value() {
        let schedule = CronSchedule::parse("0 0 2,14 * * *").unwrap();

        assert!(schedule.matches(at(2026, 7, 28, 2, 0, 0)));
        assert!(schedule.matches(at(2026, 7, 28, 14, 0, 0)));
        assert!(!schedule.matches(at(2026, 7, 28, 8, 0, 0)));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronSchedule::parse("0 0 2 * *").is_err());
        assert!(CronSchedule::parse("0 0 2 * * * *").is_err());
    }

    #[test]
    fn ticker_fires_once_per_matching_minute() {
        let schedule = CronSchedule::parse("0 0 2 * * *").unwrap();
        let clock = FixedClock(Mutex::new(at(2026, 7, 28, 2, 0, 0)));
        let mut ticker = CronTicker::new(schedule, Box::new(clock));

        assert!(ticker.poll());
        assert!(!ticker.poll());
    }

    #[test]
    fn ticker_refires_on_next_matching_minute() {
        struct SteppingClock(Mutex<Vec<DateTime<Local>>>);

        impl Clock for SteppingClock {
            fn now(&self) -> DateTime<Local> {
                let mut steps = self.0.lock().unwrap();
                if steps.len() == 1 {
                    steps[0]
                } else {
                    steps.remove(0)
                }
            }
        }

        let schedule = CronSchedule::parse("0 0 2 * * *").unwrap();
        let steps = SteppingClock(Mutex::new(vec![
            at(2026, 7, 28, 2, 0, 0),
            at(2026, 7, 28, 2, 0, 0),
            at(2026, 7, 29, 2, 0, 0),
        ]));
        let mut ticker = CronTicker::new(schedule, Box::new(steps));

        assert!(ticker.poll());
        assert!(!ticker.poll());
        assert!(ticker.poll());
    }

    #[test]
    fn empty_cron_string_is_rejected_not_treated_as_disabled() {
        // disabling is handled one layer up (an empty `scan.cron` config
        // value means "don't even construct a schedule"), so the parser
        // itself should reject a blank string rather than silently
        // matching nothing.
        assert!(CronSchedule::parse("").is_err());
    }
}
