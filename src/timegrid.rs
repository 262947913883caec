use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

/// Number of 15-minute slots in one planning day.
pub const SLOTS_PER_DAY: usize = 96;

/// Slot width in minutes.
pub const SLOT_MINUTES: u32 = 15;

/// Slot width in hours, the integration step of the dispatch simulator.
pub const SLOT_HOURS: f64 = 0.25;

/// The 96-slot daily frame, anchored to local midnight of a single day.
///
/// The frame is fixed at 96 slots regardless of DST: on transition days some
/// local wall-clock moments are skipped or repeated, and the grid resolves
/// them deterministically (ambiguous -> earlier instant, skipped -> later).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGrid {
    tz: Tz,
    day: NaiveDate,
}

impl TimeGrid {
    /// Frame for the local day containing `now`.
    pub fn for_now(now: DateTime<Utc>, tz: Tz) -> Self {
        let day = now.with_timezone(&tz).date_naive();
        Self { tz, day }
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Slot index covering `ts`, or `None` when `ts` falls outside this
    /// grid's local day.
    pub fn slot_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        let local = ts.with_timezone(&self.tz);
        if local.date_naive() != self.day {
            return None;
        }
        let minutes = local.hour() * 60 + local.minute();
        Some((minutes / SLOT_MINUTES) as usize)
    }

    /// Slot index by local time-of-day only, ignoring the date.
    ///
    /// Used when folding a rolling history window onto the daily frame:
    /// yesterday's 18:30 sample lands in today's 18:30 slot.
    pub fn slot_of_clock(&self, ts: DateTime<Utc>) -> usize {
        let local = ts.with_timezone(&self.tz);
        let minutes = local.hour() * 60 + local.minute();
        ((minutes / SLOT_MINUTES) as usize).min(SLOTS_PER_DAY - 1)
    }

    /// Instant at which slot `slot` begins.
    pub fn slot_start(&self, slot: usize) -> DateTime<Utc> {
        debug_assert!(slot < SLOTS_PER_DAY);
        let naive = self.day.and_time(NaiveTime::MIN)
            + Duration::minutes(i64::from(SLOT_MINUTES) * slot as i64);
        self.resolve_local(naive)
    }

    /// Instant at the center of slot `slot` (start + 7.5 minutes), the
    /// sampling point for forecast interpolation.
    pub fn slot_center(&self, slot: usize) -> DateTime<Utc> {
        debug_assert!(slot < SLOTS_PER_DAY);
        let naive = self.day.and_time(NaiveTime::MIN)
            + Duration::minutes(i64::from(SLOT_MINUTES) * slot as i64)
            + Duration::seconds(450);
        self.resolve_local(naive)
    }

    /// Local hour a slot belongs to, for hourly price expansion and
    /// time-of-use classification.
    pub fn slot_hour(&self, slot: usize) -> u32 {
        (slot as u32 * SLOT_MINUTES) / 60
    }

    /// Month of the grid day (1-12), for seasonal tariff factors.
    pub fn month(&self) -> u32 {
        use chrono::Datelike;
        self.day.month()
    }

    /// Map a local wall-clock moment to an instant. Ambiguous moments
    /// (autumn fall-back) resolve to the earlier instant; skipped moments
    /// (spring forward) resolve to the corresponding instant after the gap.
    fn resolve_local(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
            LocalResult::None => {
                let shifted = naive + Duration::hours(1);
                match self.tz.from_local_datetime(&shifted) {
                    LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                        dt.with_timezone(&Utc)
                    }
                    LocalResult::None => Utc.from_utc_datetime(&naive),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn grid_on(tz: &str, y: i32, m: u32, d: u32) -> TimeGrid {
        let tz: Tz = tz.parse().unwrap();
        let noon = tz
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()),
            )
            .unwrap()
            .with_timezone(&Utc);
        TimeGrid::for_now(noon, tz)
    }

    #[test]
    fn slot_of_maps_local_quarter_hours() {
        let grid = grid_on("Europe/Lisbon", 2025, 6, 15);
        let tz = grid.timezone();
        let at = |h, min| {
            tz.with_ymd_and_hms(2025, 6, 15, h, min, 0)
                .unwrap()
                .with_timezone(&Utc)
        };
        assert_eq!(grid.slot_of(at(0, 0)), Some(0));
        assert_eq!(grid.slot_of(at(0, 14)), Some(0));
        assert_eq!(grid.slot_of(at(0, 15)), Some(1));
        assert_eq!(grid.slot_of(at(12, 0)), Some(48));
        assert_eq!(grid.slot_of(at(23, 59)), Some(95));
    }

    #[test]
    fn slot_of_rejects_other_days() {
        let grid = grid_on("Europe/Lisbon", 2025, 6, 15);
        let tz = grid.timezone();
        let tomorrow = tz
            .with_ymd_and_hms(2025, 6, 16, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(grid.slot_of(tomorrow), None);
    }

    #[test]
    fn slot_start_and_center_round_trip() {
        let grid = grid_on("Europe/Lisbon", 2025, 6, 15);
        for slot in [0, 1, 47, 95] {
            assert_eq!(grid.slot_of(grid.slot_start(slot)), Some(slot));
            assert_eq!(grid.slot_of(grid.slot_center(slot)), Some(slot));
        }
    }

    #[test]
    fn skipped_hour_resolves_after_the_gap() {
        // Lisbon springs forward 2025-03-30: 01:00 local does not exist.
        let grid = grid_on("Europe/Lisbon", 2025, 3, 30);
        let start = grid.slot_start(4); // 01:00 local
        // The resolved instant must exist and not precede 00:45.
        assert!(start > grid.slot_start(3));
    }

    #[test]
    fn ambiguous_hour_resolves_to_earlier_instant() {
        // Lisbon falls back 2025-10-26: 01:00 local occurs twice.
        let grid = grid_on("Europe/Lisbon", 2025, 10, 26);
        let first = grid.slot_start(4); // first occurrence of 01:00
        let second_half = grid.slot_start(8); // 02:00, after the repeat
        assert!(second_half - first >= Duration::minutes(60));
    }

    #[test]
    fn slot_hour_and_month() {
        let grid = grid_on("Europe/Lisbon", 2025, 6, 15);
        assert_eq!(grid.slot_hour(0), 0);
        assert_eq!(grid.slot_hour(3), 0);
        assert_eq!(grid.slot_hour(4), 1);
        assert_eq!(grid.slot_hour(95), 23);
        assert_eq!(grid.month(), 6);
    }
}
