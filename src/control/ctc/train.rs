use crate::control::ctc::route::RouteId;
use crate::general::{kmh_to_mph, BlockId, Line, TrainId};
use chrono::NaiveDateTime;

/// Consecutive same-block reports before a train counts as stationary.
pub const STATIONARY_COUNT_THRESHOLD: u32 = 3;
/// Seconds a train must sit still before the emergency check fires.
pub const STATIONARY_TIME_THRESHOLD_S: i64 = 60;

/// Where a train has been sitting, for stuck-train detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovementHistory {
    pub block: Option<BlockId>,
    pub count: u32,
    pub last_update: Option<NaiveDateTime>,
    /// Set on the second consecutive report from the same block.
    pub first_stationary_time: Option<NaiveDateTime>,
}

/// One dispatched train as the CTC tracks it.
///
/// Trains carry ids, never object references; the CTC registries resolve
/// them. Speed and authority are the quantized values of the command frames.
#[derive(Debug, Clone)]
pub struct Train {
    pub id: TrainId,
    pub line: Line,
    pub current_block: BlockId,
    pub next_block: Option<BlockId>,
    pub route_id: Option<RouteId>,
    authority: u8,
    suggested_speed: u8,
    pub grade: f64,
    pub speed_limit_kmh: f64,
    pub is_active: bool,
    pub movement_history: MovementHistory,
}

impl Train {
    pub fn new(id: TrainId, line: Line, current_block: BlockId) -> Train {
        Train {
            id,
            line,
            current_block,
            next_block: None,
            route_id: None,
            authority: 0,
            suggested_speed: 0,
            grade: 0.0,
            speed_limit_kmh: 0.0,
            is_active: true,
            movement_history: MovementHistory::default(),
        }
    }

    pub fn authority(&self) -> u8 {
        self.authority
    }

    pub fn suggested_speed(&self) -> u8 {
        self.suggested_speed
    }

    /// Authority is binary; out-of-range values are clamped.
    pub fn update_authority(&mut self, authority: i32) {
        self.authority = authority.clamp(0, 1) as u8;
    }

    /// Suggested speed is an index 0-3; out-of-range values are clamped.
    pub fn update_suggested_speed(&mut self, speed: i32) {
        self.suggested_speed = speed.clamp(0, 3) as u8;
    }

    pub fn update_location(&mut self, block: BlockId, grade: f64, speed_limit_kmh: f64) {
        self.current_block = block;
        self.grade = grade;
        self.speed_limit_kmh = speed_limit_kmh;
    }

    /// The suggested speed as miles per hour of the current block's limit.
    pub fn speed_mph(&self) -> f64 {
        kmh_to_mph(self.speed_limit_kmh) * f64::from(self.suggested_speed) / 3.0
    }

    /// Records one per-tick position report. Repeated reports from the same
    /// block bump the stationary count; a new block resets it.
    pub fn update_movement_history(&mut self, block: BlockId, now: NaiveDateTime) {
        let history = &mut self.movement_history;
        if history.block == Some(block) {
            history.count += 1;
            if history.count == 2 {
                history.first_stationary_time = Some(now);
            }
        } else {
            history.block = Some(block);
            history.count = 1;
            history.first_stationary_time = None;
        }
        history.last_update = Some(now);
    }

    pub fn reset_movement_history(&mut self) {
        self.movement_history = MovementHistory::default();
    }

    pub fn stationary_count(&self) -> u32 {
        self.movement_history.count
    }

    /// Emergency predicate: the train reported the same block at least
    /// `count_threshold` times and has been stationary for at least
    /// `time_threshold_s`. Missing timestamps never trigger.
    pub fn is_stationary_too_long(
        &self,
        count_threshold: u32,
        time_threshold_s: i64,
        now: NaiveDateTime,
    ) -> bool {
        let history = &self.movement_history;
        if history.block.is_none() || history.count < count_threshold {
            return false;
        }
        if time_threshold_s == 0 {
            return true;
        }
        match history.first_stationary_time {
            Some(since) => (now - since).num_seconds() >= time_threshold_s,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn train() -> Train {
        Train::new("G001".parse().unwrap(), Line::Green, 1)
    }

    #[test]
    fn new_train_defaults() {
        let t = train();
        assert_eq!(t.current_block, 1);
        assert_eq!(t.next_block, None);
        assert_eq!(t.authority(), 0);
        assert_eq!(t.suggested_speed(), 0);
        assert!(t.route_id.is_none());
        assert!(t.is_active);
    }

    #[test]
    fn authority_and_speed_clamp() {
        let mut t = train();
        t.update_authority(5);
        assert_eq!(t.authority(), 1);
        t.update_authority(-1);
        assert_eq!(t.authority(), 0);
        for speed in 0..=3 {
            t.update_suggested_speed(speed);
            assert_eq!(t.suggested_speed(), speed as u8);
        }
        t.update_suggested_speed(10);
        assert_eq!(t.suggested_speed(), 3);
        t.update_suggested_speed(-2);
        assert_eq!(t.suggested_speed(), 0);
    }

    #[test]
    fn speed_mph_follows_the_limit() {
        let mut t = train();
        t.update_location(1, 2.0, 55.0);
        t.update_suggested_speed(3);
        let full = 55.0 * 0.621371;
        assert!((t.speed_mph() - full).abs() < 1e-9);
        t.update_suggested_speed(1);
        assert!((t.speed_mph() - full / 3.0).abs() < 1e-9);
        t.update_suggested_speed(0);
        assert_eq!(t.speed_mph(), 0.0);
    }

    #[test]
    fn movement_history_counts_and_resets() {
        let mut t = train();
        t.update_movement_history(1, at(12, 0, 0));
        assert_eq!(t.movement_history.count, 1);
        assert!(t.movement_history.first_stationary_time.is_none());

        t.update_movement_history(1, at(12, 0, 1));
        assert_eq!(t.movement_history.count, 2);
        assert_eq!(t.movement_history.first_stationary_time, Some(at(12, 0, 1)));

        t.update_movement_history(2, at(12, 0, 2));
        assert_eq!(t.movement_history.block, Some(2));
        assert_eq!(t.movement_history.count, 1);
        assert!(t.movement_history.first_stationary_time.is_none());
    }

    #[test]
    fn stationary_detection_needs_count_and_time() {
        let mut t = train();
        assert!(!t.is_stationary_too_long(3, 60, at(12, 5, 0)));

        for s in 0..4 {
            t.update_movement_history(1, at(12, 0, s));
        }
        // count reached, elapsed too short
        assert!(!t.is_stationary_too_long(3, 60, at(12, 0, 30)));
        // zero time threshold ignores the clock entirely
        assert!(t.is_stationary_too_long(3, 0, at(12, 0, 30)));
        // enough wall time since the second report
        assert!(t.is_stationary_too_long(3, 60, at(12, 2, 0)));

        // missing timestamp never fires
        t.movement_history.first_stationary_time = None;
        assert!(!t.is_stationary_too_long(3, 60, at(12, 10, 0)));

        t.reset_movement_history();
        assert_eq!(t.stationary_count(), 0);
        assert!(t.movement_history.last_update.is_none());
    }
}
