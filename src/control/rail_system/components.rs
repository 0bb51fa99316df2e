use crate::general::{kmh_to_mph, kmh_to_mps, BlockId, Line};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;

/// Quantized suggested speed: an index into fractions of the block's limit.
///
/// ```
/// # use raildispatch::control::rail_system::components::SpeedClass;
/// assert_eq!(SpeedClass::from_index(7), SpeedClass::Full);
/// assert_eq!(SpeedClass::TwoThirds.index(), 2);
/// assert_eq!(SpeedClass::Stop.fraction(), 0.0);
/// ```
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub enum SpeedClass {
    #[default]
    Stop = 0,
    OneThird = 1,
    TwoThirds = 2,
    Full = 3,
}

impl SpeedClass {
    /// Clamping conversion: anything above 3 commands full speed.
    pub fn from_index(index: u8) -> SpeedClass {
        match index {
            0 => SpeedClass::Stop,
            1 => SpeedClass::OneThird,
            2 => SpeedClass::TwoThirds,
            _ => SpeedClass::Full,
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }

    /// Fraction of the speed limit used for travel-time estimation. The
    /// one-third and two-thirds entries are the rounded planning constants,
    /// not exact thirds.
    pub fn fraction(&self) -> f64 {
        match self {
            SpeedClass::Stop => 0.0,
            SpeedClass::OneThird => 0.33,
            SpeedClass::TwoThirds => 0.67,
            SpeedClass::Full => 1.0,
        }
    }
}

impl fmt::Display for SpeedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Platform side of a station.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StationSide {
    Left,
    Right,
    Both,
}

impl fmt::Display for StationSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationSide::Left => write!(f, "left"),
            StationSide::Right => write!(f, "right"),
            StationSide::Both => write!(f, "both"),
        }
    }
}

/// Station metadata attached to a block.
#[derive(Debug, Clone, PartialEq)]
pub struct StationInfo {
    pub name: String,
    pub side: StationSide,
    /// Line-wide station number used in wayside command frames.
    pub number: u16,
}

/// A switch rooted at a block, described by its two legs.
/// `(12-13; 1-13)` reads as: normal leg 12-13, alternate leg 1-13.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchInfo {
    pub normal: (BlockId, BlockId),
    pub alternate: (BlockId, BlockId),
}

/// One fixed segment of track with its signalling state.
///
/// The block is the only authority/speed oracle in the system: every other
/// component delegates here instead of re-deriving the predicates.
#[derive(Debug, Clone)]
pub struct Block {
    pub line: Line,
    pub id: BlockId,
    pub length_m: f64,
    pub grade_percent: f64,
    pub speed_limit_kmh: f64,
    pub elevation_m: f64,
    pub section: char,
    pub underground: bool,
    pub station: Option<StationInfo>,
    pub switch: Option<SwitchInfo>,
    pub crossing: bool,

    open: bool,
    failed: bool,
    occupied: bool,
    maintenance_mode: bool,
    failure_reason: Option<(String, NaiveDateTime)>,
}

impl Block {
    pub fn new(line: Line, id: BlockId) -> Block {
        Block {
            line,
            id,
            length_m: 100.0,
            grade_percent: 0.0,
            speed_limit_kmh: 50.0,
            elevation_m: 0.0,
            section: 'A',
            underground: false,
            station: None,
            switch: None,
            crossing: false,
            open: true,
            failed: false,
            occupied: false,
            maintenance_mode: false,
            failure_reason: None,
        }
    }

    /// Open, not failed and not under maintenance.
    pub fn operational(&self) -> bool {
        self.open && !self.failed && !self.maintenance_mode
    }

    /// Binary permission to enter: 1 iff operational and unoccupied.
    pub fn calculate_safe_authority(&self) -> u8 {
        u8::from(self.operational() && !self.occupied)
    }

    /// Suggested speed given the next two blocks along the route. An absent
    /// next block is the end of known route and treated as the worst case.
    pub fn calculate_suggested_speed(
        &self,
        next1: Option<&Block>,
        next2: Option<&Block>,
    ) -> SpeedClass {
        if self.calculate_safe_authority() == 0 {
            return SpeedClass::Stop;
        }
        let clear = |block: Option<&Block>| {
            block.is_some_and(|b| b.operational() && !b.occupied)
        };
        if !clear(next1) {
            SpeedClass::OneThird
        } else if !clear(next2) {
            SpeedClass::TwoThirds
        } else {
            SpeedClass::Full
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance_mode
    }

    pub fn update_occupation(&mut self, occupied: bool) {
        self.occupied = occupied;
    }

    /// Flags or clears a failure, stamping the reason with the simulated
    /// time of the report. Repeated reports restamp; nothing coalesces.
    pub fn set_block_failed(&mut self, failed: bool, reason: &str, at: NaiveDateTime) {
        self.failed = failed;
        self.failure_reason = failed.then(|| (reason.to_owned(), at));
    }

    pub fn set_block_open(&mut self, open: bool) {
        self.open = open;
    }

    pub fn set_maintenance_mode(&mut self, maintenance: bool) {
        self.maintenance_mode = maintenance;
    }

    pub fn failure_reason(&self) -> Option<&(String, NaiveDateTime)> {
        self.failure_reason.as_ref()
    }

    pub fn speed_limit_mps(&self) -> f64 {
        kmh_to_mps(self.speed_limit_kmh)
    }

    pub fn speed_limit_mph(&self) -> f64 {
        kmh_to_mph(self.speed_limit_kmh)
    }
}

/// The one cross-subsystem mutable map: `(line, block)` to block state.
/// Writes are serialized through the CTC (closures, failures) or through
/// occupancy updates; readers lock per block and see tick-consistent state.
pub type BlockRegistry = HashMap<(Line, BlockId), Mutex<Block>>;
