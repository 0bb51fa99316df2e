use crate::control::error::{ControlError, Result};
use crate::control::rail_system::components::{Block, BlockRegistry, SpeedClass};
use crate::control::rail_system::track::TrackModel;
use crate::general::{BlockId, Line, TrainId};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::sync::Arc;

/// Seconds charged for the current block before a train gets moving, and for
/// any block whose suggested speed is stop.
pub const DEPARTURE_DWELL_S: f64 = 8.0;

pub type RouteId = String;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum RouteType {
    #[default]
    Normal,
    Emergency,
}

/// An ordered, adjacency-valid block sequence with a current position.
#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: RouteId,
    pub train_id: Option<TrainId>,
    pub line: Line,
    block_sequence: Vec<BlockId>,
    current_index: usize,
    pub is_active: bool,
    pub route_type: RouteType,
    pub priority: u8,
    pub estimated_travel_time_s: f64,
    pub scheduled_arrival: NaiveDateTime,
    pub actual_arrival: Option<NaiveDateTime>,
}

impl Route {
    /// Validates the sequence against the track graph and builds the route.
    /// The sequence must be non-empty with every consecutive pair adjacent;
    /// a single block is a legal route.
    pub fn create_route(
        route_id: RouteId,
        line: Line,
        sequence: Vec<BlockId>,
        scheduled_arrival: NaiveDateTime,
        track: &TrackModel,
    ) -> Result<Route> {
        if sequence.is_empty() {
            return Err(ControlError::InvalidInput(
                "route creation requires a non-empty block sequence".into(),
            ));
        }
        for pair in sequence.windows(2) {
            if !track.are_adjacent(line, pair[0], pair[1]) {
                return Err(ControlError::InvalidInput(format!(
                    "blocks {} and {} are not connected on the {line} line",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Route {
            route_id,
            train_id: None,
            line,
            block_sequence: sequence,
            current_index: 0,
            is_active: false,
            route_type: RouteType::Normal,
            priority: 1,
            estimated_travel_time_s: 0.0,
            scheduled_arrival,
            actual_arrival: None,
        })
    }

    pub fn start_block(&self) -> BlockId {
        self.block_sequence[0]
    }

    pub fn end_block(&self) -> BlockId {
        *self.block_sequence.last().expect("sequence is non-empty")
    }

    pub fn block_sequence(&self) -> &[BlockId] {
        &self.block_sequence
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_block(&self) -> BlockId {
        self.block_sequence[self.current_index]
    }

    /// Advances to `block` if it lies at or ahead of the current position.
    /// Backward moves and unknown blocks are rejected with no state change.
    pub fn update_location(&mut self, block: BlockId) -> bool {
        match self.block_sequence[self.current_index..]
            .iter()
            .position(|&b| b == block)
        {
            Some(offset) => {
                self.current_index += offset;
                true
            }
            None => false,
        }
    }

    pub fn get_next_block(&self) -> Option<BlockId> {
        self.block_sequence.get(self.current_index + 1).copied()
    }

    /// Remaining blocks, current block included.
    pub fn get_remaining_blocks(&self) -> &[BlockId] {
        &self.block_sequence[self.current_index..]
    }

    /// Hop count between two blocks of the sequence, 0 when either is
    /// missing.
    pub fn calculate_route_distance(&self, from: BlockId, to: BlockId) -> usize {
        let a = self.block_sequence.iter().position(|&b| b == from);
        let b = self.block_sequence.iter().position(|&b| b == to);
        match (a, b) {
            (Some(a), Some(b)) => b.saturating_sub(a),
            _ => 0,
        }
    }

    /// Per-block authority and suggested speed over the whole sequence,
    /// delegating to each block's own predicates with the following two
    /// route blocks as lookahead.
    pub async fn calculate_authority_speed(
        &self,
        registry: &BlockRegistry,
    ) -> (Vec<u8>, Vec<SpeedClass>) {
        let mut snapshot: Vec<Option<Block>> = Vec::with_capacity(self.block_sequence.len());
        for &id in &self.block_sequence {
            match registry.get(&(self.line, id)) {
                Some(block) => snapshot.push(Some(block.lock().await.clone())),
                None => snapshot.push(None),
            }
        }

        let mut authority = Vec::with_capacity(snapshot.len());
        let mut speed = Vec::with_capacity(snapshot.len());
        for i in 0..snapshot.len() {
            let Some(block) = &snapshot[i] else {
                authority.push(0);
                speed.push(SpeedClass::Stop);
                continue;
            };
            let next1 = snapshot.get(i + 1).and_then(|b| b.as_ref());
            let next2 = snapshot.get(i + 2).and_then(|b| b.as_ref());
            authority.push(block.calculate_safe_authority());
            speed.push(block.calculate_suggested_speed(next1, next2));
        }
        (authority, speed)
    }

    /// Estimated arrival for an active route. The current block is charged a
    /// fixed departure dwell; every later block is charged its length over
    /// the commanded fraction of its speed limit, stop segments counting as
    /// another dwell.
    pub async fn get_estimated_arrival(
        &self,
        now: NaiveDateTime,
        registry: &BlockRegistry,
    ) -> Option<NaiveDateTime> {
        if !self.is_active {
            return None;
        }
        let (_, speed) = self.calculate_authority_speed(registry).await;
        let mut total_s = 0.0;
        for (offset, &id) in self.get_remaining_blocks().iter().enumerate() {
            let index = self.current_index + offset;
            if offset == 0 {
                total_s += DEPARTURE_DWELL_S;
                continue;
            }
            let fraction = speed[index].fraction();
            if fraction == 0.0 {
                total_s += DEPARTURE_DWELL_S;
                continue;
            }
            let block = registry.get(&(self.line, id))?.lock().await;
            total_s += block.length_m / (fraction * block.speed_limit_mps());
        }
        Some(now + ChronoDuration::milliseconds((total_s * 1000.0) as i64))
    }

    pub fn activate_route(&mut self, train_id: TrainId) {
        self.train_id = Some(train_id);
        self.is_active = true;
    }

    pub fn deactivate_route(&mut self, now: NaiveDateTime) {
        self.is_active = false;
        self.actual_arrival = Some(now);
    }
}

/// Generates and validates routes against the track graph.
#[derive(Debug)]
pub struct RouteManager {
    track: Arc<TrackModel>,
    next_route_number: u64,
}

impl RouteManager {
    pub fn new(track: Arc<TrackModel>) -> RouteManager {
        RouteManager {
            track,
            next_route_number: 1,
        }
    }

    fn next_id(&mut self) -> RouteId {
        let id = format!("route_{}", self.next_route_number);
        self.next_route_number += 1;
        id
    }

    /// Builds a route over a caller-supplied sequence.
    pub fn create_route(
        &mut self,
        line: Line,
        sequence: Vec<BlockId>,
        scheduled_arrival: NaiveDateTime,
    ) -> Result<Route> {
        Route::create_route(self.next_id(), line, sequence, scheduled_arrival, &self.track)
    }

    /// Generates the cheapest route from `start` to a destination given as
    /// station name or block number.
    pub fn generate_route(
        &mut self,
        line: Line,
        start: BlockId,
        destination: &str,
        scheduled_arrival: NaiveDateTime,
    ) -> Result<Route> {
        let end = match destination.parse::<BlockId>() {
            Ok(block) if self.track.contains(line, block) => block,
            _ => self
                .track
                .station_block(line, destination)
                .ok_or_else(|| ControlError::NotFound(format!(
                    "destination {destination:?} on the {line} line"
                )))?,
        };
        let sequence = self
            .track
            .shortest_path(line, start, end)
            .ok_or_else(|| ControlError::NotFound(format!(
                "no path from block {start} to block {end} on the {line} line"
            )))?;
        Route::create_route(self.next_id(), line, sequence, scheduled_arrival, &self.track)
    }

    /// Route generation that steers around hazardous blocks, used when an
    /// active route develops an unresolvable hazard.
    pub fn generate_route_avoiding(
        &mut self,
        line: Line,
        start: BlockId,
        end: BlockId,
        avoid: &std::collections::HashSet<BlockId>,
        scheduled_arrival: NaiveDateTime,
    ) -> Result<Route> {
        let sequence = self
            .track
            .shortest_path_avoiding(line, start, end, avoid)
            .ok_or_else(|| ControlError::NotFound(format!(
                "no hazard-free path from block {start} to block {end} on the {line} line"
            )))?;
        Route::create_route(self.next_id(), line, sequence, scheduled_arrival, &self.track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::rail_system::components::Block;
    use crate::control::rail_system::track::Builder;
    use chrono::NaiveDate;

    fn arrival() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap()
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    /// Chain 1-2-3 plus the 4-3-2-1-13-14-15 run used by the longer cases.
    fn test_track() -> (Arc<TrackModel>, BlockRegistry) {
        let mut builder = Builder::new();
        for id in [1, 2, 3, 4, 13, 14, 15] {
            builder.add_block(Block::new(Line::Green, id));
        }
        builder.connect_run(Line::Green, &[4, 3, 2, 1, 13, 14, 15]);
        builder.connect_run(Line::Green, &[1, 2, 3]);
        let (track, registry) = builder.build();
        (Arc::new(track), registry)
    }

    #[tokio::test]
    async fn create_route_validates_input() {
        let (track, _) = test_track();
        let mut manager = RouteManager::new(track);

        let empty = manager.create_route(Line::Green, vec![], arrival());
        assert!(matches!(empty, Err(ControlError::InvalidInput(_))));

        let gap = manager.create_route(Line::Green, vec![1, 14], arrival());
        assert!(matches!(gap, Err(ControlError::InvalidInput(_))));

        let single = manager.create_route(Line::Green, vec![1], arrival()).unwrap();
        assert_eq!(single.start_block(), 1);
        assert_eq!(single.end_block(), 1);

        let long = manager
            .create_route(Line::Green, vec![4, 3, 2, 1, 13, 14, 15], arrival())
            .unwrap();
        assert_eq!(long.start_block(), 4);
        assert_eq!(long.end_block(), 15);
        assert_eq!(long.current_index(), 0);
        assert!(!long.is_active);
        assert_eq!(long.route_type, RouteType::Normal);
        assert_eq!(long.priority, 1);
    }

    #[tokio::test]
    async fn location_updates_are_monotonic() {
        let (track, _) = test_track();
        let mut manager = RouteManager::new(track);
        let mut route = manager
            .create_route(Line::Green, vec![1, 13, 14], arrival())
            .unwrap();

        assert!(route.update_location(13));
        assert_eq!(route.current_block(), 13);
        assert_eq!(route.get_next_block(), Some(14));

        // unknown block
        assert!(!route.update_location(999));
        assert_eq!(route.current_block(), 13);

        // backward move is refused with no state change
        assert!(route.update_location(14));
        assert!(!route.update_location(13));
        assert_eq!(route.current_index(), 2);
        assert_eq!(route.get_next_block(), None);
    }

    #[tokio::test]
    async fn authority_speed_over_clean_and_hazardous_routes() {
        let (track, registry) = test_track();
        let mut manager = RouteManager::new(track);
        let route = manager
            .create_route(Line::Green, vec![1, 13, 14], arrival())
            .unwrap();

        let (authority, speed) = route.calculate_authority_speed(&registry).await;
        assert_eq!(authority, vec![1, 1, 1]);
        assert_eq!(
            speed,
            vec![SpeedClass::Full, SpeedClass::TwoThirds, SpeedClass::OneThird]
        );

        registry
            .get(&(Line::Green, 13))
            .unwrap()
            .lock()
            .await
            .update_occupation(true);
        let (authority, speed) = route.calculate_authority_speed(&registry).await;
        assert_eq!(authority, vec![1, 0, 1]);
        assert_eq!(
            speed,
            vec![SpeedClass::OneThird, SpeedClass::Stop, SpeedClass::OneThird]
        );

        registry
            .get(&(Line::Green, 13))
            .unwrap()
            .lock()
            .await
            .update_occupation(false);
        registry
            .get(&(Line::Green, 14))
            .unwrap()
            .lock()
            .await
            .set_block_open(false);
        let (authority, speed) = route.calculate_authority_speed(&registry).await;
        assert_eq!(authority, vec![1, 1, 0]);
        assert_eq!(
            speed,
            vec![SpeedClass::TwoThirds, SpeedClass::OneThird, SpeedClass::Stop]
        );
    }

    #[tokio::test]
    async fn eta_matches_the_pinned_formula() {
        let mut builder = Builder::new();
        for id in [1, 2, 3] {
            let mut block = Block::new(Line::Green, id);
            block.length_m = 7.7;
            block.speed_limit_kmh = 3.6; // 1 m/s
            builder.add_block(block);
        }
        builder.connect_run(Line::Green, &[1, 2, 3]);
        let (track, registry) = builder.build();
        let mut manager = RouteManager::new(Arc::new(track));
        let mut route = manager
            .create_route(Line::Green, vec![1, 2, 3], arrival())
            .unwrap();
        route.activate_route("G001".parse().unwrap());

        let eta = route.get_estimated_arrival(noon(), &registry).await.unwrap();
        let expected_s = 8.0 + 7.7 / 0.67 + 7.7 / 0.33;
        let diff = (eta - noon()).num_milliseconds() as f64 / 1000.0 - expected_s;
        assert!(diff.abs() <= 0.1, "eta off by {diff}s");
    }

    #[tokio::test]
    async fn remaining_blocks_and_distance() {
        let (track, _) = test_track();
        let mut manager = RouteManager::new(track);
        let mut route = manager
            .create_route(Line::Green, vec![1, 13, 14], arrival())
            .unwrap();
        route.update_location(13);
        assert_eq!(route.get_remaining_blocks(), &[13, 14]);
        assert_eq!(route.calculate_route_distance(1, 14), 2);
        assert_eq!(route.calculate_route_distance(1, 999), 0);
    }

    #[tokio::test]
    async fn activation_stamps_arrival() {
        let (track, _) = test_track();
        let mut manager = RouteManager::new(track);
        let mut route = manager
            .create_route(Line::Green, vec![1, 13], arrival())
            .unwrap();
        route.activate_route("G001".parse().unwrap());
        assert!(route.is_active);
        assert_eq!(route.train_id, Some("G001".parse().unwrap()));
        route.deactivate_route(noon());
        assert!(!route.is_active);
        assert_eq!(route.actual_arrival, Some(noon()));
    }

    #[tokio::test]
    async fn generate_route_by_station_and_block() {
        let mut builder = Builder::new();
        for id in [1, 13, 14] {
            let mut block = Block::new(Line::Green, id);
            if id == 14 {
                block.station = Some(crate::control::rail_system::components::StationInfo {
                    name: "EDGEBROOK".into(),
                    side: crate::control::rail_system::components::StationSide::Right,
                    number: 2,
                });
            }
            builder.add_block(block);
        }
        builder.connect_run(Line::Green, &[1, 13, 14]);
        let (track, _) = builder.build();
        let mut manager = RouteManager::new(Arc::new(track));

        let by_station = manager
            .generate_route(Line::Green, 1, "Edgebrook", arrival())
            .unwrap();
        assert_eq!(by_station.block_sequence(), &[1, 13, 14]);

        let by_block = manager
            .generate_route(Line::Green, 1, "14", arrival())
            .unwrap();
        assert_eq!(by_block.block_sequence(), &[1, 13, 14]);

        let missing = manager.generate_route(Line::Green, 1, "NOWHERE", arrival());
        assert!(matches!(missing, Err(ControlError::NotFound(_))));
    }
}
