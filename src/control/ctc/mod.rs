/// Fan-out and filtering between the CTC and the wayside controllers.
pub mod comm;
/// Routes and the route generator.
pub mod route;
/// Dispatched train records.
pub mod train;

use crate::control::clock::SimulationClock;
use crate::control::ctc::comm::{
    CommunicationHandler, OccupancyUpdate, OperatorCommand, TrainCommand, WaysideControl,
};
use crate::control::ctc::route::{Route, RouteId, RouteManager};
use crate::control::ctc::train::{
    Train, STATIONARY_COUNT_THRESHOLD, STATIONARY_TIME_THRESHOLD_S,
};
use crate::control::error::{ControlError, Result};
use crate::control::messages::Message;
use crate::control::rail_system::components::{Block, BlockRegistry, SpeedClass};
use crate::control::rail_system::track::TrackModel;
use crate::general::{BlockId, Line, TrainId};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::{channel, Receiver, Sender};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Route blocks scanned ahead of a train when judging a closure request.
const CLOSURE_LOOKAHEAD_BLOCKS: usize = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClosureStatus {
    Scheduled,
    Active,
    Cancelled,
}

/// A block closure booked for a future simulated time.
#[derive(Debug, Clone)]
pub struct ScheduledClosure {
    pub id: u32,
    pub line: Line,
    pub block_number: BlockId,
    pub scheduled_time: NaiveDateTime,
    pub status: ClosureStatus,
}

/// The reopening paired with a timed closure.
#[derive(Debug, Clone)]
pub struct ScheduledOpening {
    pub line: Line,
    pub block_number: BlockId,
    pub scheduled_time: NaiveDateTime,
    pub related_closure: Option<u32>,
}

/// The central traffic controller.
///
/// Owns the train and route registries outright and resolves every
/// cross-entity reference through them; trains and routes carry ids, never
/// each other. Block state is shared with the waysides through the
/// [`BlockRegistry`] and written only here or via occupancy updates.
pub struct CtcSystem {
    clock: Arc<SimulationClock>,
    track: Arc<TrackModel>,
    blocks: Arc<BlockRegistry>,
    comm: Arc<CommunicationHandler>,
    occupancy_rx: UnboundedReceiver<OccupancyUpdate>,
    route_manager: RouteManager,
    trains: HashMap<TrainId, Train>,
    active_trains: Vec<TrainId>,
    routes: HashMap<RouteId, Route>,
    scheduled_closures: Vec<ScheduledClosure>,
    scheduled_openings: Vec<ScheduledOpening>,
    maintenance_closures: HashMap<Line, HashSet<BlockId>>,
    channel: Sender<Message>,
    next_closure_id: u32,
}

impl CtcSystem {
    pub fn new(
        clock: Arc<SimulationClock>,
        track: Arc<TrackModel>,
        blocks: Arc<BlockRegistry>,
        comm: Arc<CommunicationHandler>,
        occupancy_rx: UnboundedReceiver<OccupancyUpdate>,
    ) -> CtcSystem {
        CtcSystem {
            route_manager: RouteManager::new(track.clone()),
            clock,
            track,
            blocks,
            comm,
            occupancy_rx,
            trains: HashMap::new(),
            active_trains: Vec::new(),
            routes: HashMap::new(),
            scheduled_closures: Vec::new(),
            scheduled_openings: Vec::new(),
            maintenance_closures: HashMap::new(),
            channel: channel(64).0,
            next_closure_id: 1,
        }
    }

    /// Subscribes to the CTC event channel (read-only, for displays).
    pub fn subscribe(&self) -> Receiver<Message> {
        self.channel.subscribe()
    }

    fn send(&self, message: Message) {
        let _ = self.channel.send(message);
    }

    pub fn comm(&self) -> &Arc<CommunicationHandler> {
        &self.comm
    }

    pub fn track(&self) -> &Arc<TrackModel> {
        &self.track
    }

    pub fn blocks(&self) -> &Arc<BlockRegistry> {
        &self.blocks
    }

    pub fn get_block(&self, line: Line, block: BlockId) -> Option<&Mutex<Block>> {
        self.blocks.get(&(line, block))
    }

    pub fn get_train(&self, id: &TrainId) -> Option<&Train> {
        self.trains.get(id)
    }

    pub fn get_route(&self, id: &str) -> Option<&Route> {
        self.routes.get(id)
    }

    pub fn active_trains(&self) -> &[TrainId] {
        &self.active_trains
    }

    pub fn trains(&self) -> impl Iterator<Item = &Train> {
        self.trains.values()
    }

    pub fn scheduled_closures(&self) -> &[ScheduledClosure] {
        &self.scheduled_closures
    }

    pub fn scheduled_openings(&self) -> &[ScheduledOpening] {
        &self.scheduled_openings
    }

    pub fn maintenance_closures(&self, line: Line) -> Option<&HashSet<BlockId>> {
        self.maintenance_closures.get(&line)
    }

    /// Registers a wayside controller with the communication handler.
    pub async fn provide_wayside_controller(
        &self,
        controller: Arc<dyn WaysideControl>,
        blocks_covered: Vec<(Line, BlockId)>,
    ) -> bool {
        self.comm
            .provide_wayside_controller(controller, blocks_covered)
            .await
    }

    /// A train id is accepted when it has the `[GR]ddd` shape and is not
    /// already registered.
    pub fn validate_id(&self, id: &str) -> bool {
        match id.parse::<TrainId>() {
            Ok(parsed) => !self.trains.contains_key(&parsed),
            Err(_) => false,
        }
    }

    /// Registers a train at the yard exit of the line its id letter names.
    pub async fn add_train(&mut self, id: &str) -> bool {
        if !self.validate_id(id) {
            return false;
        }
        let parsed: TrainId = id.parse().expect("validated above");
        let line = parsed.line().expect("validated above");
        let Some(start) = self.track.yard_exit(line) else {
            warn!(%line, "line is not loaded, cannot add train");
            return false;
        };
        let mut train = Train::new(parsed.clone(), line, start);
        if let Some(block) = self.blocks.get(&(line, start)) {
            let block = block.lock().await;
            train.update_location(start, block.grade_percent, block.speed_limit_kmh);
        }
        self.trains.insert(parsed, train);
        true
    }

    pub fn remove_train(&mut self, id: &str) -> bool {
        let Ok(parsed) = id.parse::<TrainId>() else {
            return false;
        };
        match self.trains.remove(&parsed) {
            Some(train) => {
                self.active_trains.retain(|t| *t != parsed);
                if let Some(route_id) = train.route_id {
                    if let Some(route) = self.routes.get_mut(&route_id) {
                        route.train_id = None;
                        route.is_active = false;
                    }
                }
                self.send(Message::TrainRemoved(parsed));
                true
            }
            None => false,
        }
    }

    /// Delegates to the route manager; `None` mirrors an absent manager in
    /// the deployed configuration.
    pub async fn generate_route(
        &mut self,
        line: Line,
        start: BlockId,
        destination: &str,
    ) -> Option<RouteId> {
        let now = self.clock.get_time().await;
        // scheduled arrival defaults to an hour out until timetables land
        let arrival = now + ChronoDuration::hours(1);
        match self.route_manager.generate_route(line, start, destination, arrival) {
            Ok(route) => {
                let id = route.route_id.clone();
                self.routes.insert(id.clone(), route);
                Some(id)
            }
            Err(err) => {
                warn!(%line, start, destination, %err, "route generation failed");
                None
            }
        }
    }

    /// Assigns an existing route to an existing train and activates it.
    pub fn activate_route(&mut self, route_id: &str, train_id: &str) -> bool {
        let Ok(parsed) = train_id.parse::<TrainId>() else {
            return false;
        };
        let (Some(route), Some(train)) =
            (self.routes.get_mut(route_id), self.trains.get_mut(&parsed))
        else {
            return false;
        };
        route.activate_route(parsed.clone());
        train.route_id = Some(route.route_id.clone());
        train.next_block = route.get_next_block();
        true
    }

    /// Validate, register, route and activate in one step. Any failing step
    /// rolls the earlier ones back.
    pub async fn dispatch_train_from_yard(
        &mut self,
        id: &str,
        line: Line,
        destination: &str,
    ) -> Result<RouteId> {
        if !self.validate_id(id) {
            return Err(ControlError::InvalidInput(format!("train id {id:?}")));
        }
        if !self.add_train(id).await {
            return Err(ControlError::InvalidInput(format!("could not add train {id}")));
        }
        let start = self
            .track
            .yard_exit(line)
            .ok_or_else(|| ControlError::NotFound(format!("{line} line")))?;

        let Some(route_id) = self.generate_route(line, start, destination).await else {
            self.remove_train(id);
            return Err(ControlError::NotFound(format!(
                "no route to {destination:?} on the {line} line"
            )));
        };
        if !self.activate_route(&route_id, id) {
            self.routes.remove(&route_id);
            self.remove_train(id);
            return Err(ControlError::NotFound(format!("route {route_id}")));
        }

        let parsed: TrainId = id.parse().expect("validated above");
        self.active_trains.push(parsed.clone());
        info!(train = %parsed, %line, destination, route = %route_id, "train dispatched");
        self.send(Message::TrainDispatched(parsed.clone(), line));

        let route = self.routes.get(&route_id).expect("inserted above");
        let (station, hops) = self.next_station_on(route).await.unwrap_or((0, 0));
        if !self
            .comm
            .send_departure_commands(&parsed, route, station, hops)
            .await
        {
            // waysides may still be registering; the tick loop retries
            debug!(train = %parsed, "departure commands not delivered yet");
        }
        Ok(route_id)
    }

    /// Applies occupancy updates to the blocks, then reconciles train
    /// positions from the transitions.
    pub async fn process_occupied_blocks(&mut self, updates: Vec<OccupancyUpdate>) {
        let now = self.clock.get_time().await;
        for update in updates {
            let Some(block) = self.blocks.get(&(update.line, update.block)) else {
                warn!(line = %update.line, block = update.block, "occupancy for unknown block");
                continue;
            };
            let was_occupied = {
                let mut block = block.lock().await;
                let was = block.is_occupied();
                block.update_occupation(update.occupied);
                was
            };
            if update.occupied && !was_occupied {
                self.reconcile_entry(update.line, update.block, now).await;
            } else if !update.occupied && was_occupied {
                self.reconcile_exit(update.line, update.block, now);
            }
        }
    }

    /// A block turned occupied: exactly one active train expecting it moves
    /// forward. Two candidates is an ambiguity; nothing moves.
    async fn reconcile_entry(&mut self, line: Line, block: BlockId, now: NaiveDateTime) {
        let candidates: Vec<TrainId> = self
            .active_trains
            .iter()
            .filter(|id| {
                self.trains.get(id).is_some_and(|t| {
                    t.line == line && t.is_active && t.next_block == Some(block)
                })
            })
            .cloned()
            .collect();

        match candidates.len() {
            0 => {
                // a re-report of a train already sitting there keeps its
                // movement history warm
                if let Some(train) = self
                    .trains
                    .values_mut()
                    .find(|t| t.line == line && t.current_block == block)
                {
                    train.update_movement_history(block, now);
                }
            }
            1 => {
                let id = candidates[0].clone();
                self.advance_train(&id, block, now).await;
            }
            _ => {
                let err = ControlError::AmbiguousOccupancy {
                    line,
                    block,
                    candidates: candidates.clone(),
                };
                warn!(%err, "occupancy could not be reconciled");
                self.comm.push_response(false, err.to_string()).await;
            }
        }
    }

    fn reconcile_exit(&mut self, line: Line, block: BlockId, now: NaiveDateTime) {
        // trailing occupancy released; keep the mover's history current
        if let Some(train) = self
            .trains
            .values_mut()
            .find(|t| t.line == line && t.is_active && t.movement_history.block == Some(block))
        {
            if train.current_block != block {
                let entered = train.current_block;
                train.update_movement_history(entered, now);
            }
        }
    }

    async fn advance_train(&mut self, id: &TrainId, block: BlockId, now: NaiveDateTime) {
        let Some(train) = self.trains.get_mut(id) else {
            return;
        };
        let line = train.line;
        let (grade, limit) = match self.blocks.get(&(line, block)) {
            Some(b) => {
                let b = b.lock().await;
                (b.grade_percent, b.speed_limit_kmh)
            }
            None => (0.0, 0.0),
        };
        train.update_location(block, grade, limit);
        train.update_movement_history(block, now);

        let route_id = train.route_id.clone();
        let mut arrived = false;
        if let Some(route_id) = route_id {
            if let Some(route) = self.routes.get_mut(&route_id) {
                route.update_location(block);
                let next = route.get_next_block();
                arrived = next.is_none() && route.end_block() == block;
                if arrived {
                    route.deactivate_route(now);
                }
                if let Some(train) = self.trains.get_mut(id) {
                    train.next_block = next;
                }
            }
        }
        if arrived {
            info!(train = %id, block, "train reached end of route");
            self.send(Message::TrainArrived(id.clone()));
            self.active_trains.retain(|t| t != id);
            self.trains.remove(id);
        }
    }

    /// Books a closure; a duration books the paired reopening as well.
    pub async fn schedule_block_closure(
        &mut self,
        line: Line,
        block: BlockId,
        at: NaiveDateTime,
        duration: Option<ChronoDuration>,
    ) -> Result<u32> {
        if !self.track.contains(line, block) {
            return Err(ControlError::NotFound(format!(
                "block {block} not found on the {line} line"
            )));
        }
        let id = self.next_closure_id;
        self.next_closure_id += 1;
        self.scheduled_closures.push(ScheduledClosure {
            id,
            line,
            block_number: block,
            scheduled_time: at,
            status: ClosureStatus::Scheduled,
        });
        if let Some(duration) = duration {
            self.scheduled_openings.push(ScheduledOpening {
                line,
                block_number: block,
                scheduled_time: at + duration,
                related_closure: Some(id),
            });
        }
        info!(%line, block, %at, "closure scheduled");
        Ok(id)
    }

    /// Executes every closure whose time has come. A closure the safety
    /// check refuses is cancelled rather than left pending.
    pub async fn process_scheduled_closures(&mut self, now: NaiveDateTime) -> Vec<String> {
        let mut actions = Vec::new();
        let due: Vec<(u32, Line, BlockId)> = self
            .scheduled_closures
            .iter()
            .filter(|c| c.status == ClosureStatus::Scheduled && c.scheduled_time <= now)
            .map(|c| (c.id, c.line, c.block_number))
            .collect();

        for (id, line, block) in due {
            let outcome = self.close_block_immediately(line, block).await;
            let status = match outcome {
                Ok(()) => {
                    actions.push(format!("Executed scheduled closure of {line} block {block}"));
                    ClosureStatus::Active
                }
                Err(err) => {
                    warn!(%line, block, %err, "scheduled closure refused");
                    self.comm.push_response(false, err.to_string()).await;
                    ClosureStatus::Cancelled
                }
            };
            if let Some(entry) = self.scheduled_closures.iter_mut().find(|c| c.id == id) {
                entry.status = status;
            }
        }
        actions
    }

    /// Executes and removes every opening whose time has come.
    pub async fn process_scheduled_openings(&mut self, now: NaiveDateTime) -> Vec<String> {
        let mut actions = Vec::new();
        let due: Vec<(Line, BlockId)> = self
            .scheduled_openings
            .iter()
            .filter(|o| o.scheduled_time <= now)
            .map(|o| (o.line, o.block_number))
            .collect();

        for (line, block) in due {
            if self.open_block_immediately(line, block).await.is_ok() {
                actions.push(format!("Executed scheduled opening of {line} block {block}"));
            }
        }
        self.scheduled_openings.retain(|o| o.scheduled_time > now);
        actions
    }

    /// Removes pending closures for the block. Returns how many went away.
    pub fn cancel_scheduled_closure(&mut self, line: Line, block: BlockId) -> usize {
        let before = self.scheduled_closures.len();
        self.scheduled_closures.retain(|c| {
            !(c.line == line && c.block_number == block && c.status == ClosureStatus::Scheduled)
        });
        before - self.scheduled_closures.len()
    }

    /// Refuses when any active train's route crosses the block within the
    /// lookahead window; the refusal names the offenders.
    pub fn can_close_safely(&self, line: Line, block: BlockId) -> Result<()> {
        let mut offending = Vec::new();
        for id in &self.active_trains {
            let Some(train) = self.trains.get(id) else {
                continue;
            };
            if train.line != line {
                continue;
            }
            let Some(route_id) = &train.route_id else {
                continue;
            };
            if let Some(route) = self.routes.get(route_id) {
                let ahead = route
                    .get_remaining_blocks()
                    .iter()
                    .take(CLOSURE_LOOKAHEAD_BLOCKS);
                if ahead.clone().any(|&b| b == block) {
                    offending.push(id.clone());
                }
            }
        }
        if offending.is_empty() {
            Ok(())
        } else {
            Err(ControlError::UnsafeOperation {
                reason: format!("block {block} lies on an active route"),
                offending_trains: offending,
            })
        }
    }

    /// Closes a block for maintenance, safety check first.
    pub async fn close_block_immediately(&mut self, line: Line, block: BlockId) -> Result<()> {
        self.can_close_safely(line, block)?;
        let entry = self
            .blocks
            .get(&(line, block))
            .ok_or_else(|| ControlError::NotFound(format!("block {block} on the {line} line")))?;
        entry.lock().await.set_maintenance_mode(true);
        self.maintenance_closures.entry(line).or_default().insert(block);
        self.send(Message::BlockClosed(line, block));
        info!(%line, block, "block closed");
        Ok(())
    }

    pub async fn open_block_immediately(&mut self, line: Line, block: BlockId) -> Result<()> {
        let entry = self
            .blocks
            .get(&(line, block))
            .ok_or_else(|| ControlError::NotFound(format!("block {block} on the {line} line")))?;
        entry.lock().await.set_maintenance_mode(false);
        if let Some(set) = self.maintenance_closures.get_mut(&line) {
            set.remove(&block);
        }
        self.send(Message::BlockOpened(line, block));
        info!(%line, block, "block opened");
        Ok(())
    }

    /// Marks or clears a block failure reported from the field.
    pub async fn report_block_failure(
        &mut self,
        line: Line,
        block: BlockId,
        failed: bool,
        reason: &str,
    ) -> Result<()> {
        let now = self.clock.get_time().await;
        let entry = self
            .blocks
            .get(&(line, block))
            .ok_or_else(|| ControlError::NotFound(format!("block {block} on the {line} line")))?;
        entry.lock().await.set_block_failed(failed, reason, now);
        if failed {
            self.send(Message::BlockFailed(line, block, now));
        }
        Ok(())
    }

    /// Trains that have sat still past both emergency thresholds.
    pub fn check_for_emergencies(&self, now: NaiveDateTime) -> Vec<TrainId> {
        let emergencies: Vec<TrainId> = self
            .active_trains
            .iter()
            .filter(|id| {
                self.trains.get(id).is_some_and(|t| {
                    t.is_stationary_too_long(
                        STATIONARY_COUNT_THRESHOLD,
                        STATIONARY_TIME_THRESHOLD_S,
                        now,
                    )
                })
            })
            .cloned()
            .collect();
        for id in &emergencies {
            warn!(train = %id, "train stationary too long");
            self.send(Message::EmergencyDetected(id.clone()));
        }
        emergencies
    }

    /// First station at or ahead of the route position: `(number, hops)`.
    async fn next_station_on(&self, route: &Route) -> Option<(u16, u16)> {
        for (hops, &block) in route.get_remaining_blocks().iter().enumerate() {
            if let Some(number) = self.track.station_number(route.line, block) {
                return Some((number, hops as u16));
            }
        }
        None
    }

    /// One CTC tick: drain schedules, reconcile occupancy, check
    /// emergencies, reroute around hazards and push fresh commands.
    pub async fn system_tick(&mut self, now: NaiveDateTime) {
        self.send(Message::TimeUpdate(now.format("%H:%M").to_string()));
        self.process_operator_commands().await;
        self.process_scheduled_closures(now).await;
        self.process_scheduled_openings(now).await;

        let mut pending = Vec::new();
        while let Ok(update) = self.occupancy_rx.try_recv() {
            pending.push(update);
        }
        if !pending.is_empty() {
            self.process_occupied_blocks(pending).await;
        }

        self.check_for_emergencies(now);
        self.reroute_hazardous_trains(now).await;
        self.push_train_commands().await;
    }

    /// Drains the operator command queue, answering each request on the
    /// response queue.
    async fn process_operator_commands(&mut self) {
        let mut queued = Vec::new();
        while let Some(command) = self.comm.pop_command().await {
            queued.push(command);
        }
        for command in queued {
            let (success, message) = match command {
                OperatorCommand::CloseBlock { line, block } => {
                    match self.close_block_immediately(line, block).await {
                        Ok(()) => (true, format!("Block {block} closed")),
                        Err(err) => (false, err.to_string()),
                    }
                }
                OperatorCommand::OpenBlock { line, block } => {
                    match self.open_block_immediately(line, block).await {
                        Ok(()) => (true, format!("Block {block} opened")),
                        Err(err) => (false, err.to_string()),
                    }
                }
                OperatorCommand::EmergencyStop { train_id } => {
                    match self.trains.get_mut(&train_id) {
                        Some(train) => {
                            train.update_suggested_speed(0);
                            train.update_authority(0);
                            let stop = TrainCommand {
                                train_id: train_id.clone(),
                                line: train.line,
                                block: train.current_block,
                                suggested_speed: SpeedClass::Stop,
                                authority: 0,
                                update_block_in_queue: false,
                                next_station: 0,
                                blocks_away: 0,
                            };
                            warn!(train = %train_id, "operator emergency stop");
                            self.comm.send_train_commands(&[stop]).await;
                            (true, format!("Emergency stop sent to {train_id}"))
                        }
                        None => (
                            false,
                            ControlError::NotFound(format!("train {train_id}")).to_string(),
                        ),
                    }
                }
            };
            self.comm.push_response(success, message).await;
        }
    }

    /// Non-operational blocks of a line, the set routing must steer around.
    async fn hazardous_blocks(&self, line: Line) -> HashSet<BlockId> {
        let mut blocked = HashSet::new();
        for ((l, id), block) in self.blocks.iter() {
            if *l == line && !block.lock().await.operational() {
                blocked.insert(*id);
            }
        }
        blocked
    }

    /// Replaces the route of any train whose remaining blocks include a
    /// non-operational one, when a hazard-free alternative exists.
    async fn reroute_hazardous_trains(&mut self, now: NaiveDateTime) {
        let ids: Vec<TrainId> = self.active_trains.clone();
        for id in ids {
            let Some(train) = self.trains.get(&id) else {
                continue;
            };
            let Some(route_id) = train.route_id.clone() else {
                continue;
            };
            let Some(route) = self.routes.get(&route_id) else {
                continue;
            };
            let line = route.line;
            let blocked = self.hazardous_blocks(line).await;
            let route = self.routes.get(&route_id).expect("looked up above");
            if !route
                .get_remaining_blocks()
                .iter()
                .skip(1)
                .any(|b| blocked.contains(b))
            {
                continue;
            }
            let start = route.current_block();
            let end = route.end_block();
            debug!(train = %id, %line, "route hazard, regenerating");
            let arrival = now + ChronoDuration::hours(1);
            match self
                .route_manager
                .generate_route_avoiding(line, start, end, &blocked, arrival)
            {
                Ok(new_route) => {
                    let new_id = new_route.route_id.clone();
                    self.routes.insert(new_id.clone(), new_route);
                    if let Some(old) = self.routes.get_mut(&route_id) {
                        old.is_active = false;
                        old.train_id = None;
                    }
                    self.activate_route(&new_id, id.as_str());
                }
                Err(err) => {
                    warn!(train = %id, %line, %err, "no hazard-free route available");
                }
            }
        }
    }

    /// Builds the per-train command rows for this tick and hands them to the
    /// communication handler.
    async fn push_train_commands(&mut self) {
        let mut commands = Vec::new();
        for id in self.active_trains.clone() {
            let Some(train) = self.trains.get(&id) else {
                continue;
            };
            let line = train.line;
            let block = train.current_block;
            let next_block = train.next_block;
            let route = train
                .route_id
                .as_ref()
                .and_then(|route_id| self.routes.get(route_id));

            let Ok((authority, speed)) = self
                .comm
                .calculate_authority_and_speed(&id, line, block, route)
                .await
            else {
                continue;
            };
            let (station, hops) = match route {
                Some(route) => self.next_station_on(route).await.unwrap_or((0, 0)),
                None => (0, 0),
            };
            commands.push(TrainCommand {
                train_id: id.clone(),
                line,
                block,
                suggested_speed: speed,
                authority,
                update_block_in_queue: next_block.is_some(),
                next_station: station,
                blocks_away: hops,
            });
            if let (Some(next), Some(route)) = (next_block, route) {
                if let Ok((next_authority, next_speed)) = self
                    .comm
                    .calculate_authority_and_speed(&id, line, next, Some(route))
                    .await
                {
                    commands.push(TrainCommand {
                        train_id: id.clone(),
                        line,
                        block: next,
                        suggested_speed: next_speed,
                        authority: next_authority,
                        update_block_in_queue: false,
                        next_station: station,
                        blocks_away: hops.saturating_sub(1),
                    });
                }
            }
            if let Some(train) = self.trains.get_mut(&id) {
                train.update_authority(i32::from(authority));
                train.update_suggested_speed(i32::from(speed.index()));
            }
        }
        if !commands.is_empty() && !self.comm.send_train_commands(&commands).await {
            debug!("command batch not delivered, retrying next tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::rail_system::layout::standard_network;

    async fn ctc() -> CtcSystem {
        let (track, registry) = standard_network(&[Line::Green]);
        let blocks = Arc::new(registry);
        let (comm, occupancy_rx) = CommunicationHandler::new(blocks.clone());
        let clock = SimulationClock::new("12:00").unwrap();
        CtcSystem::new(clock, Arc::new(track), blocks, comm, occupancy_rx)
    }

    fn noon() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn id_validation() {
        let mut system = ctc().await;
        for id in ["G001", "R001", "G002", "R002"] {
            assert!(system.validate_id(id), "{id} should validate");
        }
        for id in ["", "123", "T", "R1", "L001", "G00"] {
            assert!(!system.validate_id(id), "{id} should not validate");
        }
        assert!(system.add_train("G001").await);
        assert!(!system.validate_id("G001"), "duplicates are rejected");
    }

    #[tokio::test]
    async fn add_and_remove_trains() {
        let mut system = ctc().await;
        assert!(system.add_train("G001").await);
        let parsed: TrainId = "G001".parse().unwrap();
        assert!(system.get_train(&parsed).is_some());
        assert_eq!(system.get_train(&parsed).unwrap().current_block, 1);

        assert!(!system.add_train("G001").await, "duplicate add fails");
        assert!(system.remove_train("G001"));
        assert!(system.get_train(&parsed).is_none());
        assert!(!system.remove_train("G001"));
        assert!(!system.remove_train("G999"));
    }

    #[tokio::test]
    async fn dispatch_happy_path() {
        let mut system = ctc().await;
        let route_id = system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();

        let parsed: TrainId = "G001".parse().unwrap();
        let train = system.get_train(&parsed).unwrap();
        assert_eq!(train.current_block, 1);
        assert_eq!(train.next_block, Some(13));
        assert_eq!(train.route_id.as_deref(), Some(route_id.as_str()));

        let route = system.get_route(&route_id).unwrap();
        assert!(route.is_active);
        assert_eq!(route.block_sequence(), &[1, 13, 14]);
        assert_eq!(route.current_index(), 0);
        assert!(system.active_trains().contains(&parsed));
    }

    #[tokio::test]
    async fn dispatch_rolls_back_on_bad_destination() {
        let mut system = ctc().await;
        let result = system
            .dispatch_train_from_yard("G001", Line::Green, "NOWHERE")
            .await;
        assert!(matches!(result, Err(ControlError::NotFound(_))));
        assert!(system.get_train(&"G001".parse().unwrap()).is_none());
        assert!(system.active_trains().is_empty());
        assert!(system.validate_id("G001"), "id must be reusable after rollback");
    }

    #[tokio::test]
    async fn occupancy_advances_the_expecting_train() {
        let mut system = ctc().await;
        system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();

        system
            .process_occupied_blocks(vec![OccupancyUpdate {
                line: Line::Green,
                block: 13,
                occupied: true,
                train_id: None,
            }])
            .await;

        let train = system.get_train(&"G001".parse().unwrap()).unwrap();
        assert_eq!(train.current_block, 13);
        assert_eq!(train.next_block, Some(14));
        assert_eq!(train.stationary_count(), 1);
    }

    #[tokio::test]
    async fn reaching_the_end_retires_the_train() {
        let mut system = ctc().await;
        system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();
        for block in [13, 14] {
            system
                .process_occupied_blocks(vec![OccupancyUpdate {
                    line: Line::Green,
                    block,
                    occupied: true,
                    train_id: None,
                }])
                .await;
        }
        assert!(system.get_train(&"G001".parse().unwrap()).is_none());
        assert!(system.active_trains().is_empty());
    }

    #[tokio::test]
    async fn ambiguous_occupancy_changes_nothing() {
        let mut system = ctc().await;
        system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();
        system
            .dispatch_train_from_yard("G002", Line::Green, "EDGEBROOK")
            .await
            .unwrap();

        // both trains expect block 13
        system
            .process_occupied_blocks(vec![OccupancyUpdate {
                line: Line::Green,
                block: 13,
                occupied: true,
                train_id: None,
            }])
            .await;

        for id in ["G001", "G002"] {
            let train = system.get_train(&id.parse().unwrap()).unwrap();
            assert_eq!(train.current_block, 1, "{id} must not move");
        }
        let mut saw_ambiguity = false;
        while let Some(response) = system.comm().pop_response().await {
            saw_ambiguity |= !response.success && response.message.contains("ambiguous");
        }
        assert!(saw_ambiguity, "operator warning must be surfaced");
    }

    #[tokio::test]
    async fn closure_scheduling_and_execution() {
        let mut system = ctc().await;
        let at = noon() + ChronoDuration::minutes(5);

        system
            .schedule_block_closure(Line::Green, 5, at, Some(ChronoDuration::minutes(30)))
            .await
            .unwrap();
        assert_eq!(system.scheduled_closures().len(), 1);
        assert_eq!(system.scheduled_closures()[0].status, ClosureStatus::Scheduled);
        assert_eq!(system.scheduled_openings().len(), 1);
        assert_eq!(
            system.scheduled_openings()[0].scheduled_time,
            at + ChronoDuration::minutes(30)
        );

        // nothing due yet
        let actions = system.process_scheduled_closures(noon()).await;
        assert!(actions.is_empty());

        // past the closure time
        let actions = system
            .process_scheduled_closures(at + ChronoDuration::seconds(30))
            .await;
        assert_eq!(actions.len(), 1);
        assert!(actions[0].contains("Executed scheduled closure"));
        assert_eq!(system.scheduled_closures()[0].status, ClosureStatus::Active);
        assert!(system.maintenance_closures(Line::Green).unwrap().contains(&5));

        // past the opening time
        let actions = system
            .process_scheduled_openings(at + ChronoDuration::minutes(31))
            .await;
        assert_eq!(actions.len(), 1);
        assert!(actions[0].contains("Executed scheduled opening"));
        assert!(!system.maintenance_closures(Line::Green).unwrap().contains(&5));
        assert!(system.scheduled_openings().is_empty());
    }

    #[tokio::test]
    async fn closure_of_unknown_block_fails() {
        let mut system = ctc().await;
        let result = system
            .schedule_block_closure(Line::Green, 999, noon(), None)
            .await;
        assert!(matches!(result, Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_scheduled_closure_removes_pending_entries() {
        let mut system = ctc().await;
        system
            .schedule_block_closure(Line::Green, 5, noon() + ChronoDuration::minutes(5), None)
            .await
            .unwrap();
        assert_eq!(system.cancel_scheduled_closure(Line::Green, 5), 1);
        assert!(system.scheduled_closures().is_empty());
        assert_eq!(system.cancel_scheduled_closure(Line::Green, 5), 0);
    }

    #[tokio::test]
    async fn immediate_closure_respects_the_safety_check() {
        let mut system = ctc().await;
        assert!(system.close_block_immediately(Line::Green, 5).await.is_ok());
        assert!(system.maintenance_closures(Line::Green).unwrap().contains(&5));
        {
            let block = system.get_block(Line::Green, 5).unwrap().lock().await;
            assert!(block.in_maintenance());
        }
        system.open_block_immediately(Line::Green, 5).await.unwrap();
        assert!(!system.maintenance_closures(Line::Green).unwrap().contains(&5));

        // a train routed across the block vetoes the closure
        system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();
        let refused = system.close_block_immediately(Line::Green, 13).await;
        match refused {
            Err(ControlError::UnsafeOperation { offending_trains, .. }) => {
                assert_eq!(offending_trains, vec!["G001".parse().unwrap()]);
            }
            other => panic!("expected UnsafeOperation, got {other:?}"),
        }
        assert!(
            !system
                .maintenance_closures(Line::Green)
                .is_some_and(|s| s.contains(&13))
        );
    }

    #[tokio::test]
    async fn stationary_trains_raise_emergencies() {
        let mut system = ctc().await;
        system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();
        let id: TrainId = "G001".parse().unwrap();
        {
            let train = system.trains.get_mut(&id).unwrap();
            for s in 0..5 {
                train.update_movement_history(1, noon() + ChronoDuration::seconds(s));
            }
        }
        // count satisfied, not enough wall time
        assert!(system.check_for_emergencies(noon() + ChronoDuration::seconds(10)).is_empty());
        let late = system.check_for_emergencies(noon() + ChronoDuration::minutes(2));
        assert_eq!(late, vec![id]);
    }

    #[tokio::test]
    async fn operator_commands_drain_through_the_tick() {
        let mut system = ctc().await;
        system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();
        system
            .comm()
            .push_command(OperatorCommand::CloseBlock {
                line: Line::Green,
                block: 40,
            })
            .await;
        system
            .comm()
            .push_command(OperatorCommand::EmergencyStop {
                train_id: "G001".parse().unwrap(),
            })
            .await;
        system
            .comm()
            .push_command(OperatorCommand::EmergencyStop {
                train_id: "G099".parse().unwrap(),
            })
            .await;

        system.system_tick(noon()).await;

        assert!(system.maintenance_closures(Line::Green).unwrap().contains(&40));
        let mut messages = Vec::new();
        while let Some(response) = system.comm().pop_response().await {
            messages.push((response.success, response.message));
        }
        assert!(messages.iter().any(|(ok, m)| *ok && m.contains("Block 40 closed")));
        assert!(messages.iter().any(|(ok, m)| *ok && m.contains("Emergency stop")));
        assert!(messages.iter().any(|(ok, m)| !ok && m.contains("not found")));
    }

    #[tokio::test]
    async fn hazard_on_route_triggers_regeneration() {
        let mut system = ctc().await;
        system
            .dispatch_train_from_yard("G001", Line::Green, "EDGEBROOK")
            .await
            .unwrap();
        // break the switch leg; the chain 1..14 remains
        system
            .report_block_failure(Line::Green, 13, true, "circuit fault")
            .await
            .unwrap();
        system.system_tick(noon()).await;

        let id: TrainId = "G001".parse().unwrap();
        let train = system.get_train(&id).unwrap();
        let route = system.get_route(train.route_id.as_ref().unwrap()).unwrap();
        assert!(!route.block_sequence().contains(&13));
        assert_eq!(route.end_block(), 14);
    }
}
