use crate::control::ctc::route::Route;
use crate::control::error::{ControlError, Result};
use crate::control::rail_system::components::{BlockRegistry, SpeedClass};
use crate::general::{BlockId, ControllerId, Line, TrainId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Capability set a wayside controller exposes to the CTC side.
#[async_trait]
pub trait WaysideControl: Send + Sync {
    /// Registration identity; re-registering the same id replaces coverage.
    fn id(&self) -> ControllerId;
    fn line(&self) -> Line;
    /// Delivers one batch of per-block commands.
    async fn receive_train_commands(&self, frame: CommandFrame) -> Result<()>;
    /// Pushes CTC-known occupancy down to the controller.
    async fn set_occupied(&self, block: BlockId, state: bool) -> Result<()>;
}

/// One per-train command row before it is packed into a line frame.
#[derive(Debug, Clone)]
pub struct TrainCommand {
    pub train_id: TrainId,
    pub line: Line,
    pub block: BlockId,
    pub suggested_speed: SpeedClass,
    pub authority: u8,
    pub update_block_in_queue: bool,
    pub next_station: u16,
    pub blocks_away: u16,
}

/// CTC to wayside command frame: six equal-length arrays indexed by
/// position, `block_num[i]` naming the physical block entry `i` applies to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandFrame {
    pub suggested_speed: Vec<u8>,
    pub authority: Vec<u8>,
    pub block_num: Vec<BlockId>,
    pub update_block_in_queue: Vec<bool>,
    pub next_station: Vec<u16>,
    pub blocks_away: Vec<u16>,
}

impl CommandFrame {
    pub fn push(&mut self, command: &TrainCommand) {
        self.suggested_speed.push(command.suggested_speed.index());
        self.authority.push(command.authority);
        self.block_num.push(command.block);
        self.update_block_in_queue.push(command.update_block_in_queue);
        self.next_station.push(command.next_station);
        self.blocks_away.push(command.blocks_away);
    }

    pub fn len(&self) -> usize {
        self.block_num.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_num.is_empty()
    }
}

/// Occupancy report from a wayside controller.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyUpdate {
    pub line: Line,
    pub block: BlockId,
    pub occupied: bool,
    pub train_id: Option<TrainId>,
}

/// Operator request queued for the CTC to act on at its next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    CloseBlock { line: Line, block: BlockId },
    OpenBlock { line: Line, block: BlockId },
    EmergencyStop { train_id: TrainId },
}

/// Operator-visible outcome surfaced on the response queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

/// Registers wayside controllers by block coverage, fans CTC commands out to
/// them and filters their occupancy reports by authorization.
///
/// The handler is the only inter-subsystem channel: within a tick its calls
/// are ordered CTC -> waysides -> (PLC) -> waysides -> CTC.
pub struct CommunicationHandler {
    blocks: Arc<BlockRegistry>,
    controllers: Mutex<HashMap<Line, Arc<dyn WaysideControl>>>,
    controller_block_mapping: Mutex<HashMap<ControllerId, Vec<(Line, BlockId)>>>,
    command_queue: Mutex<VecDeque<OperatorCommand>>,
    response_queue: Mutex<VecDeque<CommandResponse>>,
    occupancy_tx: UnboundedSender<OccupancyUpdate>,
    switch_positions: Mutex<HashMap<Line, Vec<bool>>>,
    railway_crossings: Mutex<HashMap<Line, Vec<bool>>>,
}

impl CommunicationHandler {
    /// Returns the handler and the receiving end of the occupancy queue the
    /// CTC drains each tick. Updates arrive in producer order per wayside.
    pub fn new(blocks: Arc<BlockRegistry>) -> (Arc<Self>, UnboundedReceiver<OccupancyUpdate>) {
        let (occupancy_tx, occupancy_rx) = unbounded_channel();
        (
            Arc::new(CommunicationHandler {
                blocks,
                controllers: Mutex::new(HashMap::new()),
                controller_block_mapping: Mutex::new(HashMap::new()),
                command_queue: Mutex::new(VecDeque::new()),
                response_queue: Mutex::new(VecDeque::new()),
                occupancy_tx,
                switch_positions: Mutex::new(HashMap::new()),
                railway_crossings: Mutex::new(HashMap::new()),
            }),
            occupancy_rx,
        )
    }

    /// Registers a controller for the blocks it covers. Registering the same
    /// controller again replaces its coverage.
    pub async fn provide_wayside_controller(
        &self,
        controller: Arc<dyn WaysideControl>,
        blocks_covered: Vec<(Line, BlockId)>,
    ) -> bool {
        if blocks_covered.is_empty() {
            warn!("rejected wayside registration with empty coverage");
            return false;
        }
        let line = controller.line();
        let id = controller.id();
        self.controllers.lock().await.insert(line, controller);
        self.controller_block_mapping
            .lock()
            .await
            .insert(id, blocks_covered);
        debug!(%line, controller = id, "wayside controller registered");
        true
    }

    pub async fn controller_for(&self, line: Line) -> Option<Arc<dyn WaysideControl>> {
        self.controllers.lock().await.get(&line).cloned()
    }

    /// Groups commands by line and delivers each batch to the registered
    /// controller. A missing controller or a controller error fails the
    /// whole call; the failure lands on the response queue, never unwinds.
    pub async fn send_train_commands(&self, commands: &[TrainCommand]) -> bool {
        let mut frames: Vec<(Line, CommandFrame)> = Vec::new();
        for command in commands {
            match frames.iter_mut().find(|(line, _)| *line == command.line) {
                Some((_, frame)) => frame.push(command),
                None => {
                    let mut frame = CommandFrame::default();
                    frame.push(command);
                    frames.push((command.line, frame));
                }
            }
        }

        for (line, frame) in frames {
            let Some(controller) = self.controller_for(line).await else {
                warn!(%line, "no wayside controller registered");
                self.push_response(false, format!("no controller for the {line} line"))
                    .await;
                return false;
            };
            if let Err(err) = controller.receive_train_commands(frame).await {
                warn!(%line, %err, "wayside rejected command batch");
                self.push_response(false, ControlError::CommFault(err.to_string()).to_string())
                    .await;
                return false;
            }
        }
        true
    }

    /// Pushes CTC-known occupancy to the controller of `line`.
    pub async fn set_occupied(&self, line: Line, block: BlockId, state: bool) -> bool {
        let Some(controller) = self.controller_for(line).await else {
            return false;
        };
        match controller.set_occupied(block, state).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%line, block, %err, "set_occupied failed");
                false
            }
        }
    }

    /// Accepts occupancy reports from `from`, dropping entries outside its
    /// registered coverage. Survivors are forwarded to the CTC in order.
    /// Returns true only when every entry was authorized.
    pub async fn update_occupied_blocks(
        &self,
        updates: Vec<OccupancyUpdate>,
        from: ControllerId,
    ) -> bool {
        let mapping = self.controller_block_mapping.lock().await;
        let Some(covered) = mapping.get(&from) else {
            warn!(controller = from, "occupancy report from unregistered controller");
            return false;
        };
        let mut all_authorized = true;
        for update in updates {
            if covered.contains(&(update.line, update.block)) {
                let _ = self.occupancy_tx.send(update);
            } else {
                all_authorized = false;
                let err = ControlError::UnauthorizedSender {
                    controller: from,
                    line: update.line,
                    block: update.block,
                };
                warn!(%err, "dropped occupancy entry");
            }
        }
        all_authorized
    }

    /// Stores the switch snapshot of an authorized sender for displays.
    pub async fn update_switch_positions(
        &self,
        line: Line,
        positions: Vec<bool>,
        from: ControllerId,
    ) -> bool {
        if !self.sender_covers_line(from, line).await {
            return false;
        }
        self.switch_positions.lock().await.insert(line, positions);
        true
    }

    /// Stores the crossing snapshot of an authorized sender for displays.
    pub async fn update_railway_crossings(
        &self,
        line: Line,
        crossings: Vec<bool>,
        from: ControllerId,
    ) -> bool {
        if !self.sender_covers_line(from, line).await {
            return false;
        }
        self.railway_crossings.lock().await.insert(line, crossings);
        true
    }

    pub async fn switch_positions(&self, line: Line) -> Option<Vec<bool>> {
        self.switch_positions.lock().await.get(&line).cloned()
    }

    pub async fn railway_crossings(&self, line: Line) -> Option<Vec<bool>> {
        self.railway_crossings.lock().await.get(&line).cloned()
    }

    async fn sender_covers_line(&self, from: ControllerId, line: Line) -> bool {
        self.controller_block_mapping
            .lock()
            .await
            .get(&from)
            .is_some_and(|covered| covered.iter().any(|(l, _)| *l == line))
    }

    /// The single authority/speed entry point used by the regular and the
    /// departure command builders, so both produce identical numbers.
    /// Lookahead comes from the route sequence after `block`.
    pub async fn calculate_authority_and_speed(
        &self,
        _train_id: &TrainId,
        line: Line,
        block: BlockId,
        route: Option<&Route>,
    ) -> Result<(u8, SpeedClass)> {
        let target = self
            .blocks
            .get(&(line, block))
            .ok_or_else(|| ControlError::NotFound(format!("block {block} on the {line} line")))?;

        let (next1_id, next2_id) = match route {
            Some(route) => {
                let sequence = route.block_sequence();
                match sequence.iter().position(|&b| b == block) {
                    Some(i) => (
                        sequence.get(i + 1).copied(),
                        sequence.get(i + 2).copied(),
                    ),
                    None => (None, None),
                }
            }
            None => (None, None),
        };

        let next1 = match next1_id {
            Some(id) => match self.blocks.get(&(line, id)) {
                Some(block) => Some(block.lock().await.clone()),
                None => None,
            },
            None => None,
        };
        let next2 = match next2_id {
            Some(id) => match self.blocks.get(&(line, id)) {
                Some(block) => Some(block.lock().await.clone()),
                None => None,
            },
            None => None,
        };

        let target = target.lock().await;
        Ok((
            target.calculate_safe_authority(),
            target.calculate_suggested_speed(next1.as_ref(), next2.as_ref()),
        ))
    }

    /// Builds and sends the departure batch for a freshly activated route:
    /// the first blocks of the sequence, numbers from the shared oracle.
    pub async fn send_departure_commands(
        &self,
        train_id: &TrainId,
        route: &Route,
        next_station: u16,
        blocks_away: u16,
    ) -> bool {
        let mut commands = Vec::new();
        for (offset, &block) in route.block_sequence().iter().take(4).enumerate() {
            let Ok((authority, speed)) = self
                .calculate_authority_and_speed(train_id, route.line, block, Some(route))
                .await
            else {
                return false;
            };
            commands.push(TrainCommand {
                train_id: train_id.clone(),
                line: route.line,
                block,
                suggested_speed: speed,
                authority,
                update_block_in_queue: offset == 0,
                next_station,
                blocks_away,
            });
        }
        self.send_train_commands(&commands).await
    }

    /// Queues an operator request; the CTC drains the queue every tick.
    pub async fn push_command(&self, command: OperatorCommand) {
        self.command_queue.lock().await.push_back(command);
    }

    pub async fn pop_command(&self) -> Option<OperatorCommand> {
        self.command_queue.lock().await.pop_front()
    }

    pub async fn push_response(&self, success: bool, message: String) {
        self.response_queue
            .lock()
            .await
            .push_back(CommandResponse { success, message });
    }

    pub async fn pop_response(&self) -> Option<CommandResponse> {
        self.response_queue.lock().await.pop_front()
    }
}
