/// Green line PLC programs.
pub mod green;
/// The PLC contract and hazard-propagation helpers.
pub mod plc;
/// Red line PLC programs.
pub mod red;

use crate::control::ctc::comm::{CommandFrame, CommunicationHandler, OccupancyUpdate, WaysideControl};
use crate::control::error::{ControlError, Result};
use crate::control::wayside::green::{GreenPlcPart1, GreenPlcPart2};
use crate::control::wayside::plc::{PlcIo, PlcRegistry};
use crate::control::wayside::red::{RedPlcPart1, RedPlcPart2};
use crate::general::{BlockId, ControllerId, Line};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use fixedbitset::FixedBitSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The PLC programs a line's controller runs, in scan order.
pub fn line_programs(line: Line) -> PlcRegistry {
    let mut registry = PlcRegistry::new();
    match line {
        Line::Green => {
            registry.register(Box::new(GreenPlcPart1));
            registry.register(Box::new(GreenPlcPart2));
        }
        Line::Red => {
            registry.register(Box::new(RedPlcPart1));
            registry.register(Box::new(RedPlcPart2));
        }
    }
    registry
}

/// Per-cycle command set pushed down to the physical track model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackCommands {
    pub commanded_speeds: Vec<u8>,
    pub authorities: Vec<bool>,
    pub switch_positions: Vec<bool>,
    pub traffic_lights: Vec<bool>,
    pub railroad_crossings: Vec<bool>,
    pub station_numbers: Vec<u16>,
    pub update_block_in_queue: Vec<bool>,
}

/// External track-model collaborator. Mocked in tests; the real model lives
/// outside this crate.
#[async_trait]
pub trait TrackModelLink: Send + Sync {
    async fn block_occupancy(&self) -> Vec<bool>;
    async fn switch_states(&self) -> Vec<bool>;
    async fn traffic_light_states(&self) -> Vec<bool>;
    async fn crossing_states(&self) -> Vec<bool>;
    async fn apply_commands(&self, commands: TrackCommands) -> Result<()>;
}

/// Packs one per-block track-side command word, MSB first:
/// `[authority:1][commandedSpeed:2][nextBlock:7][updatePrevious:1][nextStation:5]`.
///
/// ```
/// # use raildispatch::control::wayside::encode_block_command;
/// let word = encode_block_command(true, 2, 1, false, 19);
/// assert_eq!(word, 0b1_10_0000001_0_10011);
/// ```
pub fn encode_block_command(
    authority: bool,
    speed: u8,
    next_block: BlockId,
    update_previous: bool,
    next_station: u16,
) -> u16 {
    (u16::from(authority) << 15)
        | (u16::from(speed & 0b11) << 13)
        | (((next_block as u16) & 0x7F) << 6)
        | (u16::from(update_previous) << 5)
        | (next_station & 0x1F)
}

#[derive(Debug)]
struct WaysideState {
    // CTC inputs, kept apart from the working arrays between cycles
    ctc_suggested_speeds: Vec<u8>,
    ctc_authorities: Vec<bool>,
    ctc_update_queue: Vec<bool>,
    ctc_station_numbers: Vec<u16>,
    ctc_block_numbers: Vec<BlockId>,
    ctc_occupied: Vec<bool>,

    // working arrays the PLC programs transform
    speed: Vec<u8>,
    authorities: Vec<bool>,
    station_numbers: Vec<u16>,
    update_queue: Vec<bool>,
    block_numbers: Vec<BlockId>,
    block_occupancy: FixedBitSet,
    switch_positions: Vec<bool>,
    traffic_lights: Vec<bool>,
    railroad_crossings: Vec<bool>,

    operational: bool,
    plc_faults: u64,
}

impl WaysideState {
    fn new(total_blocks: usize) -> WaysideState {
        WaysideState {
            ctc_suggested_speeds: vec![0; total_blocks],
            ctc_authorities: vec![false; total_blocks],
            ctc_update_queue: vec![false; total_blocks],
            ctc_station_numbers: vec![0; total_blocks],
            ctc_block_numbers: (0..total_blocks).collect(),
            ctc_occupied: vec![false; total_blocks],
            speed: vec![0; total_blocks],
            authorities: vec![false; total_blocks],
            station_numbers: vec![0; total_blocks],
            update_queue: vec![false; total_blocks],
            block_numbers: (0..total_blocks).collect(),
            block_occupancy: FixedBitSet::with_capacity(total_blocks),
            switch_positions: vec![false; total_blocks],
            traffic_lights: vec![false; total_blocks],
            railroad_crossings: vec![false; total_blocks],
            operational: true,
            plc_faults: 0,
        }
    }

    fn set_occupancy(&mut self, occupancy: &[bool]) {
        self.block_occupancy.clear();
        for (i, &occupied) in occupancy.iter().enumerate().take(self.block_occupancy.len()) {
            self.block_occupancy.set(i, occupied);
        }
    }

    fn occupancy_vec(&self) -> Vec<bool> {
        (0..self.block_occupancy.len())
            .map(|i| self.block_occupancy.contains(i))
            .collect()
    }
}

/// Debug snapshot of a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct WaysideStatus {
    pub controller_id: ControllerId,
    pub line: Line,
    pub plc_num: u8,
    pub operational: bool,
    pub plc_modules: usize,
    pub plc_faults: u64,
    pub blocks_managed: usize,
    pub occupied_blocks: usize,
    pub track_model_connected: bool,
}

/// One per-line safety interlock.
///
/// Every 50 ms of simulated time the controller copies the latest CTC
/// suggestions into its working arrays, snapshots occupancy, runs its PLC
/// programs and reports back. A failing program never aborts the others;
/// its partial writes are discarded and the previous outputs stand.
pub struct WaysideController {
    id: ControllerId,
    line: Line,
    plc_num: u8,
    total_blocks: usize,
    blocks_covered: FixedBitSet,
    plcs: PlcRegistry,
    track_link: Mutex<Option<Arc<dyn TrackModelLink>>>,
    state: Mutex<WaysideState>,
}

impl WaysideController {
    pub fn new(
        id: ControllerId,
        line: Line,
        plc_num: u8,
        total_blocks: usize,
        blocks_covered: &[BlockId],
        plcs: PlcRegistry,
    ) -> Arc<WaysideController> {
        let mut covered = FixedBitSet::with_capacity(total_blocks);
        for &block in blocks_covered {
            if block < total_blocks {
                covered.insert(block);
            }
        }
        Arc::new(WaysideController {
            id,
            line,
            plc_num,
            total_blocks,
            blocks_covered: covered,
            plcs,
            track_link: Mutex::new(None),
            state: Mutex::new(WaysideState::new(total_blocks)),
        })
    }

    /// Coverage pairs for registration with the communication handler.
    pub fn covered_blocks(&self) -> Vec<(Line, BlockId)> {
        self.blocks_covered
            .ones()
            .map(|block| (self.line, block))
            .collect()
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub async fn set_track_model_link(&self, link: Arc<dyn TrackModelLink>) {
        *self.track_link.lock().await = Some(link);
    }

    pub async fn set_operational(&self, operational: bool) {
        self.state.lock().await.operational = operational;
    }

    pub async fn status(&self) -> WaysideStatus {
        // same lock order as update_cycle: track link, then state
        let track_model_connected = self.track_link.lock().await.is_some();
        let state = self.state.lock().await;
        WaysideStatus {
            controller_id: self.id,
            line: self.line,
            plc_num: self.plc_num,
            operational: state.operational,
            plc_modules: self.plcs.len(),
            plc_faults: state.plc_faults,
            blocks_managed: self.blocks_covered.count_ones(..),
            occupied_blocks: state.block_occupancy.count_ones(..),
            track_model_connected,
        }
    }

    /// One 50 ms cycle: CTC inputs, occupancy snapshot, PLC scans, track
    /// model push, CTC report.
    pub async fn update_cycle(&self, comm: &CommunicationHandler) {
        let link = self.track_link.lock().await.clone();
        let (updates, switches, crossings) = {
            let mut state = self.state.lock().await;
            if !state.operational {
                return;
            }
            self.process_ctc_commands(&mut state);
            self.receive_from_track_model(&mut state, link.as_deref()).await;
            self.run_plc_programs(&mut state);
            self.send_commands_to_track_model(&state, link.as_deref()).await;

            let updates: Vec<OccupancyUpdate> = self
                .blocks_covered
                .ones()
                .map(|block| OccupancyUpdate {
                    line: self.line,
                    block,
                    occupied: state.block_occupancy.contains(block),
                    train_id: None,
                })
                .collect();
            (
                updates,
                state.switch_positions.clone(),
                state.railroad_crossings.clone(),
            )
        };

        comm.update_occupied_blocks(updates, self.id).await;
        comm.update_switch_positions(self.line, switches, self.id).await;
        comm.update_railway_crossings(self.line, crossings, self.id).await;
    }

    /// Copies the stored CTC inputs into the working arrays.
    fn process_ctc_commands(&self, state: &mut WaysideState) {
        state.speed = state.ctc_suggested_speeds.clone();
        state.authorities = state.ctc_authorities.clone();
        state.update_queue = state.ctc_update_queue.clone();
        state.station_numbers = state.ctc_station_numbers.clone();
        state.block_numbers = state.ctc_block_numbers.clone();
    }

    /// Snapshots the field state. Without a track model the CTC-known
    /// occupancy stands in, which closes the loop in pure-dispatch setups.
    async fn receive_from_track_model(
        &self,
        state: &mut WaysideState,
        link: Option<&dyn TrackModelLink>,
    ) {
        match link {
            Some(link) => {
                let occupancy = link.block_occupancy().await;
                state.set_occupancy(&occupancy);
                state.switch_positions = link.switch_states().await;
                state.traffic_lights = link.traffic_light_states().await;
                state.railroad_crossings = link.crossing_states().await;
                for array in [
                    &mut state.switch_positions,
                    &mut state.traffic_lights,
                    &mut state.railroad_crossings,
                ] {
                    array.resize(self.total_blocks, false);
                }
            }
            None => {
                let occupancy = state.ctc_occupied.clone();
                state.set_occupancy(&occupancy);
            }
        }
    }

    /// Runs every program against scratch copies; only a clean scan commits.
    fn run_plc_programs(&self, state: &mut WaysideState) {
        let occupancy = state.occupancy_vec();
        for program in self.plcs.programs() {
            let mut speed = state.speed.clone();
            let mut authorities = state.authorities.clone();
            let mut switches = state.switch_positions.clone();
            let mut lights = state.traffic_lights.clone();
            let mut crossings = state.railroad_crossings.clone();
            let block_numbers = state.block_numbers.clone();
            let mut io = PlcIo {
                block_occupancy: &occupancy,
                speed: &mut speed,
                authority: &mut authorities,
                switches: &mut switches,
                traffic_lights: &mut lights,
                crossings: &mut crossings,
                block_numbers: &block_numbers,
            };
            match program.scan(&mut io) {
                Ok(()) => {
                    state.speed = speed;
                    state.authorities = authorities;
                    state.switch_positions = switches;
                    state.traffic_lights = lights;
                    state.railroad_crossings = crossings;
                }
                Err(err) => {
                    state.plc_faults += 1;
                    warn!(
                        controller = self.id,
                        program = program.name(),
                        %err,
                        "plc fault, keeping previous outputs"
                    );
                }
            }
        }
    }

    async fn send_commands_to_track_model(
        &self,
        state: &WaysideState,
        link: Option<&dyn TrackModelLink>,
    ) {
        let Some(link) = link else {
            return;
        };
        let commands = TrackCommands {
            commanded_speeds: state.speed.clone(),
            authorities: state.authorities.clone(),
            switch_positions: state.switch_positions.clone(),
            traffic_lights: state.traffic_lights.clone(),
            railroad_crossings: state.railroad_crossings.clone(),
            station_numbers: state.station_numbers.clone(),
            update_block_in_queue: state.update_queue.clone(),
        };
        if let Err(err) = link.apply_commands(commands).await {
            warn!(controller = self.id, %err, "track model rejected commands");
        }
    }

    /// The track-side output words for every covered block, big-endian.
    pub async fn output_frame(&self) -> Bytes {
        let state = self.state.lock().await;
        let mut frame = BytesMut::with_capacity(2 * self.blocks_covered.count_ones(..));
        for block in self.blocks_covered.ones() {
            let next_block = if block + 1 < self.total_blocks { block + 1 } else { 0 };
            frame.put_u16(encode_block_command(
                state.authorities[block],
                state.speed[block],
                next_block,
                state.update_queue[block],
                state.station_numbers[block],
            ));
        }
        frame.freeze()
    }

    pub async fn commanded_speed(&self, block: BlockId) -> Option<u8> {
        self.state.lock().await.speed.get(block).copied()
    }

    pub async fn commanded_authority(&self, block: BlockId) -> Option<bool> {
        self.state.lock().await.authorities.get(block).copied()
    }

    pub async fn switch_position(&self, block: BlockId) -> Option<bool> {
        self.state.lock().await.switch_positions.get(block).copied()
    }

    pub async fn crossing_state(&self, block: BlockId) -> Option<bool> {
        self.state.lock().await.railroad_crossings.get(block).copied()
    }
}

#[async_trait]
impl WaysideControl for WaysideController {
    fn id(&self) -> ControllerId {
        self.id
    }

    fn line(&self) -> Line {
        self.line
    }

    /// Stores a CTC command frame, entry `i` applying to `block_num[i]`.
    async fn receive_train_commands(&self, frame: CommandFrame) -> Result<()> {
        let n = frame.len();
        if frame.suggested_speed.len() != n
            || frame.authority.len() != n
            || frame.update_block_in_queue.len() != n
            || frame.next_station.len() != n
            || frame.blocks_away.len() != n
        {
            return Err(ControlError::InvalidInput(
                "command frame arrays must have equal length".into(),
            ));
        }
        let mut state = self.state.lock().await;
        for i in 0..n {
            let block = frame.block_num[i];
            if block >= self.total_blocks {
                debug!(controller = self.id, block, "command for block out of range");
                continue;
            }
            state.ctc_suggested_speeds[block] = frame.suggested_speed[i];
            state.ctc_authorities[block] = frame.authority[i] != 0;
            state.ctc_update_queue[block] = frame.update_block_in_queue[i];
            state.ctc_station_numbers[block] = frame.next_station[i];
        }
        Ok(())
    }

    async fn set_occupied(&self, block: BlockId, occupied: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.ctc_occupied.get_mut(block).ok_or_else(|| {
            ControlError::NotFound(format!("block {block} on controller {}", self.id))
        })?;
        *slot = occupied;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ctc::comm::TrainCommand;
    use crate::control::rail_system::components::{Block, SpeedClass};
    use crate::control::rail_system::track::Builder;
    use crate::control::wayside::green::GREEN_BLOCKS;

    fn handler() -> (
        Arc<CommunicationHandler>,
        tokio::sync::mpsc::UnboundedReceiver<OccupancyUpdate>,
    ) {
        let mut builder = Builder::new();
        for id in 1..=20 {
            builder.add_block(Block::new(Line::Green, id));
        }
        builder.connect_run(Line::Green, &(1..=20).collect::<Vec<_>>());
        let (_, registry) = builder.build();
        CommunicationHandler::new(Arc::new(registry))
    }

    fn green_controller() -> Arc<WaysideController> {
        let covered: Vec<BlockId> = (0..GREEN_BLOCKS).collect();
        WaysideController::new(
            1,
            Line::Green,
            1,
            GREEN_BLOCKS,
            &covered,
            line_programs(Line::Green),
        )
    }

    #[tokio::test]
    async fn command_frames_map_by_block_number() {
        let controller = green_controller();
        let mut frame = CommandFrame::default();
        frame.push(&TrainCommand {
            train_id: "G001".parse().unwrap(),
            line: Line::Green,
            block: 13,
            suggested_speed: SpeedClass::TwoThirds,
            authority: 1,
            update_block_in_queue: true,
            next_station: 2,
            blocks_away: 1,
        });
        controller.receive_train_commands(frame).await.unwrap();

        let state = controller.state.lock().await;
        assert_eq!(state.ctc_suggested_speeds[13], 2);
        assert!(state.ctc_authorities[13]);
        assert!(state.ctc_update_queue[13]);
        assert_eq!(state.ctc_station_numbers[13], 2);
        assert_eq!(state.ctc_suggested_speeds[12], 0, "other blocks untouched");
    }

    #[tokio::test]
    async fn ragged_frames_are_rejected() {
        let controller = green_controller();
        let frame = CommandFrame {
            suggested_speed: vec![1],
            authority: vec![],
            block_num: vec![5],
            update_block_in_queue: vec![false],
            next_station: vec![0],
            blocks_away: vec![0],
        };
        assert!(controller.receive_train_commands(frame).await.is_err());
    }

    #[tokio::test]
    async fn cycle_applies_plc_over_ctc_suggestions() {
        let (comm, mut rx) = handler();
        let controller = green_controller();
        comm.provide_wayside_controller(controller.clone(), controller.covered_blocks())
            .await;

        // CTC suggests full speed on 16..=20, a train sits on 20
        let mut frame = CommandFrame::default();
        for block in 16..=20 {
            frame.push(&TrainCommand {
                train_id: "G001".parse().unwrap(),
                line: Line::Green,
                block,
                suggested_speed: SpeedClass::Full,
                authority: 1,
                update_block_in_queue: false,
                next_station: 0,
                blocks_away: 0,
            });
        }
        controller.receive_train_commands(frame).await.unwrap();
        controller.set_occupied(20, true).await.unwrap();

        controller.update_cycle(&comm).await;

        // the trailing-4 rule must have zeroed 16..=19
        for block in 16..=19 {
            assert_eq!(controller.commanded_speed(block).await, Some(0));
            assert_eq!(controller.commanded_authority(block).await, Some(false));
        }
        assert_eq!(controller.commanded_speed(20).await, Some(3));
        // block 20 sits one past the crossing window, the barrier stays up
        assert_eq!(controller.crossing_state(19).await, Some(false));

        // occupancy reached the CTC queue in order
        let mut reported = Vec::new();
        while let Ok(update) = rx.try_recv() {
            reported.push(update);
        }
        assert!(reported.iter().any(|u| u.block == 20 && u.occupied));
        assert!(reported.iter().all(|u| u.line == Line::Green));
    }

    struct FaultyPlc;

    impl plc::PlcProgram for FaultyPlc {
        fn name(&self) -> &str {
            "faulty"
        }

        fn scan(&self, io: &mut PlcIo<'_>) -> Result<()> {
            // partial write that must never be visible
            io.speed[1] = 9;
            Err(ControlError::PlcFault {
                program: "faulty".into(),
                message: "scripted".into(),
            })
        }
    }

    struct ZeroingPlc;

    impl plc::PlcProgram for ZeroingPlc {
        fn name(&self) -> &str {
            "zeroing"
        }

        fn scan(&self, io: &mut PlcIo<'_>) -> Result<()> {
            io.speed[2] = 0;
            io.authority[2] = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_faulty_program_does_not_abort_the_rest() {
        let (comm, _rx) = handler();
        let mut plcs = PlcRegistry::new();
        plcs.register(Box::new(FaultyPlc));
        plcs.register(Box::new(ZeroingPlc));
        let controller = WaysideController::new(2, Line::Green, 1, 10, &[1, 2, 3], plcs);
        comm.provide_wayside_controller(controller.clone(), controller.covered_blocks())
            .await;

        let mut frame = CommandFrame::default();
        for block in 1..=3 {
            frame.push(&TrainCommand {
                train_id: "G001".parse().unwrap(),
                line: Line::Green,
                block,
                suggested_speed: SpeedClass::Full,
                authority: 1,
                update_block_in_queue: false,
                next_station: 0,
                blocks_away: 0,
            });
        }
        controller.receive_train_commands(frame).await.unwrap();
        controller.update_cycle(&comm).await;

        // the faulty program's write was discarded, the good one committed
        assert_eq!(controller.commanded_speed(1).await, Some(3));
        assert_eq!(controller.commanded_speed(2).await, Some(0));
        assert_eq!(controller.status().await.plc_faults, 1);
    }

    struct ScriptedTrack {
        occupancy: Vec<bool>,
        applied: Mutex<Vec<TrackCommands>>,
    }

    #[async_trait]
    impl TrackModelLink for ScriptedTrack {
        async fn block_occupancy(&self) -> Vec<bool> {
            self.occupancy.clone()
        }

        async fn switch_states(&self) -> Vec<bool> {
            vec![false; self.occupancy.len()]
        }

        async fn traffic_light_states(&self) -> Vec<bool> {
            vec![false; self.occupancy.len()]
        }

        async fn crossing_states(&self) -> Vec<bool> {
            vec![false; self.occupancy.len()]
        }

        async fn apply_commands(&self, commands: TrackCommands) -> Result<()> {
            self.applied.lock().await.push(commands);
            Ok(())
        }
    }

    #[tokio::test]
    async fn occupancy_comes_from_the_track_model_when_linked() {
        let (comm, mut rx) = handler();
        let controller = green_controller();
        comm.provide_wayside_controller(controller.clone(), controller.covered_blocks())
            .await;

        let mut occupancy = vec![false; GREEN_BLOCKS];
        occupancy[42] = true;
        let track = Arc::new(ScriptedTrack {
            occupancy,
            applied: Mutex::new(Vec::new()),
        });
        controller.set_track_model_link(track.clone()).await;
        controller.update_cycle(&comm).await;

        let mut reported = Vec::new();
        while let Ok(update) = rx.try_recv() {
            reported.push(update);
        }
        assert!(reported.iter().any(|u| u.block == 42 && u.occupied));
        assert_eq!(track.applied.lock().await.len(), 1, "commands were pushed");
    }

    #[tokio::test]
    async fn output_frame_is_bit_exact() {
        let controller = WaysideController::new(3, Line::Green, 1, 8, &[1], PlcRegistry::new());
        {
            let mut state = controller.state.lock().await;
            state.authorities[1] = true;
            state.speed[1] = 2;
            state.update_queue[1] = false;
            state.station_numbers[1] = 19;
        }
        let frame = controller.output_frame().await;
        assert_eq!(frame.len(), 2);
        let word = u16::from_be_bytes([frame[0], frame[1]]);
        assert_eq!(word, 0b1_10_0000010_0_10011);
    }

    #[test]
    fn encoding_layout() {
        assert_eq!(encode_block_command(false, 0, 0, false, 0), 0);
        assert_eq!(encode_block_command(true, 0, 0, false, 0), 0x8000);
        assert_eq!(encode_block_command(false, 3, 0, false, 0), 0x6000);
        assert_eq!(encode_block_command(false, 0, 127, false, 0), 0x1FC0);
        assert_eq!(encode_block_command(false, 0, 0, true, 0), 0x0020);
        assert_eq!(encode_block_command(false, 0, 0, false, 31), 0x001F);
    }
}
