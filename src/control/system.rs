use crate::control::clock::{SimulationClock, Tick};
use crate::control::config::SystemConfig;
use crate::control::ctc::comm::{CommunicationHandler, WaysideControl};
use crate::control::ctc::CtcSystem;
use crate::control::error::Result;
use crate::control::rail_system::components::StationSide;
use crate::control::rail_system::layout::standard_network;
use crate::control::train_controller::types::{DriverInput, TrainControllerInit, TrainModelInput};
use crate::control::train_controller::TrainController;
use crate::control::wayside::{line_programs, WaysideController};
use crate::general::Line;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Simulated budget one subsystem gets per tick; overruns are logged only.
const TICK_BUDGET: Duration = Duration::from_millis(50);

/// The assembled control fabric: one clock, one CTC, one wayside controller
/// per line, and the train controllers the dispatcher has spawned.
///
/// Per tick the order is fixed: the CTC runs first, then every wayside runs
/// its two 50 ms cycles, then the train controllers. The communication
/// handler is the only channel between them, so occupancy a wayside reports
/// in tick `n` reaches the CTC registries at the start of tick `n + 1` and
/// no subsystem ever observes another mid-tick.
pub struct TrafficControlSystem {
    clock: Arc<SimulationClock>,
    ctc: CtcSystem,
    waysides: Vec<Arc<WaysideController>>,
    train_controllers: Vec<TrainController>,
}

impl TrafficControlSystem {
    /// Builds the system for `config`: built-in layouts, one wayside per
    /// line running that line's PLC programs, everything registered with
    /// the communication handler.
    pub async fn build(config: &SystemConfig) -> Result<TrafficControlSystem> {
        let clock = SimulationClock::new(&config.start_of_day)?;
        clock.set_multiplier(config.time_multiplier).await;

        let (track, registry) = standard_network(&config.lines);
        let track = Arc::new(track);
        let blocks = Arc::new(registry);
        let (comm, occupancy_rx) = CommunicationHandler::new(blocks.clone());

        let mut waysides = Vec::new();
        for (index, &line) in config.lines.iter().enumerate() {
            let total = track.total_blocks(line);
            let covered: Vec<usize> = (0..total).collect();
            let controller = WaysideController::new(
                index as u32 + 1,
                line,
                index as u8 + 1,
                total,
                &covered,
                line_programs(line),
            );
            comm.provide_wayside_controller(controller.clone(), controller.covered_blocks())
                .await;
            waysides.push(controller);
        }

        let ctc = CtcSystem::new(clock.clone(), track, blocks, comm, occupancy_rx);
        info!(lines = config.lines.len(), "traffic control system assembled");
        Ok(TrafficControlSystem {
            clock,
            ctc,
            waysides,
            train_controllers: Vec::new(),
        })
    }

    pub fn clock(&self) -> &Arc<SimulationClock> {
        &self.clock
    }

    pub fn ctc(&self) -> &CtcSystem {
        &self.ctc
    }

    pub fn ctc_mut(&mut self) -> &mut CtcSystem {
        &mut self.ctc
    }

    pub fn wayside(&self, line: Line) -> Option<&Arc<WaysideController>> {
        self.waysides.iter().find(|w| w.line() == line)
    }

    pub fn train_controllers(&mut self) -> &mut [TrainController] {
        &mut self.train_controllers
    }

    /// Station number to name/side mapping of a line, for controller spawns.
    pub async fn station_directory(&self, line: Line) -> HashMap<u16, (String, StationSide)> {
        let mut directory = HashMap::new();
        for ((l, _), block) in self.ctc.blocks().iter() {
            if *l != line {
                continue;
            }
            let block = block.lock().await;
            if let Some(station) = &block.station {
                directory.insert(station.number, (station.name.clone(), station.side));
            }
        }
        directory
    }

    /// Spawns an on-board controller owned by this dispatcher. Returns its
    /// index for later feeds.
    pub async fn spawn_train_controller(&mut self, init: &TrainControllerInit) -> usize {
        let directory = self.station_directory(init.line).await;
        self.train_controllers
            .push(TrainController::from_init(init).with_station_directory(directory));
        self.train_controllers.len() - 1
    }

    /// One full system tick. `feeds` pairs train-model and driver inputs
    /// with spawned controllers by index; missing feeds skip the controller.
    pub async fn run_tick(&mut self, tick: &Tick, feeds: &[(TrainModelInput, DriverInput)]) {
        let started = Instant::now();
        self.ctc.system_tick(tick.now).await;

        for wayside in &self.waysides {
            // two 50 ms cycles inside the 100 ms tick
            wayside.update_cycle(self.ctc.comm()).await;
            wayside.update_cycle(self.ctc.comm()).await;
        }

        for (controller, (input, driver)) in self.train_controllers.iter_mut().zip(feeds) {
            controller.update(input, driver, TICK_BUDGET + TICK_BUDGET);
        }

        let elapsed = started.elapsed();
        if elapsed > TICK_BUDGET {
            warn!(?elapsed, "tick overran its budget");
        }
    }

    /// Drives ticks from the clock until it stops. Embedding hosts that
    /// feed train controllers call [`TrafficControlSystem::run_tick`]
    /// themselves instead.
    pub async fn run(&mut self) {
        let mut ticks = self.clock.subscribe();
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Ok(tick) => self.run_tick(&tick, &[]).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "tick loop lagged, catching up");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    if !self.clock.is_running().await {
                        break;
                    }
                }
            }
        }
        info!("tick loop drained, system stopped");
    }
}
