/// Controller I/O records.
pub mod types;

use crate::control::rail_system::components::StationSide;
use crate::general::{meters_to_yards, Line};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};
use self::types::{
    BlockInfo, DriverInput, EngineerInput, OutputToDriver, TrainControllerInit, TrainModelInput,
    TrainModelOutput,
};

/// Traction power ceiling.
pub const MAX_POWER_KW: f64 = 120.0;
/// Negative speed error beyond which the auto service brake cuts in.
const SERVICE_BRAKE_DEADBAND_MPH: f64 = 2.0;
/// A train below this speed counts as stopped.
const STOP_EPS_MPH: f64 = 0.05;
/// Platform dwell before the stop is complete and doors close again.
const STATION_STOP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
enum StationStop {
    EnRoute,
    Dwelling { elapsed: Duration },
    Completed,
}

/// Closed-loop speed regulator for one train.
///
/// Runs a PI loop over the speed error with mode arbitration between the
/// driver and the CTC command chain, a latched emergency brake, and the
/// station-stop sequencing. Emits nothing but zero power until the engineer
/// has applied Kp/Ki.
pub struct TrainController {
    train_id: String,
    line: Line,
    kp: f64,
    ki: f64,
    kp_ki_set: bool,
    integral_error: f64,
    emergency_brake_latched: bool,
    prev_driver_emergency: bool,
    station_stop: StationStop,
    current_block: Option<BlockInfo>,
    block_queue: VecDeque<BlockInfo>,
    prev_next_block_entered: bool,
    /// Station number to display name and platform side.
    station_directory: HashMap<u16, (String, StationSide)>,
    last_input: TrainModelInput,
    last_driver: DriverInput,
    output: TrainModelOutput,
}

impl TrainController {
    pub fn new(train_id: &str, line: Line) -> TrainController {
        TrainController {
            train_id: train_id.to_owned(),
            line,
            kp: 0.0,
            ki: 0.0,
            kp_ki_set: false,
            integral_error: 0.0,
            emergency_brake_latched: false,
            prev_driver_emergency: false,
            station_stop: StationStop::EnRoute,
            current_block: None,
            block_queue: VecDeque::new(),
            prev_next_block_entered: false,
            station_directory: HashMap::new(),
            last_input: TrainModelInput::default(),
            last_driver: DriverInput::default(),
            output: TrainModelOutput {
                train_id: train_id.to_owned(),
                ..TrainModelOutput::default()
            },
        }
    }

    /// Seeds the controller with the spawn-time block window.
    pub fn from_init(init: &TrainControllerInit) -> TrainController {
        let mut controller = TrainController::new(&init.train_id, init.line);
        controller.current_block = Some(init.current_block.clone());
        controller.block_queue = init.next_four_blocks.iter().cloned().collect();
        controller.last_input.next_station_number = init.next_station_number;
        controller
    }

    pub fn with_station_directory(
        mut self,
        directory: HashMap<u16, (String, StationSide)>,
    ) -> TrainController {
        self.station_directory = directory;
        self
    }

    pub fn gains(&self) -> (f64, f64) {
        (self.kp, self.ki)
    }

    pub fn kp_ki_set(&self) -> bool {
        self.kp_ki_set
    }

    /// Applies the engineer's gains; the integral restarts from zero.
    pub fn update_from_engineer_input(&mut self, input: EngineerInput) {
        self.kp = input.kp;
        self.ki = input.ki;
        self.kp_ki_set = true;
        self.integral_error = 0.0;
        info!(train = %self.train_id, kp = input.kp, ki = input.ki, "gains applied");
    }

    /// Clears latches, the integral and the station sequence.
    pub fn reset(&mut self) {
        self.integral_error = 0.0;
        self.emergency_brake_latched = false;
        self.prev_driver_emergency = false;
        self.station_stop = StationStop::EnRoute;
        self.output.power_kw = 0.0;
        self.output.emergency_brake_status = false;
        self.output.service_brake_status = false;
        self.output.station_stop_complete = false;
    }

    pub fn current_block(&self) -> Option<&BlockInfo> {
        self.current_block.as_ref()
    }

    fn speed_limit_mph(&self) -> f64 {
        self.current_block
            .as_ref()
            .map_or(43.5, |block| block.speed_limit_mph)
    }

    /// Distance the train is still authorized to run, in yards: the current
    /// block plus the contiguous authorized prefix of the queue.
    fn remaining_authority_yd(&self) -> f64 {
        let mut meters = 0.0;
        match &self.current_block {
            Some(block) if block.authorized_to_go => meters += block.length_meters,
            Some(_) => return 0.0,
            None => return 0.0,
        }
        for block in &self.block_queue {
            if !block.authorized_to_go {
                break;
            }
            meters += block.length_meters;
        }
        meters_to_yards(meters)
    }

    fn ingest_block_info(&mut self, input: &TrainModelInput) {
        if input.add_new_block_info {
            let info = input.next_block_info;
            let known = self
                .block_queue
                .iter()
                .any(|b| b.block_number == info.block_number);
            if !known {
                self.block_queue.push_back(BlockInfo {
                    block_number: info.block_number,
                    length_meters: 100.0,
                    speed_limit_mph: self.speed_limit_mph(),
                    underground: false,
                    authorized_to_go: info.authorized,
                    commanded_speed: info.commanded_speed,
                });
            }
        }
        if input.update_next_block_info {
            let info = input.next_block_info;
            if let Some(block) = self
                .block_queue
                .iter_mut()
                .find(|b| b.block_number == info.block_number)
            {
                block.authorized_to_go = info.authorized;
                block.commanded_speed = info.commanded_speed;
            }
        }
        if input.next_block_entered != self.prev_next_block_entered {
            self.prev_next_block_entered = input.next_block_entered;
            if let Some(next) = self.block_queue.pop_front() {
                debug!(train = %self.train_id, block = next.block_number, "entered block");
                self.current_block = Some(next);
            }
        }
    }

    /// One control tick.
    pub fn update(&mut self, input: &TrainModelInput, driver: &DriverInput, dt: Duration) {
        self.ingest_block_info(input);

        let speed_limit = self.speed_limit_mph();
        let commanded_index = self
            .current_block
            .as_ref()
            .map_or(0, |block| block.commanded_speed.min(3));
        let auto_target = speed_limit * f64::from(commanded_index) / 3.0;
        let target = if driver.auto_mode {
            auto_target
        } else {
            driver.set_speed_mph.clamp(0.0, speed_limit)
        };
        let error = target - input.actual_speed_mph;
        let stopped = input.actual_speed_mph <= STOP_EPS_MPH;

        // emergency latch: driver button, passenger button, and in auto mode
        // the controller-detected conditions
        let detected = driver.auto_mode
            && (input.fault_status.any()
                || self.remaining_authority_yd() < input.authority_threshold_yd
                || auto_target > speed_limit + f64::EPSILON);
        if driver.emergency_brake || input.passenger_emergency_brake || detected {
            if !self.emergency_brake_latched {
                info!(train = %self.train_id, "emergency brake latched");
            }
            self.emergency_brake_latched = true;
        } else if self.emergency_brake_latched
            && self.prev_driver_emergency
            && !driver.emergency_brake
        {
            // explicit driver release with every condition already clear
            info!(train = %self.train_id, "emergency brake released");
            self.emergency_brake_latched = false;
        }
        self.prev_driver_emergency = driver.emergency_brake;

        let service_brake = if driver.auto_mode {
            error < -SERVICE_BRAKE_DEADBAND_MPH
        } else {
            driver.service_brake
        };
        let braking = self.emergency_brake_latched || service_brake;

        // PI loop; the integral holds (is not zeroed) while brakes are on
        let power_kw = if !self.kp_ki_set || braking {
            0.0
        } else {
            self.integral_error += error * dt.as_secs_f64();
            (self.kp * error + self.ki * self.integral_error).clamp(0.0, MAX_POWER_KW)
        };

        self.advance_station_stop(input, stopped, dt);

        let (station_name, station_side) = self
            .station_directory
            .get(&input.next_station_number)
            .cloned()
            .unwrap_or_else(|| (String::new(), StationSide::Right));

        // door commands: platform side while dwelling in auto, driver's
        // switches in manual; either way the interlock wins above walking
        // pace
        let dwelling = matches!(self.station_stop, StationStop::Dwelling { .. });
        let (mut door_left, mut door_right) = if driver.auto_mode {
            if dwelling {
                match station_side {
                    StationSide::Left => (true, false),
                    StationSide::Right => (false, true),
                    StationSide::Both => (true, true),
                }
            } else {
                (false, false)
            }
        } else {
            (driver.door_left_open, driver.door_right_open)
        };
        if !stopped {
            door_left = false;
            door_right = false;
        }

        let underground = self
            .current_block
            .as_ref()
            .is_some_and(|block| block.underground);

        self.output = TrainModelOutput {
            power_kw,
            emergency_brake_status: self.emergency_brake_latched,
            interior_lights_status: driver.interior_lights_on,
            headlights_status: driver.headlights_on || underground,
            door_left_status: door_left,
            door_right_status: door_right,
            service_brake_status: service_brake,
            set_cabin_temperature_f: driver.set_temperature_f,
            train_id: self.train_id.clone(),
            station_stop_complete: self.station_stop == StationStop::Completed,
            next_station_name: station_name,
            next_station_side: station_side,
            edge_of_current_block: input.next_block_entered,
        };
        self.last_input = input.clone();
        self.last_driver = driver.clone();
    }

    fn advance_station_stop(&mut self, input: &TrainModelInput, stopped: bool, dt: Duration) {
        let at_station = input.next_station_number != 0;
        let commanded_stop = self
            .current_block
            .as_ref()
            .is_some_and(|block| block.commanded_speed == 0);
        self.station_stop = match self.station_stop {
            StationStop::EnRoute => {
                if at_station && stopped && commanded_stop {
                    debug!(train = %self.train_id, "station stop timer started");
                    StationStop::Dwelling {
                        elapsed: Duration::ZERO,
                    }
                } else {
                    StationStop::EnRoute
                }
            }
            StationStop::Dwelling { elapsed } => {
                if !stopped {
                    StationStop::EnRoute
                } else if elapsed + dt >= STATION_STOP {
                    info!(train = %self.train_id, "station stop complete");
                    StationStop::Completed
                } else {
                    StationStop::Dwelling {
                        elapsed: elapsed + dt,
                    }
                }
            }
            StationStop::Completed => {
                if !stopped || !at_station {
                    StationStop::EnRoute
                } else {
                    StationStop::Completed
                }
            }
        };
    }

    pub fn get_output(&self) -> &TrainModelOutput {
        &self.output
    }

    pub fn line(&self) -> Line {
        self.line
    }

    pub fn train_id(&self) -> &str {
        &self.train_id
    }

    /// The composite record behind the driver display.
    pub fn get_output_to_driver(&self) -> OutputToDriver {
        let input_speed = if self.last_driver.auto_mode {
            let index = self
                .current_block
                .as_ref()
                .map_or(0, |block| block.commanded_speed.min(3));
            self.speed_limit_mph() * f64::from(index) / 3.0
        } else {
            self.last_driver.set_speed_mph
        };
        OutputToDriver {
            input_speed_mph: input_speed,
            actual_speed_mph: self.last_input.actual_speed_mph,
            speed_limit_mph: self.speed_limit_mph(),
            power_output_kw: self.output.power_kw,
            authority_yd: self.remaining_authority_yd(),
            current_cabin_temp_f: self.last_input.cabin_temperature_f,
            set_cabin_temp_f: self.last_driver.set_temperature_f,
            auto_mode: self.last_driver.auto_mode,
            emergency_brake_active: self.emergency_brake_latched,
            service_brake_active: self.output.service_brake_status,
            headlights_on: self.output.headlights_status,
            interior_lights_on: self.output.interior_lights_status,
            left_door_open: self.output.door_left_status,
            right_door_open: self.output.door_right_status,
            next_station: self.output.next_station_name.clone(),
            station_side: self.output.next_station_side,
            engine_failure: self.last_input.fault_status.engine,
            signal_failure: self.last_input.fault_status.signal,
            brake_failure: self.last_input.fault_status.brake,
            kp: self.kp,
            ki: self.ki,
            kp_ki_set: self.kp_ki_set,
        }
    }
}
