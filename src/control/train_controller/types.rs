use crate::control::rail_system::components::StationSide;
use crate::general::{BlockId, Line};

/// Fault flags reported by the train model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStatus {
    pub signal: bool,
    pub brake: bool,
    pub engine: bool,
}

impl FaultStatus {
    pub fn any(&self) -> bool {
        self.signal || self.brake || self.engine
    }
}

/// Authorization and speed command for the block ahead.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NextBlockInfo {
    pub block_number: BlockId,
    /// Commanded speed index 0-3.
    pub commanded_speed: u8,
    pub authorized: bool,
}

/// Everything the train model reports into the controller each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainModelInput {
    pub fault_status: FaultStatus,
    pub actual_speed_mph: f64,
    pub passenger_emergency_brake: bool,
    pub cabin_temperature_f: f64,
    pub next_station_number: u16,
    /// Remaining-authority distance below which braking must begin.
    pub authority_threshold_yd: f64,
    pub add_new_block_info: bool,
    pub next_block_info: NextBlockInfo,
    /// Toggles each time the train crosses into the next block.
    pub next_block_entered: bool,
    pub update_next_block_info: bool,
}

impl Default for TrainModelInput {
    fn default() -> TrainModelInput {
        TrainModelInput {
            fault_status: FaultStatus::default(),
            actual_speed_mph: 0.0,
            passenger_emergency_brake: false,
            cabin_temperature_f: 72.0,
            next_station_number: 0,
            authority_threshold_yd: 50.0,
            add_new_block_info: false,
            next_block_info: NextBlockInfo::default(),
            next_block_entered: false,
            update_next_block_info: false,
        }
    }
}

/// Everything the controller commands back to the train model.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainModelOutput {
    pub power_kw: f64,
    pub emergency_brake_status: bool,
    pub interior_lights_status: bool,
    pub headlights_status: bool,
    pub door_left_status: bool,
    pub door_right_status: bool,
    pub service_brake_status: bool,
    pub set_cabin_temperature_f: f64,
    pub train_id: String,
    pub station_stop_complete: bool,
    pub next_station_name: String,
    pub next_station_side: StationSide,
    pub edge_of_current_block: bool,
}

impl Default for TrainModelOutput {
    fn default() -> TrainModelOutput {
        TrainModelOutput {
            power_kw: 0.0,
            emergency_brake_status: false,
            interior_lights_status: false,
            headlights_status: false,
            door_left_status: false,
            door_right_status: false,
            service_brake_status: false,
            set_cabin_temperature_f: 72.0,
            train_id: String::new(),
            station_stop_complete: false,
            next_station_name: String::new(),
            next_station_side: StationSide::Right,
            edge_of_current_block: false,
        }
    }
}

/// Manual and automatic driver controls.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverInput {
    pub auto_mode: bool,
    pub headlights_on: bool,
    pub interior_lights_on: bool,
    pub door_left_open: bool,
    pub door_right_open: bool,
    pub set_temperature_f: f64,
    pub emergency_brake: bool,
    /// Target speed while in manual mode.
    pub set_speed_mph: f64,
    pub service_brake: bool,
    pub train_id: String,
}

impl Default for DriverInput {
    fn default() -> DriverInput {
        DriverInput {
            auto_mode: true,
            headlights_on: false,
            interior_lights_on: false,
            door_left_open: false,
            door_right_open: false,
            set_temperature_f: 72.0,
            emergency_brake: false,
            set_speed_mph: 0.0,
            service_brake: false,
            train_id: String::new(),
        }
    }
}

/// Gains the engineer applies before the train may draw power.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineerInput {
    pub kp: f64,
    pub ki: f64,
}

/// Static data for one track block as the controller sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub block_number: BlockId,
    pub length_meters: f64,
    pub speed_limit_mph: f64,
    pub underground: bool,
    pub authorized_to_go: bool,
    /// Commanded speed index 0-3.
    pub commanded_speed: u8,
}

/// Initialization record handed to a controller at spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainControllerInit {
    pub line: Line,
    pub current_block: BlockInfo,
    pub next_four_blocks: Vec<BlockInfo>,
    pub train_id: String,
    pub next_station_number: u16,
}

/// The composite record behind the driver display.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputToDriver {
    pub input_speed_mph: f64,
    pub actual_speed_mph: f64,
    pub speed_limit_mph: f64,
    pub power_output_kw: f64,
    pub authority_yd: f64,
    pub current_cabin_temp_f: f64,
    pub set_cabin_temp_f: f64,
    pub auto_mode: bool,
    pub emergency_brake_active: bool,
    pub service_brake_active: bool,
    pub headlights_on: bool,
    pub interior_lights_on: bool,
    pub left_door_open: bool,
    pub right_door_open: bool,
    pub next_station: String,
    pub station_side: StationSide,
    pub engine_failure: bool,
    pub signal_failure: bool,
    pub brake_failure: bool,
    pub kp: f64,
    pub ki: f64,
    /// False until the engineer applies gains; the display shows
    /// "Waiting for Kp/Ki" while unset.
    pub kp_ki_set: bool,
}
