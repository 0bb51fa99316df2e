//! Green line PLC programs.
//!
//! Two programs run back-to-back against the same arrays: part 1 owns
//! blocks 1-75 (yard switches, the block 19 crossing, sections A-M), part 2
//! owns blocks 76-150 and the N/O-P-Q junction complex around the 76 and 85
//! switches. Switch convention: `false` selects the normal leg, `true` the
//! alternate leg of the layout sheet.

use crate::control::error::{ControlError, Result};
use crate::control::wayside::plc::{
    apply_hazards, crossing_active, set_range, span_occupied, trailing_hazards, PlcIo, PlcProgram,
};

/// Array length every Green program expects: yard slot plus blocks 1-150.
pub const GREEN_BLOCKS: usize = 151;

/// Occupancy window that holds the block 19 crossing down.
pub const GREEN_CROSSING_WINDOW: std::ops::RangeInclusive<usize> = 16..=19;

fn check_length(io: &PlcIo<'_>, name: &str) -> Result<()> {
    let shortest = io
        .block_occupancy
        .len()
        .min(io.speed.len())
        .min(io.authority.len())
        .min(io.switches.len())
        .min(io.traffic_lights.len())
        .min(io.crossings.len());
    if shortest < GREEN_BLOCKS {
        return Err(ControlError::PlcFault {
            program: name.to_owned(),
            message: format!("arrays of {shortest} blocks, need {GREEN_BLOCKS}"),
        });
    }
    Ok(())
}

/// Blocks 1-75: yard operations, crossing, trailing hazards in A-M.
pub struct GreenPlcPart1;

impl PlcProgram for GreenPlcPart1 {
    fn name(&self) -> &str {
        "GreenLinePlc part 1"
    }

    fn scan(&self, io: &mut PlcIo<'_>) -> Result<()> {
        check_length(io, self.name())?;
        let mut hazard = vec![false; GREEN_BLOCKS];
        let occupancy = io.block_occupancy;

        let a_to_d = span_occupied(occupancy, 1..=36);
        let e_to_h = span_occupied(occupancy, 37..=57);

        // switch at 12: (12-13; 1-13), normal leg by default
        io.switches[12] = false;
        io.traffic_lights[12] = true;
        io.traffic_lights[13] = true;
        io.traffic_lights[1] = false;

        // switch at 29: (29-30; 29-150), normal leg by default
        io.switches[29] = false;
        io.traffic_lights[29] = true;
        io.traffic_lights[30] = true;
        io.traffic_lights[150] = false;

        // switch at 58, entry to the yard: closed while the yard is occupied
        let yard_free = !occupancy[0];
        io.switches[58] = yard_free;
        io.traffic_lights[58] = yard_free;

        // switch at 62, exit from the yard: held while the line is busy
        let line_clear = !(a_to_d || e_to_h);
        io.switches[62] = line_clear;
        io.traffic_lights[62] = line_clear;

        // trailing hazards per section group
        trailing_hazards(occupancy, &mut hazard, 1..=36);
        trailing_hazards(occupancy, &mut hazard, 37..=57);
        trailing_hazards(occupancy, &mut hazard, 58..=75);

        // hold departures at the yard while the line is busy
        hazard[0] = !line_clear;

        io.crossings[19] = crossing_active(occupancy, GREEN_CROSSING_WINDOW);

        apply_hazards(&hazard, io);
        Ok(())
    }
}

/// Composite state of the 76/85 switch pair and its adjacent sections.
/// Recomputed from raw occupancy on every scan; a single-tick occupancy
/// glitch flips it for that one scan.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JunctionState {
    /// Neither N nor O-P-Q occupied: both switches on their normal legs.
    Idle,
    /// A train inside N with block 100 still occupied: 76 diverted, M held.
    InN,
    /// A train inside N, block 100 clear: exit path 85-100 set, M and Q held.
    InNExit,
    /// O-P-Q occupied: exit path kept, M held.
    InOpq,
}

impl JunctionState {
    pub fn derive(occupancy: &[bool]) -> JunctionState {
        let n = span_occupied(occupancy, 77..=85);
        let opq_interior = span_occupied(occupancy, 86..=99);
        let block_100 = occupancy.get(100).copied().unwrap_or(false);
        if opq_interior || (!n && block_100) {
            JunctionState::InOpq
        } else if n && !block_100 {
            JunctionState::InNExit
        } else if n {
            // the occupant of 100 blocks the 85-100 exit leg
            JunctionState::InN
        } else {
            JunctionState::Idle
        }
    }
}

/// Blocks 76-150: the junction state machine plus hazards in N, O-Q, S-U.
pub struct GreenPlcPart2;

impl PlcProgram for GreenPlcPart2 {
    fn name(&self) -> &str {
        "GreenLinePlc part 2"
    }

    fn scan(&self, io: &mut PlcIo<'_>) -> Result<()> {
        check_length(io, self.name())?;
        let mut hazard = vec![false; GREEN_BLOCKS];
        let occupancy = io.block_occupancy;

        trailing_hazards(occupancy, &mut hazard, 77..=85);
        trailing_hazards(occupancy, &mut hazard, 86..=100);
        trailing_hazards(occupancy, &mut hazard, 105..=117);

        match JunctionState::derive(occupancy) {
            JunctionState::Idle => {
                io.switches[76] = false;
                io.switches[85] = false;
                io.traffic_lights[76] = true;
                io.traffic_lights[77] = false;
                io.traffic_lights[85] = true;
                io.traffic_lights[86] = false;
                set_range(&mut hazard, 74..=76, false);
            }
            JunctionState::InN => {
                io.switches[76] = true;
                io.switches[85] = false;
                io.traffic_lights[76] = false;
                io.traffic_lights[77] = true;
                io.traffic_lights[101] = true;
                io.traffic_lights[85] = true;
                io.traffic_lights[86] = false;
                set_range(&mut hazard, 74..=76, true);
            }
            JunctionState::InNExit => {
                io.switches[76] = true;
                io.switches[85] = true;
                io.traffic_lights[76] = false;
                io.traffic_lights[77] = true;
                io.traffic_lights[101] = true;
                io.traffic_lights[85] = false;
                io.traffic_lights[86] = true;
                io.traffic_lights[100] = true;
                set_range(&mut hazard, 74..=76, true);
                set_range(&mut hazard, 98..=100, true);
            }
            JunctionState::InOpq => {
                io.switches[76] = true;
                io.switches[85] = true;
                io.traffic_lights[76] = false;
                io.traffic_lights[77] = true;
                io.traffic_lights[101] = true;
                io.traffic_lights[85] = false;
                io.traffic_lights[86] = true;
                set_range(&mut hazard, 74..=76, true);
            }
        }

        apply_hazards(&hazard, io);
        Ok(())
    }
}
