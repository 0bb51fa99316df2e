//! Red line PLC programs.
//!
//! Part 1 owns blocks 1-38 (yard switch, the 15/27/32/38 switches), part 2
//! blocks 39-76 (the 43/52 switches and the block 47 crossing). The red
//! line is bidirectional through its middle sections, so hazard shadows
//! flip between trailing and leading with the directional-flow flag.
//! Switch convention: `false` selects the normal leg, `true` the alternate.

use crate::control::error::{ControlError, Result};
use crate::control::wayside::plc::{
    apply_hazards, crossing_active, leading_hazards, set_range, span_occupied, trailing_hazards,
    PlcIo, PlcProgram,
};

/// Array length every Red program expects: yard slot plus blocks 1-76.
pub const RED_BLOCKS: usize = 77;

/// Occupancy window that holds the block 47 crossing down.
pub const RED_CROSSING_WINDOW: std::ops::RangeInclusive<usize> = 44..=50;

/// Directional-flow flag: a train on 52 with 51 clear is running the
/// up-through-H return direction.
pub fn up_through_h(occupancy: &[bool]) -> bool {
    occupancy.get(52).copied().unwrap_or(false) && !occupancy.get(51).copied().unwrap_or(false)
}

fn check_length(io: &PlcIo<'_>, name: &str) -> Result<()> {
    let shortest = io
        .block_occupancy
        .len()
        .min(io.speed.len())
        .min(io.authority.len())
        .min(io.switches.len())
        .min(io.traffic_lights.len())
        .min(io.crossings.len());
    if shortest < RED_BLOCKS {
        return Err(ControlError::PlcFault {
            program: name.to_owned(),
            message: format!("arrays of {shortest} blocks, need {RED_BLOCKS}"),
        });
    }
    Ok(())
}

/// Blocks 1-38: yard switch plus the direction-controlled 27/32/38 group.
pub struct RedPlcPart1;

impl PlcProgram for RedPlcPart1 {
    fn name(&self) -> &str {
        "RedLinePlc part 1"
    }

    fn scan(&self, io: &mut PlcIo<'_>) -> Result<()> {
        check_length(io, self.name())?;
        let mut hazard = vec![false; RED_BLOCKS];
        let occupancy = io.block_occupancy;
        let up = up_through_h(occupancy);

        let abc = span_occupied(occupancy, 1..=9);
        let def = span_occupied(occupancy, 10..=38);
        let fghij = span_occupied(occupancy, 16..=52);

        // switch at 9, to/from the yard: held while the line is busy
        let line_clear = !(abc || def || fghij);
        io.switches[9] = line_clear;
        io.traffic_lights[9] = line_clear;

        // switch at 15: (15-16; 1-16), normal leg by default
        io.switches[15] = false;
        io.traffic_lights[15] = true;
        io.traffic_lights[16] = true;
        io.traffic_lights[1] = false;

        // switch at 27: (27-28; 27-76)
        io.switches[27] = up;
        io.traffic_lights[27] = true;
        io.traffic_lights[28] = !up;
        io.traffic_lights[76] = up;

        // switch at 32: (32-33; 33-72)
        io.switches[32] = up;
        io.traffic_lights[32] = true;
        io.traffic_lights[33] = true;
        io.traffic_lights[72] = up;

        // switch at 38: (38-39; 38-71)
        io.switches[38] = up;
        io.traffic_lights[38] = true;
        io.traffic_lights[39] = !up;

        if up {
            leading_hazards(occupancy, &mut hazard, 1..=38);
        } else {
            trailing_hazards(occupancy, &mut hazard, 1..=38);
        }

        // hold the yard while A-F are busy
        hazard[0] = abc || def;

        // trains already through D-F have priority over section A
        set_range(&mut hazard, 1..=3, def);

        apply_hazards(&hazard, io);
        Ok(())
    }
}

/// Blocks 39-76: the 43/52 switches, the 47 crossing and sections G-N.
pub struct RedPlcPart2;

impl PlcProgram for RedPlcPart2 {
    fn name(&self) -> &str {
        "RedLinePlc part 2"
    }

    fn scan(&self, io: &mut PlcIo<'_>) -> Result<()> {
        check_length(io, self.name())?;
        let mut hazard = vec![false; RED_BLOCKS];
        let occupancy = io.block_occupancy;
        let up = up_through_h(occupancy);

        let abc = span_occupied(occupancy, 1..=9);
        let fghij = span_occupied(occupancy, 16..=52);

        // switch at 43: (43-44; 44-67), diverted on the return direction
        io.switches[43] = up;
        io.traffic_lights[43] = true;
        io.traffic_lights[44] = true;
        io.traffic_lights[67] = up;

        // switch at 52: (52-53; 52-66)
        if !fghij {
            // return route open
            io.switches[52] = true;
            io.traffic_lights[52] = true;
            io.traffic_lights[53] = false;
            io.traffic_lights[66] = true;
            set_range(&mut hazard, 67..=76, abc);
        } else if !occupancy[66] && !occupancy[1] {
            // keep followers off the section while it drains
            io.switches[52] = false;
            io.traffic_lights[52] = true;
            io.traffic_lights[53] = true;
            io.traffic_lights[66] = false;
            set_range(&mut hazard, 67..=76, true);
        }

        if up {
            leading_hazards(occupancy, &mut hazard, 39..=52);
        } else {
            trailing_hazards(occupancy, &mut hazard, 39..=52);
        }
        trailing_hazards(occupancy, &mut hazard, 53..=76);

        io.crossings[47] = crossing_active(occupancy, RED_CROSSING_WINDOW);

        apply_hazards(&hazard, io);
        Ok(())
    }
}
