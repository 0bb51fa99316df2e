//! Built-in Green and Red line layouts.
//!
//! The deployed system reads its geometry from a track file; this module
//! carries the same network as code so the core runs without any file input.
//! Connections are declared in travel direction; switch legs follow the
//! `(normal; alternate)` notation of the layout sheet, e.g. block 12 carries
//! `(12-13; 1-13)`.

use crate::control::rail_system::components::{Block, BlockRegistry, StationInfo, StationSide, SwitchInfo};
use crate::control::rail_system::track::{Builder, TrackModel};
use crate::general::Line;

/// The yard occupies command-array slot 0 on every line.
pub const YARD: usize = 0;

/// Builds the track model and block registry for the requested lines.
pub fn standard_network(lines: &[Line]) -> (TrackModel, BlockRegistry) {
    let mut builder = Builder::new();
    for line in lines {
        match line {
            Line::Green => green_line(&mut builder),
            Line::Red => red_line(&mut builder),
        }
    }
    builder.build()
}

const GREEN_STATIONS: &[(usize, &str, StationSide)] = &[
    (1, "PIONEER", StationSide::Left),
    (14, "EDGEBROOK", StationSide::Right),
    (22, "WHITED", StationSide::Both),
    (31, "SOUTH BANK", StationSide::Left),
    (39, "CENTRAL", StationSide::Right),
    (48, "INGLEWOOD", StationSide::Right),
    (57, "OVERBROOK", StationSide::Left),
    (65, "GLENBURY", StationSide::Right),
    (73, "DORMONT", StationSide::Left),
    (77, "MT LEBANON", StationSide::Both),
    (88, "POPLAR", StationSide::Left),
    (96, "CASTLE SHANNON", StationSide::Right),
];

fn green_section(id: usize) -> char {
    match id {
        1..=3 => 'A',
        4..=6 => 'B',
        7..=12 => 'C',
        13..=16 => 'D',
        17..=20 => 'E',
        21..=28 => 'F',
        29..=32 => 'G',
        33..=35 => 'H',
        36..=57 => 'I',
        58..=62 => 'J',
        63..=68 => 'K',
        69..=73 => 'L',
        74..=76 => 'M',
        77..=85 => 'N',
        86..=88 => 'O',
        89..=97 => 'P',
        98..=100 => 'Q',
        101..=104 => 'R',
        105..=109 => 'S',
        110..=116 => 'T',
        117..=121 => 'U',
        122..=128 => 'V',
        129..=143 => 'W',
        144..=146 => 'X',
        147..=149 => 'Y',
        _ => 'Z',
    }
}

/// Green line: yard plus blocks 1-150.
pub fn green_line(builder: &mut Builder) {
    for id in YARD..=150 {
        let mut block = Block::new(Line::Green, id);
        block.section = green_section(id);
        block.underground = (36..=57).contains(&id);
        block.speed_limit_kmh = if block.underground { 40.0 } else { 50.0 };
        block.grade_percent = match id {
            13..=16 => 2.5,
            29..=32 => -2.0,
            _ => 0.0,
        };
        block.elevation_m = if (77..=100).contains(&id) { 12.0 } else { 0.0 };
        block.crossing = id == 19;
        if let Some(pos) = GREEN_STATIONS.iter().position(|(b, ..)| *b == id) {
            let (_, name, side) = GREEN_STATIONS[pos];
            block.station = Some(StationInfo {
                name: name.to_owned(),
                side,
                number: pos as u16 + 1,
            });
        }
        block.switch = match id {
            12 => Some(SwitchInfo { normal: (12, 13), alternate: (1, 13) }),
            29 => Some(SwitchInfo { normal: (29, 30), alternate: (29, 150) }),
            58 => Some(SwitchInfo { normal: (58, 59), alternate: (57, YARD) }),
            62 => Some(SwitchInfo { normal: (62, 63), alternate: (YARD, 63) }),
            76 => Some(SwitchInfo { normal: (76, 77), alternate: (77, 101) }),
            85 => Some(SwitchInfo { normal: (85, 86), alternate: (100, 85) }),
            _ => None,
        };
        builder.add_block(block);
    }

    let run: Vec<usize> = (1..=150).collect();
    builder.connect_run(Line::Green, &run);
    // switch legs
    builder.connect(Line::Green, 1, 13);
    builder.connect(Line::Green, 29, 150);
    builder.connect(Line::Green, 57, YARD);
    builder.connect(Line::Green, YARD, 63);
    builder.connect(Line::Green, 77, 101);
    builder.connect(Line::Green, 100, 85);
    builder.yard_exit(Line::Green, 1);
}

const RED_STATIONS: &[(usize, &str, StationSide)] = &[
    (7, "SHADYSIDE", StationSide::Left),
    (16, "HERALD SQUARE", StationSide::Right),
    (21, "EAST END", StationSide::Both),
    (25, "WHITED", StationSide::Left),
    (35, "SOUTH POINTE", StationSide::Right),
    (45, "PENN", StationSide::Left),
    (48, "STEEL PLAZA", StationSide::Right),
    (60, "FIRST AVE", StationSide::Left),
    (73, "SWISSVALE", StationSide::Right),
];

fn red_section(id: usize) -> char {
    match id {
        1..=3 => 'A',
        4..=6 => 'B',
        7..=9 => 'C',
        10..=15 => 'D',
        16..=27 => 'E',
        28..=38 => 'F',
        39..=43 => 'G',
        44..=46 => 'H',
        47..=48 => 'I',
        49..=52 => 'J',
        53..=57 => 'K',
        58..=62 => 'L',
        63..=66 => 'M',
        _ => 'N',
    }
}

/// Red line: yard plus blocks 1-76.
pub fn red_line(builder: &mut Builder) {
    for id in YARD..=76 {
        let mut block = Block::new(Line::Red, id);
        block.section = red_section(id);
        block.underground = (24..=45).contains(&id);
        block.speed_limit_kmh = if block.underground { 40.0 } else { 55.0 };
        block.grade_percent = match id {
            10..=12 => 1.5,
            33..=35 => -1.5,
            _ => 0.0,
        };
        block.crossing = id == 47;
        if let Some(pos) = RED_STATIONS.iter().position(|(b, ..)| *b == id) {
            let (_, name, side) = RED_STATIONS[pos];
            block.station = Some(StationInfo {
                name: name.to_owned(),
                side,
                number: pos as u16 + 1,
            });
        }
        block.switch = match id {
            9 => Some(SwitchInfo { normal: (9, 10), alternate: (9, YARD) }),
            15 => Some(SwitchInfo { normal: (15, 16), alternate: (1, 16) }),
            27 => Some(SwitchInfo { normal: (27, 28), alternate: (27, 76) }),
            32 => Some(SwitchInfo { normal: (32, 33), alternate: (33, 72) }),
            38 => Some(SwitchInfo { normal: (38, 39), alternate: (38, 71) }),
            43 => Some(SwitchInfo { normal: (43, 44), alternate: (44, 67) }),
            52 => Some(SwitchInfo { normal: (52, 53), alternate: (52, 66) }),
            _ => None,
        };
        builder.add_block(block);
    }

    let run: Vec<usize> = (1..=76).collect();
    builder.connect_run(Line::Red, &run);
    // switch legs
    builder.connect(Line::Red, 9, YARD);
    builder.connect(Line::Red, YARD, 9);
    builder.connect(Line::Red, 1, 16);
    builder.connect(Line::Red, 27, 76);
    builder.connect(Line::Red, 33, 72);
    builder.connect(Line::Red, 38, 71);
    builder.connect(Line::Red, 44, 67);
    builder.connect(Line::Red, 52, 66);
    builder.yard_exit(Line::Red, 9);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn green_line_shape() {
        let (track, registry) = standard_network(&[Line::Green]);
        assert_eq!(track.total_blocks(Line::Green), 151);
        assert_eq!(track.yard_exit(Line::Green), Some(1));
        assert_eq!(track.station_block(Line::Green, "Edgebrook"), Some(14));
        // switch leg from the (12-13; 1-13) switch
        assert!(track.are_adjacent(Line::Green, 1, 13));
        assert!(track.are_adjacent(Line::Green, 13, 14));
        let crossing = registry.get(&(Line::Green, 19)).unwrap().lock().await;
        assert!(crossing.crossing);
    }

    #[test]
    fn dispatch_path_uses_the_switch_leg() {
        let (track, _) = standard_network(&[Line::Green]);
        assert_eq!(
            track.shortest_path(Line::Green, 1, 14),
            Some(vec![1, 13, 14])
        );
    }

    #[test]
    fn red_line_shape() {
        let (track, _) = standard_network(&[Line::Red]);
        assert_eq!(track.total_blocks(Line::Red), 77);
        assert_eq!(track.yard_exit(Line::Red), Some(9));
        assert!(track.are_adjacent(Line::Red, 27, 76));
        assert!(track.are_adjacent(Line::Red, 52, 66));
    }
}
