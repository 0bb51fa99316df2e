/// The single simulated clock every subsystem runs from.
pub mod clock;
/// System configuration values.
pub mod config;
/// The central traffic controller and its communication handler.
pub mod ctc;
/// Failure kinds crossing component boundaries.
pub mod error;
/// The messages broadcast to system observers.
pub mod messages;
/// Static track graph, block states and the built-in line layouts.
pub mod rail_system;
/// Full-system wiring of clock, CTC, waysides and train controllers.
pub mod system;
/// The on-board closed-loop speed regulator.
pub mod train_controller;
/// Per-line safety interlocks running PLC programs.
pub mod wayside;
