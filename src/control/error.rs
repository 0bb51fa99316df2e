use crate::general::{BlockId, ControllerId, Line, TrainId};
use thiserror::Error;

/// Failures crossing component boundaries.
///
/// Every cross-component call reports through this type or through a plain
/// boolean; errors are data, not control flow. Panics stay reserved for
/// programmer mistakes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    /// Null/empty arguments, malformed ids, empty route sequences.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown train, route or block.
    #[error("not found: {0}")]
    NotFound(String),

    /// A wayside reported a block outside its registered coverage.
    #[error("controller {controller} is not authorized for {line} block {block}")]
    UnauthorizedSender {
        controller: ControllerId,
        line: Line,
        block: BlockId,
    },

    /// A block closure would strand trains routed across the block.
    #[error("unsafe operation: {reason}")]
    UnsafeOperation {
        reason: String,
        offending_trains: Vec<TrainId>,
    },

    /// An occupancy transition matched more than one candidate train.
    #[error("ambiguous occupancy on {line} block {block}")]
    AmbiguousOccupancy {
        line: Line,
        block: BlockId,
        candidates: Vec<TrainId>,
    },

    /// A PLC program failed mid-scan; its writes were discarded.
    #[error("plc fault in {program}: {message}")]
    PlcFault { program: String, message: String },

    /// A wayside or track-model call failed; the batch is reported false.
    #[error("communication fault: {0}")]
    CommFault(String),

    /// No clock is running. Fatal at startup only.
    #[error("time manager is not running")]
    ClockDown,
}

pub type Result<T> = std::result::Result<T, ControlError>;
