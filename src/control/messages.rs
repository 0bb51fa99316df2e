use crate::general::{BlockId, Line, TrainId};
use chrono::NaiveDateTime;

/// Events broadcast on the system channel.
///
/// UI layers subscribe read-only; nothing in the core reacts to its own
/// broadcasts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    /// Simulated clock advanced. Payload is the `HH:MM` display string.
    TimeUpdate(String),
    TrainDispatched(TrainId, Line),
    TrainArrived(TrainId),
    TrainRemoved(TrainId),
    BlockClosed(Line, BlockId),
    BlockOpened(Line, BlockId),
    BlockFailed(Line, BlockId, NaiveDateTime),
    /// A train has been stationary past the emergency threshold.
    EmergencyDetected(TrainId),
}
