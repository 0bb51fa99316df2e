use crate::control::error::{ControlError, Result};
use chrono::{Local, NaiveDateTime, NaiveTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{channel, Receiver, Sender};
use tokio::sync::Mutex;
use tracing::debug;

/// Simulated time advance per tick. Fixed regardless of the rate multiplier;
/// the multiplier only shortens the wall-clock interval between ticks.
pub const TICK: Duration = Duration::from_millis(100);

const MIN_MULTIPLIER: f64 = 1.0;
const MAX_MULTIPLIER: f64 = 10.0;

/// One clock tick as delivered to every subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Simulated time at the end of this tick.
    pub now: NaiveDateTime,
    /// `HH:MM` display string of `now`.
    pub hhmm: String,
}

#[derive(Debug)]
struct ClockState {
    multiplier: f64,
    paused: bool,
    running: bool,
    elapsed: Duration,
    start_of_day: NaiveTime,
}

/// The single source of simulated time.
///
/// One writer (the tick loop), many readers. Subsystems subscribe to the
/// broadcast channel and never sleep on their own.
///
/// ```
/// # use raildispatch::control::clock::SimulationClock;
/// # use std::time::Duration;
/// # tokio_test::block_on(async {
/// let clock = SimulationClock::new("12:00").unwrap();
/// let mut ticks = clock.subscribe();
/// clock.advance(Duration::from_millis(100)).await;
/// assert_eq!(ticks.recv().await.unwrap().hhmm, "12:00");
/// clock.advance(Duration::from_secs(300)).await;
/// assert_eq!(clock.time_string().await, "12:05");
/// # });
/// ```
#[derive(Debug)]
pub struct SimulationClock {
    state: Mutex<ClockState>,
    channel: Sender<Tick>,
}

impl SimulationClock {
    /// Creates a stopped clock starting the simulated day at `start_of_day`
    /// (`HH:MM`).
    pub fn new(start_of_day: &str) -> Result<Arc<Self>> {
        let start = NaiveTime::parse_from_str(start_of_day, "%H:%M")
            .map_err(|_| ControlError::InvalidInput(format!("start of day {start_of_day:?}")))?;
        Ok(Arc::new(SimulationClock {
            state: Mutex::new(ClockState {
                multiplier: MIN_MULTIPLIER,
                paused: false,
                running: false,
                elapsed: Duration::ZERO,
                start_of_day: start,
            }),
            channel: channel(64).0,
        }))
    }

    /// Current simulated time: today's date plus the simulated time of day.
    /// Day rollover wraps the time of day.
    pub async fn get_time(&self) -> NaiveDateTime {
        let state = self.state.lock().await;
        time_of(state.start_of_day, state.elapsed)
    }

    /// Current simulated time as the `HH:MM` display string.
    pub async fn time_string(&self) -> String {
        self.get_time().await.format("%H:%M").to_string()
    }

    /// Clamps and applies the rate multiplier (1x to 10x of wall time).
    pub async fn set_multiplier(&self, multiplier: f64) {
        let mut state = self.state.lock().await;
        state.multiplier = multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
    }

    pub async fn multiplier(&self) -> f64 {
        self.state.lock().await.multiplier
    }

    /// A paused clock emits no ticks and accumulates no simulated time.
    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        self.state.lock().await.paused = false;
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    /// Subscribes to tick events.
    pub fn subscribe(&self) -> Receiver<Tick> {
        self.channel.subscribe()
    }

    /// Advances simulated time without sleeping and emits the tick events a
    /// running clock would have produced. Deterministic driver for tests and
    /// for embedding hosts that own their own scheduling.
    pub async fn advance(&self, amount: Duration) {
        let mut remaining = amount;
        while !remaining.is_zero() {
            let step = remaining.min(TICK);
            remaining -= step;
            let tick = {
                let mut state = self.state.lock().await;
                state.elapsed += step;
                tick_of(&state)
            };
            let _ = self.channel.send(tick);
        }
    }

    /// Runs the tick loop until [`SimulationClock::stop`] is called. The wall
    /// interval between ticks is `100 ms / multiplier`; the simulated advance
    /// per tick is always 100 ms.
    pub async fn run(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.running {
                return;
            }
            state.running = true;
        }
        debug!("simulation clock started");
        loop {
            let (sleep_for, tick) = {
                let mut state = self.state.lock().await;
                if !state.running {
                    break;
                }
                let sleep_for = Duration::from_secs_f64(TICK.as_secs_f64() / state.multiplier);
                if state.paused {
                    (sleep_for, None)
                } else {
                    state.elapsed += TICK;
                    (sleep_for, Some(tick_of(&state)))
                }
            };
            if let Some(tick) = tick {
                let _ = self.channel.send(tick);
            }
            tokio::time::sleep(sleep_for).await;
        }
        debug!("simulation clock stopped");
    }

    /// Stops a running tick loop. Subsystems drain their in-flight tick and
    /// exit when the channel closes.
    pub async fn stop(&self) {
        self.state.lock().await.running = false;
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Fails with [`ControlError::ClockDown`] unless the tick loop is live.
    /// Startup-time guard only; once running the clock is assumed alive.
    pub async fn require_running(&self) -> Result<()> {
        if self.state.lock().await.running {
            Ok(())
        } else {
            Err(ControlError::ClockDown)
        }
    }
}

fn time_of(start_of_day: NaiveTime, elapsed: Duration) -> NaiveDateTime {
    let start_secs = u64::from(start_of_day.hour()) * 3600 + u64::from(start_of_day.minute()) * 60;
    let total = (start_secs + elapsed.as_secs()) % (24 * 3600);
    let time = NaiveTime::from_num_seconds_from_midnight_opt(total as u32, 0)
        .unwrap_or(NaiveTime::MIN);
    Local::now().date_naive().and_time(time)
}

fn tick_of(state: &ClockState) -> Tick {
    let now = time_of(state.start_of_day, state.elapsed);
    Tick {
        hhmm: now.format("%H:%M").to_string(),
        now,
    }
}
