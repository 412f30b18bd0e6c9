// Maneuver sequencer
//
// Drives an ordered script of motion intents (or intents arriving on a
// channel) through the actuator mapper and the link, one step at a time.
// Whatever way a run ends, the last thing it transmits is the Stop intent.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::actuator::ActuatorMapper;
use crate::link::{CommandLink, LinkError};
use crate::messages::{ManeuverStep, MotionIntent, SequencerState, TelemetryEvent};
use crate::shutdown::ShutdownSignal;
use crate::telemetry::TelemetrySink;

/// How often link health is re-checked while holding a dwell
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(250);

/// Cancellation check granularity while waiting for triggered steps
const TRIGGER_POLL: Duration = Duration::from_millis(20);

/// A run aborted by the link, with the step it was on
#[derive(Debug, thiserror::Error)]
#[error("Maneuver aborted at step {step}: {cause}")]
pub struct SequenceError {
    pub step: usize,
    #[source]
    pub cause: LinkError,
}

/// How a run ended when the link held up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { steps: usize },
    Cancelled { at_step: usize },
}

pub struct Sequencer<L: CommandLink> {
    link: L,
    mapper: ActuatorMapper,
    shutdown: ShutdownSignal,
    state: SequencerState,
    liveness_interval: Duration,
    telemetry: Option<Box<dyn TelemetrySink>>,
}

impl<L: CommandLink> Sequencer<L> {
    pub fn new(link: L, mapper: ActuatorMapper, shutdown: ShutdownSignal) -> Self {
        Self {
            link,
            mapper,
            shutdown,
            state: SequencerState::Idle,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Execute a scripted maneuver, blocking for its full duration.
    ///
    /// A link failure aborts the remaining steps (no retry) and is reported
    /// with the step index. Stop is issued before returning on every path,
    /// including unwinding.
    pub fn run(&mut self, script: &[ManeuverStep]) -> Result<RunOutcome, SequenceError> {
        info!("Starting scripted maneuver: {} steps", script.len());
        self.transition(SequencerState::Idle);
        self.transition(SequencerState::Executing(0));

        let guard = StopOnExit(self);
        guard.0.execute_script(script)
    }

    /// Execute steps as they arrive on `steps` until the sender hangs up or
    /// shutdown is requested. A non-Stop step whose dwell runs out without a
    /// newer step is followed by a watchdog Stop.
    pub fn run_triggered(
        &mut self,
        steps: &Receiver<ManeuverStep>,
    ) -> Result<RunOutcome, SequenceError> {
        info!("Waiting for triggered maneuver steps");
        self.transition(SequencerState::Idle);

        let guard = StopOnExit(self);
        guard.0.execute_triggered(steps)
    }

    fn execute_script(&mut self, script: &[ManeuverStep]) -> Result<RunOutcome, SequenceError> {
        for (i, step) in script.iter().enumerate() {
            if self.shutdown.is_triggered() {
                info!("Cancellation observed before step {}", i);
                return Ok(RunOutcome::Cancelled { at_step: i });
            }

            self.issue(Some(i), step.intent)
                .map_err(|cause| SequenceError { step: i, cause })?;
            self.transition(SequencerState::Executing(i));

            let cancelled = self
                .dwell(step.dwell)
                .map_err(|cause| SequenceError { step: i, cause })?;
            if cancelled {
                info!("Cancellation observed during dwell of step {}", i);
                return Ok(RunOutcome::Cancelled { at_step: i });
            }
        }
        Ok(RunOutcome::Completed {
            steps: script.len(),
        })
    }

    fn execute_triggered(
        &mut self,
        steps: &Receiver<ManeuverStep>,
    ) -> Result<RunOutcome, SequenceError> {
        let mut index = 0usize;
        let mut hold_until: Option<Instant> = None;
        let mut last_motion = Instant::now();
        let mut next_check = Instant::now() + self.liveness_interval;

        loop {
            if self.shutdown.is_triggered() {
                info!("Cancellation observed after {} triggered steps", index);
                return Ok(RunOutcome::Cancelled { at_step: index });
            }

            match steps.recv_timeout(TRIGGER_POLL) {
                Ok(step) => {
                    self.issue(Some(index), step.intent)
                        .map_err(|cause| SequenceError { step: index, cause })?;
                    self.transition(SequencerState::Executing(index));
                    hold_until = match step.intent {
                        MotionIntent::Stop => None,
                        _ => Some(Instant::now() + step.dwell),
                    };
                    last_motion = Instant::now();
                    index += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Step source closed after {} steps", index);
                    return Ok(RunOutcome::Completed { steps: index });
                }
            }

            let now = Instant::now();
            let current = index.saturating_sub(1);

            if let Some(until) = hold_until {
                if now >= until {
                    let idle_ms = now.duration_since(last_motion).as_millis() as u64;
                    warn!("No new step for {}ms, watchdog stopping vehicle", idle_ms);
                    self.emit(TelemetryEvent::Watchdog { idle_ms });
                    self.issue(None, MotionIntent::Stop)
                        .map_err(|cause| SequenceError {
                            step: current,
                            cause,
                        })?;
                    hold_until = None;
                }
            }

            if now >= next_check {
                self.link.poll_liveness().map_err(|cause| SequenceError {
                    step: current,
                    cause,
                })?;
                next_check = now + self.liveness_interval;
            }
        }
    }

    /// Liveness check, then transmit the intent's channel pair
    fn issue(&mut self, step: Option<usize>, intent: MotionIntent) -> Result<(), LinkError> {
        self.link.poll_liveness()?;
        let pair = self.mapper.resolve(intent);
        self.link.send_channel_commands(&pair)?;
        info!(
            step = ?step,
            %intent,
            left = pair[0].value(),
            right = pair[1].value(),
            "Command sent"
        );
        self.emit(TelemetryEvent::CommandSent {
            step,
            intent,
            commands: pair.to_vec(),
        });
        Ok(())
    }

    /// Hold for `duration`, re-checking the link every liveness interval.
    /// Returns Ok(true) if shutdown was requested during the wait.
    fn dwell(&mut self, duration: Duration) -> Result<bool, LinkError> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(self.liveness_interval);
            if self.shutdown.wait_timeout(slice) {
                return Ok(true);
            }
            if Instant::now() < deadline {
                self.link.poll_liveness()?;
            }
        }
    }

    /// Stopping -> (Stop intent) -> Halted. The Stop skips the liveness poll,
    /// and a refused send falls back to the link's ungated stop. A failure
    /// here is logged since there is nothing left to abort.
    fn stop_and_halt(&mut self) {
        self.transition(SequencerState::Stopping);
        let pair = self.mapper.resolve(MotionIntent::Stop);
        let sent = self.link.send_channel_commands(&pair).or_else(|e| {
            warn!("Stop refused ({}), forcing neutral outputs", e);
            self.link.send_stop(&self.mapper.stop_commands())
        });
        match sent {
            Ok(()) => {
                info!(
                    left = pair[0].value(),
                    right = pair[1].value(),
                    "Stop issued"
                );
                self.emit(TelemetryEvent::CommandSent {
                    step: None,
                    intent: MotionIntent::Stop,
                    commands: pair.to_vec(),
                });
            }
            Err(e) => error!("Failed to issue stop: {}", e),
        }
        self.transition(SequencerState::Halted);
    }

    fn transition(&mut self, to: SequencerState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!("Sequencer {} -> {}", from, to);
        self.emit(TelemetryEvent::StateChanged { from, to });
    }

    fn emit(&mut self, event: TelemetryEvent) {
        if let Some(sink) = self.telemetry.as_mut() {
            sink.publish(&event);
        }
    }
}

/// Issues Stop when a run leaves scope, on return or unwind
struct StopOnExit<'a, L: CommandLink>(&'a mut Sequencer<L>);

impl<L: CommandLink> Drop for StopOnExit<'_, L> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Maneuver interrupted by panic, stopping vehicle");
        }
        self.0.stop_and_halt();
    }
}
