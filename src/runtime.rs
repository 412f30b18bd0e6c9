// Process wiring: link + sequencer on one blocking thread, camera on another,
// zenoh for intents (listen mode) and telemetry, Ctrl-C for cancellation.
//
// The actuation thread is the only owner of the serial link. The camera thread
// is the only owner of the capture device. They share the shutdown signal and
// nothing else.

use std::sync::mpsc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::actuator::ActuatorMapper;
use crate::config::{ConfigError, LinkConfig, VehicleConfig, CMD_TIMEOUT, LOOP_HZ, TOPIC_CMD_INTENT};
use crate::link::{LinkError, LinkSession};
use crate::messages::{IntentCommand, ManeuverStep, TelemetryEvent};
use crate::perception::{self, open_platform_device};
use crate::sequencer::{RunOutcome, SequenceError, Sequencer};
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{TelemetrySink, ZenohTelemetry};

/// Pause between connection attempts
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Could not establish link with flight controller: {0}")]
    Connect(#[source] LinkError),

    #[error("Link lost mid-maneuver: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Zenoh error: {0}")]
    Zenoh(String),

    #[error("Actuation task failed: {0}")]
    Task(String),
}

/// Where maneuver steps come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Execute the configured script once
    Scripted,
    /// Execute intents published on the command topic
    Listen,
}

pub async fn run(config: VehicleConfig, mode: Mode) -> Result<(), RuntimeError> {
    config.validate()?;
    if mode == Mode::Scripted {
        config.script()?;
    }
    let mapper = ActuatorMapper::new(&config.actuator).map_err(ConfigError::from)?;

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping vehicle");
                shutdown.trigger();
            }
        });
    }

    let zenoh_session = if config.telemetry.enabled || mode == Mode::Listen {
        info!("Opening Zenoh session...");
        Some(
            zenoh::open(zenoh::Config::default())
                .await
                .map_err(|e| RuntimeError::Zenoh(e.to_string()))?,
        )
    } else {
        None
    };

    let telemetry = match (&zenoh_session, config.telemetry.enabled) {
        (Some(session), true) => {
            info!("Publishing telemetry under: {}/*", config.telemetry.topic_prefix);
            Some(ZenohTelemetry::with_session(
                session.clone(),
                &config.telemetry.topic_prefix,
            ))
        }
        _ => None,
    };

    // 1. Perception feed, on its own thread with its own stop signal
    let feed_stop = ShutdownSignal::new();
    let feed = if config.camera.enabled {
        let sink = telemetry
            .clone()
            .map(|t| Box::new(t) as Box<dyn TelemetrySink>);
        match perception::spawn_feed(
            config.camera.device_index,
            Box::new(open_platform_device),
            feed_stop.clone(),
            sink,
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not start perception thread: {}", e);
                None
            }
        }
    } else {
        info!("Camera disabled");
        None
    };

    // 2. Intent bridge (listen mode): zenoh subscriber -> step channel
    let steps = match (mode, &zenoh_session) {
        (Mode::Listen, Some(session)) => {
            let subscriber = session
                .declare_subscriber(TOPIC_CMD_INTENT)
                .await
                .map_err(|e| RuntimeError::Zenoh(e.to_string()))?;
            info!("Subscribed to: {}", TOPIC_CMD_INTENT);

            let (tx, rx) = mpsc::channel::<ManeuverStep>();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
                loop {
                    tick.tick().await;
                    if stop.is_triggered() {
                        return;
                    }
                    // Drain all pending intents (non-blocking)
                    while let Ok(Some(sample)) = subscriber.try_recv() {
                        let payload = sample.payload().to_bytes();
                        match serde_json::from_slice::<IntentCommand>(&payload) {
                            Ok(cmd) => {
                                info!("Received intent: {:?}", &cmd);
                                if tx.send(cmd.into_step(CMD_TIMEOUT)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Failed to parse intent: {}", e),
                        }
                    }
                }
            });
            Some(rx)
        }
        _ => None,
    };

    // 3. Actuation, synchronously on one blocking thread
    let actuation = {
        let shutdown = shutdown.clone();
        let telemetry = telemetry.clone();
        tokio::task::spawn_blocking(move || actuate(&config, mapper, shutdown, telemetry, steps))
    };
    let result = match actuation.await {
        Ok(result) => result,
        Err(e) => Err(RuntimeError::Task(e.to_string())),
    };

    // 4. Camera goes down regardless of how actuation ended
    feed_stop.trigger();
    if let Some(feed) = feed {
        match tokio::task::spawn_blocking(move || feed.join()).await {
            Ok(Ok(Ok((w, h)))) => info!("Perception feed closed ({}x{})", w, h),
            Ok(Ok(Err(e))) => warn!("Perception feed was unavailable: {}", e),
            Ok(Err(_)) | Err(_) => error!("Perception thread panicked"),
        }
    }

    let reason = match &result {
        Ok(RunOutcome::Completed { steps }) => format!("completed {} steps", steps),
        Ok(RunOutcome::Cancelled { at_step }) => format!("cancelled at step {}", at_step),
        Err(e) => e.to_string(),
    };
    if let Some(mut sink) = telemetry {
        sink.publish(&TelemetryEvent::Shutdown {
            reason: reason.clone(),
        });
    }
    info!("Shutdown: {}", reason);

    result.map(|_| ())
}

fn actuate(
    config: &VehicleConfig,
    mapper: ActuatorMapper,
    shutdown: ShutdownSignal,
    telemetry: Option<ZenohTelemetry>,
    steps: Option<mpsc::Receiver<ManeuverStep>>,
) -> Result<RunOutcome, RuntimeError> {
    let session = match connect_with_retry(&config.link, &shutdown) {
        Ok(session) => session,
        Err(LinkError::Cancelled { .. }) => {
            info!("Shutdown requested before the link came up");
            return Ok(RunOutcome::Cancelled { at_step: 0 });
        }
        Err(e) => return Err(RuntimeError::Connect(e)),
    };

    let mut sequencer = Sequencer::new(session, mapper, shutdown)
        .with_liveness_interval(config.link.liveness_check_interval());
    if let Some(mut sink) = telemetry {
        let link = sequencer.link();
        sink.publish(&TelemetryEvent::Connected {
            port: link.port().to_string(),
            target_system: link.target_system(),
            target_component: link.target_component(),
        });
        sequencer = sequencer.with_telemetry(Box::new(sink));
    }

    let outcome = match steps {
        Some(rx) => sequencer.run_triggered(&rx)?,
        None => sequencer.run(config.script()?)?,
    };
    Ok(outcome)
}

/// Retry policy for the initial handshake. The session itself never retries.
/// Shutdown ends the wait between attempts and the handshake in progress.
fn connect_with_retry(link: &LinkConfig, shutdown: &ShutdownSignal) -> Result<LinkSession, LinkError> {
    let attempts = link.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        let session_options = link.session_options();
        match LinkSession::connect_until(&link.port, link.baud, session_options, Some(shutdown)) {
            Ok(session) => return Ok(session),
            Err(e @ LinkError::Cancelled { .. }) => return Err(e),
            Err(e) if attempt < attempts => {
                warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                if shutdown.wait_timeout(CONNECT_RETRY_DELAY) {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
