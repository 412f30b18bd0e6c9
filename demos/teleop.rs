// Keyboard teleop: W forward, A/D turn, S or space stop, R/F hold time, Q quit
//
// Publishes IntentCommand JSON on rover/cmd/intent for `rover-link-runtime listen`.
// Holding a key keeps re-sending the intent; releasing it lets the runtime's
// watchdog stop the vehicle once the hold time runs out.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use rover_link_runtime::config::TOPIC_CMD_INTENT;
use rover_link_runtime::messages::{IntentCommand, MotionIntent};

const HOLD_MS: [u64; 3] = [150, 300, 600];
const REPEAT_INTERVAL: Duration = Duration::from_millis(100); // Re-send while a key is held

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_INTENT).await?;

    info!("Controls: W=forward, A/D=turn, S/space=stop, R/F=hold time, Q=quit");
    info!("Hold: {}ms", HOLD_MS[0]);

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut hold_idx: usize = 0;
    let mut last_sent: Option<(MotionIntent, Instant)> = None;

    loop {
        // Poll for key with 20ms timeout
        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if !(kind == KeyEventKind::Press || kind == KeyEventKind::Repeat) {
            continue;
        }

        let intent = match code {
            KeyCode::Char('w') => MotionIntent::Forward,
            KeyCode::Char('a') => MotionIntent::TurnLeft,
            KeyCode::Char('d') => MotionIntent::TurnRight,
            KeyCode::Char('s') | KeyCode::Char(' ') => MotionIntent::Stop,

            KeyCode::Char('r') => {
                hold_idx = (hold_idx + 1).min(HOLD_MS.len() - 1);
                info!("Hold: {}ms", HOLD_MS[hold_idx]);
                continue;
            }
            KeyCode::Char('f') => {
                hold_idx = hold_idx.saturating_sub(1);
                info!("Hold: {}ms", HOLD_MS[hold_idx]);
                continue;
            }

            KeyCode::Char('q') | KeyCode::Esc => {
                publish(publisher, MotionIntent::Stop, HOLD_MS[0]).await?;
                break;
            }
            _ => continue,
        };

        // Key repeat fires faster than needed; throttle identical intents
        if let Some((prev, at)) = last_sent {
            if prev == intent && at.elapsed() < REPEAT_INTERVAL {
                continue;
            }
        }
        publish(publisher, intent, HOLD_MS[hold_idx]).await?;
        last_sent = Some((intent, Instant::now()));
    }

    Ok(())
}

async fn publish(
    publisher: &zenoh::pubsub::Publisher<'_>,
    intent: MotionIntent,
    hold_ms: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cmd = IntentCommand {
        intent,
        hold_ms: Some(hold_ms),
    };
    publisher.put(serde_json::to_string(&cmd)?).await?;
    Ok(())
}
