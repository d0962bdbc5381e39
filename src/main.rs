use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use voice_bridge::{
    settings, streaming, ConnectionState, CpalHost, GeminiConnector, SessionConfig, SessionHandle,
};

/// Width of the terminal volume bar
const METER_WIDTH: usize = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = settings::load_settings();
    if let Ok(path) = settings::settings_path() {
        // Seed an editable settings file on first run
        if !path.exists() {
            match settings::save_settings(&settings) {
                Ok(()) => log::info!("Wrote default settings to {:?}", path),
                Err(e) => log::warn!("Settings: {}", e),
            }
        }
    }
    log::info!(
        "Violet voice starting (model {}, voice {})",
        settings.model,
        settings.voice_name
    );

    let (handle, task) = SessionHandle::spawn(
        SessionConfig::from_settings(&settings),
        streaming::get_api_key(),
        Arc::new(CpalHost),
        Arc::new(GeminiConnector::from_settings(&settings)),
    );

    handle.connect();
    run_meter(&handle).await;

    handle.disconnect();
    let report = handle.report().await.context("voice session stopped unexpectedly")?;
    handle.shutdown();
    task.await.context("voice session task failed")?;

    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&report.metrics).context("serialize metrics")?
    );
    Ok(())
}

/// Draw a one-line state/volume meter until Ctrl-C or the session ends.
async fn run_meter(handle: &SessionHandle) {
    let mut status_rx = handle.watch_status();
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut was_live = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("Ctrl-C received, hanging up");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                match status.state {
                    ConnectionState::Connecting | ConnectionState::Connected => was_live = true,
                    ConnectionState::Error => {
                        eprintln!("\n{}", status.message.unwrap_or_default());
                        break;
                    }
                    ConnectionState::Disconnected => {
                        if let Some(notice) = status.message {
                            eprintln!("\n{}", notice);
                            break;
                        }
                        if was_live {
                            break;
                        }
                    }
                }
            }
            _ = tick.tick() => {
                let state = handle.status().state;
                print!("\r{:<12} {}", format!("{:?}", state), meter_bar(handle.volume()));
                let _ = std::io::stdout().flush();
            }
        }
    }
}

fn meter_bar(volume: f32) -> String {
    // Speech RMS rarely exceeds 0.2
    let level = (volume * 5.0).clamp(0.0, 1.0);
    let filled = (level * METER_WIDTH as f32).round() as usize;
    format!("[{}{}]", "#".repeat(filled), " ".repeat(METER_WIDTH - filled))
}
