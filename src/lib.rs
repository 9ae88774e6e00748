pub mod audio;
pub mod error;
pub mod history;
pub mod live;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod tools;

use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use audio::CpalBackend;
use history::{ContentType, Message};
use live::LiveTransport;
use metrics::ErrorRecord;
use session::{SessionController, SessionServices, Snapshot};
use settings::AppSettings;
use tools::GeminiClient;

/// Terminal view of a snapshot.
/// Uses tagged union format: { "status": "idle" } or { "status": "error", "title": ... }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UiState {
    Idle,
    Connecting,
    Connected {
        thinking: bool,
        speaking: bool,
    },
    Error {
        title: Option<String>,
        message: Option<String>,
        steps: Vec<String>,
    },
}

/// Convert a snapshot to its terminal view
pub fn snapshot_to_ui(snapshot: &Snapshot) -> UiState {
    use state_machine::SessionState;

    match snapshot.state {
        SessionState::Idle => UiState::Idle,
        SessionState::Connecting => UiState::Connecting,
        SessionState::Connected => UiState::Connected {
            thinking: snapshot.thinking,
            speaking: snapshot.speaking,
        },
        SessionState::Error => UiState::Error {
            title: snapshot.error.as_ref().map(|e| e.title.clone()),
            message: snapshot.error.as_ref().map(|e| e.message.clone()),
            steps: snapshot
                .error
                .as_ref()
                .map(|e| e.steps.clone())
                .unwrap_or_default(),
        },
    }
}

fn emit_ui_state(snapshot: &Snapshot) {
    let ui_state = snapshot_to_ui(snapshot);
    match serde_json::to_string(&ui_state) {
        Ok(json) => log::info!("UI state: {}", json),
        Err(e) => log::warn!("Failed to serialize UI state: {}", e),
    }
}

fn print_history(messages: &[Message]) {
    if messages.is_empty() {
        println!("(no messages)");
        return;
    }
    // Oldest first on a terminal
    for message in messages.iter().rev() {
        let body = match message.content_type {
            ContentType::Image => format!("[image, {} bytes]", message.text.len()),
            _ => message.text.clone(),
        };
        println!("{:?}: {}", message.role, body);
    }
}

fn print_errors(errors: &[ErrorRecord]) {
    if errors.is_empty() {
        println!("(no errors)");
        return;
    }
    for error in errors {
        println!(
            "{} {}: {}",
            error.timestamp.format("%H:%M:%S"),
            error.title,
            error.message
        );
    }
}

/// Log every observable change until the controller goes away
async fn watch_snapshots(mut rx: watch::Receiver<Snapshot>) {
    let mut last = snapshot_to_ui(&rx.borrow_and_update());
    emit_ui_state(&rx.borrow());
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        let ui_state = snapshot_to_ui(&snapshot);
        if ui_state != last {
            emit_ui_state(&snapshot);
            last = ui_state;
        }
    }
}

/// Read commands from stdin and drive the controller
async fn run_terminal(controller: SessionController) {
    println!("Commands: start, greet, clear, status, history, errors, quit");

    let watcher = tokio::spawn(watch_snapshots(controller.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        match line.trim() {
            "" => {}
            "start" => controller.start(false).await,
            "greet" => controller.start(true).await,
            "clear" => controller.clear_error().await,
            "status" => {
                let snapshot = controller.snapshot();
                match serde_json::to_string_pretty(&snapshot_to_ui(&snapshot)) {
                    Ok(json) => println!("{}", json),
                    Err(e) => log::warn!("Failed to serialize UI state: {}", e),
                }
                match serde_json::to_string_pretty(&snapshot.metrics) {
                    Ok(json) => println!("{}", json),
                    Err(e) => log::warn!("Failed to serialize metrics: {}", e),
                }
                if let Some(attempt) = snapshot.attempts.first() {
                    println!(
                        "Last attempt: {}ms, sent {} / dropped {} chunks, played {:.1}s",
                        attempt.duration_ms,
                        attempt.chunks_sent,
                        attempt.chunks_dropped,
                        attempt.audio_scheduled_secs
                    );
                }
            }
            "errors" => print_errors(&controller.snapshot().errors),
            "history" => print_history(&controller.history()),
            "quit" | "exit" => break,
            other => println!("Unknown command: {}", other),
        }
    }

    log::info!("Shutting down");
    controller.shutdown().await;
    watcher.abort();
}

fn build_services(settings: AppSettings) -> Result<SessionServices, String> {
    let api_key = settings::get_api_key().unwrap_or_else(|| {
        log::warn!("GEMINI_API_KEY is not set; sessions will fail to connect");
        String::new()
    });

    let audio = CpalBackend::new(settings.input_device.clone(), settings.output_device.clone());
    let transport = LiveTransport::new(api_key.clone())
        .with_endpoint(settings.endpoint_url.clone())
        .with_timeouts(settings.connect_timeout(), settings.setup_timeout());
    let generator =
        GeminiClient::new(api_key, settings.gemini_models()).map_err(|e| e.to_string())?;

    Ok(SessionServices {
        audio: Arc::new(audio),
        transport: Arc::new(transport),
        generator: Arc::new(generator),
        settings,
    })
}

// ============================================================================
// Application entry point
// ============================================================================

pub fn run() -> Result<(), String> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // tokio-tungstenite and reqwest share one rustls provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings = settings::load_settings();
    match settings::settings_path() {
        Ok(path) if !path.exists() => match settings::save_settings(&settings) {
            Ok(()) => log::info!("Wrote default settings to {:?}", path),
            Err(e) => log::warn!("Could not write default settings: {}", e),
        },
        Ok(_) => {}
        Err(e) => log::debug!("Settings: {}", e),
    }
    log::info!(
        "Settings loaded (model: {}, voice: {})",
        settings.model,
        settings.voice_name
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;

    runtime.block_on(async move {
        let services = build_services(settings)?;
        let controller = SessionController::spawn(services);
        log::info!("Duplex voice started");
        run_terminal(controller).await;
        Ok(())
    })
}
