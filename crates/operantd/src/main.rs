//! Operant box daemon.
//!
//! Runs one session at a time for the box it is attached to:
//! - Session timers on the wall clock
//! - Hopper and camera scripts
//! - Per-session CSV data files
//! - IPC server for the touchscreen client and the CLI
//!
//! Storage locations:
//! - Linux: ~/.local/share/operant/
//! - Windows: %APPDATA%\operant\
//! - MacOS: ~/Library/Application Support/operant/

use std::sync::Arc;
use std::time::Duration;

use operant::catalog::Catalog;
use operant::error::SessionError;
use operant::io::Screen;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time;
use tracing::{error, info, warn};

mod config;
mod devices;
mod paths;
mod protocol;
mod state;

use config::DaemonConfig;
use paths::AppPaths;
use protocol::{Request, Response};
use state::DaemonState;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("no session prepared")]
    NoSession,

    #[error("session for {0} is still running; abort it first")]
    Busy(String),

    #[error("session already started")]
    AlreadyStarted,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

type Shared = Arc<Mutex<DaemonState>>;

async fn write_response(writer: &mut OwnedWriteHalf, resp: &Response) -> Result<(), DaemonError> {
    writer
        .write_all(serde_json::to_string(resp)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Next screen for a subscribed connection; pending forever otherwise.
async fn next_screen(rx: &mut Option<broadcast::Receiver<Screen>>) -> Option<Screen> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(screen) => return Some(screen),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Screen subscriber lagging");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn handle_request(state: &Shared, wake: &Notify, request: Request) -> Response {
    let mut s = state.lock().await;
    let result = match request {
        Request::GetStatus => return Response::Status(Box::new(s.status())),
        Request::ListSubjects => {
            return Response::Subjects {
                subjects: s.subjects(),
            }
        }
        Request::PreviewPlan {
            subject,
            phase,
            seed,
        } => {
            return match s.preview(&subject, &phase, seed) {
                Ok(plan) => Response::Plan { plan },
                Err(e) => Response::error(e),
            }
        }
        Request::StartSession {
            subject,
            phase,
            seed,
            record_video,
        } => s.start_session(&subject, &phase, seed, record_video),
        Request::BeginTrials => s.begin(),
        Request::Touch { target, x, y } => s
            .touch(target, x, y)
            .map(|_| format!("{} at ({x:.1}, {y:.1})", target.as_str())),
        Request::Abort => s.abort(),
        Request::Shutdown => {
            if let Err(e) = s.abort() {
                info!("Shutdown with no session: {}", e);
            }
            info!("Shutdown requested");
            tokio::spawn(async {
                // Give the response a moment to flush before exiting.
                time::sleep(Duration::from_millis(50)).await;
                std::process::exit(0);
            });
            Ok("Shutting down".to_string())
        }
        // Needs the connection; see `handle_client`.
        Request::Subscribe => return Response::error("Subscribe is per connection"),
    };
    wake.notify_one();
    match result {
        Ok(message) => Response::success(message),
        Err(e) => Response::error(e),
    }
}

async fn handle_client(stream: TcpStream, state: Shared, wake: Arc<Notify>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut screens: Option<broadcast::Receiver<Screen>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let request: Request = match serde_json::from_str(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        let resp = Response::error(format!("Invalid request: {}", e));
                        write_response(&mut writer, &resp).await?;
                        continue;
                    }
                };
                let resp = if matches!(request, Request::Subscribe) {
                    screens = Some(state.lock().await.subscribe());
                    Response::success("Subscribed")
                } else {
                    handle_request(&state, &wake, request).await
                };
                write_response(&mut writer, &resp).await?;
            }
            screen = next_screen(&mut screens) => {
                match screen {
                    Some(screen) => write_response(&mut writer, &Response::Screen { screen }).await?,
                    None => screens = None,
                }
            }
        }
    }
    Ok(())
}

/// Sleeps until the session's next timer, or until a request changes what
/// that timer is, then lets the controller catch up with the wall clock.
async fn session_clock(state: Shared, wake: Arc<Notify>) {
    loop {
        let next = state.lock().await.next_wakeup();
        match next {
            Some(at) => {
                tokio::select! {
                    _ = time::sleep_until(time::Instant::from_std(at)) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
        state.lock().await.tick();
    }
}

fn load_catalog(config: &DaemonConfig, config_file: &std::path::Path) -> Result<Catalog, DaemonError> {
    let path = config.stimuli_path(config_file);
    if path.exists() {
        let catalog = Catalog::load(&path).map_err(SessionError::from)?;
        info!(path = %path.display(), stimuli = catalog.len(), "Stimulus catalog loaded");
        Ok(catalog)
    } else {
        warn!(path = %path.display(), "Stimulus file not found; using built-in gradient set");
        Ok(Catalog::builtin_gradient_set())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Setup application paths
    let paths = AppPaths::new()?;
    let config_file = paths.config_file();
    let config = DaemonConfig::load_or_create(&config_file)?;
    let catalog = load_catalog(&config, &config_file)?;
    info!(
        data_dir = %paths.data_dir().display(),
        subjects = config.experiment.subjects.names().len(),
        "Configuration loaded"
    );

    let listen_addr = config.listen_addr.clone();
    let state: Shared = Arc::new(Mutex::new(DaemonState::new(paths, config, catalog)));
    let wake = Arc::new(Notify::new());

    // End the session on Ctrl-C so its data file is complete.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let mut s = state.lock().await;
                match s.abort() {
                    Ok(msg) => info!("Ctrl-C: {}", msg),
                    Err(e) => info!("Ctrl-C: {}", e),
                }
                std::process::exit(0);
            }
        });
    }

    tokio::spawn(session_clock(Arc::clone(&state), Arc::clone(&wake)));

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Operant daemon listening on {}", listen_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Client connected: {}", addr);
        let state = Arc::clone(&state);
        let wake = Arc::clone(&wake);

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, state, wake).await {
                error!("Client handler error: {}", e);
            }
        });
    }
}
