//! Tauri Commands Module
//!
//! IPC commands exposed to the frontend.

use tauri::{command, AppHandle, Emitter, State, WebviewWindow};
use tokio::sync::watch;
use tracing::{info, debug};

use crate::model::Screen;
use crate::session::SessionSnapshot;
use crate::AppState;

pub const SESSION_EVENT: &str = "session_update";
pub const TRAY_ID: &str = "main-tray";

const TRAY_TOOLTIP: &str = "Glucose Tray";

// Commands

/// Current state for the first render
#[command]
pub fn get_session(state: State<'_, AppState>) -> SessionSnapshot {
    state.session.snapshot()
}

/// Log in and remember the credentials on success
#[command]
pub async fn login(
    username: String,
    password: String,
    protocol_version: String,
    state: State<'_, AppState>,
) -> Result<SessionSnapshot, String> {
    let success = state
        .session
        .login(&username, &password, &protocol_version)
        .await;
    debug!("Login finished, success: {}", success);
    Ok(state.session.snapshot())
}

/// Logout and forget the saved credentials
#[command]
pub fn logout(state: State<'_, AppState>) -> SessionSnapshot {
    state.session.logout();
    state.session.snapshot()
}

/// Switch between the reading and the history chart
#[command]
pub fn navigate(screen: Screen, state: State<'_, AppState>) -> Result<SessionSnapshot, String> {
    state.session.navigate(screen).map_err(|e| e.to_string())?;
    Ok(state.session.snapshot())
}

/// Minimize window
#[command]
pub fn minimize_window(window: WebviewWindow) {
    let _ = window.minimize();
}

/// Hide to system tray
#[command]
pub fn hide_to_tray(window: WebviewWindow) {
    let _ = window.hide();
}

/// Quit the application
#[command]
pub fn close_window(app: AppHandle, state: State<'_, AppState>) {
    info!("Exit requested from window");
    state.session.shutdown();
    app.exit(0);
}

/// Push every session change to the frontend and into the tray tooltip
pub fn forward_session_updates(app: AppHandle, mut updates: watch::Receiver<SessionSnapshot>) {
    tauri::async_runtime::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();

            let _ = app.emit(SESSION_EVENT, &snapshot);

            if let Some(tray) = app.tray_by_id(TRAY_ID) {
                let _ = tray.set_tooltip(Some(tray_tooltip(&snapshot)));
            }
        }
        debug!("Session update channel closed");
    });
}

fn tray_tooltip(snapshot: &SessionSnapshot) -> String {
    match (&snapshot.reading, &snapshot.arrow) {
        (Some(reading), Some(arrow)) => format!("{} mg/dL {}", reading.value, arrow),
        _ => TRAY_TOOLTIP.to_string(),
    }
}
