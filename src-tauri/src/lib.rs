//! Glucose Tray Library
//!
//! Core modules for the desktop glucose reader.

pub mod auth;
pub mod client;
pub mod config;
pub mod librelink;
pub mod logging;
pub mod messages;
pub mod model;
pub mod session;
pub mod storage;
pub mod window;

#[cfg(feature = "desktop")]
pub mod commands;

#[cfg(feature = "desktop")]
use librelink::LibreLinkClient;
#[cfg(feature = "desktop")]
use session::SessionController;
#[cfg(feature = "desktop")]
use storage::SecureStorage;
#[cfg(feature = "desktop")]
use window::TauriWindow;

/// Session controller wired to the real collaborators
#[cfg(feature = "desktop")]
pub type DesktopSession = SessionController<LibreLinkClient, SecureStorage, TauriWindow>;

/// Application state shared across commands
#[cfg(feature = "desktop")]
pub struct AppState {
    pub session: DesktopSession,
}
