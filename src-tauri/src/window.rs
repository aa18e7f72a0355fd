//! Window Controller
//!
//! Applies a screen's geometry to the single application window.

use crate::model::Screen;

/// Side-effecting window resize, nothing is reported back
pub trait WindowController: Send + Sync + 'static {
    fn resize_to(&self, screen: Screen);
}

#[cfg(feature = "desktop")]
pub use desktop::TauriWindow;

#[cfg(feature = "desktop")]
mod desktop {
    use tauri::{AppHandle, LogicalSize, Manager, Size};
    use tracing::{debug, warn};

    use super::WindowController;
    use crate::model::Screen;

    pub const MAIN_WINDOW_LABEL: &str = "main";

    /// Resizes the `main` webview window
    pub struct TauriWindow {
        app: AppHandle,
    }

    impl TauriWindow {
        pub fn new(app: AppHandle) -> Self {
            Self { app }
        }
    }

    impl WindowController for TauriWindow {
        fn resize_to(&self, screen: Screen) {
            let Some(window) = self.app.get_webview_window(MAIN_WINDOW_LABEL) else {
                warn!("No main window to resize");
                return;
            };

            let geometry = screen.geometry();
            debug!("Resizing window for screen: {}", screen);

            let size = Size::Logical(LogicalSize::new(
                geometry.width as f64,
                geometry.height as f64,
            ));
            if let Err(e) = window.set_size(size) {
                warn!("Failed to resize window: {}", e);
            }
            let _ = window.set_always_on_top(geometry.always_on_top);
            let _ = window.center();
        }
    }
}
