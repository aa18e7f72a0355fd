//! Glucose Tray - Main Entry Point
//!
//! Small always-on-top window and tray icon showing the current
//! LibreLinkUp glucose reading.

#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use std::path::PathBuf;

use tauri::Manager;
use tracing::{info, error};

use glucose_tray_lib::{
    commands,
    config::{self, AppConfig},
    librelink::LibreLinkClient,
    logging,
    session::{SessionController, SessionOptions},
    storage::SecureStorage,
    window::TauriWindow,
    AppState,
};

fn main() {
    let data_dir = config::data_directory();
    let _log_guard = logging::init(&data_dir.join("logs"));
    info!("Glucose Tray starting...");

    let config = AppConfig::load(&data_dir);

    if let Err(e) = run(config, data_dir) {
        error!("Glucose Tray stopped: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: AppConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    let client = LibreLinkClient::new(&config.api_base_url, config.request_timeout())?;
    let storage = SecureStorage::new(data_dir);

    tauri::Builder::default()
        .on_window_event(|window, event| {
            if let tauri::WindowEvent::CloseRequested { api, .. } = event {
                let _ = window.hide();
                api.prevent_close();
            }
        })
        .invoke_handler(tauri::generate_handler![
            commands::get_session,
            commands::login,
            commands::logout,
            commands::navigate,
            commands::minimize_window,
            commands::hide_to_tray,
            commands::close_window,
        ])
        .setup(move |app| {
            let session = SessionController::new(
                client,
                storage,
                TauriWindow::new(app.handle().clone()),
                SessionOptions::from(&config),
            );

            commands::forward_session_updates(app.handle().clone(), session.subscribe());

            let startup = session.clone();
            tauri::async_runtime::spawn(async move {
                startup.bootstrap().await;
            });

            app.manage(AppState { session });

            let tray_menu = tauri::menu::Menu::with_items(app, &[
                &tauri::menu::MenuItem::with_id(app, "show", "Show", true, None::<&str>)?,
                &tauri::menu::MenuItem::with_id(app, "quit", "Quit", true, None::<&str>)?,
            ])?;

            let mut tray = tauri::tray::TrayIconBuilder::with_id(commands::TRAY_ID)
                .tooltip("Glucose Tray")
                .menu(&tray_menu)
                .on_menu_event(|app, event| match event.id().as_ref() {
                    "show" => show_main_window(app),
                    "quit" => {
                        app.state::<AppState>().session.shutdown();
                        app.exit(0);
                    }
                    _ => {}
                })
                .on_tray_icon_event(|tray, event| {
                    if let tauri::tray::TrayIconEvent::Click {
                        button: tauri::tray::MouseButton::Left,
                        ..
                    } = event
                    {
                        show_main_window(tray.app_handle());
                    }
                });

            if let Some(icon) = app.default_window_icon() {
                tray = tray.icon(icon.clone());
            }
            tray.build(app)?;

            info!("Application setup complete");
            Ok(())
        })
        .run(tauri::generate_context!())?;

    Ok(())
}

fn show_main_window(app: &tauri::AppHandle) {
    if let Some(window) = app.get_webview_window("main") {
        let _ = window.show();
        let _ = window.set_focus();
    }
}
