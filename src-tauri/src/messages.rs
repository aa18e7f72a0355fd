//! User-visible error messages in the supported languages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Es,
    En,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    InvalidCredentials,
    ConnectionFailed,
}

pub fn text(locale: Locale, message: Message) -> &'static str {
    match (locale, message) {
        (Locale::Es, Message::InvalidCredentials) => "Credenciales inválidas.",
        (Locale::Es, Message::ConnectionFailed) => "Error al conectar con el servidor o red.",
        (Locale::En, Message::InvalidCredentials) => "Invalid credentials.",
        (Locale::En, Message::ConnectionFailed) => "Could not connect to the server.",
    }
}
