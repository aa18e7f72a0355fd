//! Domain Model
//!
//! Readings, history points and screens shared by the session controller,
//! the glucose client and the desktop shell.

use serde::{Deserialize, Serialize};

/// Direction the glucose value is moving in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    NotComputable,
}

impl Trend {
    /// Parse the remote trend name. Unknown names are not computable.
    pub fn from_name(name: &str) -> Self {
        match name {
            "SingleUp" => Trend::SingleUp,
            "FortyFiveUp" => Trend::FortyFiveUp,
            "Flat" => Trend::Flat,
            "FortyFiveDown" => Trend::FortyFiveDown,
            "SingleDown" => Trend::SingleDown,
            _ => Trend::NotComputable,
        }
    }

    /// Map the numeric `TrendArrow` code sent by LibreLinkUp.
    pub fn from_arrow_code(code: i64) -> Self {
        match code {
            1 => Trend::SingleDown,
            2 => Trend::FortyFiveDown,
            3 => Trend::Flat,
            4 => Trend::FortyFiveUp,
            5 => Trend::SingleUp,
            _ => Trend::NotComputable,
        }
    }

    /// Glyph shown next to the value
    pub fn arrow(&self) -> &'static str {
        match self {
            Trend::SingleUp => "⬆",
            Trend::FortyFiveUp => "↗",
            Trend::Flat => "➡",
            Trend::FortyFiveDown => "↘",
            Trend::SingleDown => "⬇",
            Trend::NotComputable => "⏺",
        }
    }
}

/// Range a value falls into, used to colour it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GlucoseBand {
    Low,
    InRange,
    High,
    VeryHigh,
}

/// A single measurement in mg/dL
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub trend: Trend,
}

impl Reading {
    pub fn band(&self) -> GlucoseBand {
        if self.value > 240.0 {
            GlucoseBand::VeryHigh
        } else if self.value > 180.0 {
            GlucoseBand::High
        } else if self.value >= 70.0 {
            GlucoseBand::InRange
        } else {
            GlucoseBand::Low
        }
    }
}

/// Past measurement, ordered oldest first within a history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub date: chrono::DateTime<chrono::Utc>,
    pub value: f64,
}

/// The three mutually exclusive views
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Screen {
    Login,
    Main,
    History,
}

impl Screen {
    pub fn name(&self) -> &'static str {
        match self {
            Screen::Login => "login",
            Screen::Main => "main",
            Screen::History => "history",
        }
    }

    /// Window size and stacking for this screen
    pub fn geometry(&self) -> WindowGeometry {
        match self {
            Screen::Login => WindowGeometry { width: 400, height: 500, always_on_top: false },
            Screen::Main => WindowGeometry { width: 55, height: 50, always_on_top: true },
            Screen::History => WindowGeometry { width: 800, height: 700, always_on_top: false },
        }
    }
}

impl std::fmt::Display for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub width: u32,
    pub height: u32,
    pub always_on_top: bool,
}
