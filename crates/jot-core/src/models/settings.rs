//! Application settings model

use serde::{Deserialize, Serialize};

/// Theme preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Light,
    Dark,
    #[default]
    System,
}

/// User-facing application settings, stored locally and carried in exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    /// Theme preference
    #[serde(default)]
    pub theme: ThemeMode,
    /// Base font size in points
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    /// Color applied to newly created cards
    #[serde(default = "default_color")]
    pub default_color: String,
    /// Whether completed checklist items stay visible
    #[serde(default = "default_show_completed")]
    pub show_completed: bool,
}

fn default_font_size() -> u32 {
    14
}

fn default_color() -> String {
    "#ffd500".to_string()
}

fn default_show_completed() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: ThemeMode::default(),
            font_size: default_font_size(),
            default_color: default_color(),
            show_completed: default_show_completed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.theme, ThemeMode::System);
        assert_eq!(settings.font_size, 14);
        assert_eq!(settings.default_color, "#ffd500");
        assert!(settings.show_completed);
    }

    #[test]
    fn test_theme_serializes_lowercase() {
        let json = serde_json::to_string(&ThemeMode::Dark).unwrap();
        assert_eq!(json, "\"dark\"");
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str("{\"theme\":\"dark\"}").unwrap();
        assert_eq!(settings.theme, ThemeMode::Dark);
        assert_eq!(settings.font_size, 14);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = serde_json::from_str::<Settings>("{\"theme\":\"dark\",\"legacy\":1}");
        assert!(result.is_err());
    }
}
