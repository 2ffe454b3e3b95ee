//! Intent types
//!
//! The intent enumeration is closed; routing uses a fixed
//! intent-to-capability table. Parameter values are strings or lists of
//! strings, with slot-extraction problems collected under `__errors`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Parameter key under which slot-extraction errors are collected.
pub const PARAM_ERRORS_KEY: &str = "__errors";

/// Closed enumeration of command intents.
///
/// The declaration order is the deterministic tie-break order for
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentName {
    PlayMusic,
    ControlVolume,
    SwitchAudio,
    SystemControl,
    SmartHome,
    Communication,
    Navigation,
    GpioControl,
    Unknown,
}

impl IntentName {
    /// All intents in tie-break order.
    pub const ALL: [IntentName; 9] = [
        IntentName::PlayMusic,
        IntentName::ControlVolume,
        IntentName::SwitchAudio,
        IntentName::SystemControl,
        IntentName::SmartHome,
        IntentName::Communication,
        IntentName::Navigation,
        IntentName::GpioControl,
        IntentName::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentName::PlayMusic => "play_music",
            IntentName::ControlVolume => "control_volume",
            IntentName::SwitchAudio => "switch_audio",
            IntentName::SystemControl => "system_control",
            IntentName::SmartHome => "smart_home",
            IntentName::Communication => "communication",
            IntentName::Navigation => "navigation",
            IntentName::GpioControl => "gpio_control",
            IntentName::Unknown => "unknown",
        }
    }

    /// Capability a service must advertise to handle this intent.
    ///
    /// `unknown` routes nowhere; the pipeline short-circuits it to a
    /// clarify response before routing.
    pub fn capability(&self) -> Option<&'static str> {
        match self {
            IntentName::PlayMusic => Some("music"),
            IntentName::ControlVolume => Some("audio"),
            IntentName::SwitchAudio => Some("audio"),
            IntentName::SystemControl => Some("system"),
            IntentName::SmartHome => Some("smart_home"),
            IntentName::Communication => Some("communication"),
            IntentName::Navigation => Some("navigation"),
            IntentName::GpioControl => Some("gpio"),
            IntentName::Unknown => None,
        }
    }
}

impl std::fmt::Display for IntentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parameter value: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            ParamValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ParamValue::Text(_) => None,
            ParamValue::List(items) => Some(items),
        }
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(items: Vec<String>) -> Self {
        ParamValue::List(items)
    }
}

/// Extracted parameter map.
pub type Parameters = HashMap<String, ParamValue>;

/// A classified command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Winning intent
    pub name: IntentName,
    /// Winning score clamped to [0, 1]; at most 0.3 for `unknown`
    pub confidence: f32,
    /// Extracted slot values
    #[serde(default)]
    pub parameters: Parameters,
    /// Original (pre-normalization) text
    pub text: String,
}

impl Intent {
    pub fn new(name: IntentName, confidence: f32, text: impl Into<String>) -> Self {
        Self {
            name,
            confidence: confidence.clamp(0.0, 1.0),
            parameters: Parameters::new(),
            text: text.into(),
        }
    }

    /// An `unknown` intent; confidence is capped at 0.3.
    pub fn unknown(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(IntentName::Unknown, confidence.min(0.3), text)
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Append a slot-extraction error marker.
    pub fn push_error(&mut self, message: impl Into<String>) {
        match self
            .parameters
            .entry(PARAM_ERRORS_KEY.to_string())
            .or_insert_with(|| ParamValue::List(Vec::new()))
        {
            ParamValue::List(errors) => errors.push(message.into()),
            other => {
                // A scalar under __errors means a service wrote junk; replace it.
                *other = ParamValue::List(vec![message.into()]);
            }
        }
    }

    /// Whether the intent is dispatchable: known and confident enough.
    pub fn is_dispatchable(&self) -> bool {
        self.name != IntentName::Unknown && self.confidence >= 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_table() {
        assert_eq!(IntentName::PlayMusic.capability(), Some("music"));
        assert_eq!(IntentName::GpioControl.capability(), Some("gpio"));
        assert_eq!(IntentName::Unknown.capability(), None);
    }

    #[test]
    fn test_unknown_confidence_cap() {
        let intent = Intent::unknown("garble", 0.9);
        assert!(intent.confidence <= 0.3);
        assert!(!intent.is_dispatchable());
    }

    #[test]
    fn test_confidence_boundary() {
        let intent = Intent::new(IntentName::PlayMusic, 0.5, "play jazz");
        assert!(intent.is_dispatchable());
        let intent = Intent::new(IntentName::PlayMusic, 0.49, "play?");
        assert!(!intent.is_dispatchable());
    }

    #[test]
    fn test_error_markers() {
        let mut intent = Intent::new(IntentName::GpioControl, 0.8, "set pin 99 high");
        intent.push_error("pin 99 out of range 0-40");
        let errors = intent
            .parameters
            .get(PARAM_ERRORS_KEY)
            .and_then(|v| v.as_list())
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_param_value_untagged_serde() {
        let value: ParamValue = serde_json::from_str("\"jazz\"").unwrap();
        assert_eq!(value.as_text(), Some("jazz"));
        let value: ParamValue = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(value.as_list().map(|l| l.len()), Some(2));
    }
}
