//! Per-intent slot extraction
//!
//! Each slot has one or more extractors tried in order: regex capture,
//! literal anchor + tail, or closed vocabulary lookup. The first
//! left-to-right match wins. Out-of-range numerics are still emitted as
//! strings, with a marker appended to the error list.

use once_cell::sync::Lazy;
use regex::Regex;

use orchestrator_core::{IntentName, ParamValue, Parameters};

static ARTIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bby ([a-z0-9 ]+)$").expect("artist regex"));
static LEVEL_TO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:to|at)\s+(\d{1,3})\b").expect("level regex"));
static LEVEL_BARE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bvolume\s+(\d{1,3})\b").expect("bare level regex"));
static DELTA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(up|down)\b(?:\s+by\s+(\d{1,3}))?").expect("delta regex"));
static ACTION_SYSTEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(shutdown|shut down|restart|reboot|power off|sleep|lock)\b")
        .expect("system action regex")
});
static HOME_ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:turn|switch) (on|off)\b").expect("home action regex"));
static LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bin the ([a-z]+)\b").expect("location regex"));
static CONTACT_TO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bto ([a-z]+)\b").expect("contact regex"));
static CONTACT_VERB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:call|text|dial) ([a-z]+)\b").expect("contact verb regex"));
static DESTINATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:to|towards?)\s+(.+)$").expect("destination regex"));
static PIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bpin\s*(\d{1,3})\b").expect("pin regex"));
static GPIO_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bvalue\s+(\d+)\b").expect("gpio value regex"));

const GENRES: &[&str] = &[
    "jazz", "rock", "pop", "classical", "blues", "metal", "country", "techno", "ambient",
];
const AUDIO_DEVICES: &[&str] = &["headphones", "speakers", "hdmi", "bluetooth", "earbuds", "tv"];
const HOME_DEVICES: &[&str] = &["lights", "light", "lamp", "thermostat", "heater", "fan", "blinds"];
const GPIO_ACTIONS: &[&str] = &["toggle", "read", "high", "low", "on", "off"];
const COMM_MEDIA: &[&str] = &["call", "message", "text", "email"];
const TRACK_FILLER: &[&str] = &["some", "the", "a", "music", "song", "songs", "please"];

/// Extract the declared slots for an intent from normalized text.
///
/// Returns the parameter map and any range-validation errors.
pub fn extract(intent: IntentName, text: &str, tokens: &[&str]) -> (Parameters, Vec<String>) {
    let mut params = Parameters::new();
    let mut errors = Vec::new();

    match intent {
        IntentName::PlayMusic => extract_play_music(text, tokens, &mut params),
        IntentName::ControlVolume => extract_volume(text, &mut params, &mut errors),
        IntentName::SwitchAudio => {
            if let Some(device) = first_vocab_token(tokens, AUDIO_DEVICES) {
                params.insert("device".into(), device.into());
            }
        }
        IntentName::SystemControl => {
            if let Some(m) = ACTION_SYSTEM_RE.captures(text).and_then(|c| c.get(1)) {
                params.insert("action".into(), canonical_system_action(m.as_str()).into());
            }
        }
        IntentName::SmartHome => extract_smart_home(text, tokens, &mut params),
        IntentName::Communication => extract_communication(text, tokens, &mut params),
        IntentName::Navigation => {
            if let Some(m) = DESTINATION_RE.captures(text).and_then(|c| c.get(1)) {
                params.insert("destination".into(), m.as_str().trim().into());
            }
        }
        IntentName::GpioControl => extract_gpio(text, tokens, &mut params, &mut errors),
        IntentName::Unknown => {}
    }

    (params, errors)
}

fn extract_play_music(text: &str, tokens: &[&str], params: &mut Parameters) {
    let genre = first_vocab_token(tokens, GENRES);
    if let Some(genre) = &genre {
        params.insert("genre".into(), genre.as_str().into());
    }

    let mut tail_end = text.len();
    if let Some(m) = ARTIST_RE.captures(text) {
        let capture = m.get(1).map(|g| g.as_str().trim()).unwrap_or("");
        if !capture.is_empty() {
            params.insert("artist".into(), capture.into());
            tail_end = m.get(0).map(|g| g.start()).unwrap_or(tail_end);
        }
    }

    // Anchor + tail: whatever follows "play", minus filler and the genre,
    // is the track.
    if let Some(idx) = text.find("play ") {
        let tail = &text[idx + "play ".len()..tail_end.max(idx + "play ".len())];
        let track: Vec<&str> = tail
            .split_whitespace()
            .filter(|t| !TRACK_FILLER.contains(t))
            .filter(|t| genre.as_deref() != Some(*t))
            .collect();
        if !track.is_empty() {
            params.insert("track".into(), track.join(" ").into());
        }
    }
}

fn extract_volume(text: &str, params: &mut Parameters, errors: &mut Vec<String>) {
    let level = LEVEL_TO_RE
        .captures(text)
        .or_else(|| LEVEL_BARE_RE.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    if let Some(level) = level {
        validate_range(&level, 0, 100, "level", errors);
        params.insert("level".into(), level.into());
    }

    if let Some(c) = DELTA_RE.captures(text) {
        let step = c.get(2).map(|m| m.as_str()).unwrap_or("10");
        let delta = match c.get(1).map(|m| m.as_str()) {
            Some("up") => format!("+{step}"),
            Some("down") => format!("-{step}"),
            _ => return,
        };
        params.insert("delta".into(), delta.into());
    }
}

fn extract_smart_home(text: &str, tokens: &[&str], params: &mut Parameters) {
    if let Some(device) = first_vocab_token(tokens, HOME_DEVICES) {
        params.insert("device".into(), device.into());
    }
    if let Some(m) = HOME_ACTION_RE.captures(text).and_then(|c| c.get(1)) {
        params.insert("action".into(), m.as_str().into());
    }
    if let Some(m) = LOCATION_RE.captures(text).and_then(|c| c.get(1)) {
        params.insert("location".into(), m.as_str().into());
    }
}

fn extract_communication(text: &str, tokens: &[&str], params: &mut Parameters) {
    if let Some(medium) = first_vocab_token(tokens, COMM_MEDIA) {
        params.insert("medium".into(), medium.into());
    }
    let contact = CONTACT_TO_RE
        .captures(text)
        .or_else(|| CONTACT_VERB_RE.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    if let Some(contact) = contact {
        params.insert("contact".into(), contact.into());
    }
}

fn extract_gpio(text: &str, tokens: &[&str], params: &mut Parameters, errors: &mut Vec<String>) {
    if let Some(pin) = PIN_RE.captures(text).and_then(|c| c.get(1)) {
        let pin = pin.as_str().to_string();
        validate_range(&pin, 0, 40, "pin", errors);
        params.insert("pin".into(), pin.into());
    }
    if let Some(action) = first_vocab_token(tokens, GPIO_ACTIONS) {
        params.insert("action".into(), action.into());
    }
    if let Some(value) = GPIO_VALUE_RE.captures(text).and_then(|c| c.get(1)) {
        params.insert("value".into(), ParamValue::from(value.as_str()));
    }
}

/// First token (left to right) that appears in the vocabulary.
fn first_vocab_token(tokens: &[&str], vocabulary: &[&str]) -> Option<String> {
    tokens
        .iter()
        .find(|t| vocabulary.contains(*t))
        .map(|t| t.to_string())
}

fn canonical_system_action(raw: &str) -> &'static str {
    match raw {
        "shut down" | "shutdown" | "power off" => "shutdown",
        "restart" | "reboot" => "restart",
        "sleep" => "sleep",
        "lock" => "lock",
        _ => "unknown",
    }
}

/// Out-of-range numerics stay in the slot as strings; the marker lets
/// downstream services decide how to fail.
fn validate_range(value: &str, min: i64, max: i64, slot: &str, errors: &mut Vec<String>) {
    match value.parse::<i64>() {
        Ok(n) if n >= min && n <= max => {}
        Ok(n) => errors.push(format!("{slot} {n} out of range {min}-{max}")),
        Err(_) => errors.push(format!("{slot} {value:?} is not a number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize;
    use unicode_segmentation::UnicodeSegmentation;

    fn run(intent: IntentName, text: &str) -> (Parameters, Vec<String>) {
        let normalized = normalize(text);
        let tokens: Vec<&str> = normalized.unicode_words().collect();
        extract(intent, &normalized, &tokens)
    }

    #[test]
    fn test_track_and_artist() {
        let (params, _) = run(IntentName::PlayMusic, "play hotel california by eagles");
        assert_eq!(params.get("track").and_then(|v| v.as_text()), Some("hotel california"));
        assert_eq!(params.get("artist").and_then(|v| v.as_text()), Some("eagles"));
    }

    #[test]
    fn test_genre_only_no_track() {
        let (params, _) = run(IntentName::PlayMusic, "play some jazz music");
        assert_eq!(params.get("genre").and_then(|v| v.as_text()), Some("jazz"));
        assert!(!params.contains_key("track"));
    }

    #[test]
    fn test_volume_delta() {
        let (params, errors) = run(IntentName::ControlVolume, "turn the volume up by 20");
        assert_eq!(params.get("delta").and_then(|v| v.as_text()), Some("+20"));
        assert!(errors.is_empty());

        let (params, _) = run(IntentName::ControlVolume, "turn it down");
        assert_eq!(params.get("delta").and_then(|v| v.as_text()), Some("-10"));
    }

    #[test]
    fn test_volume_level_range() {
        let (params, errors) = run(IntentName::ControlVolume, "set volume to 120");
        assert_eq!(params.get("level").and_then(|v| v.as_text()), Some("120"));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("0-100"));
    }

    #[test]
    fn test_gpio_boundaries() {
        let (_, errors) = run(IntentName::GpioControl, "set gpio pin 40 high");
        assert!(errors.is_empty());

        let (params, errors) = run(IntentName::GpioControl, "set gpio pin 41 high");
        assert_eq!(params.get("pin").and_then(|v| v.as_text()), Some("41"));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_missing_slots_are_absent() {
        // Missing required slots stay absent; downstream prompts for them
        let (params, errors) = run(IntentName::GpioControl, "gpio");
        assert!(params.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_system_action_canonicalized() {
        let (params, _) = run(IntentName::SystemControl, "shut down the computer");
        assert_eq!(params.get("action").and_then(|v| v.as_text()), Some("shutdown"));
    }

    #[test]
    fn test_first_match_wins() {
        let (params, _) = run(IntentName::SwitchAudio, "switch audio from speakers to headphones");
        // Leftmost device token wins
        assert_eq!(params.get("device").and_then(|v| v.as_text()), Some("speakers"));
    }
}
