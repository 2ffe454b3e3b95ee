//! Built-in matcher configuration
//!
//! Each intent carries one dominant matcher (weight 1.0) naming the
//! intent's defining vocabulary and two supporting matchers (weight 0.5)
//! for verbs and qualifiers. A dominant match alone therefore clears the
//! 0.5 dispatch threshold, while stray supporting tokens stay below it.

use orchestrator_core::IntentName;

use crate::classifier::{IntentPatterns, Matcher};

/// The default pattern set, in enumeration (tie-break) order.
pub fn default_patterns() -> Vec<IntentPatterns> {
    vec![
        IntentPatterns::new(
            IntentName::PlayMusic,
            vec![
                Matcher::keyword("play", 1.0),
                Matcher::pattern(r"\b(music|song|songs|track|playlist|radio|album)\b", 0.5),
                Matcher::pattern(
                    r"\b(jazz|rock|pop|classical|blues|metal|country|techno|ambient)\b",
                    0.5,
                ),
            ],
        ),
        IntentPatterns::new(
            IntentName::ControlVolume,
            vec![
                Matcher::pattern(r"\b(volume|mute|unmute|louder|quieter|softer)\b", 1.0),
                Matcher::pattern(r"\b(set|turn|adjust|change|make)\b", 0.5),
                Matcher::pattern(r"\b(up|down|\d{1,3})\b", 0.5),
            ],
        ),
        IntentPatterns::new(
            IntentName::SwitchAudio,
            vec![
                Matcher::pattern(
                    r"\b(switch|change|move)\b.*\b(audio|output|sound|speakers|headphones|hdmi|bluetooth)\b",
                    1.0,
                ),
                Matcher::pattern(r"\b(headphones|speakers|hdmi|bluetooth|earbuds|tv)\b", 0.5),
                Matcher::keyword("audio", 0.5),
            ],
        ),
        IntentPatterns::new(
            IntentName::SystemControl,
            vec![
                Matcher::pattern(
                    r"\b(shutdown|shut down|restart|reboot|power off|sleep|lock)\b",
                    1.0,
                ),
                Matcher::pattern(r"\b(system|computer|machine|pc|device)\b", 0.5),
                Matcher::pattern(r"\b(now|immediately)\b", 0.5),
            ],
        ),
        IntentPatterns::new(
            IntentName::SmartHome,
            vec![
                Matcher::pattern(r"\b(light|lights|lamp|thermostat|heater|fan|blinds)\b", 1.0),
                Matcher::pattern(r"\b(turn|switch) (on|off)\b", 0.5),
                Matcher::pattern(
                    r"\b(living room|kitchen|bedroom|bathroom|garage|hallway)\b",
                    0.5,
                ),
            ],
        ),
        IntentPatterns::new(
            IntentName::Communication,
            vec![
                Matcher::pattern(r"\b(call|text|message|email)\b", 1.0),
                Matcher::pattern(r"\b(send|dial|contact)\b", 0.5),
                Matcher::pattern(r"\bto [a-z]+", 0.5),
            ],
        ),
        IntentPatterns::new(
            IntentName::Navigation,
            vec![
                Matcher::pattern(r"\b(navigate|navigation|directions|route)\b", 1.0),
                Matcher::phrase("take me", 0.5),
                Matcher::pattern(r"\bto\b", 0.5),
            ],
        ),
        IntentPatterns::new(
            IntentName::GpioControl,
            vec![
                Matcher::keyword("gpio", 1.0),
                Matcher::pattern(r"\bpin\s*\d+", 0.5),
                Matcher::pattern(r"\b(high|low|toggle|read|on|off)\b", 0.5),
            ],
        ),
    ]
}
