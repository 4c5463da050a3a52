//! Text-level cleanup of the simulator's session document
//!
//! The session string handed over by the simulator is YAML followed, in some
//! capture paths, by a dump of live telemetry values laid out in fixed-width
//! columns. It also carries the usual iRacing YAML quirks:
//! - Control characters that break YAML parsers
//! - Unquoted free-text values (driver and team names with quotes, commas)
//!
//! This module isolates and cleans the structured part without parsing it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Twenty spaces: the column gap of fixed-width live-value dumps.
const LIVE_VALUE_GAP: &str = "                    ";

/// Channel names that start a live-value line when followed by a column gap.
const LIVE_CHANNEL_PREFIXES: &[&str] = &[
    "AirDensity",
    "AirPressure",
    "AirTemp",
    "Brake",
    "Clutch",
    "Engine",
    "Fuel",
    "Gear",
    "Lap",
    "RPM",
    "Speed",
    "Steering",
    "Throttle",
    "Velocity",
    "Yaw",
    "Roll",
    "Pitch",
    "FrameRate",
    "CpuUsage",
];

/// Line starts that only ever appear in YAML structure.
const STRUCTURE_MARKERS: &[&str] = &["---", "- ", ": "];

/// Keys whose values are free text and arrive unquoted.
const FREE_TEXT_KEYS: &[&str] = &[
    "AbbrevName:",
    "TeamName:",
    "UserName:",
    "Initials:",
    "DriverSetupName:",
    "CarDesignStr:",
];

/// Whether a line looks like a live telemetry key/value dump rather than YAML.
pub fn is_live_value_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }

    if STRUCTURE_MARKERS.iter().any(|marker| trimmed.starts_with(marker)) {
        return false;
    }

    let has_gap = line.contains(LIVE_VALUE_GAP);
    if has_gap && line.matches(' ').count() > LIVE_VALUE_GAP.len() {
        return true;
    }

    if has_gap && LIVE_CHANNEL_PREFIXES.iter().any(|name| trimmed.starts_with(name)) {
        return true;
    }

    // Indented CarIdx* keys are YAML; at column zero they are per-car arrays.
    trimmed.starts_with("CarIdx") && !line.starts_with(' ')
}

/// Slice off the structured prefix of a session document.
///
/// Stops before the first live-value line or at a YAML document end marker
/// (`...`). Blank lines are kept. Returns the input unchanged if no noise is
/// found.
pub fn isolate_structured_prefix(raw: &str) -> &str {
    let mut end = 0;

    for line in raw.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        if content.trim() == "..." || is_live_value_line(content) {
            return &raw[..end];
        }
        end += line.len();
    }

    raw
}

/// Stable hash of the structured text, used to skip redundant layout updates.
pub fn content_hash(structured: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    structured.hash(&mut hasher);
    hasher.finish()
}

/// Remove control characters other than newline, carriage return and tab.
pub fn strip_control_characters(text: &str) -> String {
    text.chars().filter(|ch| !ch.is_control() || matches!(ch, '\n' | '\r' | '\t')).collect()
}

/// Quote free-text values so driver names like `O'Connor, Mike` parse.
///
/// Already-quoted values are left alone; embedded single quotes are doubled.
pub fn quote_free_text_values(text: &str) -> String {
    let mut result = Vec::new();

    for line in text.lines() {
        let mut processed = line.to_string();

        for &key in FREE_TEXT_KEYS {
            let Some(key_pos) = line.find(key) else {
                continue;
            };
            let after_key = key_pos + key.len();
            if let Some(offset) = line[after_key..].find(|c: char| !c.is_whitespace()) {
                let value_start = after_key + offset;
                let value = line[value_start..].trim();
                if !value.starts_with('\'') && !value.starts_with('"') {
                    processed =
                        format!("{}'{}'", &line[..value_start], value.replace('\'', "''"));
                }
            }
            break;
        }

        result.push(processed);
    }

    result.join("\n")
}

/// Full text cleanup applied before deserializing the structured prefix.
pub fn preprocess_session_yaml(structured: &str) -> String {
    quote_free_text_values(&strip_control_characters(structured))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DOCUMENT: &str = "---\nWeekendInfo:\n TrackName: lagunaseca\n TrackID: 47\n\nSplitTimeInfo:\n Sectors:\n - SectorNum: 0\n   SectorStartPct: 0.000000\n";

    #[test]
    fn clean_document_is_returned_whole() {
        assert_eq!(isolate_structured_prefix(DOCUMENT), DOCUMENT);
    }

    #[test]
    fn stops_at_fixed_width_value_dump() {
        let noisy = format!(
            "{DOCUMENT}Speed                         54.2311\nRPM                           6512.0\n"
        );
        assert_eq!(isolate_structured_prefix(&noisy), DOCUMENT);
    }

    #[test]
    fn stops_at_document_end_marker() {
        let with_end = format!("{DOCUMENT}...\nLapDist 1200.4\n");
        assert_eq!(isolate_structured_prefix(&with_end), DOCUMENT);
    }

    #[test]
    fn unindented_car_idx_is_noise() {
        assert!(is_live_value_line("CarIdxLapDistPct [0.1, 0.2]"));
        assert!(!is_live_value_line("  CarIdx: 0"));
    }

    #[test]
    fn yaml_lines_are_not_noise() {
        assert!(!is_live_value_line(" TrackName: lagunaseca"));
        assert!(!is_live_value_line(" - SectorNum: 1"));
        assert!(!is_live_value_line(""));
        assert!(!is_live_value_line("   SectorStartPct: 0.500000"));
    }

    #[test]
    fn channel_name_with_gap_is_noise() {
        assert!(is_live_value_line("Throttle                    1.0"));
        assert!(!is_live_value_line(" Throttle: 1.0"));
    }

    #[test]
    fn quotes_problem_values() {
        let input = "   UserName: O'Connor, Mike\n   TeamName: \"Fast & Furious\" Racing\n";
        let result = quote_free_text_values(input);
        assert!(result.contains("UserName: 'O''Connor, Mike'"));
        assert!(result.contains("TeamName: \"Fast & Furious\" Racing"));
    }

    #[test]
    fn strips_control_characters_only() {
        let cleaned = strip_control_characters("Key:\x00\x01 Value\n\tNext\r\n");
        assert_eq!(cleaned, "Key: Value\n\tNext\r\n");
    }

    #[test]
    fn hash_changes_with_content() {
        assert_eq!(content_hash(DOCUMENT), content_hash(DOCUMENT));
        assert_ne!(content_hash(DOCUMENT), content_hash(&DOCUMENT.replace("47", "48")));
    }

    proptest! {
        #[test]
        fn prefix_is_always_a_prefix(body in r"[a-zA-Z0-9: \n\-\._]{0,400}") {
            let isolated = isolate_structured_prefix(&body);
            prop_assert!(body.starts_with(isolated));
        }

        #[test]
        fn appended_dump_never_survives(
            name in prop::sample::select(LIVE_CHANNEL_PREFIXES.to_vec()),
            value in -1000.0f64..1000.0,
        ) {
            let noisy = format!("{DOCUMENT}{name}{LIVE_VALUE_GAP}{value}\n");
            prop_assert_eq!(isolate_structured_prefix(&noisy), DOCUMENT);
        }
    }
}
