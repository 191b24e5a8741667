//! Line protocol spoken by the optimization workers.
//!
//! Workers interleave free-form logging with progress lines of the form
//! `[PROGRESS] GA: 42.5% completed, estimated 17.3s remaining` and a single
//! machine-readable result line. The result is either marked with the
//! `[RESULT] ` sentinel or, for older workers, is a bare line that starts with
//! `{` and ends with `}`.

use crate::model::Lane;
use once_cell::sync::Lazy;
use regex::Regex;

pub const RESULT_SENTINEL: &str = "[RESULT]";

/// Longest output line the harness keeps; anything longer is discarded.
pub const MAX_LINE_BYTES: usize = 1 << 20;

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[PROGRESS\]\s*([A-Za-z]+):\s*([^%\s]+)%\s*completed,\s*estimated\s+(\S+?)s\s+remaining",
    )
    .expect("progress pattern compiles")
});

/// Markers that hint at why a worker died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FatalMarker {
    CrashTrace,
    MissingDependency,
}

impl FatalMarker {
    pub fn hint(self) -> &'static str {
        match self {
            FatalMarker::CrashTrace => "worker encountered an unhandled error (traceback detected)",
            FatalMarker::MissingDependency => {
                "worker is missing a required module (import error detected)"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Sentinel,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Progress {
        lane: Lane,
        percent: f64,
        eta_seconds: f64,
    },
    FinalResult {
        json: String,
        source: ResultSource,
    },
    Diagnostic {
        text: String,
        marker: Option<FatalMarker>,
    },
}

/// Classify one line of worker output.
pub fn parse_line(line: &str) -> LineEvent {
    let trimmed = line.trim();

    if let Some(caps) = PROGRESS_RE.captures(trimmed) {
        let lane = Lane::from_tag(&caps[1]);
        let percent = caps[2].parse::<f64>().ok().filter(|p| (0.0..=100.0).contains(p));
        let eta = caps[3].parse::<f64>().ok().filter(|e| e.is_finite() && *e >= 0.0);
        match (lane, percent, eta) {
            (Some(lane), Some(percent), Some(eta_seconds)) => {
                return LineEvent::Progress {
                    lane,
                    percent,
                    eta_seconds,
                }
            }
            _ => {
                tracing::warn!(line = trimmed, "dropping malformed progress line");
                return diagnostic(trimmed);
            }
        }
    }

    if let Some(rest) = trimmed.strip_prefix(RESULT_SENTINEL) {
        return LineEvent::FinalResult {
            json: rest.trim().to_string(),
            source: ResultSource::Sentinel,
        };
    }

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return LineEvent::FinalResult {
            json: trimmed.to_string(),
            source: ResultSource::Heuristic,
        };
    }

    diagnostic(trimmed)
}

/// Stand-in for a line that exceeded `MAX_LINE_BYTES` and was discarded.
pub fn oversized_line(bytes: usize) -> LineEvent {
    LineEvent::Diagnostic {
        text: format!("discarded output line of {bytes} bytes (limit {MAX_LINE_BYTES})"),
        marker: None,
    }
}

fn diagnostic(text: &str) -> LineEvent {
    LineEvent::Diagnostic {
        text: text.to_string(),
        marker: fatal_marker(text),
    }
}

fn fatal_marker(text: &str) -> Option<FatalMarker> {
    if text.contains("ModuleNotFoundError")
        || text.contains("No module named")
        || text.contains("ImportError")
    {
        Some(FatalMarker::MissingDependency)
    } else if text.contains("Traceback") {
        Some(FatalMarker::CrashTrace)
    } else {
        None
    }
}

/// What the harness remembers about a worker's output stream.
#[derive(Debug, Default)]
pub struct StreamSummary {
    final_result: Option<(String, ResultSource)>,
    marker: Option<FatalMarker>,
    lines: usize,
}

impl StreamSummary {
    /// Fold one parsed line into the summary. The last result line wins, except
    /// that once a sentinel result has been seen, bare JSON lines no longer
    /// replace it.
    pub fn observe(&mut self, event: &LineEvent) {
        self.lines += 1;
        match event {
            LineEvent::FinalResult { json, source } => {
                let keep_sentinel = matches!(self.final_result, Some((_, ResultSource::Sentinel)))
                    && *source == ResultSource::Heuristic;
                if !keep_sentinel {
                    self.final_result = Some((json.clone(), *source));
                }
            }
            LineEvent::Diagnostic {
                marker: Some(m), ..
            } => {
                self.marker = self.marker.max(Some(*m));
            }
            _ => {}
        }
    }

    pub fn final_result(&self) -> Option<&str> {
        self.final_result.as_ref().map(|(json, _)| json.as_str())
    }

    pub fn marker(&self) -> Option<FatalMarker> {
        self.marker
    }

    pub fn lines(&self) -> usize {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line() {
        let ev = parse_line("[PROGRESS] GA: 42.5% completed, estimated 17.3s remaining");
        assert_eq!(
            ev,
            LineEvent::Progress {
                lane: Lane::Ga,
                percent: 42.5,
                eta_seconds: 17.3
            }
        );
    }

    #[test]
    fn parses_integer_progress_for_aco() {
        let ev = parse_line("  [PROGRESS] ACO: 7% completed, estimated 120s remaining  ");
        assert_eq!(
            ev,
            LineEvent::Progress {
                lane: Lane::Aco,
                percent: 7.0,
                eta_seconds: 120.0
            }
        );
    }

    #[test]
    fn malformed_progress_is_diagnostic() {
        for line in [
            "[PROGRESS] GA: abc% completed, estimated 3.0s remaining",
            "[PROGRESS] GA: 12.0% completed, estimated soons remaining",
            "[PROGRESS] GA: 140.0% completed, estimated 3.0s remaining",
            "[PROGRESS] PSO: 10.0% completed, estimated 3.0s remaining",
        ] {
            assert!(
                matches!(parse_line(line), LineEvent::Diagnostic { marker: None, .. }),
                "{line}"
            );
        }
    }

    #[test]
    fn bare_json_is_heuristic_result() {
        let ev = parse_line(r#"  {"total_profit": 1.0, "products": []}  "#);
        assert_eq!(
            ev,
            LineEvent::FinalResult {
                json: r#"{"total_profit": 1.0, "products": []}"#.into(),
                source: ResultSource::Heuristic
            }
        );
    }

    #[test]
    fn sentinel_result_is_recognized() {
        let ev = parse_line(r#"[RESULT] {"total_profit": 3}"#);
        assert_eq!(
            ev,
            LineEvent::FinalResult {
                json: r#"{"total_profit": 3}"#.into(),
                source: ResultSource::Sentinel
            }
        );
    }

    #[test]
    fn fatal_markers_are_classified() {
        assert!(matches!(
            parse_line("Traceback (most recent call last):"),
            LineEvent::Diagnostic {
                marker: Some(FatalMarker::CrashTrace),
                ..
            }
        ));
        assert!(matches!(
            parse_line("ModuleNotFoundError: No module named 'pandas'"),
            LineEvent::Diagnostic {
                marker: Some(FatalMarker::MissingDependency),
                ..
            }
        ));
        assert!(matches!(
            parse_line("INFO starting generation 4"),
            LineEvent::Diagnostic { marker: None, .. }
        ));
    }

    #[test]
    fn last_json_line_wins() {
        let mut summary = StreamSummary::default();
        for line in [
            r#"{"total_profit": 1}"#,
            "generation 10 done",
            r#"{"total_profit": 2}"#,
        ] {
            summary.observe(&parse_line(line));
        }
        assert_eq!(summary.final_result(), Some(r#"{"total_profit": 2}"#));
        assert_eq!(summary.lines(), 3);
    }

    #[test]
    fn sentinel_result_beats_later_bare_json() {
        let mut summary = StreamSummary::default();
        for line in [r#"[RESULT] {"total_profit": 5}"#, r#"{"debug": true}"#] {
            summary.observe(&parse_line(line));
        }
        assert_eq!(summary.final_result(), Some(r#"{"total_profit": 5}"#));
    }

    #[test]
    fn missing_dependency_outranks_crash_trace() {
        let mut summary = StreamSummary::default();
        for line in [
            "Traceback (most recent call last):",
            "ModuleNotFoundError: No module named 'numpy'",
        ] {
            summary.observe(&parse_line(line));
        }
        assert_eq!(summary.marker(), Some(FatalMarker::MissingDependency));
    }
}
