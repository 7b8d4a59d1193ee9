//! Classification of snapshot tool output lines.

use serde::Deserialize;

/// A tool output line, ready for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Info(String),
    Error(String),
}

/// The parts of the `snapshot create --json` summary we report on.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotSummary {
    root_entry: RootEntry,
}

#[derive(Debug, Deserialize)]
struct RootEntry {
    summ: EntrySummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntrySummary {
    #[serde(default)]
    num_failed: u64,
}

pub struct OutputParser;

impl OutputParser {
    pub fn parse(line: &str) -> OutputLine {
        let text = if line.contains("hashing") {
            // Progress lines start with a carriage return
            drop_first_char(line).to_string()
        } else if let Ok(summary) = serde_json::from_str::<SnapshotSummary>(line) {
            format!(
                "backup finished with {} errors",
                summary.root_entry.summ.num_failed
            )
        } else {
            line.to_string()
        };

        if text.contains("ERROR") {
            OutputLine::Error(text)
        } else {
            OutputLine::Info(text)
        }
    }
}

fn drop_first_char(line: &str) -> &str {
    let mut chars = line.chars();
    chars.next();
    chars.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_lose_leading_carriage_return() {
        assert_eq!(
            OutputParser::parse("\r | 2 hashing, 10 hashed (1.2 MB)"),
            OutputLine::Info(" | 2 hashing, 10 hashed (1.2 MB)".to_string())
        );
    }

    #[test]
    fn summary_json_is_condensed() {
        let summary = r#"{"id":"k1a2","source":{"host":"shop","userName":"backup-controller","path":"/data/pgdata"},"description":"","startTime":"2024-05-01T12:00:00Z","endTime":"2024-05-01T12:01:00Z","rootEntry":{"name":"pgdata","type":"d","summ":{"size":1024,"files":3,"numFailed":2,"errors":[]}}}"#;
        assert_eq!(
            OutputParser::parse(summary),
            OutputLine::Info("backup finished with 2 errors".to_string())
        );
    }

    #[test]
    fn error_lines_are_errors() {
        assert_eq!(
            OutputParser::parse("ERROR unable to open repository"),
            OutputLine::Error("ERROR unable to open repository".to_string())
        );
    }

    #[test]
    fn other_json_passes_through() {
        let line = r#"{"level":"info"}"#;
        assert_eq!(OutputParser::parse(line), OutputLine::Info(line.to_string()));
    }

    #[test]
    fn empty_line_is_info() {
        assert_eq!(OutputParser::parse(""), OutputLine::Info(String::new()));
    }
}
