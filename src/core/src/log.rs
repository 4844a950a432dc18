//! Container output: log lines, the on-disk record format and log driver settings.

use serde::{Deserialize, Deserializer, Serialize};

const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_FILE: u32 = 3;

/// Where container output is kept besides the in-memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogDriver {
    /// `container.json` with size-based rotation
    #[default]
    JsonFile,
    None,
}

impl LogDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonFile => "json-file",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for LogDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogDriver {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [Self::JsonFile, Self::None]
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown log driver '{}' (expected json-file or none)", s))
    }
}

/// Log driver settings.
///
/// `max-size` accepts a byte count or a size such as `"20m"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    pub driver: LogDriver,
    /// Bytes written to `container.json` before it rotates
    #[serde(deserialize_with = "size_or_bytes")]
    pub max_size: u64,
    /// Files kept, counting the live one's rotations
    pub max_file: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            driver: LogDriver::default(),
            max_size: DEFAULT_MAX_SIZE,
            max_file: DEFAULT_MAX_FILE,
        }
    }
}

impl LogConfig {
    /// Build from `--log-opt key=value` style pairs.
    pub fn from_options<'a>(
        driver: LogDriver,
        options: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> std::result::Result<Self, String> {
        let mut config = Self {
            driver,
            ..Default::default()
        };
        for (key, value) in options {
            match key {
                "max-size" => config.max_size = parse_size(value)?,
                "max-file" => {
                    config.max_file = value
                        .parse()
                        .map_err(|_| format!("invalid max-file '{}'", value))?
                }
                other => return Err(format!("unknown log option '{}'", other)),
            }
        }
        Ok(config)
    }
}

fn size_or_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

/// `"4096"`, `"512k"`, `"10mb"`, `"1g"` → bytes (binary multiples).
pub fn parse_size(input: &str) -> std::result::Result<u64, String> {
    let text = input.trim().to_ascii_lowercase();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    let multiplier: u64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        _ => return Err(format!("invalid size '{}'", input)),
    };
    let count: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", input))?;
    count
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", input))
}

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// One line of container output, without its newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStreamKind,
    pub line: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// A `container.json` record, as Docker's json-file driver writes them.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Line text with its newline restored
    pub log: String,
    pub stream: LogStreamKind,
    /// RFC 3339, nanoseconds, UTC
    pub time: String,
}

impl From<&LogLine> for LogEntry {
    fn from(line: &LogLine) -> Self {
        Self {
            log: format!("{}\n", line.line),
            stream: line.stream,
            time: line
                .time
                .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_names() {
        assert_eq!("json-file".parse::<LogDriver>().unwrap(), LogDriver::JsonFile);
        assert_eq!(LogDriver::None.to_string(), "none");
        assert!("journald".parse::<LogDriver>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.driver, LogDriver::JsonFile);
        assert_eq!(config.max_size, 10 * 1024 * 1024);
        assert_eq!(config.max_file, 3);
    }

    #[test]
    fn test_from_options() {
        let config =
            LogConfig::from_options(LogDriver::JsonFile, [("max-size", "50m"), ("max-file", "5")])
                .unwrap();
        assert_eq!(config.max_size, 50 * 1024 * 1024);
        assert_eq!(config.max_file, 5);

        assert!(LogConfig::from_options(LogDriver::JsonFile, [("mode", "fast")]).is_err());
        assert!(LogConfig::from_options(LogDriver::JsonFile, [("max-file", "x")]).is_err());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size(" 10MB ").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("m").is_err());
        assert!(parse_size("10x").is_err());
        assert!(parse_size("99999999999999g").is_err());
    }

    #[test]
    fn test_config_accepts_size_strings() {
        let config: LogConfig =
            serde_json::from_str(r#"{"driver":"none","max-size":"2k"}"#).unwrap();
        assert_eq!(config.driver, LogDriver::None);
        assert_eq!(config.max_size, 2048);
        assert_eq!(config.max_file, 3);

        let config: LogConfig = serde_json::from_str(r#"{"max-size":100}"#).unwrap();
        assert_eq!(config.max_size, 100);
    }

    #[test]
    fn test_entry_format() {
        let line = LogLine {
            stream: LogStreamKind::Stderr,
            line: "boom".to_string(),
            time: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&LogEntry::from(&line)).unwrap();
        assert!(json.starts_with(r#"{"log":"boom\n","stream":"stderr","time":""#));
    }
}
