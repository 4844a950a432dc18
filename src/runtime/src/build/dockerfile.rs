//! Dockerfile parser.
//!
//! Parses a Dockerfile into a sequence of [`BuildInstruction`]s.
//! Supports line continuations (`\`), comments, and both shell and JSON
//! (exec) forms for CMD/ENTRYPOINT.

use dockyard_core::error::{EngineError, Result};
use dockyard_core::BuildInstruction;

/// Parsed Dockerfile: a list of instructions in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dockerfile {
    pub instructions: Vec<BuildInstruction>,
}

impl Dockerfile {
    /// Parse a Dockerfile from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let parsed = parse_instruction(trimmed, line_num)?;
            for instruction in &parsed {
                if matches!(instruction, BuildInstruction::SetBase { .. }) && !instructions.is_empty()
                {
                    return Err(parse_error(
                        line_num,
                        "FROM must be the first instruction (multi-stage builds are not supported)",
                    ));
                }
            }
            instructions.extend(parsed);
        }

        if instructions.is_empty() {
            return Err(parse_error(1, "Dockerfile contains no instructions"));
        }

        Ok(Dockerfile { instructions })
    }

    /// Parse a Dockerfile from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Other(format!(
                "failed to read Dockerfile at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn into_instructions(self) -> Vec<BuildInstruction> {
        self.instructions
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> EngineError {
    EngineError::ParseError {
        line,
        message: message.into(),
    }
}

/// Join lines ending with `\` into logical lines, keeping the number of
/// the physical line each one starts on.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 1;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        // Comments never continue, and are dropped inside a continuation
        if line.trim_start().starts_with('#') {
            if current.is_empty() {
                logical_lines.push((start, line.to_string()));
            }
            continue;
        }
        let line = if current.is_empty() { line } else { line.trim_start() };
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start, std::mem::take(&mut current)));
        }
    }

    // Handle trailing continuation without final line
    if !current.trim().is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Parse a single logical line.
///
/// Some lines expand to several instructions (`ENV A=1 B=2`,
/// `COPY a b /dst/`).
fn parse_instruction(line: &str, line_num: usize) -> Result<Vec<BuildInstruction>> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    if rest.is_empty() {
        return Err(parse_error(
            line_num,
            format!("{} requires an argument", keyword_upper),
        ));
    }

    match keyword_upper.as_str() {
        "FROM" => parse_from(rest, line_num).map(|i| vec![i]),
        "RUN" => parse_run(rest, line_num).map(|i| vec![i]),
        "COPY" => parse_copy(rest, line_num),
        "WORKDIR" => Ok(vec![BuildInstruction::SetWorkdir {
            path: unquote(rest),
        }]),
        "ENV" => parse_env(rest, line_num),
        "ENTRYPOINT" => Ok(vec![BuildInstruction::SetEntrypoint {
            command: parse_command(rest, line_num)?,
        }]),
        "CMD" => Ok(vec![BuildInstruction::SetCmd {
            command: parse_command(rest, line_num)?,
        }]),
        "EXPOSE" => parse_expose(rest, line_num),
        "LABEL" => parse_label(rest, line_num),
        _ => Err(parse_error(
            line_num,
            format!("unknown instruction '{}'", keyword),
        )),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<BuildInstruction> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        [image] => Ok(BuildInstruction::SetBase {
            image: image.to_string(),
        }),
        // The stage alias has no meaning without multi-stage support
        [image, as_kw, _alias] if as_kw.eq_ignore_ascii_case("AS") => {
            Ok(BuildInstruction::SetBase {
                image: image.to_string(),
            })
        }
        _ => Err(parse_error(line_num, format!("invalid FROM '{}'", rest))),
    }
}

fn parse_run(rest: &str, line_num: usize) -> Result<BuildInstruction> {
    // If JSON array form, extract and join
    let command = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?.join(" ")
    } else {
        rest.to_string()
    };

    Ok(BuildInstruction::RunCommand { command })
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Vec<BuildInstruction>> {
    if rest.starts_with("--") {
        let (flag, _) = split_first_word(rest);
        return Err(parse_error(
            line_num,
            format!("unsupported COPY flag '{}'", flag),
        ));
    }

    // JSON form: COPY ["src", "dst"]
    let parts = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?
    } else {
        split_words(rest, line_num)?
    };

    let Some((dst, sources)) = parts.split_last() else {
        return Err(parse_error(line_num, "COPY requires a source and a destination"));
    };
    if sources.is_empty() {
        return Err(parse_error(line_num, "COPY requires a source and a destination"));
    }

    // Several sources always land inside the destination directory
    let dst = if sources.len() > 1 && !dst.ends_with('/') {
        format!("{}/", dst)
    } else {
        dst.clone()
    };

    Ok(sources
        .iter()
        .map(|src| BuildInstruction::CopyFiles {
            src: src.clone(),
            dst: dst.clone(),
        })
        .collect())
}

fn parse_env(rest: &str, line_num: usize) -> Result<Vec<BuildInstruction>> {
    // Two forms:
    // ENV KEY=VALUE [KEY=VALUE ...]  (values may be quoted)
    // ENV KEY VALUE
    let (first, remainder) = split_first_word(rest);
    if !first.contains('=') {
        return Ok(vec![BuildInstruction::SetEnv {
            key: first.to_string(),
            value: unquote(remainder),
        }]);
    }

    parse_pairs(rest, line_num, "ENV")?
        .into_iter()
        .map(|(key, value)| Ok(BuildInstruction::SetEnv { key, value }))
        .collect()
}

fn parse_label(rest: &str, line_num: usize) -> Result<Vec<BuildInstruction>> {
    let (first, remainder) = split_first_word(rest);
    if !first.contains('=') {
        // LABEL key value (legacy)
        return Ok(vec![BuildInstruction::SetLabel {
            key: unquote(first),
            value: unquote(remainder),
        }]);
    }

    Ok(parse_pairs(rest, line_num, "LABEL")?
        .into_iter()
        .map(|(key, value)| BuildInstruction::SetLabel { key, value })
        .collect())
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Vec<BuildInstruction>> {
    rest.split_whitespace()
        .map(|spec| {
            let port = spec.split('/').next().unwrap_or(spec);
            port.parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .map(|port| BuildInstruction::ExposePort { port })
                .ok_or_else(|| parse_error(line_num, format!("invalid port '{}'", spec)))
        })
        .collect()
}

/// ENTRYPOINT/CMD argument: JSON exec form, or shell form wrapped in `sh -c`.
fn parse_command(rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        Ok(vec!["/bin/sh".to_string(), "-c".to_string(), rest.to_string()])
    }
}

// --- Helpers ---

/// Parse `k=v k2="v 2"` into pairs.
fn parse_pairs(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<(String, String)>> {
    split_words(rest, line_num)?
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(parse_error(
                line_num,
                format!("{} expects key=value, got '{}'", keyword, word),
            )),
        })
        .collect()
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| parse_error(line_num, format!("invalid JSON array '{}': {}", s, e)))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Whitespace split that honours single quotes, double quotes and
/// backslash escapes. Quotes are removed from the result.
fn split_words(s: &str, line_num: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(parse_error(line_num, "unterminated quote"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- join_continuation_lines ---

    #[test]
    fn test_join_continuation_simple() {
        let input = "RUN apt-get update && \\\n    apt-get install -y curl";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 1);
        assert!(lines[0].1.contains("apt-get update"));
        assert!(lines[0].1.contains("apt-get install"));
    }

    #[test]
    fn test_join_continuation_tracks_line_numbers() {
        let input = "FROM scratch\n\nRUN a \\\n    b\nCMD c";
        let lines = join_continuation_lines(input);
        let numbers: Vec<usize> = lines.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3, 5]);
    }

    #[test]
    fn test_join_continuation_skips_inner_comments() {
        let input = "RUN a \\\n# note\n    b";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].1.contains("note"));
    }

    // --- full documents ---

    #[test]
    fn test_parse_full_dockerfile() {
        let content = r#"
# Build a tiny app
FROM base:1.0
WORKDIR /app
COPY app.py /app/
ENV MODE=prod LEVEL="two words"
RUN echo hello > greeting.txt && \
    chmod 600 greeting.txt
EXPOSE 8080/tcp 9090
LABEL maintainer="ops team"
ENTRYPOINT ["python3", "app.py"]
CMD --verbose
"#;
        let df = Dockerfile::parse(content).unwrap();
        assert_eq!(
            df.instructions,
            vec![
                BuildInstruction::SetBase {
                    image: "base:1.0".to_string()
                },
                BuildInstruction::SetWorkdir {
                    path: "/app".to_string()
                },
                BuildInstruction::CopyFiles {
                    src: "app.py".to_string(),
                    dst: "/app/".to_string()
                },
                BuildInstruction::SetEnv {
                    key: "MODE".to_string(),
                    value: "prod".to_string()
                },
                BuildInstruction::SetEnv {
                    key: "LEVEL".to_string(),
                    value: "two words".to_string()
                },
                BuildInstruction::RunCommand {
                    command: "echo hello > greeting.txt && chmod 600 greeting.txt".to_string()
                },
                BuildInstruction::ExposePort { port: 8080 },
                BuildInstruction::ExposePort { port: 9090 },
                BuildInstruction::SetLabel {
                    key: "maintainer".to_string(),
                    value: "ops team".to_string()
                },
                BuildInstruction::SetEntrypoint {
                    command: vec!["python3".to_string(), "app.py".to_string()]
                },
                BuildInstruction::SetCmd {
                    command: vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        "--verbose".to_string()
                    ]
                },
            ]
        );
    }

    #[test]
    fn test_parse_without_from_starts_from_scratch() {
        let df = Dockerfile::parse("COPY a.txt /a.txt\n").unwrap();
        assert_eq!(df.instructions.len(), 1);
    }

    #[test]
    fn test_parse_unknown_instruction_reports_line() {
        let err = Dockerfile::parse("FROM scratch\n\nFROBNICATE now\n").unwrap_err();
        match err {
            EngineError::ParseError { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("FROBNICATE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_late_from_rejected() {
        let err = Dockerfile::parse("RUN true\nFROM base\n").unwrap_err();
        assert!(matches!(err, EngineError::ParseError { line: 2, .. }));
    }

    #[test]
    fn test_parse_empty() {
        assert!(Dockerfile::parse("# only a comment\n\n").is_err());
    }

    // --- individual parsers ---

    #[test]
    fn test_parse_from_with_alias() {
        assert_eq!(
            parse_from("golang:1.21 AS builder", 1).unwrap(),
            BuildInstruction::SetBase {
                image: "golang:1.21".to_string()
            }
        );
        assert!(parse_from("a b", 1).is_err());
    }

    #[test]
    fn test_parse_run_json() {
        assert_eq!(
            parse_run(r#"["echo", "hello"]"#, 1).unwrap(),
            BuildInstruction::RunCommand {
                command: "echo hello".to_string()
            }
        );
    }

    #[test]
    fn test_parse_copy_multiple_sources() {
        let result = parse_copy("file1.txt file2.txt /dest", 1).unwrap();
        assert_eq!(
            result,
            vec![
                BuildInstruction::CopyFiles {
                    src: "file1.txt".to_string(),
                    dst: "/dest/".to_string()
                },
                BuildInstruction::CopyFiles {
                    src: "file2.txt".to_string(),
                    dst: "/dest/".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_copy_rejects_flags_and_missing_dst() {
        assert!(parse_copy("--from=builder /a /b", 1).is_err());
        assert!(parse_copy("only-source", 1).is_err());
    }

    #[test]
    fn test_parse_env_legacy_form() {
        assert_eq!(
            parse_env("PATH /usr/bin:/bin", 1).unwrap(),
            vec![BuildInstruction::SetEnv {
                key: "PATH".to_string(),
                value: "/usr/bin:/bin".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_expose_invalid() {
        assert!(parse_expose("http", 1).is_err());
        assert!(parse_expose("0", 1).is_err());
        assert!(parse_expose("70000", 1).is_err());
    }

    #[test]
    fn test_parse_command_invalid_json() {
        assert!(parse_command(r#"["unterminated"#, 4).is_err());
    }

    #[test]
    fn test_split_words_quotes() {
        assert_eq!(
            split_words(r#"a "b c" 'd e' f\ g"#, 1).unwrap(),
            vec!["a", "b c", "d e", "f g"]
        );
        assert!(split_words(r#"a "b"#, 1).is_err());
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
