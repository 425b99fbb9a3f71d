//! Dockerfile parser.
//!
//! Only the parts of a Dockerfile that decide which images a build pulls are
//! kept: stage starts (`FROM`), argument declarations (`ARG`) and
//! `COPY --from` sources. Every other instruction is carried as an opaque
//! keyword so stage boundaries and line numbers stay intact.

use crate::error::{Result, ScanError};

/// Default escape character, changed by the `# escape=` parser directive.
pub const DEFAULT_ESCAPE: char = '\\';

/// A parsed build definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    /// Escape character in effect (`\` or `` ` ``)
    pub escape: char,
    pub instructions: Vec<Instruction>,
}

/// One logical line of the definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// 1-based line where the logical line starts
    pub line: usize,
    pub kind: InstructionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    /// FROM [--platform=<platform>] <image> [AS <name>]
    StageStart {
        image: String,
        name: Option<String>,
        platform: Option<String>,
    },

    /// ARG <name>[=<default>]
    Arg {
        name: String,
        default: Option<String>,
    },

    /// COPY --from=<stage|index|image> ...
    CopyFrom { source: String },

    /// Anything else; irrelevant to dependency analysis.
    Other { keyword: String },
}

/// A logical line after continuation joining.
struct LogicalLine {
    line: usize,
    text: String,
}

/// Parses Dockerfile text into its instructions.
///
/// Fails on an empty file, an unterminated line continuation, a malformed
/// `FROM`/`ARG`, a duplicate stage name, or an instruction other than `ARG`
/// before the first `FROM`.
pub fn parse(content: &str) -> Result<Definition> {
    let (escape, first_line) = read_directives(content)?;
    let lines = join_lines(content, escape, first_line)?;

    if lines.is_empty() {
        return Err(ScanError::syntax(1, "build definition is empty"));
    }

    let mut instructions = Vec::new();
    let mut stage_names: Vec<String> = Vec::new();
    let mut stages = 0usize;

    for LogicalLine { line, text } in lines {
        let (keyword, rest) = split_first_word(&text);
        let keyword = keyword.to_ascii_uppercase();

        match keyword.as_str() {
            "FROM" => {
                let kind = parse_from(rest, line)?;
                if let InstructionKind::StageStart { name: Some(name), .. } = &kind {
                    let lowered = name.to_ascii_lowercase();
                    if stage_names.contains(&lowered) {
                        return Err(ScanError::syntax(
                            line,
                            format!("duplicate stage name '{name}'"),
                        ));
                    }
                    stage_names.push(lowered);
                }
                stages += 1;
                instructions.push(Instruction { line, kind });
            }
            "ARG" => {
                for (name, default) in parse_arg(rest, line)? {
                    instructions.push(Instruction {
                        line,
                        kind: InstructionKind::Arg { name, default },
                    });
                }
            }
            _ if stages == 0 => {
                return Err(ScanError::syntax(
                    line,
                    format!("expected ARG or FROM, found {keyword}"),
                ));
            }
            "COPY" => {
                let kind = match copy_from(rest, line)? {
                    Some(source) => InstructionKind::CopyFrom { source },
                    None => InstructionKind::Other { keyword },
                };
                instructions.push(Instruction { line, kind });
            }
            _ => instructions.push(Instruction {
                line,
                kind: InstructionKind::Other { keyword },
            }),
        }
    }

    if stages == 0 {
        let line = instructions.last().map(|i| i.line).unwrap_or(1);
        return Err(ScanError::syntax(
            line,
            "build definition has no FROM instruction",
        ));
    }

    Ok(Definition {
        escape,
        instructions,
    })
}

/// Reads leading parser directives. Returns the escape character and the
/// 0-based index of the first line after the directives.
fn read_directives(content: &str) -> Result<(char, usize)> {
    let mut escape = DEFAULT_ESCAPE;

    for (idx, raw) in content.lines().enumerate() {
        let Some(body) = raw.trim().strip_prefix('#') else {
            return Ok((escape, idx));
        };
        let Some((key, value)) = body.split_once('=') else {
            return Ok((escape, idx));
        };

        match key.trim().to_ascii_lowercase().as_str() {
            "escape" => {
                escape = match value.trim() {
                    "\\" => '\\',
                    "`" => '`',
                    other => {
                        return Err(ScanError::syntax(
                            idx + 1,
                            format!("invalid escape directive '{other}', expected \\ or `"),
                        ));
                    }
                };
            }
            "syntax" | "check" => {}
            _ => return Ok((escape, idx)),
        }
    }

    Ok((escape, content.lines().count()))
}

/// Joins continuation lines and drops comments, blank lines and heredoc
/// bodies.
fn join_lines(content: &str, escape: char, first_line: usize) -> Result<Vec<LogicalLine>> {
    let mut logical = Vec::new();
    let mut current: Option<(usize, String)> = None;
    // Terminators still owed by the last instruction, and where it started.
    let mut heredocs: Vec<Heredoc> = Vec::new();
    let mut heredoc_line = 0;

    for (idx, raw) in content.lines().enumerate().skip(first_line) {
        if let Some(open) = heredocs.first() {
            if open.closes_at(raw) {
                heredocs.remove(0);
            }
            continue;
        }

        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let body = raw.trim_end();
        let (body, continues) = match body.strip_suffix(escape) {
            Some(body) => (body, true),
            None => (body, false),
        };

        match current.as_mut() {
            Some((_, text)) => {
                let body = body.trim();
                if !body.is_empty() {
                    text.push(' ');
                    text.push_str(body);
                }
            }
            None => current = Some((idx + 1, body.trim().to_string())),
        }

        if !continues {
            if let Some((line, text)) = current.take() {
                if !text.is_empty() {
                    heredocs = heredoc_terminators(&text);
                    heredoc_line = line;
                    logical.push(LogicalLine { line, text });
                }
            }
        }
    }

    if let Some((line, _)) = current {
        return Err(ScanError::syntax(line, "unterminated line continuation"));
    }
    if let Some(open) = heredocs.first() {
        return Err(ScanError::syntax(
            heredoc_line,
            format!("heredoc is missing its '{}' terminator", open.word),
        ));
    }

    Ok(logical)
}

/// A `<<WORD` heredoc opened by `RUN`, `COPY` or `ADD`.
#[derive(Debug, PartialEq)]
struct Heredoc {
    word: String,
    /// `<<-WORD` strips leading tabs before matching the terminator
    strip_tabs: bool,
}

impl Heredoc {
    fn closes_at(&self, raw: &str) -> bool {
        let raw = raw.trim_end_matches('\r');
        let raw = if self.strip_tabs {
            raw.trim_start_matches('\t')
        } else {
            raw
        };
        raw == self.word
    }
}

/// Heredocs opened by `text`, in the order their bodies follow.
fn heredoc_terminators(text: &str) -> Vec<Heredoc> {
    let (keyword, _) = split_first_word(text);
    if !matches!(keyword.to_ascii_uppercase().as_str(), "RUN" | "COPY" | "ADD") {
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("<<") {
        let after = &rest[pos + 2..];
        // `<<<` is a shell here-string, not a heredoc.
        if after.starts_with('<') {
            rest = after.trim_start_matches('<');
            continue;
        }

        let (strip_tabs, after) = match after.strip_prefix('-') {
            Some(after) => (true, after),
            None => (false, after),
        };
        let (quote, after) = match after.chars().next() {
            Some(q @ ('"' | '\'')) => (Some(q), &after[1..]),
            _ => (None, after),
        };
        let end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let word = &after[..end];
        let closed = quote.is_none_or(|q| after[end..].starts_with(q));

        if !word.is_empty() && closed {
            found.push(Heredoc {
                word: word.to_string(),
                strip_tabs,
            });
        }
        rest = &after[end..];
    }
    found
}

fn parse_from(rest: &str, line: usize) -> Result<InstructionKind> {
    let mut tokens = rest.split_whitespace().peekable();
    let mut platform = None;

    while let Some(flag) = tokens.next_if(|t| t.starts_with("--")) {
        match flag.strip_prefix("--platform=") {
            Some(value) if !value.is_empty() => platform = Some(value.to_string()),
            _ => {
                return Err(ScanError::syntax(
                    line,
                    format!("unsupported FROM flag '{flag}'"),
                ));
            }
        }
    }

    let image = tokens.next().ok_or_else(|| {
        ScanError::syntax(line, "FROM requires an image reference: FROM <image> [AS <name>]")
    })?;

    let name = match tokens.next() {
        None => None,
        Some(kw) if kw.eq_ignore_ascii_case("AS") => {
            let name = tokens
                .next()
                .ok_or_else(|| ScanError::syntax(line, "FROM ... AS requires a stage name"))?;
            if !is_valid_stage_name(name) {
                return Err(ScanError::syntax(
                    line,
                    format!("invalid stage name '{name}'"),
                ));
            }
            Some(name.to_string())
        }
        Some(other) => {
            return Err(ScanError::syntax(
                line,
                format!("unexpected '{other}' after FROM image, expected AS <name>"),
            ));
        }
    };

    if let Some(extra) = tokens.next() {
        return Err(ScanError::syntax(
            line,
            format!("unexpected '{extra}' after stage name"),
        ));
    }

    Ok(InstructionKind::StageStart {
        image: unquote(image),
        name,
        platform,
    })
}

fn parse_arg(rest: &str, line: usize) -> Result<Vec<(String, Option<String>)>> {
    let words = split_words(rest);
    if words.is_empty() {
        return Err(ScanError::syntax(line, "ARG requires a name: ARG <name>[=<default>]"));
    }

    words
        .into_iter()
        .map(|word| {
            let (name, default) = match word.split_once('=') {
                Some((name, default)) => (name, Some(unquote(default))),
                None => (word.as_str(), None),
            };
            if !is_valid_arg_name(name) {
                return Err(ScanError::syntax(
                    line,
                    format!("invalid ARG name '{name}'"),
                ));
            }
            Ok((name.to_string(), default))
        })
        .collect()
}

/// Returns the `--from` value of a COPY, if any.
fn copy_from(rest: &str, line: usize) -> Result<Option<String>> {
    for word in rest.split_whitespace() {
        if !word.starts_with("--") {
            break;
        }
        if let Some(source) = word.strip_prefix("--from=") {
            if source.is_empty() {
                return Err(ScanError::syntax(line, "COPY --from requires a value"));
            }
            return Ok(Some(unquote(source)));
        }
    }
    Ok(None)
}

// --- Helpers ---

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Whitespace split that keeps quoted sections together.
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        words.push(current);
    }
    words
}

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

fn is_valid_stage_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub(crate) fn is_valid_arg_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
