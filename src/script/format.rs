//! Text form of a script: `render_script` and `parse_script`.
//!
//! `parse_script(&render_script(s)?)` reproduces the commands and autoplay
//! flag of `s` exactly. Commands whose names or parameter keys would not
//! survive that trip are refused by `render_script`.

use std::fs;
use std::path::Path;

use crate::error::{MergeError, Result};
use crate::script::{Script, ScriptCommand};
use crate::stage::{Params, StageId};

const HEADER: &str = "SCRIPT";
const AUTOPLAY: &str = "AUTOPLAY";
const HOLD: &str = "HOLD";

/// Render a script in its persisted form.
pub fn render_script(script: &Script) -> Result<String> {
    let mut out = String::new();
    out.push_str(HEADER);
    if script.autoplay {
        out.push(' ');
        out.push_str(AUTOPLAY);
    }
    out.push('\n');
    for (i, cmd) in script.commands().iter().enumerate() {
        if let Some((part, reason)) = unrepresentable(&cmd.target, &cmd.operation, &cmd.params) {
            return Err(MergeError::ScriptFormat {
                line: i + 2,
                reason: format!("command {cmd} cannot be written: {part}: {reason}"),
            });
        }
        out.push_str(&cmd.seq.to_string());
        if !cmd.eligible {
            out.push(' ');
            out.push_str(HOLD);
        }
        out.push(' ');
        out.push_str(cmd.target.name());
        out.push(' ');
        out.push_str(&cmd.operation);
        for (key, value) in &cmd.params {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value));
            out.push('"');
        }
        out.push('\n');
    }
    Ok(out)
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// The part of a command that has no text form, with the reason. Custom
/// names must be words that do not read back as a built-in stage or `HOLD`;
/// operations and parameter names must be single words without `=`.
pub(crate) fn unrepresentable(
    target: &StageId,
    operation: &str,
    params: &Params,
) -> Option<(String, String)> {
    if let StageId::Custom(name) = target {
        if name.is_empty() || !name.chars().all(is_word_char) {
            return Some((
                "command".to_string(),
                format!("'{name}' may only contain letters, digits, '_' and '-'"),
            ));
        }
        if StageId::parse(name).is_builtin() || name.eq_ignore_ascii_case(HOLD) {
            return Some(("command".to_string(), format!("'{name}' is a reserved word")));
        }
    }
    if operation.is_empty() || operation.contains(|c: char| c.is_whitespace() || c == '=') {
        return Some((
            "operation".to_string(),
            format!("'{operation}' must be one word without '='"),
        ));
    }
    params
        .keys()
        .find(|k| k.is_empty() || k.contains(|c: char| c.is_whitespace() || c == '=' || c == '"'))
        .map(|k| {
            (
                k.clone(),
                "parameter names must be one word without '=' or '\"'".to_string(),
            )
        })
}

/// Parse a script from its persisted form.
pub fn parse_script(text: &str) -> Result<Script> {
    let mut script = Script::new();
    let mut seen_command = false;

    for (line_num, line) in text.lines().enumerate() {
        let line_no = line_num + 1;
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let format_error = |reason: String| MergeError::ScriptFormat {
            line: line_no,
            reason,
        };

        let (first, rest) = split_word(line);
        if first.eq_ignore_ascii_case(HEADER) {
            if seen_command {
                return Err(format_error(
                    "SCRIPT must come before the first command".to_string(),
                ));
            }
            script.autoplay = match rest.trim() {
                "" => false,
                flag if flag.eq_ignore_ascii_case(AUTOPLAY) => true,
                other => return Err(format_error(format!("unknown SCRIPT flag '{other}'"))),
            };
            continue;
        }

        let command = parse_command(first, rest).map_err(format_error)?;
        script.push_numbered(command).map_err(format_error)?;
        seen_command = true;
    }

    Ok(script)
}

fn parse_command(seq_word: &str, rest: &str) -> std::result::Result<ScriptCommand, String> {
    let seq: u32 = seq_word
        .parse()
        .map_err(|_| format!("expected a sequence number, found '{seq_word}'"))?;

    let (word, mut rest) = split_word(rest);
    let (stage_word, eligible) = if word.eq_ignore_ascii_case(HOLD) {
        let (stage_word, after) = split_word(rest);
        rest = after;
        (stage_word, false)
    } else {
        (word, true)
    };
    if stage_word.is_empty() {
        return Err("missing stage identifier".to_string());
    }
    if !stage_word.chars().all(is_word_char) {
        return Err(format!("invalid stage identifier '{stage_word}'"));
    }

    let (operation, mut rest) = split_word(rest);
    if operation.is_empty() || operation.contains('=') {
        return Err(format!("missing operation after '{stage_word}'"));
    }

    let mut params = Params::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let Some(eq) = rest.find('=') else {
            return Err(format!("expected key=\"value\", found '{rest}'"));
        };
        let key = &rest[..eq];
        if key.is_empty() || key.contains(char::is_whitespace) || key.contains('"') {
            return Err(format!("invalid parameter name '{key}'"));
        }
        let (value, after) = parse_quoted_value(&rest[eq + 1..])
            .map_err(|e| format!("parameter '{key}': {e}"))?;
        if params.insert(key.to_string(), value).is_some() {
            return Err(format!("parameter '{key}' given twice"));
        }
        if !after.is_empty() && !after.starts_with(char::is_whitespace) {
            return Err(format!("missing space after parameter '{key}'"));
        }
        rest = after;
    }

    let mut command = ScriptCommand::new(StageId::parse(stage_word), operation, params);
    command.seq = seq;
    command.eligible = eligible;
    Ok(command)
}

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], &s[end..]),
        None => (s, ""),
    }
}

/// Parse a `"..."` value with `\"`, `\\`, `\n` and `\t` escapes. Returns the
/// value and the text after the closing quote.
fn parse_quoted_value(s: &str) -> std::result::Result<(String, &str), String> {
    let Some(body) = s.strip_prefix('"') else {
        return Err("value must be double-quoted".to_string());
    };
    let mut value = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &body[i + 1..])),
            '\\' => match chars.next() {
                Some((_, '"')) => value.push('"'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, other)) => return Err(format!("unknown escape '\\{other}'")),
                None => return Err("unterminated escape".to_string()),
            },
            _ => value.push(c),
        }
    }
    Err("unclosed quote".to_string())
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

impl Script {
    /// Read and parse a script file.
    pub fn load(path: &Path) -> Result<Script> {
        if !path.is_file() {
            return Err(MergeError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path).map_err(|e| MergeError::ScriptFormat {
            line: 0,
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let mut script = parse_script(&text)?;
        script.source = Some(path.to_path_buf());
        Ok(script)
    }

    /// Write the script to `path`, creating parent directories. Nothing is
    /// written when a command has no text form.
    pub fn save(&self, path: &Path) -> Result<()> {
        let unwritable = |e: std::io::Error| MergeError::DestinationUnwritable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let text = render_script(self)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(unwritable)?;
        }
        fs::write(path, text).map_err(unwritable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::params;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn sample() -> Script {
        let mut script = Script::new();
        script.autoplay = true;
        let commands = [
            ScriptCommand::new(
                StageId::Input,
                "open",
                params([("path", "people.tab"), ("delimiter", "tab")]),
            ),
            ScriptCommand::new(
                StageId::Filter,
                "apply",
                params([("expr", "dept = \"SALES\" and note contains 'a\\b'")]),
            ),
            ScriptCommand::new(
                StageId::Template,
                "merge",
                params([("text", "Dear {{first}},\n\tthanks"), ("unresolved", "raise")]),
            )
            .held(),
            ScriptCommand::new(StageId::Custom("NOTIFY".to_string()), "call", Params::new()),
        ];
        for command in commands {
            script.push(command).unwrap();
        }
        script
    }

    #[test]
    fn test_round_trip_preserves_commands_and_flags() {
        let script = sample();
        let text = render_script(&script).unwrap();
        let back = parse_script(&text).unwrap();
        assert!(back.same_content(&script));
        assert_eq!(render_script(&back).unwrap(), text);
    }

    #[test]
    fn test_parse_fixture() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("specs/sales_letters.script");
        let script = Script::load(&path).unwrap();
        assert!(script.autoplay);
        assert_eq!(script.len(), 5);
        assert_eq!(script.get(0).unwrap().target, StageId::Input);
        assert!(script.commands().iter().all(|c| c.eligible));
        assert_eq!(script.source.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_hold_and_custom() {
        let script = parse_script("1 HOLD sort apply keys=\"last\"\n2 NOTIFY call\n").unwrap();
        assert!(!script.autoplay);
        let sort = script.get(0).unwrap();
        assert!(!sort.eligible);
        assert_eq!(sort.target, StageId::Sort);
        assert_eq!(
            script.get(1).unwrap().target,
            StageId::Custom("NOTIFY".to_string())
        );
    }

    #[test]
    fn test_errors_name_the_line() {
        let cases = [
            ("1 INPUT open path=\"a\"\n\n1 SORT apply keys=\"b\"\n", 3),
            ("# c\nx INPUT open\n", 2),
            ("1 INPUT open path=a\n", 1),
            ("1 INPUT open path=\"a\n", 1),
            ("1 INPUT\n", 1),
            ("1 INPUT open\nSCRIPT\n", 2),
            ("SCRIPT LOUDLY\n", 1),
            ("1 INPUT open path=\"a\" path=\"b\"\n", 1),
            ("1 INPUT open path=\"\\q\"\n", 1),
            ("0 INPUT open\n", 1),
        ];
        for (text, line) in cases {
            match parse_script(text) {
                Err(MergeError::ScriptFormat { line: got, .. }) => {
                    assert_eq!(got, line, "wrong line for {text:?}")
                }
                other => panic!("Expected ScriptFormat for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/run.script");
        let script = sample();
        script.save(&path).unwrap();
        let loaded = Script::load(&path).unwrap();
        assert!(loaded.same_content(&script));
    }

    #[test]
    fn test_refuses_commands_without_text_form() {
        let dir = tempdir().unwrap();
        let unsavable = [
            (StageId::Custom("send mail".to_string()), "go", Params::new()),
            (StageId::Custom("Input".to_string()), "ping", Params::new()),
            (StageId::Custom("hold".to_string()), "ping", Params::new()),
            (StageId::Custom("NOTIFY".to_string()), "go to", Params::new()),
            (StageId::Custom("NOTIFY".to_string()), "go", params([("go to", "ops")])),
            (StageId::Custom("NOTIFY".to_string()), "go", params([("a=b", "c")])),
        ];
        for (target, operation, command_params) in unsavable {
            let mut script = sample();
            script
                .push(ScriptCommand::new(target, operation, command_params))
                .unwrap();
            assert!(matches!(
                render_script(&script),
                Err(MergeError::ScriptFormat { line: 6, .. })
            ));
            let path = dir.path().join("refused.script");
            assert!(script.save(&path).is_err());
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Script::load(&dir.path().join("none.script")),
            Err(MergeError::SourceNotFound { .. })
        ));
    }
}
