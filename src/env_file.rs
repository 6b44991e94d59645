//! `.env` loading for the `--env-file <path>` flag.
//!
//! Without the flag, `./.env` is read when present. Variables already set in
//! the process environment win over file values.

use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Parse CLI arguments (program name already skipped) and load the env file.
pub fn load_from_args<I>(args: I) -> Result<Option<LoadedEnvFile>, String>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let explicit = env_file_arg(args)?;
    let (path, explicit) = match explicit {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => (path, true),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };

    let contents =
        std::fs::read_to_string(&path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse(&contents).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // Single-threaded at this point: logging and workers start afterwards.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn env_file_arg<I>(args: I) -> Result<Option<PathBuf>, String>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let mut args = args.into_iter();
    let mut found: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let value = match arg.to_str() {
            Some("--env-file") => args.next().map(PathBuf::from),
            Some(s) if s.starts_with("--env-file=") => {
                Some(&s["--env-file=".len()..]).filter(|p| !p.is_empty()).map(PathBuf::from)
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        let value = value.ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
        if found.replace(value).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

/// `KEY=value` pairs in file order; errors carry the 1-based line number.
pub fn parse(contents: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| format!("{}: missing '=' in assignment", index + 1))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("{}: invalid variable name {:?}", index + 1, key));
        }
        let value = parse_value(raw.trim()).map_err(|e| format!("{}: {}", index + 1, e))?;
        pairs.push((key.to_string(), value));
    }
    Ok(pairs)
}

fn parse_value(raw: &str) -> Result<String, String> {
    let quote = match raw.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string()),
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => {
                let escaped = chars.next().ok_or("unterminated escape sequence")?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => {
                let rest = chars.as_str().trim();
                return if rest.is_empty() || rest.starts_with('#') {
                    Ok(value)
                } else {
                    Err("unexpected characters after closing quote".to_string())
                };
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn parses_assignments() {
        let contents = "\
# broker
export MQTT_HOST=broker.local
MQTT_PORT = 1884   # default is 1883
NOTIFY_URL=\"http://hooks.local/notify?a=1#frag\"
DEVICE_DISPLAY_NAME='Bathroom #2'
MESSAGE=\"line\\none\"
EMPTY=
";
        let pairs = parse(contents).expect("parse");
        assert_eq!(
            pairs,
            vec![
                ("MQTT_HOST".to_string(), "broker.local".to_string()),
                ("MQTT_PORT".to_string(), "1884".to_string()),
                ("NOTIFY_URL".to_string(), "http://hooks.local/notify?a=1#frag".to_string()),
                ("DEVICE_DISPLAY_NAME".to_string(), "Bathroom #2".to_string()),
                ("MESSAGE".to_string(), "line\none".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn reports_line_of_bad_assignment() {
        let err = parse("A=1\nnot an assignment\n").unwrap_err();
        assert!(err.starts_with("2:"), "{err}");
        assert!(parse("BAD KEY=1").is_err());
        assert!(parse("A=\"open").is_err());
        assert!(parse("A='x' trailing").is_err());
    }

    #[test]
    fn env_file_flag_forms() {
        assert_eq!(env_file_arg(args(&[])).expect("none"), None);
        assert_eq!(
            env_file_arg(args(&["--env-file", "prod.env"])).expect("spaced"),
            Some(PathBuf::from("prod.env"))
        );
        assert_eq!(
            env_file_arg(args(&["--env-file=dev.env", "--", "ignored"])).expect("inline"),
            Some(PathBuf::from("dev.env"))
        );
        assert!(env_file_arg(args(&["--env-file"])).is_err());
        assert!(env_file_arg(args(&["--env-file="])).is_err());
        assert!(env_file_arg(args(&["--env-file=a", "--env-file=b"])).is_err());
        assert!(env_file_arg(args(&["--verbose"])).is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_from_args(args(&["--env-file", "/nonexistent/humidity-outbox.env"])).unwrap_err();
        assert!(err.contains("env file not found"));
    }
}
