//! Profiling options from the environment.
//!
//! `IGPROF` holds a comma- or space-separated token list: profiler-mode
//! tokens (`perf:real`, `mem:overhead=none`, ...) plus the engine options
//! `igprof:out='<path>'` and `igprof:dump='<path>'`. Quoted values may
//! contain separators, so splitting has to respect quotes.

use std::sync::OnceLock;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Options {
    /// Output file, or `|command` for a pipe target.
    pub out: Option<String>,
    /// Path polled by the dump thread to trigger asynchronous dumps.
    pub dump: Option<String>,
    /// Clear all profile data in the child after `fork`.
    pub reset_on_fork: bool,
}

/// The raw `IGPROF` value, read once.
pub fn env_options() -> Option<&'static str> {
    static OPTIONS: OnceLock<Option<String>> = OnceLock::new();
    OPTIONS
        .get_or_init(|| std::env::var("IGPROF").ok())
        .as_deref()
}

fn split_tokens(options: &str) -> Vec<&str> {
    let bytes = options.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b',') {
            i += 1;
        }
        let start = i;
        let mut quoted = false;
        while i < bytes.len() && (quoted || (bytes[i] != b' ' && bytes[i] != b',')) {
            if bytes[i] == b'\'' {
                quoted = !quoted;
            }
            i += 1;
        }
        if i > start {
            tokens.push(&options[start..i]);
        }
    }
    tokens
}

fn quoted_value<'a>(token: &'a str, key: &str) -> Option<&'a str> {
    let rest = token.strip_prefix(key)?.strip_prefix('\'')?;
    Some(rest.strip_suffix('\'').unwrap_or(rest))
}

/// Extract the engine options; mode tokens are left for the modes to pick
/// up with [`find_token`].
pub fn parse(options: &str) -> Options {
    let mut parsed = Options::default();
    for token in split_tokens(options) {
        if let Some(value) = quoted_value(token, "igprof:out=") {
            parsed.out = Some(value.to_string());
        } else if let Some(value) = quoted_value(token, "igprof:dump=") {
            parsed.dump = Some(value.to_string());
        } else if token == "igprof:resetonfork" {
            parsed.reset_on_fork = true;
        }
    }
    parsed
}

/// Look for a mode token. Returns the token's suffix: empty for a bare
/// token, `":..."` when sub-options follow.
pub fn find_token<'a>(options: &'a str, name: &str) -> Option<&'a str> {
    for token in split_tokens(options) {
        if token == name {
            return Some("");
        }
        if let Some(rest) = token.strip_prefix(name) {
            if rest.starts_with(':') {
                return Some(rest);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_commas_and_spaces() {
        assert_eq!(split_tokens("perf, mem  fd"), vec!["perf", "mem", "fd"]);
        assert_eq!(split_tokens(""), Vec::<&str>::new());
    }

    #[test]
    fn quotes_protect_separators() {
        let tokens = split_tokens("mem,igprof:out='|gzip -c>out.gz',fd");
        assert_eq!(tokens, vec!["mem", "igprof:out='|gzip -c>out.gz'", "fd"]);
    }

    #[test]
    fn parses_out_and_dump() {
        let parsed = parse("perf:real,igprof:out='profile.gz',igprof:dump='/tmp/do-dump'");
        assert_eq!(parsed.out.as_deref(), Some("profile.gz"));
        assert_eq!(parsed.dump.as_deref(), Some("/tmp/do-dump"));
        assert!(!parsed.reset_on_fork);
    }

    #[test]
    fn parses_pipe_target_with_spaces() {
        let parsed = parse("mem igprof:out='|gzip -c>igprof.out.gz'");
        assert_eq!(parsed.out.as_deref(), Some("|gzip -c>igprof.out.gz"));
    }

    #[test]
    fn parses_reset_on_fork() {
        let parsed = parse("perf,igprof:resetonfork");
        assert!(parsed.reset_on_fork);
    }

    #[test]
    fn finds_mode_tokens_with_suffixes() {
        assert_eq!(find_token("perf:real,mem", "perf"), Some(":real"));
        assert_eq!(find_token("perf:real,mem", "mem"), Some(""));
        assert_eq!(find_token("perf:real,mem", "fd"), None);
        // A mode name inside an option value is not a token.
        assert_eq!(find_token("igprof:out='/tmp/mem.gz'", "mem"), None);
        // Prefixes do not match.
        assert_eq!(find_token("memfoo", "mem"), None);
    }
}
