//! Server connection credentials, read from the `pgmoneta_users.conf`-style
//! file named by `config::resolve_users_path` (spec.md §6).
//!
//! The origin implementation stores passwords AES-encrypted under a master
//! key read from `$HOME/.pgmoneta/master.key` (mode 0600, parent dir
//! 0700). An AES file codec is an explicit Non-goal here, so this reads
//! plain `username:password` lines instead of decrypting anything — a
//! deliberate simplification of the origin's format, not a silent gap.

use camino::Utf8Path;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("line {0} is not in 'username:password' form")]
    MalformedLine(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parses `username:password` lines, one per line. Blank lines and lines
/// starting with `#` are skipped. A password may itself contain `:`; only
/// the first colon splits the line.
pub fn parse_users(text: &str) -> Result<BTreeMap<String, String>, CredentialsError> {
    let mut users = BTreeMap::new();
    for (i, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (user, password) = trimmed
            .split_once(':')
            .ok_or(CredentialsError::MalformedLine(i + 1))?;
        users.insert(user.to_string(), password.to_string());
    }
    Ok(users)
}

pub fn load_users(path: &Utf8Path) -> Result<BTreeMap<String, String>, CredentialsError> {
    let text = std::fs::read_to_string(path)?;
    parse_users(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_username_password_lines() {
        let text = "repl:s3cret\nfollower:other-pass\n";
        let users = parse_users(text).unwrap();
        assert_eq!(users.get("repl").map(String::as_str), Some("s3cret"));
        assert_eq!(users.get("follower").map(String::as_str), Some("other-pass"));
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let text = "# comment\n\nrepl:pw\n";
        let users = parse_users(text).unwrap();
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn password_may_contain_a_colon() {
        let text = "repl:pass:word\n";
        let users = parse_users(text).unwrap();
        assert_eq!(users.get("repl").map(String::as_str), Some("pass:word"));
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(parse_users("not-a-valid-line").is_err());
    }
}
