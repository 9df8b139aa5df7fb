//! Credential storage
//!
//! One password file per user directory, written at registration and
//! compared literally at login. The on-disk format (password + newline,
//! cleartext) is part of the persisted layout and must not change.

use crate::error::Result;
use std::path::Path;
use tokio::fs;

/// Password file inside each user directory.
pub const PASSWORD_FILE: &str = ".PASSWORD";

/// Write the password file for a freshly registered user.
pub async fn write_password(user_dir: &Path, password: &str) -> Result<()> {
    let mut contents = String::with_capacity(password.len() + 1);
    contents.push_str(password);
    contents.push('\n');
    fs::write(user_dir.join(PASSWORD_FILE), contents).await?;
    Ok(())
}

/// Compare `presented` against the stored password: first line only,
/// trailing `\r`/`\n` stripped from both sides, byte-exact.
pub async fn verify_password(user_dir: &Path, presented: &str) -> Result<bool> {
    let contents = fs::read_to_string(user_dir.join(PASSWORD_FILE)).await?;
    let stored = contents
        .lines()
        .next()
        .unwrap_or_default()
        .trim_end_matches(['\r', '\n']);
    Ok(stored.as_bytes() == presented.trim_end_matches(['\r', '\n']).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stored_and_presented_passwords_compare_literally() {
        let dir = tempfile::tempdir().unwrap();
        write_password(dir.path(), "pw1").await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join(PASSWORD_FILE)).unwrap(),
            "pw1\n"
        );
        assert!(verify_password(dir.path(), "pw1").await.unwrap());
        assert!(verify_password(dir.path(), "pw1\n").await.unwrap());
        assert!(verify_password(dir.path(), "pw1\r\n").await.unwrap());
        assert!(!verify_password(dir.path(), "pw2").await.unwrap());
        assert!(!verify_password(dir.path(), "PW1").await.unwrap());
    }

    #[tokio::test]
    async fn only_the_first_line_counts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PASSWORD_FILE), "pw1\ntrailing junk\n").unwrap();

        assert!(verify_password(dir.path(), "pw1").await.unwrap());
        assert!(!verify_password(dir.path(), "pw1\ntrailing junk").await.unwrap());
    }
}
