//! On-disk mailbox store
//!
//! Each registered user owns one directory, `<username>_user`, created
//! with owner-only permissions. A message is one file inside it: the
//! fixed 132-byte header followed by the body. Unread state is encoded
//! in the filename itself: delivery writes `UNREAD<timestamp>[<n>].pgm`
//! and the first successful fetch strips the `UNREAD` prefix with a
//! rename. The rename is one-way; no file is ever both.
//!
//! Delivery relies on the filesystem's exclusive-create as the only
//! serialisation between concurrent senders: two deliveries in the same
//! second race on the plain timestamp name, and the loser retries with a
//! decimal counter appended.

use crate::credentials;
use crate::error::{Error, Result};
use crate::wire::{MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE, MessageHeader};
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Suffix turning a username into its mailbox directory name.
pub const FOLDER_SUFFIX: &str = "_user";

/// Filename prefix marking a message as not yet fetched.
pub const UNREAD_PREFIX: &str = "UNREAD";

/// Extension shared by every stored message.
pub const MESSAGE_SUFFIX: &str = ".pgm";

/// Per-user bookkeeping file, written at registration and never read back.
const DATA_FILE: &str = ".DATA";

/// How many counter suffixes delivery tries after a same-second collision.
const MAX_DELIVERY_RETRIES: u32 = 999;

/// Mailbox store rooted at the server's data directory.
#[derive(Debug, Clone)]
pub struct MailboxStore {
    root: PathBuf,
}

impl MailboxStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The mailbox directory for `username`, after sanitization.
    fn user_dir(&self, username: &str) -> Result<PathBuf> {
        validate_username(username)?;
        Ok(self.root.join(format!("{username}{FOLDER_SUFFIX}")))
    }

    /// Whether `username` is registered (its directory exists).
    pub async fn user_exists(&self, username: &str) -> Result<bool> {
        let dir = self.user_dir(username)?;
        match fs::metadata(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Register `username`: create the mailbox directory (owner-only),
    /// store the password, and seed the bookkeeping file.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<()> {
        let dir = self.user_dir(username)?;

        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        match builder.create(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let meta = fs::metadata(&dir).await?;
                if !meta.is_dir() {
                    return Err(Error::Mailbox(format!(
                        "{} exists and is not a directory",
                        dir.display()
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }

        credentials::write_password(&dir, password).await?;
        fs::write(dir.join(DATA_FILE), b"0\n").await?;
        debug!("registered user {username}");
        Ok(())
    }

    /// Compare `presented` against the stored password for `username`.
    pub async fn verify_password(&self, username: &str, presented: &str) -> Result<bool> {
        let dir = self.user_dir(username)?;
        credentials::verify_password(&dir, presented).await
    }

    /// Store one message for `recipient`. Returns the filename the
    /// message was delivered under.
    pub async fn deliver(&self, sender: &str, recipient: &str, body: &[u8]) -> Result<String> {
        let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        self.deliver_with_stamp(sender, recipient, body, &stamp)
            .await
    }

    async fn deliver_with_stamp(
        &self,
        sender: &str,
        recipient: &str,
        body: &[u8],
        stamp: &str,
    ) -> Result<String> {
        let dir = self.user_dir(recipient)?;
        let length = u32::try_from(body.len()).unwrap_or(u32::MAX);
        if length == 0 || length > MAX_MESSAGE_SIZE {
            return Err(Error::Mailbox(format!(
                "invalid body length {} for {recipient}",
                body.len()
            )));
        }
        let header = MessageHeader::new(sender, recipient, length);

        for attempt in 0..=MAX_DELIVERY_RETRIES {
            let name = if attempt == 0 {
                format!("{UNREAD_PREFIX}{stamp}{MESSAGE_SUFFIX}")
            } else {
                format!("{UNREAD_PREFIX}{stamp}{attempt}{MESSAGE_SUFFIX}")
            };
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dir.join(&name))
                .await
            {
                Ok(mut file) => {
                    file.write_all(&header.encode()).await?;
                    file.write_all(body).await?;
                    debug!("delivered {name} to {recipient}");
                    return Ok(name);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Mailbox(format!(
            "no free message filename for {recipient} at {stamp}"
        )))
    }

    /// Enumerate the mailbox of `username`, newest first (descending
    /// lexicographic order, which the timestamp naming makes equivalent).
    pub async fn list_messages(&self, username: &str, only_unread: bool) -> Result<Vec<String>> {
        let dir = self.user_dir(username)?;
        let mut entries = fs::read_dir(&dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == credentials::PASSWORD_FILE || name == DATA_FILE {
                continue;
            }
            if !name.ends_with(MESSAGE_SUFFIX) {
                continue;
            }
            if only_unread && !is_unread(&name) {
                continue;
            }
            names.push(name);
        }

        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Read one stored message: header plus body.
    pub async fn fetch(&self, username: &str, filename: &str) -> Result<(MessageHeader, Vec<u8>)> {
        let dir = self.user_dir(username)?;
        validate_filename(filename)?;

        let mut file = match fs::File::open(dir.join(filename)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MessageNotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let mut header_buf = [0u8; MESSAGE_HEADER_SIZE];
        file.read_exact(&mut header_buf)
            .await
            .map_err(|_| Error::Mailbox(format!("{filename}: truncated header")))?;
        let header = MessageHeader::decode(&header_buf);

        if header.length == 0 || header.length > MAX_MESSAGE_SIZE {
            return Err(Error::Mailbox(format!(
                "{filename}: invalid body length {}",
                header.length
            )));
        }

        let mut body = vec![0u8; header.length as usize];
        file.read_exact(&mut body)
            .await
            .map_err(|_| Error::Mailbox(format!("{filename}: truncated body")))?;

        Ok((header, body))
    }

    /// Strip the `UNREAD` prefix from a fetched message. Returns the new
    /// filename; a no-op for names that are already read.
    pub async fn promote(&self, username: &str, filename: &str) -> Result<String> {
        let dir = self.user_dir(username)?;
        validate_filename(filename)?;

        let Some(promoted) = filename.strip_prefix(UNREAD_PREFIX) else {
            return Ok(filename.to_string());
        };
        fs::rename(dir.join(filename), dir.join(promoted)).await?;
        Ok(promoted.to_string())
    }

    /// Unlink one stored message.
    pub async fn delete(&self, username: &str, filename: &str) -> Result<()> {
        let dir = self.user_dir(username)?;
        validate_filename(filename)?;

        match fs::remove_file(dir.join(filename)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::MessageNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate registered usernames: directories under the root ending
    /// in the mailbox suffix, suffix stripped, ascending order.
    pub async fn list_users(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(user) = name.strip_suffix(FOLDER_SUFFIX) {
                if !user.is_empty() {
                    names.push(user.to_string());
                }
            }
        }

        names.sort_unstable();
        Ok(names)
    }
}

/// Whether a message filename still carries the unread flag.
#[must_use]
pub fn is_unread(filename: &str) -> bool {
    filename.starts_with(UNREAD_PREFIX)
}

/// Render a listing as its wire payload: each name followed by `\n`,
/// terminated by a single NUL. An empty listing is a single NUL.
#[must_use]
pub fn render_listing(names: &[String]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum::<usize>() + 1);
    for name in names {
        payload.extend_from_slice(name.as_bytes());
        payload.push(b'\n');
    }
    payload.push(0);
    payload
}

fn name_is_clean(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

/// Reject usernames that are empty or could escape the data directory.
/// Violations never touch the filesystem.
pub fn validate_username(name: &str) -> Result<()> {
    if name_is_clean(name) {
        Ok(())
    } else {
        Err(Error::UserNotFound)
    }
}

/// Reject filenames that are empty, could escape the mailbox, or do not
/// name a message file. Violations never touch the filesystem.
pub fn validate_filename(name: &str) -> Result<()> {
    if name_is_clean(name) && name.ends_with(MESSAGE_SUFFIX) {
        Ok(())
    } else {
        Err(Error::MessageNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MailboxStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn registration_creates_layout() {
        let (dir, store) = store();
        store.create_user("alice", "pw1").await.unwrap();

        let user_dir = dir.path().join("alice_user");
        assert!(user_dir.is_dir());
        assert_eq!(
            std::fs::read_to_string(user_dir.join(".PASSWORD")).unwrap(),
            "pw1\n"
        );
        assert_eq!(std::fs::read_to_string(user_dir.join(".DATA")).unwrap(), "0\n");
        assert!(store.user_exists("alice").await.unwrap());
        assert!(!store.user_exists("bob").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mailbox_directory_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, store) = store();
        store.create_user("alice", "pw1").await.unwrap();

        let meta = std::fs::metadata(dir.path().join("alice_user")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[tokio::test]
    async fn delivery_writes_header_then_body() {
        let (_dir, store) = store();
        store.create_user("bob", "pw").await.unwrap();

        let name = store.deliver("alice", "bob", b"hello").await.unwrap();
        assert!(is_unread(&name));
        assert!(name.ends_with(MESSAGE_SUFFIX));

        let (header, body) = store.fetch("bob", &name).await.unwrap();
        assert_eq!(header.sender_text(), "alice");
        assert_eq!(header.recipient_text(), "bob");
        assert_eq!(header.length, 5);
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn same_second_deliveries_get_distinct_names() {
        let (_dir, store) = store();
        store.create_user("bob", "pw").await.unwrap();

        let first = store
            .deliver_with_stamp("alice", "bob", b"one", "20250101120000")
            .await
            .unwrap();
        let second = store
            .deliver_with_stamp("carol", "bob", b"two", "20250101120000")
            .await
            .unwrap();
        let third = store
            .deliver_with_stamp("dave", "bob", b"three", "20250101120000")
            .await
            .unwrap();

        assert_eq!(first, "UNREAD20250101120000.pgm");
        assert_eq!(second, "UNREAD202501011200001.pgm");
        assert_eq!(third, "UNREAD202501011200002.pgm");
        assert_eq!(store.list_messages("bob", false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn listing_is_descending_and_skips_dot_files() {
        let (_dir, store) = store();
        store.create_user("bob", "pw").await.unwrap();
        store
            .deliver_with_stamp("a", "bob", b"x", "20250101120000")
            .await
            .unwrap();
        store
            .deliver_with_stamp("a", "bob", b"y", "20250102120000")
            .await
            .unwrap();

        let names = store.list_messages("bob", false).await.unwrap();
        assert_eq!(
            names,
            vec!["UNREAD20250102120000.pgm", "UNREAD20250101120000.pgm"]
        );
    }

    #[tokio::test]
    async fn unread_listing_excludes_promoted_messages() {
        let (_dir, store) = store();
        store.create_user("bob", "pw").await.unwrap();
        let name = store
            .deliver_with_stamp("a", "bob", b"x", "20250101120000")
            .await
            .unwrap();

        assert_eq!(store.list_messages("bob", true).await.unwrap().len(), 1);

        let promoted = store.promote("bob", &name).await.unwrap();
        assert_eq!(promoted, "20250101120000.pgm");
        assert!(store.list_messages("bob", true).await.unwrap().is_empty());

        let all = store.list_messages("bob", false).await.unwrap();
        assert_eq!(all, vec!["20250101120000.pgm"]);

        // Promotion is idempotent on an already-read name.
        let again = store.promote("bob", &promoted).await.unwrap();
        assert_eq!(again, promoted);
    }

    #[tokio::test]
    async fn listing_payload_is_nul_terminated() {
        let names = vec!["b.pgm".to_string(), "a.pgm".to_string()];
        assert_eq!(render_listing(&names), b"b.pgm\na.pgm\n\0");
        assert_eq!(render_listing(&[]), b"\0");
    }

    #[tokio::test]
    async fn delete_removes_and_reports_missing() {
        let (_dir, store) = store();
        store.create_user("bob", "pw").await.unwrap();
        let name = store.deliver("alice", "bob", b"hi").await.unwrap();

        store.delete("bob", &name).await.unwrap();
        assert!(store.list_messages("bob", false).await.unwrap().is_empty());

        match store.delete("bob", "20990101000000.pgm").await {
            Err(Error::MessageNotFound) => {}
            other => panic!("expected MessageNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn traversal_names_are_rejected_without_fs_access() {
        let (_dir, store) = store();

        for bad in ["", "..", "../etc", "a/b", "a\\b"] {
            match store.user_exists(bad).await {
                Err(Error::UserNotFound) => {}
                other => panic!("username {bad:?}: expected UserNotFound, got {other:?}"),
            }
        }

        store.create_user("bob", "pw").await.unwrap();
        for bad in ["", "../x.pgm", "a/b.pgm", "a\\b.pgm", "nosuffix"] {
            match store.fetch("bob", bad).await {
                Err(Error::MessageNotFound) => {}
                other => panic!("filename {bad:?}: expected MessageNotFound, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn user_listing_strips_suffix_and_sorts() {
        let (dir, store) = store();
        store.create_user("carol", "pw").await.unwrap();
        store.create_user("alice", "pw").await.unwrap();
        store.create_user("bob", "pw").await.unwrap();
        // Stray entries are ignored.
        std::fs::create_dir(dir.path().join("not-a-mailbox")).unwrap();
        std::fs::write(dir.path().join("stray_user"), b"file, not dir").unwrap();

        assert_eq!(store.list_users().await.unwrap(), vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn corrupt_stored_length_is_a_mailbox_fault() {
        let (dir, store) = store();
        store.create_user("bob", "pw").await.unwrap();

        let header = MessageHeader::new("alice", "bob", 0);
        std::fs::write(
            dir.path().join("bob_user").join("20250101120000.pgm"),
            header.encode(),
        )
        .unwrap();

        match store.fetch("bob", "20250101120000.pgm").await {
            Err(Error::Mailbox(_)) => {}
            other => panic!("expected Mailbox error, got {other:?}"),
        }
    }
}
