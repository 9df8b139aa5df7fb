//! Binary wire protocol
//!
//! Every multi-byte integer on the wire is big-endian. Two frame kinds
//! exist: fixed frames (username, password, codes, message header) whose
//! sizes both peers assume, and length-prefixed payloads (a `u32` length
//! followed by exactly that many bytes) used by the listing operations.
//!
//! String frames are zero-padded byte arrays. The bytes are opaque on the
//! wire; text is extracted as "everything up to the first NUL" and only
//! validated at the point of use.

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a username frame: 63 usable bytes plus a terminator.
pub const USERNAME_SIZE: usize = 64;

/// Size of a password frame: 255 usable bytes plus a terminator.
pub const PASSWORD_SIZE: usize = 256;

/// Size of a message header frame: sender + recipient + u32 body length.
pub const MESSAGE_HEADER_SIZE: usize = 2 * USERNAME_SIZE + 4;

/// Valid message bodies are `1..=MAX_MESSAGE_SIZE` bytes.
pub const MAX_MESSAGE_SIZE: u32 = 4096;

/// Upper bound on a client-supplied NUL-terminated filename.
pub const MAX_FILENAME_SIZE: usize = 512;

/// Status codes sent in 4-byte signed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    NoError = 0,
    Error = -1,
    StringSizeInvalid = -2,
    StringSizeExceedingMaximum = -3,
    TtyError = -4,
    SyscallError = -5,
    OperationAborted = -6,
    NullParameters = -7,
    ExitProgram = -99,
    StartRegistration = -100,
    WrongPassword = -101,
    UserNotFound = -102,
}

impl ResultCode {
    /// Decode a raw wire value. Unknown values yield `None`.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::NoError),
            -1 => Some(Self::Error),
            -2 => Some(Self::StringSizeInvalid),
            -3 => Some(Self::StringSizeExceedingMaximum),
            -4 => Some(Self::TtyError),
            -5 => Some(Self::SyscallError),
            -6 => Some(Self::OperationAborted),
            -7 => Some(Self::NullParameters),
            -99 => Some(Self::ExitProgram),
            -100 => Some(Self::StartRegistration),
            -101 => Some(Self::WrongPassword),
            -102 => Some(Self::UserNotFound),
            _ => None,
        }
    }
}

/// Command codes sent in 4-byte signed frames.
///
/// `LoadPreviousMessages` is part of the protocol enum but has no server
/// handler; it falls through the dispatch default like any unknown code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    LoadPreviousMessages = 1,
    ListRegisteredUsers = 2,
    SendMessage = 3,
    LoadMessage = 4,
    LoadSpecificMessage = 5,
    DeleteMessage = 6,
    LoadUnreadMessages = 7,
    MessageError = -1,
    OperationAborted = -2,
    MessageNotFound = -3,
    Logout = -4,
}

impl Command {
    /// Decode a raw wire value. Unknown values yield `None`.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::LoadPreviousMessages),
            2 => Some(Self::ListRegisteredUsers),
            3 => Some(Self::SendMessage),
            4 => Some(Self::LoadMessage),
            5 => Some(Self::LoadSpecificMessage),
            6 => Some(Self::DeleteMessage),
            7 => Some(Self::LoadUnreadMessages),
            -1 => Some(Self::MessageError),
            -2 => Some(Self::OperationAborted),
            -3 => Some(Self::MessageNotFound),
            -4 => Some(Self::Logout),
            _ => None,
        }
    }
}

/// The fixed 132-byte message header: two zero-padded name fields and the
/// big-endian body length. This is both the wire frame and the on-disk
/// file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub sender: [u8; USERNAME_SIZE],
    pub recipient: [u8; USERNAME_SIZE],
    pub length: u32,
}

impl MessageHeader {
    #[must_use]
    pub fn new(sender: &str, recipient: &str, length: u32) -> Self {
        Self {
            sender: pack_field(sender.as_bytes()),
            recipient: pack_field(recipient.as_bytes()),
            length,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        buf[..USERNAME_SIZE].copy_from_slice(&self.sender);
        buf[USERNAME_SIZE..2 * USERNAME_SIZE].copy_from_slice(&self.recipient);
        buf[2 * USERNAME_SIZE..].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        let mut sender = [0u8; USERNAME_SIZE];
        let mut recipient = [0u8; USERNAME_SIZE];
        sender.copy_from_slice(&buf[..USERNAME_SIZE]);
        recipient.copy_from_slice(&buf[USERNAME_SIZE..2 * USERNAME_SIZE]);
        let length = u32::from_be_bytes([
            buf[2 * USERNAME_SIZE],
            buf[2 * USERNAME_SIZE + 1],
            buf[2 * USERNAME_SIZE + 2],
            buf[2 * USERNAME_SIZE + 3],
        ]);
        Self {
            sender,
            recipient,
            length,
        }
    }

    /// The sender field as text (bytes up to the first NUL, lossy UTF-8).
    #[must_use]
    pub fn sender_text(&self) -> String {
        field_text(&self.sender)
    }

    /// The recipient field as text (bytes up to the first NUL, lossy UTF-8).
    #[must_use]
    pub fn recipient_text(&self) -> String {
        field_text(&self.recipient)
    }
}

/// Zero-pad `value` into a fixed frame, truncating to `N - 1` bytes so a
/// terminator always survives.
#[must_use]
pub fn pack_field<const N: usize>(value: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    let len = value.len().min(N - 1);
    buf[..len].copy_from_slice(&value[..len]);
    buf
}

/// Extract the text of a zero-padded frame: bytes up to the first NUL,
/// decoded lossily, with trailing newline bytes stripped.
#[must_use]
pub fn field_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end])
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Write the whole buffer and flush. Never reports partial success.
pub async fn send_all<S>(stream: &mut S, buf: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Fill the whole buffer, retrying internally. A peer that closes before
/// the frame completes yields [`Error::Disconnected`], distinct from a
/// transport fault.
pub async fn recv_all<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Disconnected),
        Err(e) => Err(e.into()),
    }
}

pub async fn send_i32<S>(stream: &mut S, value: i32) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_all(stream, &value.to_be_bytes()).await
}

pub async fn recv_i32<S>(stream: &mut S) -> Result<i32>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    recv_all(stream, &mut buf).await?;
    Ok(i32::from_be_bytes(buf))
}

pub async fn send_u32<S>(stream: &mut S, value: u32) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_all(stream, &value.to_be_bytes()).await
}

pub async fn recv_u32<S>(stream: &mut S) -> Result<u32>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    recv_all(stream, &mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

pub async fn send_result<S>(stream: &mut S, code: ResultCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_i32(stream, code as i32).await
}

/// Receive a [`ResultCode`] frame; an unknown value is a protocol error.
pub async fn recv_result<S>(stream: &mut S) -> Result<ResultCode>
where
    S: AsyncRead + Unpin,
{
    let raw = recv_i32(stream).await?;
    ResultCode::from_raw(raw).ok_or_else(|| Error::Protocol(format!("unknown result code {raw}")))
}

pub async fn send_command<S>(stream: &mut S, command: Command) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_i32(stream, command as i32).await
}

/// Receive a NUL-terminated string, rejecting anything longer than `max`
/// bytes (terminator included).
pub async fn recv_cstring<S>(stream: &mut S, max: usize) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        recv_all(stream, &mut byte).await?;
        if byte[0] == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(byte[0]);
        if bytes.len() >= max {
            return Err(Error::Protocol(format!(
                "unterminated string exceeds {max} bytes"
            )));
        }
    }
}

/// Send a string as NUL-terminated bytes.
pub async fn send_cstring<S>(stream: &mut S, value: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(value.as_bytes()).await?;
    stream.write_all(&[0]).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_raw_values() {
        assert_eq!(ResultCode::NoError as i32, 0);
        assert_eq!(ResultCode::StartRegistration as i32, -100);
        assert_eq!(ResultCode::WrongPassword as i32, -101);
        assert_eq!(ResultCode::UserNotFound as i32, -102);
        assert_eq!(ResultCode::from_raw(-100), Some(ResultCode::StartRegistration));
        assert_eq!(ResultCode::from_raw(42), None);
    }

    #[test]
    fn command_raw_values() {
        assert_eq!(Command::SendMessage as i32, 3);
        assert_eq!(Command::LoadUnreadMessages as i32, 7);
        assert_eq!(Command::Logout as i32, -4);
        assert_eq!(Command::from_raw(5), Some(Command::LoadSpecificMessage));
        assert_eq!(Command::from_raw(99), None);
    }

    #[test]
    fn header_encodes_to_132_big_endian_bytes() {
        let header = MessageHeader::new("alice", "bob", 5);
        let bytes = header.encode();
        assert_eq!(bytes.len(), MESSAGE_HEADER_SIZE);
        assert_eq!(&bytes[..5], b"alice");
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[USERNAME_SIZE..USERNAME_SIZE + 3], b"bob");
        assert_eq!(&bytes[128..], &[0, 0, 0, 5]);

        let decoded = MessageHeader::decode(&bytes);
        assert_eq!(decoded.sender_text(), "alice");
        assert_eq!(decoded.recipient_text(), "bob");
        assert_eq!(decoded.length, 5);
    }

    #[test]
    fn pack_field_truncates_and_keeps_terminator() {
        let long = "x".repeat(100);
        let packed: [u8; USERNAME_SIZE] = pack_field(long.as_bytes());
        assert_eq!(packed[USERNAME_SIZE - 1], 0);
        assert_eq!(field_text(&packed).len(), USERNAME_SIZE - 1);
    }

    #[test]
    fn field_text_strips_trailing_newlines() {
        let packed: [u8; USERNAME_SIZE] = pack_field(b"alice\r\n");
        assert_eq!(field_text(&packed), "alice");
    }

    #[tokio::test]
    async fn recv_all_distinguishes_closed_peer() {
        let (mut client, mut server) = tokio::io::duplex(64);
        send_all(&mut client, &[1, 2]).await.unwrap();
        drop(client);

        let mut buf = [0u8; 4];
        match recv_all(&mut server, &mut buf).await {
            Err(Error::Disconnected) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cstring_round_trip_and_bound() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        send_cstring(&mut client, "UNREAD20250101120000.pgm")
            .await
            .unwrap();
        let name = recv_cstring(&mut server, MAX_FILENAME_SIZE).await.unwrap();
        assert_eq!(name, "UNREAD20250101120000.pgm");

        let oversize = vec![b'a'; MAX_FILENAME_SIZE + 8];
        send_all(&mut client, &oversize).await.unwrap();
        match recv_cstring(&mut server, MAX_FILENAME_SIZE).await {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
