//! Typed protocol client
//!
//! `MessengerClient` drives the broker's wire protocol over one TCP
//! connection: handshake, register-or-login, then commands. The
//! interactive binary and the integration tests both sit on top of it.
//!
//! The three-step listing exchange (length, ack, payload) and the
//! listing-then-selection flows are modelled as `begin_*`/`select_*`
//! pairs so an interactive caller can show the listing before deciding;
//! convenience wrappers cover the common one-shot cases.

use crate::error::{Error, Result};
use crate::wire::{
    self, Command, MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE, MessageHeader, PASSWORD_SIZE, ResultCode,
    USERNAME_SIZE,
};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// A loaded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub recipient: String,
    pub body: Vec<u8>,
}

/// One authenticated (or authenticating) connection to the broker.
pub struct MessengerClient {
    stream: TcpStream,
    username: String,
}

impl MessengerClient {
    /// Connect and run the username handshake.
    ///
    /// The returned code is the server's verdict: `NoError` means the
    /// user exists and a password is expected, `StartRegistration`
    /// means the server is waiting for a registration password.
    pub async fn connect(addr: impl ToSocketAddrs, username: &str) -> Result<(Self, ResultCode)> {
        let mut stream = TcpStream::connect(addr).await?;
        debug!("connected, sending username {username:?}");

        let frame: [u8; USERNAME_SIZE] = wire::pack_field(username.as_bytes());
        wire::send_all(&mut stream, &frame).await?;
        let code = wire::recv_result(&mut stream).await?;

        Ok((
            Self {
                stream,
                username: username.to_string(),
            },
            code,
        ))
    }

    /// Send one password frame (a login attempt or the registration
    /// password) and return the verdict.
    pub async fn send_password(&mut self, password: &str) -> Result<ResultCode> {
        let frame: [u8; PASSWORD_SIZE] = wire::pack_field(password.as_bytes());
        wire::send_all(&mut self.stream, &frame).await?;
        wire::recv_result(&mut self.stream).await
    }

    /// Connect and authenticate in one step, registering the user when
    /// the server does not know them.
    pub async fn login(addr: impl ToSocketAddrs, username: &str, password: &str) -> Result<Self> {
        let (mut client, code) = Self::connect(addr, username).await?;
        match code {
            ResultCode::NoError | ResultCode::StartRegistration => {}
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected handshake code {other:?}"
                )));
            }
        }
        match client.send_password(password).await? {
            ResultCode::NoError => Ok(client),
            ResultCode::WrongPassword => Err(Error::Protocol("wrong password".into())),
            other => Err(Error::Protocol(format!("login refused: {other:?}"))),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Usernames registered on the server.
    pub async fn list_users(&mut self) -> Result<Vec<String>> {
        wire::send_command(&mut self.stream, Command::ListRegisteredUsers).await?;
        self.receive_listing().await
    }

    /// Filenames of the unread messages in our mailbox, newest first.
    pub async fn list_unread(&mut self) -> Result<Vec<String>> {
        wire::send_command(&mut self.stream, Command::LoadUnreadMessages).await?;
        self.receive_listing().await
    }

    /// Filenames of every message in our mailbox, newest first, without
    /// loading any of them.
    pub async fn list_messages(&mut self) -> Result<Vec<String>> {
        let names = self.begin_load().await?;
        self.abort_selection().await?;
        Ok(names)
    }

    /// Deliver `body` to `recipient`. The returned code is the server's
    /// verdict on the header (`NoError`, `UserNotFound`, ...); the body
    /// is only sent on `NoError`.
    pub async fn send_message(&mut self, recipient: &str, body: &[u8]) -> Result<ResultCode> {
        let length = u32::try_from(body.len())
            .map_err(|_| Error::Protocol("message body too large".into()))?;
        wire::send_command(&mut self.stream, Command::SendMessage).await?;
        let header = MessageHeader::new(&self.username, recipient, length);
        wire::send_all(&mut self.stream, &header.encode()).await?;

        let code = wire::recv_result(&mut self.stream).await?;
        if code == ResultCode::NoError {
            wire::send_all(&mut self.stream, body).await?;
        }
        Ok(code)
    }

    /// Start a load operation: returns the mailbox listing. Follow up
    /// with [`Self::select_load`] or [`Self::abort_selection`].
    pub async fn begin_load(&mut self) -> Result<Vec<String>> {
        wire::send_command(&mut self.stream, Command::LoadMessage).await?;
        self.receive_listing().await
    }

    /// Select one listed message, stream it down, and return it. The
    /// server promotes an unread message to read as a side effect.
    pub async fn select_load(&mut self, filename: &str) -> Result<Message> {
        self.send_selection(filename).await?;

        let code = wire::recv_i32(&mut self.stream).await?;
        if code != ResultCode::NoError as i32 {
            return Err(selection_error(code, "load"));
        }

        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        wire::recv_all(&mut self.stream, &mut buf).await?;
        let header = MessageHeader::decode(&buf);
        if header.length == 0 || header.length > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "invalid body length {}",
                header.length
            )));
        }

        let mut body = vec![0u8; header.length as usize];
        wire::recv_all(&mut self.stream, &mut body).await?;

        Ok(Message {
            sender: header.sender_text(),
            recipient: header.recipient_text(),
            body,
        })
    }

    /// Start a delete operation: returns the mailbox listing. Follow up
    /// with [`Self::select_delete`] or [`Self::abort_selection`].
    pub async fn begin_delete(&mut self) -> Result<Vec<String>> {
        wire::send_command(&mut self.stream, Command::DeleteMessage).await?;
        self.receive_listing().await
    }

    /// Select one listed message and delete it.
    pub async fn select_delete(&mut self, filename: &str) -> Result<()> {
        self.send_selection(filename).await?;

        let code = wire::recv_i32(&mut self.stream).await?;
        if code == ResultCode::NoError as i32 {
            Ok(())
        } else {
            Err(selection_error(code, "delete"))
        }
    }

    /// Back out of a pending selection; the session stays healthy.
    pub async fn abort_selection(&mut self) -> Result<()> {
        wire::send_command(&mut self.stream, Command::OperationAborted).await
    }

    /// One-shot load of a known filename.
    pub async fn fetch_message(&mut self, filename: &str) -> Result<Message> {
        self.begin_load().await?;
        self.select_load(filename).await
    }

    /// One-shot delete of a known filename.
    pub async fn delete_message(&mut self, filename: &str) -> Result<()> {
        self.begin_delete().await?;
        self.select_delete(filename).await
    }

    /// Announce logout and drop the connection.
    pub async fn logout(mut self) -> Result<()> {
        wire::send_command(&mut self.stream, Command::Logout).await
    }

    async fn send_selection(&mut self, filename: &str) -> Result<()> {
        wire::send_command(&mut self.stream, Command::LoadSpecificMessage).await?;
        wire::send_cstring(&mut self.stream, filename).await
    }

    /// The client half of the Acknowledged Listing Protocol: read the
    /// length, approve the transfer, read and parse the payload.
    async fn receive_listing(&mut self) -> Result<Vec<String>> {
        let length = wire::recv_u32(&mut self.stream).await?;
        wire::send_result(&mut self.stream, ResultCode::NoError).await?;

        let mut payload = vec![0u8; length as usize];
        wire::recv_all(&mut self.stream, &mut payload).await?;
        Ok(parse_listing(&payload))
    }
}

fn selection_error(code: i32, operation: &str) -> Error {
    if code == Command::MessageNotFound as i32 {
        Error::MessageNotFound
    } else {
        Error::Protocol(format!("{operation} refused with code {code}"))
    }
}

/// Parse a listing payload: newline-separated names terminated by NUL.
#[must_use]
pub fn parse_listing(payload: &[u8]) -> Vec<String> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    payload[..end]
        .split(|&b| b == b'\n')
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}
