//! Per-connection session state machine
//!
//! Each accepted connection runs one `Session`: the username handshake,
//! the register-or-authenticate branch, then the command loop. The
//! session is generic over the stream so tests can drive it over an
//! in-memory duplex pipe.
//!
//! Error discipline follows the wire contract: per-operation failures
//! (unknown recipient, unknown filename, declined listing) answer with a
//! code and keep the session alive; protocol violations and unexpected
//! filesystem faults tear the session down after a best-effort code,
//! never the process.

use crate::error::{Error, Result};
use crate::mailbox::{self, MailboxStore};
use crate::registry::{AddOutcome, SessionRegistry};
use crate::wire::{
    self, Command, MAX_FILENAME_SIZE, MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE, MessageHeader,
    PASSWORD_SIZE, ResultCode, USERNAME_SIZE,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Wrong passwords tolerated before the session is closed.
pub const MAX_PASSWORD_ATTEMPTS: u32 = 3;

/// One client connection's worth of state.
pub struct Session<S> {
    stream: S,
    store: Arc<MailboxStore>,
    registry: Arc<SessionRegistry>,
    username: Option<String>,
    registry_slot: Option<usize>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, store: Arc<MailboxStore>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            stream,
            store,
            registry,
            username: None,
            registry_slot: None,
        }
    }

    /// The registry slot claimed during login, if any. The worker that
    /// drove this session must release it on every exit path.
    pub fn take_registry_slot(&mut self) -> Option<usize> {
        self.registry_slot.take()
    }

    /// Drive the session to completion: handshake, then commands until
    /// logout, disconnect, or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        if !self.handshake().await? {
            return Ok(());
        }
        self.command_loop().await
    }

    async fn handshake(&mut self) -> Result<bool> {
        let mut frame = [0u8; USERNAME_SIZE];
        wire::recv_all(&mut self.stream, &mut frame).await?;
        let username = wire::field_text(&frame);
        if username.is_empty() {
            debug!("empty username, closing");
            return Ok(false);
        }

        let known = match self.store.user_exists(&username).await {
            Ok(known) => known,
            // A malformed name is simply not a registered user; the
            // registration branch will refuse it with the same code.
            Err(Error::UserNotFound) => false,
            Err(e) => return Err(e),
        };

        if known {
            self.authenticate(username).await
        } else {
            self.register(username).await
        }
    }

    async fn register(&mut self, username: String) -> Result<bool> {
        debug!("unknown user {username:?}, starting registration");
        wire::send_result(&mut self.stream, ResultCode::StartRegistration).await?;

        let password = self.read_password_frame().await?;
        if let Err(e) = self.store.create_user(&username, &password).await {
            let code = match &e {
                Error::UserNotFound => ResultCode::UserNotFound,
                _ => ResultCode::SyscallError,
            };
            wire::send_result(&mut self.stream, code).await.ok();
            return Err(e);
        }

        self.claim_slot(username).await
    }

    async fn authenticate(&mut self, username: String) -> Result<bool> {
        wire::send_result(&mut self.stream, ResultCode::NoError).await?;

        for attempt in 1..=MAX_PASSWORD_ATTEMPTS {
            let presented = self.read_password_frame().await?;
            if self.store.verify_password(&username, &presented).await? {
                return self.claim_slot(username).await;
            }
            debug!("{username}: wrong password ({attempt}/{MAX_PASSWORD_ATTEMPTS})");
            wire::send_result(&mut self.stream, ResultCode::WrongPassword).await?;
        }

        info!("{username}: password attempts exhausted, closing");
        Ok(false)
    }

    async fn claim_slot(&mut self, username: String) -> Result<bool> {
        match self.registry.try_add(&username).await {
            AddOutcome::Added(slot) => {
                self.registry_slot = Some(slot);
                wire::send_result(&mut self.stream, ResultCode::NoError).await?;
                info!("{username} logged in (slot {slot})");
                self.username = Some(username);
                Ok(true)
            }
            AddOutcome::AlreadyLoggedIn => {
                info!("{username} is already logged in, refusing");
                wire::send_result(&mut self.stream, ResultCode::Error).await?;
                Ok(false)
            }
            AddOutcome::Full => {
                warn!("session registry is full, refusing {username}");
                wire::send_result(&mut self.stream, ResultCode::Error).await?;
                Ok(false)
            }
        }
    }

    async fn read_password_frame(&mut self) -> Result<String> {
        let mut frame = [0u8; PASSWORD_SIZE];
        wire::recv_all(&mut self.stream, &mut frame).await?;
        Ok(wire::field_text(&frame))
    }

    fn current_user(&self) -> Result<String> {
        self.username
            .clone()
            .ok_or_else(|| Error::Protocol("command before login".into()))
    }

    async fn command_loop(&mut self) -> Result<()> {
        loop {
            let raw = wire::recv_i32(&mut self.stream).await?;
            match Command::from_raw(raw) {
                Some(Command::SendMessage) => self.handle_send().await?,
                Some(Command::ListRegisteredUsers) => self.handle_list_users().await?,
                Some(Command::LoadMessage) => self.handle_load().await?,
                Some(Command::LoadUnreadMessages) => self.handle_unread().await?,
                Some(Command::DeleteMessage) => self.handle_delete().await?,
                Some(Command::Logout) => {
                    info!("{} logged out", self.current_user()?);
                    return Ok(());
                }
                // Everything else, including the handler-less
                // LoadPreviousMessages, is answered and ignored.
                _ => {
                    debug!("unhandled command {raw}");
                    wire::send_command(&mut self.stream, Command::MessageError).await?;
                }
            }
        }
    }

    async fn handle_send(&mut self) -> Result<()> {
        let user = self.current_user()?;

        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        wire::recv_all(&mut self.stream, &mut buf).await?;
        let header = MessageHeader::decode(&buf);

        // Oversize rejection happens before any body allocation.
        if header.length == 0 || header.length > MAX_MESSAGE_SIZE {
            wire::send_result(&mut self.stream, ResultCode::StringSizeInvalid)
                .await
                .ok();
            return Err(Error::Protocol(format!(
                "body length {} out of range",
                header.length
            )));
        }

        let recipient = header.recipient_text();
        let known = match self.store.user_exists(&recipient).await {
            Ok(known) => known,
            Err(Error::UserNotFound) => false,
            Err(e) => return Err(e),
        };
        if !known {
            debug!("{user}: send to unknown recipient {recipient:?}");
            wire::send_result(&mut self.stream, ResultCode::UserNotFound).await?;
            return Ok(());
        }

        wire::send_result(&mut self.stream, ResultCode::NoError).await?;

        let mut body = vec![0u8; header.length as usize];
        wire::recv_all(&mut self.stream, &mut body).await?;

        // Whatever the client put in the sender field is ignored; the
        // stored sender is the authenticated username.
        let name = self.store.deliver(&user, &recipient, &body).await?;
        info!("{user} -> {recipient}: stored {name}");
        Ok(())
    }

    async fn handle_list_users(&mut self) -> Result<()> {
        let users = self.store.list_users().await?;
        let payload = mailbox::render_listing(&users);
        self.send_listing(&payload).await?;
        Ok(())
    }

    async fn handle_unread(&mut self) -> Result<()> {
        let user = self.current_user()?;
        let names = self.store.list_messages(&user, true).await?;
        let payload = mailbox::render_listing(&names);
        self.send_listing(&payload).await?;
        Ok(())
    }

    async fn handle_load(&mut self) -> Result<()> {
        let user = self.current_user()?;
        let Some(filename) = self.select_from_mailbox().await? else {
            return Ok(());
        };

        match self.store.fetch(&user, &filename).await {
            Ok((header, body)) => {
                wire::send_result(&mut self.stream, ResultCode::NoError).await?;
                wire::send_all(&mut self.stream, &header.encode()).await?;
                wire::send_all(&mut self.stream, &body).await?;

                // The promotion is best-effort: a failed rename only
                // leaves the message flagged unread for the next fetch.
                if mailbox::is_unread(&filename) {
                    if let Err(e) = self.store.promote(&user, &filename).await {
                        warn!("{user}: could not mark {filename} as read: {e}");
                    }
                }
                Ok(())
            }
            Err(Error::MessageNotFound) => {
                wire::send_command(&mut self.stream, Command::MessageNotFound).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_delete(&mut self) -> Result<()> {
        let user = self.current_user()?;
        let Some(filename) = self.select_from_mailbox().await? else {
            return Ok(());
        };

        match self.store.delete(&user, &filename).await {
            Ok(()) => {
                info!("{user}: deleted {filename}");
                wire::send_result(&mut self.stream, ResultCode::NoError).await?;
                Ok(())
            }
            Err(Error::MessageNotFound) => {
                wire::send_command(&mut self.stream, Command::MessageNotFound).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Acknowledged Listing Protocol: send the payload length, wait for
    /// the client's verdict, then send the payload or drop it. Returns
    /// whether the payload was delivered.
    async fn send_listing(&mut self, payload: &[u8]) -> Result<bool> {
        let length = u32::try_from(payload.len())
            .map_err(|_| Error::Mailbox("listing payload too large".into()))?;
        wire::send_u32(&mut self.stream, length).await?;

        let ack = wire::recv_i32(&mut self.stream).await?;
        if ack != ResultCode::NoError as i32 {
            debug!("listing declined with code {ack}");
            return Ok(false);
        }

        wire::send_all(&mut self.stream, payload).await?;
        Ok(true)
    }

    /// Listing-then-selection over the full mailbox. `None` means the
    /// client backed out (at the ack or at the selection step) and the
    /// session stays healthy.
    async fn select_from_mailbox(&mut self) -> Result<Option<String>> {
        let user = self.current_user()?;
        let names = self.store.list_messages(&user, false).await?;
        let payload = mailbox::render_listing(&names);
        if !self.send_listing(&payload).await? {
            return Ok(None);
        }

        let raw = wire::recv_i32(&mut self.stream).await?;
        match Command::from_raw(raw) {
            Some(Command::LoadSpecificMessage) => {
                let filename = wire::recv_cstring(&mut self.stream, MAX_FILENAME_SIZE).await?;
                Ok(Some(filename))
            }
            Some(Command::OperationAborted) => {
                debug!("{user} aborted the selection");
                Ok(None)
            }
            _ => {
                wire::send_command(&mut self.stream, Command::MessageError)
                    .await
                    .ok();
                Err(Error::Protocol(format!("unexpected selection code {raw}")))
            }
        }
    }
}
