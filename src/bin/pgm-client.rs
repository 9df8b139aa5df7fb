#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Interactive client for the message broker
//!
//! Every connection parameter can be passed as a positional argument
//! for scripted use; anything omitted is prompted for.

use anyhow::{Context, bail};
use clap::Parser;
use pgm_messenger::{DEFAULT_PORT, MAX_PASSWORD_ATTEMPTS, MessengerClient, ResultCode};
use std::io::{BufRead, Write};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgm-client")]
#[command(about = "Interactive client for the pgm message broker")]
struct Args {
    /// Username (prompted for when omitted)
    username: Option<String>,

    /// Server IPv4 address (default 127.0.0.1)
    address: Option<String>,

    /// Server port (default 6666)
    port: Option<u16>,

    /// Password (prompted for when omitted)
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let username = match args.username {
        Some(username) => username,
        None => prompt("Username")?,
    };
    if username.is_empty() {
        bail!("username must not be empty");
    }

    let address = args.address.unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.port.unwrap_or(DEFAULT_PORT);

    println!("Connecting to {address}:{port} as {username} ...");
    let (mut client, code) = MessengerClient::connect((address.as_str(), port), &username)
        .await
        .context("could not reach the server")?;

    match code {
        ResultCode::StartRegistration => {
            println!("User not found, registering.");
            let password = match args.password.clone() {
                Some(password) => password,
                None => prompt("New password")?,
            };
            match client.send_password(&password).await? {
                ResultCode::NoError => println!("Registration successful."),
                other => bail!("registration failed: {other:?}"),
            }
        }
        ResultCode::NoError => {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let password = match args.password.clone() {
                    Some(password) => password,
                    None => prompt("Password")?,
                };
                match client.send_password(&password).await? {
                    ResultCode::NoError => {
                        println!("Authentication successful.");
                        break;
                    }
                    ResultCode::WrongPassword if attempt < MAX_PASSWORD_ATTEMPTS => {
                        println!("Wrong password ({attempt}/{MAX_PASSWORD_ATTEMPTS}).");
                        if args.password.is_some() {
                            bail!("wrong password");
                        }
                    }
                    ResultCode::WrongPassword => bail!("maximum password attempts reached"),
                    other => bail!("login failed: {other:?}"),
                }
            }
        }
        other => bail!("unexpected server response: {other:?}"),
    }

    menu_loop(client).await
}

async fn menu_loop(mut client: MessengerClient) -> anyhow::Result<()> {
    loop {
        println!();
        println!("Select operation:");
        println!("  [1] Send message");
        println!("  [2] List registered users");
        println!("  [3] Load message");
        println!("  [4] Load unread messages list");
        println!("  [5] Delete message");
        println!("  [q] Quit");

        let choice = prompt(">")?;
        match choice.chars().find(|c| !c.is_whitespace()) {
            Some('1' | 's' | 'S') => send_message(&mut client).await?,
            Some('2' | 'l' | 'L') => {
                let users = client.list_users().await?;
                println!("\nRegistered users:");
                for user in users {
                    println!("  {user}");
                }
            }
            Some('3' | 'm' | 'M') => load_message(&mut client).await?,
            Some('4' | 'u' | 'U') => {
                let unread = client.list_unread().await?;
                if unread.is_empty() {
                    println!("No unread messages.");
                } else {
                    println!("\nUnread messages:");
                    for name in unread {
                        println!("  {name}");
                    }
                }
            }
            Some('5' | 'd' | 'D') => delete_message(&mut client).await?,
            Some('q' | 'Q') => {
                client.logout().await.ok();
                println!("Bye.");
                return Ok(());
            }
            _ => println!("Invalid choice."),
        }
    }
}

async fn send_message(client: &mut MessengerClient) -> anyhow::Result<()> {
    let recipient = prompt("Recipient username")?;
    let body = prompt("Message body")?;

    match client.send_message(&recipient, body.as_bytes()).await? {
        ResultCode::NoError => println!("Message sent."),
        ResultCode::UserNotFound => println!("No such user: {recipient}"),
        other => println!("Send failed: {other:?}"),
    }
    Ok(())
}

async fn load_message(client: &mut MessengerClient) -> anyhow::Result<()> {
    let names = client.begin_load().await?;
    let Some(name) = pick_message(client, names, "load").await? else {
        return Ok(());
    };

    match client.select_load(&name).await {
        Ok(message) => {
            println!("\nMessage loaded:");
            println!("  From: {}", message.sender);
            println!("  To:   {}", message.recipient);
            println!("  Body: {}", String::from_utf8_lossy(&message.body));
        }
        Err(pgm_messenger::Error::MessageNotFound) => println!("Message not found."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn delete_message(client: &mut MessengerClient) -> anyhow::Result<()> {
    let names = client.begin_delete().await?;
    let Some(name) = pick_message(client, names, "delete").await? else {
        return Ok(());
    };

    match client.select_delete(&name).await {
        Ok(()) => println!("Message deleted."),
        Err(pgm_messenger::Error::MessageNotFound) => println!("Message not found."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Show a numbered listing and let the user pick an entry or back out.
/// Aborts the pending server-side selection on cancel.
async fn pick_message(
    client: &mut MessengerClient,
    names: Vec<String>,
    verb: &str,
) -> anyhow::Result<Option<String>> {
    if names.is_empty() {
        println!("No messages available.");
        client.abort_selection().await?;
        return Ok(None);
    }

    println!("\nMessages:");
    for (index, name) in names.iter().enumerate() {
        println!("  [{index}] {name}");
    }

    let line = prompt(&format!("Select message number to {verb} or 'q' to cancel"))?;
    if line.starts_with(['q', 'Q']) {
        client.abort_selection().await?;
        return Ok(None);
    }

    match line.trim().parse::<usize>() {
        Ok(index) if index < names.len() => Ok(Some(names[index].clone())),
        _ => {
            println!("Invalid selection.");
            client.abort_selection().await?;
            Ok(None)
        }
    }
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}\n> ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("could not read from the terminal")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
