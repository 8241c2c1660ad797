use anyhow::{Context, Result};
use scriptnet_sandbox::{PollFlags, Session, SessionOptions};

use super::run_interruptible;

const REPLY_LEN: usize = 4096;

pub async fn handle_send_command(
    stdout: &mut impl std::io::Write,
    options: SessionOptions,
    host: String,
    port: u16,
    message: String,
) -> Result<()> {
    let session = Session::new(options).context("Failed to create session")?;
    let reply = run_interruptible(session, move |mut session| {
        exchange(&mut session, &host, port, message.as_bytes())
    })
    .await?;

    if let Some(reply) = reply {
        stdout.write_all(&reply)?;
        stdout.flush()?;
    }
    Ok(())
}

/// Connect, send `message`, and wait for one reply chunk.
///
/// Returns `None` if the peer closed the connection without answering.
pub fn exchange(
    session: &mut Session,
    host: &str,
    port: u16,
    message: &[u8],
) -> Result<Option<Vec<u8>>> {
    let vfd = session.connect_tcp(host, port)?;

    let mut pending = message;
    while !pending.is_empty() {
        let sent = session.send(vfd, pending, None)?;
        pending = &pending[sent..];
    }

    session.poll(&[(vfd, PollFlags::IN)])?;
    let reply = session.recv(vfd, Some(REPLY_LEN))?;
    session.close(vfd)?;
    Ok(reply)
}
