use anyhow::{Context, Result};
use scriptnet_sandbox::{ListenId, NetError, PollFlags, Session, SessionOptions};
use tracing::{debug, info, warn};

use super::run_interruptible;

const CHUNK_LEN: usize = 4096;

pub async fn handle_serve_command(
    options: SessionOptions,
    host: String,
    port: u16,
    max_clients: usize,
) -> Result<()> {
    let mut session = Session::new(options).context("Failed to create session")?;
    let id = session
        .listen_tcp(&host, port)
        .with_context(|| format!("Failed to start echo server on {}:{}", host, port))?;
    for vfd in session.listen_fds(id)? {
        info!(addr = %session.local_addr(vfd)?, vfd, "listening");
    }

    run_interruptible(session, move |mut session| {
        serve(&mut session, id, max_clients)
    })
    .await
}

/// Forget a closed client and renumber the clients that moved down a slot.
fn forget(clients: &mut Vec<i32>, closed: i32) {
    clients.retain(|&vfd| vfd != closed);
    for vfd in clients.iter_mut() {
        if *vfd > closed {
            *vfd -= 1;
        }
    }
}

fn send_all(session: &Session, vfd: i32, mut data: &[u8]) -> Result<(), NetError> {
    while !data.is_empty() {
        let sent = session.send(vfd, data, None)?;
        data = &data[sent..];
    }
    Ok(())
}

/// Echo every byte received on accepted connections until interrupted.
pub fn serve(session: &mut Session, id: ListenId, max_clients: usize) -> Result<()> {
    let mut clients: Vec<i32> = Vec::new();

    loop {
        let listeners = session.listen_fds(id)?;
        let interests: Vec<(i32, PollFlags)> = listeners
            .iter()
            .chain(clients.iter())
            .map(|&vfd| (vfd, PollFlags::IN))
            .collect();

        let outcome = match session.poll(&interests) {
            Ok(outcome) => outcome,
            Err(NetError::Interrupted) => {
                info!(clients = clients.len(), "interrupted, shutting down");
                break;
            }
            Err(err) => return Err(err.into()),
        };

        // Highest first, so closing one never renumbers a client still to be handled.
        let mut ready: Vec<i32> = clients
            .iter()
            .copied()
            .filter(|&vfd| !outcome.readiness(vfd).is_empty())
            .collect();
        ready.sort_unstable_by(|a, b| b.cmp(a));

        for vfd in ready {
            let echoed = match session.recv(vfd, Some(CHUNK_LEN)) {
                Ok(Some(data)) => send_all(session, vfd, &data).map(|_| true),
                Ok(None) => Ok(false),
                Err(err) => Err(err),
            };
            match echoed {
                Ok(true) => {}
                Ok(false) => {
                    debug!(vfd, "client closed the connection");
                    session.close(vfd)?;
                    forget(&mut clients, vfd);
                }
                Err(err) => {
                    warn!(vfd, error = %err, "dropping client");
                    session.close(vfd)?;
                    forget(&mut clients, vfd);
                }
            }
        }

        if listeners
            .iter()
            .any(|&vfd| !outcome.readiness(vfd).is_empty())
        {
            match session.accept(id) {
                Ok(vfd) if clients.len() >= max_clients => {
                    warn!(vfd, max_clients, "too many clients, closing connection");
                    session.close(vfd)?;
                }
                Ok(vfd) => {
                    info!(vfd, "client connected");
                    clients.push(vfd);
                }
                Err(NetError::Interrupted) => {
                    info!(clients = clients.len(), "interrupted, shutting down");
                    break;
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }

    Ok(())
}
