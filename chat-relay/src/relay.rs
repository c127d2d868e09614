use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
};
use tracing::{info, warn};

use crate::{directory::Directory, session::Session};

/// Why [`Relay::run_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// The last registered client left.
    Drained,
    /// The caller's shutdown future completed.
    Shutdown,
}

/// Accepts connections and hands each one to its own [`Session`].
pub struct Relay {
    listener: TcpListener,
    directory: Arc<Directory<OwnedWriteHalf>>,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            directory: Arc::new(Directory::default()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until every registered client has left or `shutdown` resolves.
    /// A failed accept is fatal. Sessions still running when this returns are
    /// abandoned with the runtime.
    pub async fn run_until<F>(self, shutdown: F) -> Result<Stopped>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            directory,
        } = self;
        tokio::pin!(shutdown);

        let stopped = loop {
            select! {
                _ = &mut shutdown => break Stopped::Shutdown,
                _ = directory.drained() => break Stopped::Drained,
                accept_result = listener.accept() => {
                    let (stream, peer) = accept_result.context("failed to accept connection")?;
                    spawn_session(stream, peer, &directory);
                }
            }
        };

        info!(?stopped, "relay stopped accepting connections");
        Ok(stopped)
    }

    pub async fn run_until_ctrl_c(self) -> Result<Stopped> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, directory: &Arc<Directory<OwnedWriteHalf>>) {
    let (reader, writer) = stream.into_split();
    let session = Session::new(BufReader::new(reader), writer, Arc::clone(directory));
    info!(%peer, "accepted connection");
    tokio::spawn(async move {
        if let Err(err) = session.run().await {
            warn!(peer = %peer, error = ?err, "session ended with error");
        }
    });
}
