use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::Sender,
    task::JoinHandle,
};

/// Hands every accepted connection to `session_tx` until the receiver goes away.
pub fn accept_connections(listener: TcpListener, session_tx: Sender<TcpStream>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            tracing::debug!("Accepted connection from {}", peer);

            if session_tx.send(socket).await.is_err() {
                tracing::debug!("Session handler stopped, no longer accepting");
                break;
            }
        }
    })
}
