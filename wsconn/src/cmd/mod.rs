mod connect;
mod serve;

pub use connect::{ConnectArgs, run_connect};
pub use serve::{ServeArgs, run_serve};

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = recv_signal(&mut sigint) => {
            tracing::info!("received SIGINT, shutting down");
        }
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
