use clap::Args;
use server_connection::{ConnectionConfig, Payload, ServerConnection};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::CliResult;

#[derive(Args)]
pub struct ConnectArgs {
    /// Server endpoint, e.g. ws://localhost:8888/ws
    pub endpoint: String,

    /// Delay before reconnecting after the connection drops
    #[arg(long, env = "WSCONN_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,
}

/// Render a received payload as one line of output.
fn format_payload(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => text.clone(),
        Payload::Binary(data) => format!("<{} bytes>", data.len()),
    }
}

pub async fn run_connect(args: ConnectArgs) -> CliResult<()> {
    let config = ConnectionConfig {
        retry_delay_ms: args.retry_delay_ms,
    };
    let conn = ServerConnection::connect(args.endpoint, config)?;

    conn.on_state_change(|state| eprintln!("[{state}]"));
    conn.on_message(|payload| println!("{}", format_payload(&payload)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = super::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => conn.send(line),
                    None => {
                        tracing::info!("stdin closed");
                        break;
                    }
                }
            }
            () = &mut shutdown => break,
        }
    }

    conn.close();
    Ok(())
}
