//! Single-process length-prefixed server with a built-in client.
//!
//! Runs one worker inline (no fork): a client thread sends a few framed
//! messages, the server replies with each payload reversed, and the client
//! raises SIGINT to stop the worker gracefully.

use std::{
    io::{Read, Write},
    net::TcpStream,
    thread,
    time::Duration,
};

use rush_net::{net::run_worker, prelude::*};
use signal_hook::consts::SIGINT;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Reverse;

impl Handler for Reverse {
    fn on_message(&self, conn: &mut Conn<'_>, payload: &[u8]) -> anyhow::Result<()> {
        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        conn.send_message(&reversed);
        Ok(())
    }
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn client(port: u16) -> anyhow::Result<()> {
    let mut stream = loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => break stream,
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    };
    let protocol = LengthPrefixed::default();
    for word in ["hello", "reactor", "prefork"] {
        stream.write_all(&protocol.encode(word.as_bytes()))?;
        let reply = read_frame(&mut stream)?;
        info!(sent = word, received = %String::from_utf8_lossy(&reply), "round trip");
    }
    signal_hook::low_level::raise(SIGINT)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let port = 7100;
    let config = ServerConfig::builder()
        .url(&format!("tcp://127.0.0.1:{port}"))?
        .protocol(LengthPrefixed::default())
        .build();
    let server = Server::new(config, Reverse)?;

    let client = thread::spawn(move || client(port));
    run_worker(
        &server,
        &SupervisorConfig::default()
            .shutdown_signal(SIGINT)
            .grace(Duration::from_millis(500)),
    )?;

    client
        .join()
        .map_err(|_| anyhow::anyhow!("client thread panicked"))??;
    info!("worker stopped");
    Ok(())
}
