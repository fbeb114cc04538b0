//! Peer transport: TCP listener (incoming), TCP client (outbound to configured peers),
//! version handshake, length-prefixed frames.
//!
//! Each connection gets an async reader task that feeds the shared inbox, a writer thread
//! that blocks on the connection's outbox, and an announce ticker.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use deltapod_core::wire::{decode_payload, encode_frame, payload_len, LEN_SIZE};
use deltapod_core::{Envelope, FrameDecodeError, Inbox, Outbox, Pipe, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Delay between attempts to reach an outbound peer.
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("peer speaks protocol version {got}, expected {expected}")]
    Version { expected: u8, got: u8 },
    #[error("frame error: {0}")]
    Frame(#[from] FrameDecodeError),
}

/// Accept incoming peers until the listener fails.
pub async fn run_listener(listener: TcpListener, inbox: Inbox, announce_every: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_connection(stream, addr, inbox, announce_every).await {
                        warn!(peer = %addr, error = %e, "connection closed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed, listener stopped");
                break;
            }
        }
    }
}

/// Keep a connection to `peer` open, reconnecting after failures, until the inbox closes.
pub async fn run_peer(peer: String, inbox: Inbox, announce_every: Duration) {
    while !inbox.is_closed() {
        match TcpStream::connect(peer.as_str()).await {
            Ok(stream) => {
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                info!(peer = peer.as_str(), "connected");
                if let Err(e) = run_connection(stream, addr, inbox.clone(), announce_every).await {
                    warn!(peer = peer.as_str(), error = %e, "connection closed");
                }
            }
            Err(e) => debug!(peer = peer.as_str(), error = %e, "connect failed"),
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

async fn handshake(stream: &mut TcpStream) -> Result<(), TransportError> {
    stream.write_all(&[PROTOCOL_VERSION]).await?;
    stream.flush().await?;
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(TransportError::Version {
            expected: PROTOCOL_VERSION,
            got: buf[0],
        });
    }
    Ok(())
}

async fn run_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    inbox: Inbox,
    announce_every: Duration,
) -> Result<(), TransportError> {
    handshake(&mut stream).await?;
    let (mut reader, writer) = stream.into_split();
    let outbox: Outbox = Arc::new(Pipe::new());
    // Closed on every exit path, which also stops the writer thread.
    let _close_outbox = outbox.close_on_drop();

    let writer_outbox = outbox.clone();
    let handle = Handle::current();
    thread::Builder::new()
        .name(format!("deltapod-writer-{addr}"))
        .spawn(move || write_loop(writer, writer_outbox, handle))?;

    let tick_inbox = inbox.clone();
    let tick_outbox = outbox.clone();
    let ticker = tokio::spawn(async move {
        let mut every = tokio::time::interval(announce_every);
        loop {
            every.tick().await;
            if tick_outbox.is_closed() {
                break;
            }
            if !tick_inbox.send(Envelope::announce(tick_outbox.clone())) {
                break;
            }
        }
    });

    let result = read_loop(&mut reader, &inbox, &outbox).await;
    ticker.abort();
    debug!(peer = %addr, "connection finished");
    result
}

async fn read_loop(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    inbox: &Inbox,
    outbox: &Outbox,
) -> Result<(), TransportError> {
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = payload_len(len_buf)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        let message = decode_payload(&payload)?;
        debug!(kind = message.kind(), len, "received");
        if !inbox.send(Envelope::inbound(message, outbox.clone())) {
            return Ok(());
        }
    }
}

/// Writer thread: drain the outbox onto the socket until either side closes.
fn write_loop(mut writer: OwnedWriteHalf, outbox: Outbox, handle: Handle) {
    while let Some(message) = outbox.receive() {
        let frame = match encode_frame(&message) {
            Ok(f) => f,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "message dropped");
                continue;
            }
        };
        let sent = handle.block_on(async {
            writer.write_all(&frame).await?;
            writer.flush().await
        });
        if let Err(e) = sent {
            debug!(error = %e, "write failed");
            break;
        }
    }
    outbox.close();
}
