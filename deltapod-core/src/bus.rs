//! Message bus: envelopes that carry a message plus the connection to answer on, and the
//! single worker thread that feeds them to the sync engine one at a time.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::pipe::Pipe;
use crate::protocol::Message;

/// Outbound queue of one connection.
pub type Outbox = Arc<Pipe<Message>>;

/// Shared inbound queue of the sync worker.
pub type Inbox = Arc<Pipe<Envelope>>;

#[derive(Debug)]
pub enum Command {
    /// A decoded wire message from the peer behind `reply_to`.
    Inbound(Message),
    /// Periodic local trigger: refresh the index and ask the peer for its listing.
    Announce,
}

/// A command together with the outbox its replies go to.
pub struct Envelope {
    pub command: Command,
    pub reply_to: Outbox,
}

impl Envelope {
    pub fn inbound(message: Message, reply_to: Outbox) -> Self {
        Self {
            command: Command::Inbound(message),
            reply_to,
        }
    }

    pub fn announce(reply_to: Outbox) -> Self {
        Self {
            command: Command::Announce,
            reply_to,
        }
    }
}

/// What the worker drives. Implemented by the sync engine.
pub trait MessageHandler {
    fn handle_message(&mut self, message: Message) -> Vec<Message>;
    fn on_announce(&mut self) -> Vec<Message>;
}

/// Process one envelope and push the replies to its outbox. Returns how many replies were
/// accepted; replies to a closed outbox are dropped.
pub fn dispatch<H: MessageHandler + ?Sized>(handler: &mut H, envelope: Envelope) -> usize {
    let Envelope { command, reply_to } = envelope;
    let replies = match command {
        Command::Inbound(message) => handler.handle_message(message),
        Command::Announce => handler.on_announce(),
    };
    let mut sent = 0;
    for reply in replies {
        if reply_to.send(reply) {
            sent += 1;
        } else {
            tracing::debug!("reply dropped: connection closed");
            break;
        }
    }
    sent
}

/// Start the sync worker. It handles envelopes strictly one at a time until the inbox is
/// closed, then processes whatever was still queued and returns the handler.
pub fn spawn_worker<H>(mut handler: H, inbox: Inbox) -> io::Result<JoinHandle<H>>
where
    H: MessageHandler + Send + 'static,
{
    thread::Builder::new()
        .name("deltapod-sync".into())
        .spawn(move || {
            while let Some(envelope) = inbox.receive() {
                dispatch(&mut handler, envelope);
            }
            for envelope in inbox.drain() {
                dispatch(&mut handler, envelope);
            }
            tracing::info!("sync worker stopped");
            handler
        })
}
