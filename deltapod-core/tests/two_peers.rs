//! Two engines on their own worker threads, wired back to back through pipes.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use deltapod_core::{
    spawn_worker, Envelope, FileStore, Inbox, MemoryIndex, Message, MessageHandler, Outbox, Pipe,
    SyncConfig, SyncSystem,
};
use rand::{Rng, SeedableRng};

/// Counts what the worker has finished handling.
struct Counted {
    inner: SyncSystem,
    done: Arc<AtomicUsize>,
}

impl MessageHandler for Counted {
    fn handle_message(&mut self, message: Message) -> Vec<Message> {
        let out = self.inner.handle_message(message);
        self.done.fetch_add(1, Ordering::SeqCst);
        out
    }

    fn on_announce(&mut self) -> Vec<Message> {
        let out = self.inner.on_announce();
        self.done.fetch_add(1, Ordering::SeqCst);
        out
    }
}

struct Peer {
    inbox: Inbox,
    outbox: Outbox,
    done: Arc<AtomicUsize>,
    sent: usize,
    worker: thread::JoinHandle<Counted>,
}

impl Peer {
    fn start(root: &Path) -> Peer {
        let done = Arc::new(AtomicUsize::new(0));
        let system = SyncSystem::new(
            MemoryIndex::new(),
            FileStore::new(root),
            SyncConfig::default(),
        );
        let inbox: Inbox = Arc::new(Pipe::new());
        let worker = spawn_worker(
            Counted {
                inner: system,
                done: done.clone(),
            },
            inbox.clone(),
        )
        .unwrap();
        Peer {
            inbox,
            outbox: Arc::new(Pipe::new()),
            done,
            sent: 0,
            worker,
        }
    }

    fn push(&mut self, envelope: Envelope) {
        assert!(self.inbox.send(envelope));
        self.sent += 1;
    }

    fn idle(&self) -> bool {
        self.outbox.is_empty() && self.done.load(Ordering::SeqCst) == self.sent
    }

    fn stop(self) -> SyncSystem {
        self.inbox.close();
        self.worker.join().unwrap().inner
    }
}

/// Move every queued reply of `from` into `to`'s inbox.
fn forward(from: &Peer, to: &mut Peer) -> bool {
    let mut moved = false;
    while let Some(message) = from.outbox.try_receive() {
        let reply_to = to.outbox.clone();
        to.push(Envelope::inbound(message, reply_to));
        moved = true;
    }
    moved
}

fn run_until_quiet(a: &mut Peer, b: &mut Peer) {
    let deadline = Instant::now() + Duration::from_secs(60);
    let mut quiet_rounds = 0;
    while quiet_rounds < 10 {
        assert!(Instant::now() < deadline, "peers never went quiet");
        let moved = forward(a, b) | forward(b, a);
        if !moved && a.idle() && b.idle() {
            quiet_rounds += 1;
        } else {
            quiet_rounds = 0;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn write(root: &Path, name: &str, data: &[u8]) {
    let path = root.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

#[test]
fn trees_converge_after_one_announce_each() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let original = random_bytes(1, 100_000);
    write(dir_b.path(), "shared.bin", &original);
    thread::sleep(Duration::from_millis(50));
    let mut edited = original[..40_000].to_vec();
    edited.extend_from_slice(b"inserted on a");
    edited.extend_from_slice(&original[40_000..90_000]);
    write(dir_a.path(), "shared.bin", &edited);

    let notes = b"# notes\nkept on a\n".to_vec();
    let only_b = random_bytes(2, 7_777);
    write(dir_a.path(), "a1.txt", b"hello from a");
    write(dir_a.path(), "docs/notes.md", &notes);
    write(dir_a.path(), ".hidden/skip", b"never leaves a");
    write(dir_b.path(), "b-only.txt", &only_b);

    let mut a = Peer::start(dir_a.path());
    let mut b = Peer::start(dir_b.path());
    let (a_out, b_out) = (a.outbox.clone(), b.outbox.clone());
    a.push(Envelope::announce(a_out));
    b.push(Envelope::announce(b_out));
    run_until_quiet(&mut a, &mut b);

    let sys_a = a.stop();
    let sys_b = b.stop();

    assert_eq!(fs::read(dir_b.path().join("shared.bin")).unwrap(), edited);
    assert_eq!(fs::read(dir_a.path().join("shared.bin")).unwrap(), edited);
    assert_eq!(fs::read(dir_b.path().join("a1.txt")).unwrap(), b"hello from a");
    assert_eq!(fs::read(dir_b.path().join("docs/notes.md")).unwrap(), notes);
    assert_eq!(fs::read(dir_a.path().join("b-only.txt")).unwrap(), only_b);
    assert!(!dir_b.path().join(".hidden/skip").exists());

    // Listings come back sorted.
    assert_eq!(
        sys_a.store().list(false).unwrap(),
        sys_b.store().list(false).unwrap()
    );
}
