//! Block matcher: locate the requester's blocks inside the local file by weak signature, and
//! derive the non-matching spans between matches.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Seek, SeekFrom};

use crate::protocol::BlockPair;
use crate::signature::{self, RollingChecksum};

/// Largest span, per axis, of a single non-matching pair.
pub const MAX_SPAN: u32 = 1024 * 1024;

/// Bytes read from the local file per refill of the scan window.
const READ_CHUNK: usize = 64 * 1024;

/// Sliding view over a reader: keeps bytes from `base` onward, refilled on demand.
struct ScanWindow<R> {
    reader: R,
    buf: Vec<u8>,
    base: u64,
}

impl<R: Read> ScanWindow<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            base: 0,
        }
    }

    /// Make sure bytes up to (excluding) `end` are buffered.
    fn fill_to(&mut self, end: u64) -> io::Result<()> {
        while self.base + (self.buf.len() as u64) < end {
            let old = self.buf.len();
            self.buf.resize(old + READ_CHUNK, 0);
            let n = signature::read_full(&mut self.reader, &mut self.buf[old..])?;
            self.buf.truncate(old + n);
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "local file shorter than its recorded size",
                ));
            }
        }
        Ok(())
    }

    fn byte(&self, at: u64) -> u8 {
        self.buf[(at - self.base) as usize]
    }

    fn slice(&self, at: u64, len: u32) -> &[u8] {
        let start = (at - self.base) as usize;
        &self.buf[start..start + len as usize]
    }

    /// Drop buffered bytes before `at`.
    fn release(&mut self, at: u64) {
        let drop_n = (at - self.base) as usize;
        if drop_n >= READ_CHUNK {
            self.buf.drain(..drop_n);
            self.base = at;
        }
    }
}

/// Find the requester's blocks inside the local file.
///
/// `weak_signatures` holds one entry per aligned `block_size` block of the requester's file,
/// plus one for the trailing short block when `client_size` is not a multiple of the block
/// size. The scan is greedy, leftmost and first-fit: on a hit it consumes `block_size` local
/// bytes; otherwise it rolls forward one byte. Hits are not re-checked with strong signatures.
///
/// Returned pairs are ordered by both offsets and never overlap on either axis.
pub fn find_matching_blocks<R: Read + Seek>(
    file_name: &str,
    weak_signatures: &[u32],
    client_size: u64,
    block_size: u32,
    mut local: R,
    local_size: u64,
) -> io::Result<Vec<BlockPair>> {
    let b = block_size as u64;
    let full_blocks = (client_size / b) as usize;
    let tail_size = (client_size % b) as u32;

    let mut candidates: HashMap<u32, VecDeque<u64>> = HashMap::new();
    for (i, &sig) in weak_signatures.iter().take(full_blocks).enumerate() {
        candidates.entry(sig).or_default().push_back(i as u64 * b);
    }

    let mut matches = Vec::new();
    // Client offsets below this are consumed or would break ordering.
    let mut client_floor = 0u64;
    let mut pos = 0u64;

    if !candidates.is_empty() {
        local.seek(SeekFrom::Start(0))?;
        let mut window = ScanWindow::new(&mut local);
        let mut rolling: Option<RollingChecksum> = None;
        while pos + b <= local_size {
            window.fill_to(pos + b)?;
            let sum = match rolling.take() {
                Some(sum) => sum,
                None => RollingChecksum::new(window.slice(pos, block_size)),
            };
            if let Some(queue) = candidates.get_mut(&sum.value()) {
                while queue.front().is_some_and(|&c| c < client_floor) {
                    queue.pop_front();
                }
                if let Some(client_offset) = queue.pop_front() {
                    matches.push(BlockPair {
                        file_name: file_name.to_string(),
                        offset_client: client_offset,
                        offset_server: pos,
                        size_client: block_size,
                        size_server: block_size,
                    });
                    client_floor = client_offset + b;
                    pos += b;
                    window.release(pos);
                    continue;
                }
            }
            if pos + b < local_size {
                window.fill_to(pos + b + 1)?;
                let mut next = sum;
                next.roll(window.byte(pos), window.byte(pos + b));
                rolling = Some(next);
            }
            pos += 1;
            window.release(pos);
        }
    }

    if tail_size > 0 && weak_signatures.len() > full_blocks && local_size >= tail_size as u64 {
        let tail_server = local_size - tail_size as u64;
        let server_floor = matches.last().map(|m: &BlockPair| m.server_end()).unwrap_or(0);
        if tail_server >= server_floor {
            local.seek(SeekFrom::Start(tail_server))?;
            let mut tail = vec![0u8; tail_size as usize];
            let n = signature::read_full(&mut local, &mut tail)?;
            if n == tail.len()
                && signature::weak_signature(&tail) == weak_signatures[full_blocks]
            {
                matches.push(BlockPair {
                    file_name: file_name.to_string(),
                    offset_client: full_blocks as u64 * b,
                    offset_server: tail_server,
                    size_client: tail_size,
                    size_server: tail_size,
                });
            }
        }
    }

    Ok(matches)
}

/// Pairs spanning every gap around `matches` (sorted, non-overlapping) on both axes.
///
/// A gap exists where either axis has unmatched bytes. Gaps longer than [`MAX_SPAN`] on an
/// axis are split; the trailing gap is emitted whenever either file extends past the last
/// match.
pub fn get_block_pairs_between(
    file_name: &str,
    matches: &[BlockPair],
    client_size: u64,
    server_size: u64,
) -> Vec<BlockPair> {
    let mut out = Vec::new();
    let mut client = 0u64;
    let mut server = 0u64;
    for m in matches {
        push_gap(
            &mut out,
            file_name,
            (client, m.offset_client),
            (server, m.offset_server),
        );
        client = m.client_end();
        server = m.server_end();
    }
    push_gap(
        &mut out,
        file_name,
        (client, client_size),
        (server, server_size),
    );
    out
}

fn push_gap(out: &mut Vec<BlockPair>, file_name: &str, client: (u64, u64), server: (u64, u64)) {
    let (mut c, c_end) = client;
    let (mut s, s_end) = server;
    while c < c_end || s < s_end {
        let size_client = c_end.saturating_sub(c).min(MAX_SPAN as u64) as u32;
        let size_server = s_end.saturating_sub(s).min(MAX_SPAN as u64) as u32;
        out.push(BlockPair {
            file_name: file_name.to_string(),
            offset_client: c,
            offset_server: s,
            size_client,
            size_server,
        });
        c += size_client as u64;
        s += size_server as u64;
    }
}
