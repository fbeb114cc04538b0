//! Signatures: weak rolling checksum over a block window, strong 128-bit content hash.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Default block size in bytes for weak signatures.
pub const DEFAULT_BLOCK_SIZE: u32 = 6000;

/// Modulus of both rolling accumulators (2^16).
const MODULUS_MASK: u32 = 0xffff;
const MODULUS_SHIFT: u32 = 16;

/// Strong signature length in bytes (128 bits).
pub const STRONG_SIGNATURE_LEN: usize = 16;

/// Buffer size used when hashing a stream.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Two-accumulator rolling checksum over a fixed window.
///
/// `r1` is the byte sum and `r2` the position-weighted sum, both mod 2^16.
/// All arithmetic wraps in u32; masking afterwards is exact since 2^16 divides 2^32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingChecksum {
    r1: u32,
    r2: u32,
    window: u32,
}

impl RollingChecksum {
    /// Compute the checksum of `window` directly.
    pub fn new(window: &[u8]) -> Self {
        let len = window.len() as u32;
        let mut r1: u32 = 0;
        let mut r2: u32 = 0;
        for (i, &b) in window.iter().enumerate() {
            r1 = r1.wrapping_add(b as u32);
            r2 = r2.wrapping_add(len.wrapping_sub(i as u32).wrapping_mul(b as u32));
        }
        Self {
            r1: r1 & MODULUS_MASK,
            r2: r2 & MODULUS_MASK,
            window: len,
        }
    }

    /// Slide the window one byte: `outgoing` leaves at the front, `incoming` enters at the back.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        self.r1 = self
            .r1
            .wrapping_sub(outgoing as u32)
            .wrapping_add(incoming as u32)
            & MODULUS_MASK;
        self.r2 = self
            .r2
            .wrapping_sub(self.window.wrapping_mul(outgoing as u32))
            .wrapping_add(self.r1)
            & MODULUS_MASK;
    }

    /// Signature value: `r1 + 2^16 * r2`.
    pub fn value(&self) -> u32 {
        self.r1 | (self.r2 << MODULUS_SHIFT)
    }

    pub fn window(&self) -> u32 {
        self.window
    }
}

/// Weak signature of a whole window.
pub fn weak_signature(window: &[u8]) -> u32 {
    RollingChecksum::new(window).value()
}

/// Weak signatures of consecutive aligned blocks of `reader`. The last entry covers the
/// trailing short block when the input length is not a multiple of `block_size`.
pub fn block_signatures<R: Read>(mut reader: R, block_size: u32) -> io::Result<Vec<u32>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; block_size.max(1) as usize];
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        out.push(weak_signature(&buf[..n]));
        if n < buf.len() {
            break;
        }
    }
    Ok(out)
}

/// Strong signature of an in-memory buffer as lowercase hex.
pub fn strong_signature(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..STRONG_SIGNATURE_LEN])
}

/// Strong signature of a stream, hashed in fixed-size buffers.
pub fn strong_signature_of_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..STRONG_SIGNATURE_LEN]))
}

/// Read until `buf` is full or EOF. Returns bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
