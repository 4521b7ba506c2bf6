//! Identifier algebra: XOR distance and bit addressing over contact ids.
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};

use bytes::Bytes;
use rand::Rng;

/// The size in bytes of generated identifiers (160 bits).
pub const ID_LENGTH: usize = 20;

/// XOR distance between two identifiers.
///
/// Interpreted as a big-endian magnitude; used only for ordering, so leading
/// zero bytes are insignificant when comparing.
#[derive(Clone)]
pub struct Distance(Box<[u8]>);

/// XOR distance between two identifiers.
///
/// When the identifiers differ in length, the shorter one is treated as
/// right-padded with `0xFF` bytes, so a missing tail counts as maximally
/// distant.
pub fn distance<A: AsRef<[u8]>, B: AsRef<[u8]>>(a: A, b: B) -> Distance {
    let a = a.as_ref();
    let b = b.as_ref();

    let len = a.len().max(b.len());
    let mut xor = Vec::with_capacity(len);

    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0xff);
        let y = b.get(i).copied().unwrap_or(0xff);

        xor.push(x ^ y);
    }

    Distance(xor.into_boxed_slice())
}

/// The `index`th bit of `id`, counting from the most significant bit of
/// byte 0. Bits addressing bytes beyond the id's length read as 0, so short
/// identifiers always route towards the left (zero) side of the tree.
pub(crate) fn bit_at(id: &[u8], index: usize) -> bool {
    match id.get(index / 8) {
        Some(byte) => byte & (0x80 >> (index % 8)) != 0,
        None => false,
    }
}

/// A fresh uniformly-random identifier of [ID_LENGTH] bytes.
pub(crate) fn random_id() -> Bytes {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; ID_LENGTH] = rng.gen();

    Bytes::copy_from_slice(&random_bytes)
}

impl Distance {
    /// Whether this is the zero distance, i.e. the two identifiers were equal.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }

    /// The raw XOR bytes, including leading zeros.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn significant(&self) -> &[u8] {
        let start = self
            .0
            .iter()
            .position(|&byte| byte != 0)
            .unwrap_or(self.0.len());

        &self.0[start..]
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.significant();
        let b = other.significant();

        // A longer magnitude with a non-zero leading byte is the bigger number.
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Distance {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Distance {}

impl Display for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.significant() {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:x?})", &self.0)
    }
}
