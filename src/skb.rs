use std::fmt;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::SkbError;
use crate::sqn::Sqn;

/// Transport session identifier: the sender's global source id plus its source port.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Tsi {
    pub gsi: [u8; 6],
    pub sport: u16,
}

impl Tsi {
    pub const fn new(gsi: [u8; 6], sport: u16) -> Self {
        Self { gsi, sport }
    }
}

impl fmt::Display for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.gsi;
        write!(
            f,
            "{}.{}.{}.{}.{}.{}.{}",
            g[0], g[1], g[2], g[3], g[4], g[5], self.sport
        )
    }
}

struct Body {
    storage: Box<[u8]>,
    // Start of valid payload
    data: usize,
    // One past the end of valid payload
    tail: usize,
    tsi: Tsi,
    tstamp: u64,
    sequence: Sqn,
}

/// A shared handle to one packet's storage.
///
/// The storage is laid out as `head <= data <= tail <= end`, where `[head, data)` is reserved
/// header room and `[data, tail)` is the valid payload. Every handle refers to the same storage
/// and cursors; the storage is freed when the last handle is released.
pub struct SkBuff {
    body: Arc<Mutex<Body>>,
}

impl SkBuff {
    pub fn allocate(capacity: usize) -> Self {
        Self {
            body: Arc::new(Mutex::new(Body {
                storage: vec![0; capacity].into_boxed_slice(),
                data: 0,
                tail: 0,
                tsi: Tsi::default(),
                tstamp: 0,
                sequence: 0,
            })),
        }
    }

    /// Allocates a buffer holding exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let skb = Self::allocate(bytes.len());
        skb.append(bytes);
        skb
    }

    /// Returns an additional handle to the same storage.
    pub fn acquire(&self) -> Self {
        Self {
            body: Arc::clone(&self.body),
        }
    }

    /// Drops this handle. Storage is freed with the last one.
    pub fn release(self) {}

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.body)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    /// Moves `data` and `tail` forward by `n`, reserving header room. Panics if the buffer would
    /// overrun.
    pub fn reserve(&self, n: usize) {
        let mut body = self.body.lock();

        let tail = body.tail + n;
        if tail > body.storage.len() {
            panic!(
                "skb over panic: reserve of {} bytes exceeds tailroom of {}",
                n,
                body.storage.len() - body.tail
            );
        }

        body.data += n;
        body.tail = tail;
    }

    /// Copies `bytes` to the end of the payload. Panics if the buffer would overrun.
    pub fn append(&self, bytes: &[u8]) {
        let mut body = self.body.lock();

        let begin = body.tail;
        let end = begin + bytes.len();
        if end > body.storage.len() {
            panic!(
                "skb over panic: append of {} bytes exceeds tailroom of {}",
                bytes.len(),
                body.storage.len() - begin
            );
        }

        body.storage[begin..end].copy_from_slice(bytes);
        body.tail = end;
    }

    /// Strips `n` bytes from the front of the payload.
    pub fn consume(&self, n: usize) -> Result<(), SkbError> {
        let mut body = self.body.lock();

        let len = body.tail - body.data;
        if n > len {
            return Err(SkbError::Underflow { requested: n, len });
        }

        body.data += n;
        Ok(())
    }

    pub fn len(&self) -> usize {
        let body = self.body.lock();
        body.tail - body.data
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.body.lock().storage.len()
    }

    pub fn headroom(&self) -> usize {
        self.body.lock().data
    }

    pub fn tailroom(&self) -> usize {
        let body = self.body.lock();
        body.storage.len() - body.tail
    }

    /// Locks the storage and returns the valid payload.
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.body.lock(), |body| {
            let (data, tail) = (body.data, body.tail);
            &mut body.storage[data..tail]
        })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    pub fn tsi(&self) -> Tsi {
        self.body.lock().tsi
    }

    pub fn set_tsi(&self, tsi: Tsi) {
        self.body.lock().tsi = tsi;
    }

    pub fn tstamp(&self) -> u64 {
        self.body.lock().tstamp
    }

    pub fn set_tstamp(&self, tstamp: u64) {
        self.body.lock().tstamp = tstamp;
    }

    pub fn sequence(&self) -> Sqn {
        self.body.lock().sequence
    }

    pub fn set_sequence(&self, sequence: Sqn) {
        self.body.lock().sequence = sequence;
    }
}

impl Clone for SkBuff {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl fmt::Debug for SkBuff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.lock();
        f.debug_struct("SkBuff")
            .field("tsi", &body.tsi)
            .field("sequence", &body.sequence)
            .field("data", &body.data)
            .field("tail", &body.tail)
            .field("end", &body.storage.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_empty() {
        let skb = SkBuff::allocate(100);

        assert_eq!(skb.len(), 0);
        assert_eq!(skb.headroom(), 0);
        assert_eq!(skb.tailroom(), 100);
        assert_eq!(skb.capacity(), 100);
        assert_eq!(skb.ref_count(), 1);
    }

    #[test]
    fn reserve_append_consume() {
        let skb = SkBuff::allocate(32);

        skb.reserve(8);
        assert_eq!(skb.headroom(), 8);
        assert_eq!(skb.len(), 0);

        skb.append(&[1, 2, 3, 4, 5]);
        assert_eq!(skb.len(), 5);
        assert_eq!(skb.tailroom(), 32 - 13);
        assert_eq!(&*skb.data(), &[1, 2, 3, 4, 5]);

        skb.consume(2).unwrap();
        assert_eq!(&*skb.data(), &[3, 4, 5]);
        assert_eq!(skb.headroom(), 10);

        assert_eq!(
            skb.consume(4),
            Err(SkbError::Underflow {
                requested: 4,
                len: 3
            })
        );
        assert_eq!(skb.len(), 3);

        skb.consume(3).unwrap();
        assert!(skb.is_empty());
    }

    #[test]
    fn shared_handles() {
        let skb = SkBuff::allocate(16);
        skb.append(b"abc");

        let other = skb.acquire();
        assert_eq!(skb.ref_count(), 2);
        assert!(skb.ptr_eq(&other));

        other.consume(1).unwrap();
        assert_eq!(skb.to_vec(), b"bc");

        other.release();
        assert_eq!(skb.ref_count(), 1);
    }

    #[test]
    fn metadata() {
        let skb = SkBuff::allocate(0);
        let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);

        skb.set_tsi(tsi);
        skb.set_sequence(77);
        skb.set_tstamp(123);

        assert_eq!(skb.tsi(), tsi);
        assert_eq!(skb.sequence(), 77);
        assert_eq!(skb.tstamp(), 123);
        assert_eq!(tsi.to_string(), "1.2.3.4.5.6.1000");
    }

    #[test]
    #[should_panic(expected = "skb over panic")]
    fn append_overrun() {
        let skb = SkBuff::allocate(4);
        skb.append(&[0; 5]);
    }

    #[test]
    #[should_panic(expected = "skb over panic")]
    fn reserve_overrun() {
        let skb = SkBuff::allocate(4);
        skb.append(&[0; 2]);
        skb.reserve(3);
    }
}
