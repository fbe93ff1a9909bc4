/*!
Replay suppression for onion packets.

Every accepted packet leaves its [`ReplayTag`] in a bloom filter; a tag
seen twice within the detection window is dropped. Two filters are kept
so that detection keeps working across a window rollover: tags recorded
shortly before the rollover still reject replays arriving shortly after
it. A bloom filter never misses a recorded tag, it can only reject a
small fraction of fresh packets by collision, which a relay treats the
same as any other drop.
*/

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use mixnet_packet::onion::ReplayTag;

use crate::time::clock_now;

/// Default detection window.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(600);

/// Default filter size as a power of two, in bits. 2^23 bits is 1 MiB
/// per window.
pub const BLOOM_BITS_POW: u8 = 23;

/// Number of bit positions set per tag.
pub const BLOOM_HASHES: usize = 4;

struct Bloom {
    bits: Vec<u64>,
    mask: u64,
    hashes: usize,
}

impl Bloom {
    fn new(bits_pow: u8, hashes: usize) -> Bloom {
        let words = 1usize << (bits_pow.saturating_sub(6));
        Bloom {
            bits: vec![0; words],
            mask: (1u64 << bits_pow) - 1,
            hashes,
        }
    }

    fn positions(&self, tag: &ReplayTag) -> impl Iterator<Item = u64> + '_ {
        let mut indexes = vec![0u8; self.hashes * 8];
        blake3::Hasher::new()
            .update(&tag.0)
            .finalize_xof()
            .fill(&mut indexes);
        (0..self.hashes).map(move |i| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&indexes[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(bytes) & self.mask
        })
    }

    fn contains(&self, tag: &ReplayTag) -> bool {
        self.positions(tag)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    fn insert(&mut self, tag: &ReplayTag) {
        let positions: Vec<u64> = self.positions(tag).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    fn clear(&mut self) {
        for word in &mut self.bits {
            *word = 0;
        }
    }
}

struct Windows {
    current: Bloom,
    previous: Bloom,
    rolled_at: Instant,
}

/// Duplicate detector shared by all workers of a relay.
pub struct ReplayGuard {
    windows: Mutex<Windows>,
    window: Duration,
}

impl ReplayGuard {
    /// New `ReplayGuard` with the default filter parameters.
    pub fn new(window: Duration) -> ReplayGuard {
        ReplayGuard::with_params(window, BLOOM_BITS_POW, BLOOM_HASHES)
    }

    /// New `ReplayGuard` with explicit filter parameters.
    pub fn with_params(window: Duration, bits_pow: u8, hashes: usize) -> ReplayGuard {
        ReplayGuard {
            windows: Mutex::new(Windows {
                current: Bloom::new(bits_pow, hashes),
                previous: Bloom::new(bits_pow, hashes),
                rolled_at: clock_now(),
            }),
            window,
        }
    }

    /** Record a tag, telling whether it is fresh.

    Returns `true` if the tag was not seen within the detection window
    and is recorded now; `false` means the packet is a replay and must
    be dropped.
    */
    pub fn observe(&self, tag: &ReplayTag) -> bool {
        let mut windows = self.windows.lock().expect("replay guard lock poisoned");
        let windows = &mut *windows;

        if clock_now() - windows.rolled_at >= self.window {
            std::mem::swap(&mut windows.current, &mut windows.previous);
            windows.current.clear();
            windows.rolled_at = clock_now();
        }

        if windows.current.contains(tag) || windows.previous.contains(tag) {
            return false;
        }
        windows.current.insert(tag);
        true
    }
}
