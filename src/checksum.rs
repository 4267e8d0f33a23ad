// Copyright 2020 Joyent, Inc.

//! Running CRC-32 over the serialized bytes of one top-level variable.

use crc32fast::Hasher;

pub struct ChecksumTracker {
    enabled: bool,
    hasher: Hasher,
}

impl ChecksumTracker {
    pub fn new(enabled: bool) -> ChecksumTracker {
        ChecksumTracker {
            enabled,
            hasher: Hasher::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn reset(&mut self) {
        self.hasher.reset();
    }

    pub fn update(&mut self, bytes: &[u8]) {
        if self.enabled {
            self.hasher.update(bytes);
        }
    }

    /// Digest of everything seen since the last reset. Does not reset.
    pub fn digest(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn matches_reference_crc32() {
        let mut tracker = ChecksumTracker::new(true);
        tracker.update(b"1234");
        tracker.update(b"56789");
        // CRC-32/ISO-HDLC check value
        assert_eq!(tracker.digest(), 0xCBF4_3926);
        tracker.reset();
        assert_eq!(tracker.digest(), 0);
    }

    #[test]
    fn disabled_tracker_ignores_bytes() {
        let mut tracker = ChecksumTracker::new(false);
        tracker.update(b"ignored");
        assert_eq!(tracker.digest(), 0);
    }
}
