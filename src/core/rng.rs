//! Deterministic Dice RNG
//!
//! Uses Xorshift128+ for fast, deterministic randomness.
//! The generator lives inside `GameState` and is replicated with it, so
//! whichever peer holds authority continues the same dice stream.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Faces on a die.
pub const DIE_FACES: u32 = 6;

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use tysiacha::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.roll_dice(5), b.roll_dice(5));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create an RNG for a fresh game in a room.
    ///
    /// Mixes the room channel, the creating session and caller-supplied
    /// entropy so two rooms created at the same moment do not share dice.
    pub fn for_room(channel: &str, session: &str, entropy: u64) -> Self {
        Self::new(derive_room_seed(channel, session, entropy))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Simple modulo - bias is negligible for six faces
        (self.next_u64() % max as u64) as u32
    }

    /// Roll a single die (1..=6).
    #[inline]
    pub fn roll_die(&mut self) -> u8 {
        (self.next_int(DIE_FACES) + 1) as u8
    }

    /// Roll `count` dice.
    pub fn roll_dice(&mut self, count: usize) -> Vec<u8> {
        (0..count).map(|_| self.roll_die()).collect()
    }

    /// Get current state (for fingerprinting/debugging).
    pub fn state(&self) -> [u64; 2] {
        self.state
    }

    /// Restore from saved state.
    pub fn set_state(&mut self, state: [u64; 2]) {
        self.state = state;
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a game seed from the room channel, creator and entropy.
pub fn derive_room_seed(channel: &str, session: &str, entropy: u64) -> u64 {
    let mut hasher = Sha256::new();

    hasher.update(b"TYSIACHA_SEED_V1");
    hasher.update(channel.as_bytes());
    hasher.update(session.as_bytes());
    hasher.update(entropy.to_le_bytes());

    let hash = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_determinism() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(12345);

        for _ in 0..1000 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_different_seeds() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(54321);

        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_rng_known_values() {
        // Must never change: replicated games depend on the stream.
        let mut rng = DeterministicRng::new(42);
        assert_eq!(rng.next_u64(), 16629283624882167704);
        assert_eq!(rng.next_u64(), 1420492921613871959);
        assert_eq!(rng.next_u64(), 9768315062676884790);
    }

    #[test]
    fn test_roll_die_range() {
        let mut rng = DeterministicRng::new(1234);
        let mut seen = [false; 6];

        for _ in 0..1000 {
            let face = rng.roll_die();
            assert!((1..=6).contains(&face));
            seen[(face - 1) as usize] = true;
        }

        assert!(seen.iter().all(|s| *s), "every face should appear");
    }

    #[test]
    fn test_roll_dice_count() {
        let mut rng = DeterministicRng::new(7);
        assert_eq!(rng.roll_dice(5).len(), 5);
        assert_eq!(rng.roll_dice(2).len(), 2);
        assert!(rng.roll_dice(0).is_empty());
    }

    #[test]
    fn test_state_checkpoint() {
        let mut rng = DeterministicRng::new(5555);
        for _ in 0..50 {
            rng.next_u64();
        }

        let saved = rng.state();
        let next: Vec<u8> = rng.roll_dice(10);

        rng.set_state(saved);
        assert_eq!(rng.roll_dice(10), next);
    }

    #[test]
    fn test_rng_survives_serialization() {
        let mut rng = DeterministicRng::new(99);
        rng.next_u64();

        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: DeterministicRng = serde_json::from_str(&json).unwrap();

        assert_eq!(rng.roll_dice(5), restored.roll_dice(5));
    }

    #[test]
    fn test_derive_room_seed() {
        let a = derive_room_seed("room/BCDFG", "sid_a", 1);
        let b = derive_room_seed("room/BCDFG", "sid_a", 1);
        assert_eq!(a, b);

        assert_ne!(a, derive_room_seed("room/BCDFH", "sid_a", 1));
        assert_ne!(a, derive_room_seed("room/BCDFG", "sid_a", 2));
    }
}
