//! Room Addressing
//!
//! Humans type a short room code; peers subscribe to the channel derived
//! from it. The alphabet leaves out vowels and the characters people mix
//! up (0/O, 1/I/L), so codes are easy to read aloud and never spell words.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Serialize, Deserialize};

/// Characters a room code may contain.
pub const ROOM_CODE_ALPHABET: &str = "BCDFGHJKMNPQRSTVWXZ23456789";

/// Length of every room code.
pub const ROOM_CODE_LEN: usize = 5;

/// Prefix shared by every room channel.
pub const CHANNEL_PREFIX: &str = "tysiacha-v3-app/room";

/// A validated room code.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a random code.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Generate a code from a caller-supplied RNG.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let alphabet = ROOM_CODE_ALPHABET.as_bytes();
        let code = (0..ROOM_CODE_LEN)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input: surrounding whitespace is ignored and case folded.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let code = input.trim().to_ascii_uppercase();

        if code.chars().count() != ROOM_CODE_LEN {
            return Err(RoomCodeError::BadLength(code.chars().count()));
        }
        if let Some(c) = code.chars().find(|c| !ROOM_CODE_ALPHABET.contains(*c)) {
            return Err(RoomCodeError::BadCharacter(c));
        }

        Ok(Self(code))
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel all peers of this room publish to.
    pub fn channel(&self) -> ChannelId {
        ChannelId(format!("{}/{}", CHANNEL_PREFIX, self.0))
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport channel identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invalid room code input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomCodeError {
    /// Wrong number of characters.
    #[error("Room code must be {} characters, got {0}", ROOM_CODE_LEN)]
    BadLength(usize),

    /// Character outside the alphabet.
    #[error("Room code contains invalid character '{0}'")]
    BadCharacter(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_generated_codes_parse() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let code = RoomCode::generate_with(&mut rng);
            assert_eq!(code.as_str().len(), ROOM_CODE_LEN);
            assert_eq!(RoomCode::parse(code.as_str()), Ok(code));
        }
    }

    #[test]
    fn test_parse_normalizes() {
        let code = RoomCode::parse("  bcd23 ").unwrap();
        assert_eq!(code.as_str(), "BCD23");
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(RoomCode::parse("BCD2"), Err(RoomCodeError::BadLength(4)));
        assert_eq!(RoomCode::parse("BCDA2"), Err(RoomCodeError::BadCharacter('A')));
        assert_eq!(RoomCode::parse("BCD02"), Err(RoomCodeError::BadCharacter('0')));
        assert_eq!(RoomCode::parse("BCDL2"), Err(RoomCodeError::BadCharacter('L')));
    }

    #[test]
    fn test_alphabet_has_no_vowels_or_lookalikes() {
        for c in "AEIOUY01L".chars() {
            assert!(!ROOM_CODE_ALPHABET.contains(c), "{}", c);
        }
    }

    #[test]
    fn test_channel_is_deterministic() {
        let a = RoomCode::parse("XK7PQ").unwrap();
        let b = RoomCode::parse("xk7pq").unwrap();
        assert_eq!(a.channel(), b.channel());
        assert_eq!(a.channel().as_str(), "tysiacha-v3-app/room/XK7PQ");
    }

    #[test]
    fn test_serde_validates() {
        let code: RoomCode = serde_json::from_str("\"mnp34\"").unwrap();
        assert_eq!(code.as_str(), "MNP34");
        assert!(serde_json::from_str::<RoomCode>("\"AAAAA\"").is_err());
    }
}
