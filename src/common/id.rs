//! Kademlia node Id or a lookup target
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use bytes::Bytes;
use rand::RngCore;

use crate::Error;

/// The default size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Kademlia node Id or a lookup target.
///
/// The length is fixed per deployment ([ID_SIZE] by default), but not at compile time,
/// so every Id carries its own bytes. Comparing Ids orders them lexicographically.
pub struct Id(Bytes);

impl Id {
    /// Generate a random Id of `length` bytes.
    pub fn random(length: usize) -> Id {
        let mut bytes = vec![0_u8; length];
        rand::thread_rng().fill_bytes(&mut bytes);

        Id(bytes.into())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length `length`.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T, length: usize) -> Result<Id, Error> {
        let bytes = bytes.as_ref();

        if bytes.len() != length {
            return Err(Error::InvalidIdLength {
                expected: length,
                actual: bytes.len(),
            });
        }

        Ok(Id(Bytes::copy_from_slice(bytes)))
    }

    /// Returns true if `bytes` would make a valid Id of `length` bytes.
    pub fn is_valid(bytes: &[u8], length: usize) -> bool {
        bytes.len() == length
    }

    /// Number of bytes in this Id.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the degenerate zero length Id.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of bits in this Id, which is also the maximum [Id::distance].
    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR metric between this Id and another, as a big endian unsigned integer.
    ///
    /// Ids of different lengths are compared as if the shorter one was padded with zeros.
    pub fn xor(&self, other: &Id) -> Distance {
        let len = self.len().max(other.len());

        let bytes = (0..len)
            .map(|i| self.0.get(i).copied().unwrap_or(0) ^ other.0.get(i).copied().unwrap_or(0))
            .collect();

        Distance(bytes)
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing bits after the longest common prefix.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160 (for 20 bytes Ids)
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> usize {
        let len = self.len().max(other.len());

        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = i * 8 + (a ^ b).leading_zeros() as usize;

                return len * 8 - leading_zeros;
            }
        }

        0
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse a hex encoded Id of any non-zero even length.
    fn from_str(s: &str) -> Result<Id, Error> {
        if s.is_empty() {
            return Err(Error::InvalidIdSize(0));
        }

        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(Error::InvalidIdHex(s.to_string()));
        }

        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| Error::InvalidIdHex(s.to_string()))?;

        Ok(Id(bytes.into()))
    }
}

/// The XOR of two [Id]s read as an unsigned big endian integer.
#[derive(Clone, Debug)]
pub struct Distance(Box<[u8]>);

impl Distance {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        // Leading zeros carry no magnitude, whatever the byte length.
        let a = strip_leading_zeros(&self.0);
        let b = strip_leading_zeros(&other.0);

        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialEq for Distance {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Distance {}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = Id::random(ID_SIZE);
        let distance = id.distance(&id);
        assert_eq!(distance, 0)
    }

    #[test]
    fn distance_to_id() {
        let id = Id::from_str("0639A1E24FBB8AB277DF033476AB0DE10FAB3BDC").unwrap();

        let target = Id::from_str("035b1aeb9737ade1a80933594f405d3f772aa08e").unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, 155)
    }

    #[test]
    fn distance_to_random_id() {
        let id = Id::random(ID_SIZE);
        let target = Id::random(ID_SIZE);

        let distance = id.distance(&target);

        assert_ne!(distance, 0)
    }

    #[test]
    fn distance_to_furthest() {
        let id = Id::random(ID_SIZE);

        let mut opposite = [0_u8; 20];
        for (i, &value) in id.as_bytes().iter().enumerate() {
            opposite[i] = value ^ 0xff;
        }
        let target = Id::from_bytes(opposite, ID_SIZE).unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, 160)
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(Id::from_bytes([0_u8; 20], ID_SIZE).is_ok());
        assert!(matches!(
            Id::from_bytes([0_u8; 19], ID_SIZE),
            Err(Error::InvalidIdLength {
                expected: 20,
                actual: 19
            })
        ));
        assert!(Id::from_bytes([0_u8; 32], 32).is_ok());
    }

    #[test]
    fn hex_round_trip() {
        let hex = "aaaabbbbccccddddeeeeaaaabbbbccccddddeeee";
        let id = Id::from_str(hex).unwrap();

        assert_eq!(id.len(), 20);
        assert_eq!(id.to_string(), hex);
        assert!(Id::from_str("abc").is_err());
        assert!(Id::from_str("zz").is_err());
    }

    #[test]
    fn xor_orders_like_unsigned_integers() {
        let target = Id::from_bytes([0_u8; 4], 4).unwrap();
        let near = Id::from_bytes([0, 0, 0, 0xff], 4).unwrap();
        let far = Id::from_bytes([0, 1, 0, 0], 4).unwrap();

        assert!(near.xor(&target) < far.xor(&target));
        assert_eq!(near.xor(&target), target.xor(&near));
        assert_eq!(target.xor(&target).as_bytes(), &[0, 0, 0, 0]);
    }
}
