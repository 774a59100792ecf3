// Copyright 2024 The pgit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Identifier types shared by every store: commit time-tokens, content
//! hashes, and the integer surrogates used by the registry tables.

use std::fmt;
use std::fmt::Debug;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use rand::RngCore as _;
use thiserror::Error;

/// Crockford base32, in ascending ASCII order so that encoded tokens sort
/// byte-wise in the same order as the 128-bit values they encode.
const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Number of characters in a commit token.
pub const COMMIT_ID_LEN: usize = 26;

/// Error returned when parsing an identifier from untrusted input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("Invalid commit id {input:?} (expected {COMMIT_ID_LEN} base32 characters)")]
    InvalidCommitId { input: String },
    #[error("Invalid content hash length (expected {expected} bytes, got {actual}): {hex}")]
    InvalidHashLength {
        expected: usize,
        actual: usize,
        hex: String,
    },
}

/// Identifier of a commit: a 26-character time-ordered token whose
/// lexicographic order matches creation time.
///
/// The first 10 characters encode a 48-bit millisecond timestamp, the
/// remaining 16 encode 80 bits of entropy. Tokens are generated through
/// [`TimeTokenGenerator`] which keeps the entropy tail monotonic so that two
/// tokens minted in the same millisecond still sort in mint order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    /// Wraps a token that is already known to be valid (e.g. read back from
    /// the database).
    pub fn new(token: String) -> Self {
        debug_assert!(Self::is_valid(&token));
        Self(token)
    }

    /// Parses a full token from untrusted input.
    pub fn try_from_str(token: &str) -> Result<Self, IdParseError> {
        if Self::is_valid(token) {
            Ok(Self(token.to_owned()))
        } else {
            Err(IdParseError::InvalidCommitId {
                input: token.to_owned(),
            })
        }
    }

    /// Builds a token from a millisecond timestamp and an explicit entropy
    /// tail. The import pipeline derives the entropy from source content so
    /// that re-running the same stream reproduces the same ids.
    pub fn from_parts(ms: i64, entropy: [u8; 10]) -> Self {
        Self(encode_token(ms.max(0), entropy))
    }

    fn is_valid(token: &str) -> bool {
        token.len() == COMMIT_ID_LEN && token.bytes().all(|b| ENCODING.contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The millisecond timestamp encoded in the token prefix.
    pub fn timestamp_ms(&self) -> i64 {
        (self.decode() >> 80) as i64
    }

    fn decode(&self) -> u128 {
        let mut value: u128 = 0;
        for b in self.0.bytes() {
            let digit = ENCODING.iter().position(|&e| e == b).unwrap() as u128;
            value = (value << 5) | digit;
        }
        value
    }
}

impl Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommitId").field(&self.0).finish()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Mints commit tokens for a given wall-clock position.
///
/// Guarantees strict monotonicity across calls even when the supplied
/// timestamps tie or run backwards (imported histories are only ordered, not
/// strictly increasing): the generator never emits a token that sorts at or
/// below its predecessor.
#[derive(Debug, Default)]
pub struct TimeTokenGenerator {
    last: Mutex<Option<(i64, [u8; 10])>>,
}

impl TimeTokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a token whose timestamp prefix encodes `at` (clamped forward if
    /// an earlier call already used a later timestamp).
    pub fn next(&self, at: DateTime<Utc>) -> CommitId {
        let requested_ms = at.timestamp_millis().max(0);
        let mut last = self.last.lock().unwrap();
        let (ms, entropy) = match *last {
            Some((last_ms, last_entropy)) if requested_ms <= last_ms => {
                (last_ms, increment_entropy(last_entropy))
            }
            _ => {
                let mut entropy = [0_u8; 10];
                rand::rng().fill_bytes(&mut entropy);
                (requested_ms, entropy)
            }
        };
        *last = Some((ms, entropy));
        CommitId(encode_token(ms, entropy))
    }

    /// Mints a token for the current wall clock.
    pub fn next_now(&self) -> CommitId {
        self.next(Utc::now())
    }

    /// Raises the floor so every future token sorts after `id`. Called with
    /// the current head before appending to an existing history.
    pub fn observe(&self, id: &CommitId) {
        let value = id.decode();
        let ms = (value >> 80) as i64;
        let mut entropy = [0_u8; 10];
        for (i, byte) in entropy.iter_mut().enumerate() {
            *byte = ((value >> (8 * (9 - i))) & 0xff) as u8;
        }
        let mut last = self.last.lock().unwrap();
        if last.is_none_or(|(last_ms, last_entropy)| (last_ms, last_entropy) < (ms, entropy)) {
            *last = Some((ms, entropy));
        }
    }
}

fn increment_entropy(mut entropy: [u8; 10]) -> [u8; 10] {
    for byte in entropy.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
    entropy
}

fn encode_token(ms: i64, entropy: [u8; 10]) -> String {
    // 48 bits of timestamp + 80 bits of entropy, encoded as 26 base32
    // characters (the top two bits of the first character are zero).
    let mut value: u128 = ((ms as u128) & 0xffff_ffff_ffff) << 80;
    for (i, byte) in entropy.iter().enumerate() {
        value |= u128::from(*byte) << (8 * (9 - i));
    }
    let mut out = [0_u8; COMMIT_ID_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 5 * (COMMIT_ID_LEN - 1 - i);
        *slot = ENCODING[((value >> shift) & 0x1f) as usize];
    }
    String::from_utf8(out.to_vec()).unwrap()
}

/// Returns the exclusive upper bound of the token range that starts with
/// `prefix`, for `[prefix, bound)` scans. The caller must pass a non-empty
/// prefix.
pub(crate) fn prefix_upper_bound(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    let last = bytes.last_mut().unwrap();
    *last += 1;
    String::from_utf8(bytes).unwrap()
}

/// A 16-byte BLAKE3 prefix identifying file content, stored raw.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    pub const LEN: usize = 16;

    /// Hashes the given payload.
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0_u8; Self::LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..Self::LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdParseError> {
        let array: [u8; Self::LEN] =
            bytes
                .try_into()
                .map_err(|_| IdParseError::InvalidHashLength {
                    expected: Self::LEN,
                    actual: bytes.len(),
                    hex: hex::encode(bytes),
                })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&self.hex()).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.hex())
    }
}

macro_rules! surrogate_id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(
            Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, serde::Serialize,
        )]
        #[serde(transparent)]
        $vis struct $name(pub i32);

        impl $name {
            pub fn value(self) -> i32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

surrogate_id_type!(
    /// Surrogate key of a registered path.
    pub PathId
);
surrogate_id_type!(
    /// Key of a delta chain in the content tables. Multiple paths may share
    /// one group.
    pub GroupId
);
surrogate_id_type!(
    /// Monotonic position of a content row within its group's chain.
    pub VersionId
);
surrogate_id_type!(
    /// Import-order sequence number of a commit-graph entry.
    pub GraphSeq
);

/// The result of resolving a partial commit id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixResolution<T> {
    NoMatch,
    SingleMatch(T),
    /// Carries the candidates so the error message can enumerate them.
    AmbiguousMatch(Vec<T>),
}

impl<T> PrefixResolution<T> {
    pub fn map<U>(self, f: impl Fn(T) -> U) -> PrefixResolution<U> {
        match self {
            Self::NoMatch => PrefixResolution::NoMatch,
            Self::SingleMatch(x) => PrefixResolution::SingleMatch(f(x)),
            Self::AmbiguousMatch(xs) => {
                PrefixResolution::AmbiguousMatch(xs.into_iter().map(f).collect())
            }
        }
    }
}
