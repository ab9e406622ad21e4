//! Sources of a queued file and their failure records.
//!
//! Every item keeps two lists: good sources (candidates for download) and bad
//! sources (each with one classified reason and a removed marker). A user is
//! in at most one of them.

use crate::error::{QueueError, Result};
use ferry_files::{ContentIdError, decode_base32, encode_base32};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Status text for a good source
pub const NO_ERRORS_TEXT: &str = "No errors";

/// Status text for a source removed by the user
pub const REMOVED_TEXT: &str = "Removed by user";

/// Remote client identity (24 bytes, shown as base-32)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId([u8; 24]);

impl UserId {
    /// Raw identity length
    pub const LEN: usize = 24;

    /// Wrap raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 24]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }

    /// Encode as base-32 text (39 characters)
    #[must_use]
    pub fn to_base32(&self) -> String {
        encode_base32(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({self})")
    }
}

impl FromStr for UserId {
    type Err = ContentIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = decode_base32(s)?;
        let actual = bytes.len();
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| ContentIdError::InvalidLength {
                expected: Self::LEN,
                actual,
            })
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Why a source was moved to the bad list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFailure {
    /// Peer no longer shares the file
    FileNotAvailable,
    /// Peer is passive and cannot be reached
    Passive,
    /// Whole-file hash did not match the content id
    ChecksumMismatch,
    /// Tree metadata or a block did not match the content id
    BadTree,
    /// Peer could not supply tree metadata
    NoTree,
    /// Peer was too slow
    SlowSource,
    /// Peer lacks full tree support
    NoTreeSupport,
    /// Peer certificate not trusted
    Untrusted,
    /// Peer does not use encryption
    Unencrypted,
}

impl SourceFailure {
    /// Fixed user-facing status text
    #[must_use]
    pub fn status_text(self) -> &'static str {
        match self {
            SourceFailure::FileNotAvailable => "File not available",
            SourceFailure::Passive => "Passive user",
            SourceFailure::ChecksumMismatch => "Checksum inconsistency (whole-file hash mismatch)",
            SourceFailure::BadTree => "Full tree does not match TTH root",
            SourceFailure::NoTree => "No full tree available",
            SourceFailure::SlowSource => "Source too slow",
            SourceFailure::NoTreeSupport => {
                "Remote client does not fully support TTH - cannot download"
            }
            SourceFailure::Untrusted => "User certificate not trusted",
            SourceFailure::Unencrypted => "Remote ADC client does not use TLS encryption",
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_text())
    }
}

/// A candidate source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Remote identity
    pub user: UserId,
    /// Hub address the user was seen on
    pub hub: String,
    /// Peer offered no tree, tolerated because the file is small
    #[serde(default)]
    pub no_tree: bool,
}

/// A failed or removed source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadSource {
    /// Remote identity
    pub user: UserId,
    /// Hub address the user was seen on
    pub hub: String,
    /// Latest failure, `None` when dismissed by the user
    pub reason: Option<SourceFailure>,
    /// Removed permanently rather than failed
    #[serde(default)]
    pub removed: bool,
}

impl BadSource {
    /// Fixed user-facing status text
    #[must_use]
    pub fn status_text(&self) -> &'static str {
        self.reason.map_or(REMOVED_TEXT, SourceFailure::status_text)
    }
}

/// Good and bad sources of one item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceList {
    good: Vec<Source>,
    bad: Vec<BadSource>,
}

impl SourceList {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate sources
    #[must_use]
    pub fn good(&self) -> &[Source] {
        &self.good
    }

    /// Failed or removed sources
    #[must_use]
    pub fn bad(&self) -> &[BadSource] {
        &self.bad
    }

    /// Whether `user` is a candidate
    #[must_use]
    pub fn is_good(&self, user: &UserId) -> bool {
        self.good.iter().any(|s| s.user == *user)
    }

    /// Bad record for `user`
    #[must_use]
    pub fn find_bad(&self, user: &UserId) -> Option<&BadSource> {
        self.bad.iter().find(|s| s.user == *user)
    }

    /// Good record for `user`
    #[must_use]
    pub fn find_good(&self, user: &UserId) -> Option<&Source> {
        self.good.iter().find(|s| s.user == *user)
    }

    /// Whether any candidate exists
    #[must_use]
    pub fn has_candidates(&self) -> bool {
        !self.good.is_empty()
    }

    /// Add a candidate
    ///
    /// A removed bad record is cleared and the user re-admitted.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateSource`] if the user is already good or
    /// has a failure record that was not removed.
    pub fn add(&mut self, user: UserId, hub: impl Into<String>) -> Result<()> {
        if self.is_good(&user) {
            return Err(QueueError::DuplicateSource(user));
        }

        if let Some(pos) = self.bad.iter().position(|s| s.user == user) {
            if !self.bad[pos].removed {
                return Err(QueueError::DuplicateSource(user));
            }
            self.bad.remove(pos);
        }

        self.good.push(Source {
            user,
            hub: hub.into(),
            no_tree: false,
        });
        Ok(())
    }

    /// Move `user` to the bad list with `reason`
    ///
    /// An existing bad record only has its reason replaced. Returns false if
    /// the user is unknown.
    pub fn report_failure(&mut self, user: &UserId, reason: SourceFailure) -> bool {
        if let Some(pos) = self.good.iter().position(|s| s.user == *user) {
            let source = self.good.remove(pos);
            self.bad.push(BadSource {
                user: source.user,
                hub: source.hub,
                reason: Some(reason),
                removed: false,
            });
            return true;
        }

        match self.bad.iter_mut().find(|s| s.user == *user) {
            Some(record) => {
                record.reason = Some(reason);
                true
            }
            None => false,
        }
    }

    /// Remove `user` permanently
    ///
    /// `reason` of `None` means dismissed by the user. Returns false if the
    /// user is unknown.
    pub fn remove(&mut self, user: &UserId, reason: Option<SourceFailure>) -> bool {
        if let Some(pos) = self.good.iter().position(|s| s.user == *user) {
            let source = self.good.remove(pos);
            self.bad.push(BadSource {
                user: source.user,
                hub: source.hub,
                reason,
                removed: true,
            });
            return true;
        }

        match self.bad.iter_mut().find(|s| s.user == *user) {
            Some(record) => {
                record.removed = true;
                if reason.is_some() {
                    record.reason = reason;
                }
                true
            }
            None => false,
        }
    }

    /// Clear bad records for one user, or for all when `user` is `None`
    ///
    /// Returns the number of re-admitted sources.
    pub fn readd(&mut self, user: Option<&UserId>) -> usize {
        let (readded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.bad)
            .into_iter()
            .partition(|s| user.is_none_or(|u| s.user == *u));
        self.bad = kept;

        let count = readded.len();
        self.good.extend(readded.into_iter().map(|s| Source {
            user: s.user,
            hub: s.hub,
            no_tree: false,
        }));
        count
    }

    /// Mark a good source as lacking tree metadata
    pub fn set_no_tree(&mut self, user: &UserId) -> bool {
        match self.good.iter_mut().find(|s| s.user == *user) {
            Some(source) => {
                source.no_tree = true;
                true
            }
            None => false,
        }
    }

    /// Merge candidates from another list, skipping known users
    ///
    /// Returns the number of sources added.
    pub fn merge(&mut self, other: &SourceList) -> usize {
        other
            .good
            .iter()
            .filter(|s| self.add(s.user, s.hub.clone()).is_ok())
            .count()
    }

    /// Status text for `user`
    #[must_use]
    pub fn status_text(&self, user: &UserId) -> Option<&'static str> {
        if self.is_good(user) {
            return Some(NO_ERRORS_TEXT);
        }
        self.find_bad(user).map(BadSource::status_text)
    }
}
