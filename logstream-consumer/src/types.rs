use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one independently-ordered shard of a log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque resumable position token within a shard.
///
/// Totally ordered within a shard by the service; this crate never interprets
/// the contents, it only compares tokens for equality and emptiness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Where consumption starts when no persisted checkpoint exists for a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPosition {
    /// Oldest retained position.
    Begin,
    /// Tail of the shard.
    End,
    /// First position at or after the given wall-clock time.
    Timestamp(DateTime<Utc>),
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "begin" => Ok(Self::Begin),
            "end" => Ok(Self::End),
            _ => s
                .parse::<DateTime<Utc>>()
                .map(Self::Timestamp)
                .map_err(|e| format!("invalid start position {s:?}: {e}")),
        }
    }
}

/// One log line: a timestamp plus ordered key/value fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<(String, String)>,
}

impl LogRecord {
    pub fn byte_size(&self) -> usize {
        self.fields.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// A group of log records sharing a source, the unit the service batches by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGroup {
    pub source: String,
    pub records: Vec<LogRecord>,
}

impl LogGroup {
    pub fn byte_size(&self) -> usize {
        self.source.len() + self.records.iter().map(LogRecord::byte_size).sum::<usize>()
    }
}

/// One fetch task's result: the pulled groups, the cursor to resume from, and
/// the raw byte size the batch was admitted under.
///
/// Owned exclusively by the shard state machine that requested it until handed
/// to a process task; the admission reservation of `raw_size` bytes travels
/// with it and is released by whoever consumes or discards the batch.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub shard: ShardId,
    pub groups: Vec<LogGroup>,
    /// Cursor pointing just past the last group in this batch.
    pub end_cursor: Cursor,
    pub raw_size: usize,
}

impl FetchedBatch {
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn line_count(&self) -> usize {
        self.groups.iter().map(|g| g.records.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_parses_sentinels_and_timestamps() {
        assert_eq!("begin".parse::<StartPosition>().unwrap(), StartPosition::Begin);
        assert_eq!("END".parse::<StartPosition>().unwrap(), StartPosition::End);

        let parsed = "2026-01-02T03:04:05Z".parse::<StartPosition>().unwrap();
        match parsed {
            StartPosition::Timestamp(t) => assert_eq!(t.timestamp(), 1767323045),
            other => panic!("expected timestamp, got {other:?}"),
        }

        assert!("yesterday".parse::<StartPosition>().is_err());
    }

    #[test]
    fn cursor_emptiness() {
        assert!(Cursor::default().is_empty());
        assert!(!Cursor::new("MTIzNA==").is_empty());
    }
}
