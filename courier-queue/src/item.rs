use std::{
    cmp::Ordering,
    fmt::{self, Display},
    str::FromStr,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// Identifier of a queue item.
///
/// A ULID, so ids sort by creation time and double as safe file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueItemId {
    id: ulid::Ulid,
}

impl QueueItemId {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Parse an id from a file name such as `01ARZ3NDEKTSV4RRFFQ69G5FAV.bin`.
    ///
    /// Anything containing a path separator or `..` is rejected.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename.strip_suffix(".bin")?;
        ulid::Ulid::from_string(stem).ok().map(|id| Self { id })
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl FromStr for QueueItemId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s.trim()).map(|id| Self { id })
    }
}

impl Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Serialize for QueueItemId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for QueueItemId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    /// Terminal failure recorded outside the normal delivery path. The
    /// manager itself dead-letters instead.
    Failed,
    Retrying,
    DeadLetter,
}

impl QueueStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Retrying,
        Self::DeadLetter,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::DeadLetter => "dead_letter",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLetter)
    }

    /// States a claim may start from.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

impl Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("unknown queue status '{s}'"))
    }
}

/// One delivery obligation: deliver `message_id` to `recipient`.
///
/// Invariants kept by the manager: `attempts <= max_attempts`, and
/// `next_attempt_at` is set exactly while the status is `Retrying`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub message_id: String,
    pub recipient: String,
    pub status: QueueStatus,
    /// Higher is sooner.
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<SystemTime>,
    pub next_attempt_at: Option<SystemTime>,
    pub error_message: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Bumped by the store on every write.
    pub version: u64,
}

impl QueueItem {
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        recipient: impl Into<String>,
        priority: i32,
        max_attempts: u32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: QueueItemId::generate(),
            message_id: message_id.into(),
            recipient: recipient.into(),
            status: QueueStatus::Pending,
            priority,
            attempts: 0,
            max_attempts,
            last_attempt_at: None,
            next_attempt_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Pending, or retrying with its next attempt due.
    #[must_use]
    pub fn is_ready(&self, now: SystemTime) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Retrying => self.next_attempt_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Apply a claim: the item moves to `Processing`.
    pub(crate) fn mark_claimed(&mut self, now: SystemTime) {
        self.status = QueueStatus::Processing;
        self.last_attempt_at = Some(now);
        self.next_attempt_at = None;
        self.updated_at = now;
        self.version += 1;
    }

    /// Dispatch order: highest priority first, then whichever became due
    /// first, then oldest.
    #[must_use]
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        let due = |item: &Self| item.next_attempt_at.unwrap_or(item.created_at);
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| due(self).cmp(&due(other)))
            .then_with(|| self.id.cmp(&other.id))
    }
}
