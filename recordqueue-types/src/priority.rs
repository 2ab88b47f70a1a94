//! Record priorities.
//!
//! Every [`Priority`] maps to exactly one storage queue. The derived ordering runs from the most
//! urgent priority (uploaded promptly) to the least urgent one (uploaded opportunistically).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Urgency class of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Security events, uploaded right after they are stored.
    Security,
    /// Uploaded right after they are stored.
    Immediate,
    /// Uploaded in short batches.
    FastBatch,
    /// Uploaded in longer batches.
    SlowBatch,
    /// Uploaded in large, infrequent batches.
    BackgroundBatch,
    /// Only uploaded on explicit flush.
    ManualBatch,
}

impl Priority {
    /// All priorities, from the most to the least urgent.
    pub const ALL: [Priority; 6] = [
        Priority::Security,
        Priority::Immediate,
        Priority::FastBatch,
        Priority::SlowBatch,
        Priority::BackgroundBatch,
        Priority::ManualBatch,
    ];

    /// Returns the canonical upper-case name of this priority.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Security => "SECURITY",
            Priority::Immediate => "IMMEDIATE",
            Priority::FastBatch => "FAST_BATCH",
            Priority::SlowBatch => "SLOW_BATCH",
            Priority::BackgroundBatch => "BACKGROUND_BATCH",
            Priority::ManualBatch => "MANUAL_BATCH",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown priority name.
#[derive(Debug, thiserror::Error)]
#[error("unknown priority \"{0}\"")]
pub struct ParsePriorityError(String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|priority| {
                let name = priority.as_str();
                s.eq_ignore_ascii_case(name) || s.eq_ignore_ascii_case(&name.replace('_', "-"))
            })
            .ok_or_else(|| ParsePriorityError(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_by_urgency() {
        let mut shuffled = vec![
            Priority::ManualBatch,
            Priority::Immediate,
            Priority::BackgroundBatch,
            Priority::Security,
            Priority::SlowBatch,
            Priority::FastBatch,
        ];
        shuffled.sort();
        assert_eq!(shuffled, Priority::ALL);
    }

    #[test]
    fn parses_names() {
        assert_eq!("FAST_BATCH".parse::<Priority>().unwrap(), Priority::FastBatch);
        assert_eq!("fast_batch".parse::<Priority>().unwrap(), Priority::FastBatch);
        assert_eq!("slow-batch".parse::<Priority>().unwrap(), Priority::SlowBatch);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn display_roundtrips_through_serde() {
        for priority in Priority::ALL {
            let json = serde_json::to_string(&priority).unwrap();
            assert_eq!(json, format!("\"{priority}\""));
        }
    }
}
