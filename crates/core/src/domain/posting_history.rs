// Posting History: longer-window duplicate-content detection

use serde::{Deserialize, Serialize};

/// Default look-back for duplicate checks (48 hours)
pub const DEFAULT_DUPLICATE_WINDOW_MS: i64 = 48 * 60 * 60 * 1000;

/// Trim and lowercase a title so cosmetic differences don't defeat the check
pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// One successful posting, appended after publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingHistoryRecord {
    pub normalized_title: String,
    pub title: String,
    pub destination: String,
    pub subject_id: String,
    pub posted_at: i64,
}

impl PostingHistoryRecord {
    pub fn new(title: &str, destination: &str, subject_id: &str, posted_at: i64) -> Self {
        Self {
            normalized_title: normalize_title(title),
            title: title.trim().to_string(),
            destination: destination.to_string(),
            subject_id: subject_id.to_string(),
            posted_at,
        }
    }

    /// Same content on the same destination within `window_ms` of `now_millis`
    pub fn matches(
        &self,
        normalized_title: &str,
        destination: &str,
        now_millis: i64,
        window_ms: i64,
    ) -> bool {
        self.normalized_title == normalized_title
            && self.destination == destination
            && self.posted_at > now_millis - window_ms
    }
}

/// Answer of `check_duplicate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub last_posted_at: Option<i64>,
}

impl DuplicateCheck {
    /// Fold matching records into a single answer (most recent posting wins)
    pub fn from_matches<'a>(matches: impl IntoIterator<Item = &'a PostingHistoryRecord>) -> Self {
        let last_posted_at = matches.into_iter().map(|r| r.posted_at).max();
        Self {
            is_duplicate: last_posted_at.is_some(),
            last_posted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  Oak Dresser \n"), "oak dresser");
    }

    #[test]
    fn test_matches_respects_destination_and_window() {
        let record = PostingHistoryRecord::new(" Oak Dresser", "facebook", "inv-1", 1_000);
        assert_eq!(record.title, "Oak Dresser");

        assert!(record.matches("oak dresser", "facebook", 5_000, 10_000));
        assert!(!record.matches("oak dresser", "craigslist", 5_000, 10_000));
        assert!(!record.matches("oak dresser", "facebook", 20_000, 10_000));
        assert!(!record.matches("oak chair", "facebook", 5_000, 10_000));
    }

    #[test]
    fn test_duplicate_check_takes_latest() {
        let a = PostingHistoryRecord::new("Lamp", "facebook", "inv-1", 100);
        let b = PostingHistoryRecord::new("Lamp", "facebook", "inv-2", 300);

        let check = DuplicateCheck::from_matches([&a, &b]);
        assert!(check.is_duplicate);
        assert_eq!(check.last_posted_at, Some(300));

        let none = DuplicateCheck::from_matches(std::iter::empty());
        assert!(!none.is_duplicate);
    }
}
