/// 1-based position of an item within a batch.
pub type ItemNumber = usize;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
