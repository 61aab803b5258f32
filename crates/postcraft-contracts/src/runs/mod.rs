mod summary;

pub use summary::{write_summary, SessionSummary};
