mod persona;
mod post;
mod research;
mod state;

pub use persona::Persona;
pub use post::{
    layout_matches_count, GeneratedPost, GridLayout, ImageRole, ImageSlide, Posting,
    PostingStatus, SlidePanel, SlidePlan, UsageDecision, UsageType, ALLOWED_SLIDE_COUNTS,
    AVATAR_REFERENCE_LABEL,
};
pub use research::{
    clean_queries, ImageItem, SubTask, SubTaskResults, SubTaskStatus, WebItem,
    MAX_QUERIES_PER_SUB_TASK, MAX_SUB_TASKS, SPARSE_RESULT_THRESHOLD,
};
pub use state::{
    ErrorKind, OrchestratorSession, Phase, PhaseError, ResultCounts, UserSelections,
};

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
