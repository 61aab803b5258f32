//! Session state machine: plan, research, selection, generation.
//!
//! Every phase past `start` runs as a supervised background task. Writes to a
//! session go through [`Orchestrator::apply`], which serialises them per
//! session and drops writes from tasks whose session was deleted or
//! superseded.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use postcraft_contracts::events::{
    influencer_topic, post_topic, session_topic, ORCH_ERROR, ORCH_GENERATING, ORCH_PLANNING,
    ORCH_PLAN_READY, ORCH_POST_READY, ORCH_QUESTION, ORCH_RESEARCHING, ORCH_RESEARCH_READY,
    POST_UPDATE, STATUS_UPDATE,
};
use postcraft_contracts::session::{
    clean_queries, ErrorKind, GridLayout, OrchestratorSession, Persona, Phase, Posting,
    PostingStatus, SubTask, SubTaskStatus, UserSelections, MAX_SUB_TASKS,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capabilities::{
    snap_video_duration, BlobStore, GeneratedVideo, ImageFetcher, ImageGenerator, ImageSearch,
    PersonaStore, PostingStore, SessionStore, TextGenerator, VideoGenerator, VideoRequest,
    WebSearch,
};
use crate::composer::{
    ComposeInput, PostComposer, DEFAULT_COMPOSITE_TIMEOUT, DEFAULT_FETCH_TIMEOUT,
};
use crate::error::{StudioError, StudioResult};
use crate::hub::EventHub;
use crate::planner::{broaden_query, PlanGenerator};
use crate::research::ResearchExecutor;
use crate::slides::SlidePlanner;
use crate::strategist::ImageStrategist;
use crate::{error_chain_text, map_object};

const INSUFFICIENT_RESULTS: &str = "Insufficient results found";
const STILL_NO_RESULTS: &str = "Still no results found";
const ERROR_DETAIL_CHARS: usize = 600;

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct Capabilities {
    pub text: Arc<dyn TextGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub video: Option<Arc<dyn VideoGenerator>>,
    pub web_search: Arc<dyn WebSearch>,
    pub image_search: Arc<dyn ImageSearch>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub personas: Arc<dyn PersonaStore>,
    pub postings: Arc<dyn PostingStore>,
    pub sessions: Arc<dyn SessionStore>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Sub-tasks researched at once; 1 keeps plan order.
    pub research_concurrency: usize,
    pub fetch_timeout: Duration,
    pub composite_timeout: Duration,
    pub video_duration_seconds: u32,
    pub video_aspect_ratio: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            research_concurrency: 1,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            composite_timeout: DEFAULT_COMPOSITE_TIMEOUT,
            video_duration_seconds: 5,
            video_aspect_ratio: "9:16".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub influencer_id: String,
    pub query: String,
    #[serde(default)]
    pub post_type_hint: Option<String>,
    /// Reusing an existing id supersedes that session.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// One sub-task of a user-edited plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEdit {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub queries: Vec<String>,
}

impl From<&SubTask> for PlanEdit {
    fn from(task: &SubTask) -> Self {
        Self {
            id: Some(task.id.clone()),
            name: task.name.clone(),
            queries: task.queries.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub sub_task_id: String,
    pub status: SubTaskStatus,
    pub web_count: usize,
    pub image_count: usize,
}

/// Applies the edited-plan bounds: at most [`MAX_SUB_TASKS`] sub-tasks, each
/// with 1-4 non-empty queries and a unique id.
pub fn bound_plan(edits: Vec<PlanEdit>) -> StudioResult<Vec<SubTask>> {
    if edits.is_empty() {
        return Err(StudioError::InvalidInput(
            "plan must contain at least one sub-task".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    let mut plan = Vec::new();
    for (idx, edit) in edits.into_iter().take(MAX_SUB_TASKS).enumerate() {
        let name = match edit.name.trim() {
            "" => format!("Sub-task {}", idx + 1),
            name => name.to_string(),
        };
        let queries = clean_queries(edit.queries);
        if queries.is_empty() {
            return Err(StudioError::InvalidInput(format!(
                "sub-task '{name}' has no queries"
            )));
        }
        let id = edit
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !seen.insert(id.clone()) {
            return Err(StudioError::InvalidInput(format!(
                "duplicate sub-task id '{id}'"
            )));
        }
        plan.push(SubTask::with_id(id, name, queries));
    }
    Ok(plan)
}

pub fn animation_prompt(layout: GridLayout) -> String {
    format!(
        "Animate this {layout} grid image. Keep all {count} panels in their positions. \
Add subtle, natural motion to each panel: breathing, blinking, gentle movements. \
Maintain the exact scene composition and character appearance in each quadrant. \
The motion should feel like a social media story coming to life.",
        count = layout.slide_count(),
    )
}

fn require_phase(
    session: &OrchestratorSession,
    allowed: &[Phase],
    expected: &'static str,
) -> StudioResult<()> {
    if allowed.contains(&session.phase) {
        return Ok(());
    }
    Err(StudioError::InvalidPhase {
        session_id: session.session_id.clone(),
        actual: session.phase,
        expected,
    })
}

fn advance(session: &mut OrchestratorSession, next: Phase) -> StudioResult<()> {
    session
        .advance(next)
        .map_err(|err| StudioError::InvalidPhase {
            session_id: session.session_id.clone(),
            actual: err.from,
            expected: next.as_str(),
        })
}

/// True while `run` is the most recent search started for its sub-task.
fn is_latest_run(session: &OrchestratorSession, run: &SubTask) -> bool {
    session
        .sub_task(&run.id)
        .is_some_and(|stored| stored.attempts == run.attempts)
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

struct Inner {
    caps: Capabilities,
    hub: EventHub,
    settings: OrchestratorSettings,
    planner: PlanGenerator,
    research: ResearchExecutor,
    composer: PostComposer,
    locks: DashMap<String, Arc<Mutex<()>>>,
    tracker: TaskTracker,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(caps: Capabilities, hub: EventHub, settings: OrchestratorSettings) -> Self {
        let planner = PlanGenerator::new(caps.text.clone());
        let research = ResearchExecutor::new(caps.web_search.clone(), caps.image_search.clone());
        let composer = PostComposer::new(
            ImageStrategist::new(caps.text.clone()),
            SlidePlanner::new(caps.text.clone()),
            caps.images.clone(),
            caps.fetcher.clone(),
            caps.blobs.clone(),
        )
        .with_timeouts(settings.fetch_timeout, settings.composite_timeout);
        Self {
            inner: Arc::new(Inner {
                caps,
                hub,
                settings,
                planner,
                research,
                composer,
                locks: DashMap::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    /// Creates a session and plans it in the background.
    pub async fn start(&self, request: StartRequest) -> StudioResult<String> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(StudioError::InvalidInput("query must not be empty".to_string()));
        }
        let persona = self
            .inner
            .caps
            .personas
            .get(&request.influencer_id)
            .await
            .map_err(StudioError::storage)?
            .ok_or_else(|| StudioError::PersonaNotFound(request.influencer_id.clone()))?;
        let session_id = request
            .session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let hint = request
            .post_type_hint
            .map(|hint| hint.trim().to_string())
            .filter(|hint| !hint.is_empty());
        let owner_id = request.owner_id.or_else(|| persona.owner_id.clone());
        let session = OrchestratorSession::new(
            session_id.clone(),
            persona.id.clone(),
            query.clone(),
            hint.clone(),
            owner_id,
        );
        let epoch = session.epoch.clone();

        let superseded = {
            let lock = self.lock_for(&session_id);
            let _guard = lock.lock().await;
            let sessions = &self.inner.caps.sessions;
            let previous = sessions.get(&session_id).await.map_err(StudioError::storage)?;
            sessions.put(session).await.map_err(StudioError::storage)?;
            previous.is_some()
        };
        if superseded {
            info!(session_id = %session_id, "superseding existing session");
            self.inner.hub.close_topic(&session_topic(&session_id));
        }
        info!(session_id = %session_id, influencer_id = %persona.id, "session started");
        self.emit(
            &session_id,
            ORCH_PLANNING,
            json!({"message": "Creating research plan..."}),
        );

        let this = self.clone();
        let (sid, task_epoch) = (session_id.clone(), epoch.clone());
        self.spawn_phase(session_id.clone(), epoch, "Planning", async move {
            this.run_planning(&sid, &task_epoch, persona, query, hint)
                .await
        });
        Ok(session_id)
    }

    pub async fn session(&self, session_id: &str) -> StudioResult<OrchestratorSession> {
        self.inner
            .caps
            .sessions
            .get(session_id)
            .await
            .map_err(StudioError::storage)?
            .ok_or_else(|| StudioError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self) -> StudioResult<Vec<String>> {
        self.inner
            .caps
            .sessions
            .list()
            .await
            .map_err(StudioError::storage)
    }

    /// Replaces the plan and starts research. Valid only in `plan_review`.
    pub async fn edit_plan(
        &self,
        session_id: &str,
        edits: Vec<PlanEdit>,
    ) -> StudioResult<Vec<SubTask>> {
        let plan = bound_plan(edits)?;
        let session = self
            .apply(session_id, None, |session| {
                require_phase(session, &[Phase::PlanReview], "plan_review")?;
                session.research_plan = plan;
                session.research_results.clear();
                advance(session, Phase::Research)
            })
            .await?
            .ok_or_else(|| StudioError::SessionNotFound(session_id.to_string()))?;

        let this = self.clone();
        let (sid, epoch) = (session.session_id.clone(), session.epoch.clone());
        self.spawn_phase(
            session.session_id.clone(),
            session.epoch.clone(),
            "Research",
            async move { this.run_research(&sid, &epoch).await },
        );
        Ok(session.research_plan)
    }

    /// Re-runs one sub-task inline with a custom or broadened query.
    pub async fn retry_subtask(
        &self,
        session_id: &str,
        sub_task_id: &str,
        custom_query: Option<String>,
    ) -> StudioResult<RetryOutcome> {
        const EXPECTED: &str = "research or selection";
        let allowed = [Phase::Research, Phase::Selection];
        let session = self.session(session_id).await?;
        require_phase(&session, &allowed, EXPECTED)?;
        let task = session
            .sub_task(sub_task_id)
            .ok_or_else(|| StudioError::SubTaskNotFound(sub_task_id.to_string()))?;
        let queries = match custom_query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
        {
            Some(query) => vec![query.to_string()],
            None => vec![broaden_query(
                task.queries.first().map(String::as_str).unwrap_or(&task.name),
            )],
        };
        let epoch = session.epoch.clone();

        let updated = self
            .apply(session_id, Some(&epoch), |session| {
                require_phase(session, &allowed, EXPECTED)?;
                let task = session
                    .sub_task_mut(sub_task_id)
                    .ok_or_else(|| StudioError::SubTaskNotFound(sub_task_id.to_string()))?;
                task.queries = queries;
                task.mark_in_progress();
                Ok(())
            })
            .await?
            .ok_or_else(|| StudioError::SessionNotFound(session_id.to_string()))?;
        let task = updated
            .sub_task(sub_task_id)
            .cloned()
            .ok_or_else(|| StudioError::SubTaskNotFound(sub_task_id.to_string()))?;
        info!(session_id, sub_task = %task.id, queries = ?task.queries, "retrying sub-task");

        let results = self.inner.research.execute(&task).await;
        let outcome = RetryOutcome {
            sub_task_id: task.id.clone(),
            status: if results.is_empty() {
                SubTaskStatus::Failed
            } else {
                SubTaskStatus::Complete
            },
            web_count: results.web_items.len(),
            image_count: results.images.len(),
        };
        self.apply(session_id, Some(&epoch), |session| {
            if !is_latest_run(session, &task) {
                debug!(session_id, sub_task = %task.id, "a newer retry owns this sub-task");
                return Ok(());
            }
            let found = !results.is_empty();
            session.set_results(task.id.clone(), results);
            if let Some(task) = session.sub_task_mut(&task.id) {
                if found {
                    task.mark_complete();
                } else {
                    task.mark_failed(STILL_NO_RESULTS);
                }
            }
            Ok(())
        })
        .await?
        .ok_or_else(|| StudioError::SessionNotFound(session_id.to_string()))?;
        Ok(outcome)
    }

    /// Records the curated items and starts generation.
    pub async fn submit_selections(
        &self,
        session_id: &str,
        selections: UserSelections,
    ) -> StudioResult<()> {
        let session = self
            .apply(session_id, None, |session| {
                require_phase(session, &[Phase::Selection], "selection")?;
                session.user_selections = Some(selections);
                advance(session, Phase::Generation)
            })
            .await?
            .ok_or_else(|| StudioError::SessionNotFound(session_id.to_string()))?;

        let this = self.clone();
        let (sid, epoch) = (session.session_id.clone(), session.epoch.clone());
        self.spawn_phase(
            session.session_id,
            session.epoch,
            "Generation",
            async move { this.run_generation(&sid, &epoch).await },
        );
        Ok(())
    }

    /// Valid in any phase. In-flight work for the session becomes a no-op.
    pub async fn delete(&self, session_id: &str) -> StudioResult<bool> {
        let (existed, posting_id) = {
            let lock = self.lock_for(session_id);
            let _guard = lock.lock().await;
            let sessions = &self.inner.caps.sessions;
            let posting_id = sessions
                .get(session_id)
                .await
                .map_err(StudioError::storage)?
                .and_then(|session| session.generated_post)
                .and_then(|post| post.posting_id);
            let existed = sessions
                .delete(session_id)
                .await
                .map_err(StudioError::storage)?;
            (existed, posting_id)
        };
        self.release_lock(session_id);
        if existed {
            info!(session_id, "session deleted");
            self.inner.hub.close_topic(&session_topic(session_id));
        }
        if let Some(posting_id) = posting_id {
            let topic = post_topic(&posting_id);
            self.release_lock(&topic);
            self.inner.hub.close_idle_topic(&topic);
        }
        Ok(existed)
    }

    /// Starts turning the composite grid of a completed session into a video.
    /// Returns the posting id.
    pub async fn animate_post(
        &self,
        session_id: &str,
        duration_seconds: Option<u32>,
        aspect_ratio: Option<String>,
    ) -> StudioResult<String> {
        let session = self.session(session_id).await?;
        require_phase(&session, &[Phase::Complete], "complete")?;
        let post = session
            .generated_post
            .as_ref()
            .ok_or_else(|| StudioError::PostingNotFound(session_id.to_string()))?;
        let posting_id = post
            .posting_id
            .clone()
            .ok_or_else(|| StudioError::PostingNotFound(session_id.to_string()))?;
        let video = self.inner.caps.video.clone().ok_or_else(|| {
            StudioError::failed(ErrorKind::Capability, "no video generator configured")
        })?;

        let settings = &self.inner.settings;
        let aspect_ratio = aspect_ratio
            .map(|ratio| ratio.trim().to_string())
            .filter(|ratio| !ratio.is_empty())
            .unwrap_or_else(|| settings.video_aspect_ratio.clone());
        let duration_seconds =
            snap_video_duration(duration_seconds.unwrap_or(settings.video_duration_seconds));

        let posting = {
            let lock = self.lock_for(&post_topic(&posting_id));
            let _guard = lock.lock().await;
            let postings = &self.inner.caps.postings;
            let mut posting = postings
                .get(&posting_id)
                .await
                .map_err(StudioError::storage)?
                .ok_or_else(|| StudioError::PostingNotFound(session_id.to_string()))?;
            if posting.status == PostingStatus::GeneratingVideo {
                return Err(StudioError::InvalidInput(
                    "video generation is already running for this post".to_string(),
                ));
            }
            posting.status = PostingStatus::GeneratingVideo;
            posting.error = None;
            posting.touch();
            postings
                .update(posting.clone())
                .await
                .map_err(StudioError::storage)?;
            posting
        };
        self.publish_posting(&posting, "Generating video...");

        let request = VideoRequest {
            prompt: animation_prompt(post.grid_layout),
            source_image: posting.grid_image_url.clone(),
            duration_seconds,
            aspect_ratio,
        };
        info!(
            session_id,
            posting_id = %posting_id,
            duration_seconds,
            aspect_ratio = %request.aspect_ratio,
            "animation started"
        );

        let this = self.clone();
        let failed = self.clone();
        let (body_id, failed_id) = (posting_id.clone(), posting_id.clone());
        self.spawn_supervised(
            "Animation",
            async move { this.run_animation(&body_id, video, request).await },
            move |_, detail| async move { failed.record_video_failure(&failed_id, detail).await },
        );
        Ok(posting_id)
    }

    /// Waits for every background phase started so far.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    async fn run_planning(
        &self,
        session_id: &str,
        epoch: &str,
        persona: Persona,
        query: String,
        hint: Option<String>,
    ) -> StudioResult<()> {
        let plan = self
            .inner
            .planner
            .create_plan(&query, hint.as_deref(), &persona)
            .await;
        let sub_tasks: Vec<Value> = plan
            .iter()
            .map(|task| json!({"id": task.id, "name": task.name, "queries": task.queries}))
            .collect();
        let stored = self
            .apply(session_id, Some(epoch), |session| {
                session.research_plan = plan;
                advance(session, Phase::PlanReview)
            })
            .await?;
        if stored.is_none() {
            debug!(session_id, "planning finished for a stale session");
            return Ok(());
        }
        self.emit(
            session_id,
            ORCH_PLAN_READY,
            json!({"message": "Research plan ready for review", "sub_tasks": sub_tasks}),
        );
        Ok(())
    }

    async fn run_research(&self, session_id: &str, epoch: &str) -> StudioResult<()> {
        let Some(session) = self.current(session_id, epoch).await? else {
            return Ok(());
        };
        let plan = session.research_plan;
        let total = plan.len();
        self.emit(
            session_id,
            ORCH_RESEARCHING,
            json!({"message": format!("Researching {total} sub-tasks..."), "total": total}),
        );

        let concurrency = self.inner.settings.research_concurrency.max(1);
        let outcomes: Vec<StudioResult<bool>> = stream::iter(plan.into_iter().enumerate())
            .map(|(index, task)| {
                let this = self.clone();
                let (sid, epoch) = (session_id.to_string(), epoch.to_string());
                async move {
                    this.research_sub_task(&sid, &epoch, index, total, task)
                        .await
                }
            })
            .buffered(concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            if !outcome? {
                return Ok(());
            }
        }

        let Some(session) = self
            .apply(session_id, Some(epoch), |session| {
                advance(session, Phase::Selection)
            })
            .await?
        else {
            return Ok(());
        };
        info!(session_id, sub_tasks = total, "research complete");
        self.emit(
            session_id,
            ORCH_RESEARCH_READY,
            json!({
                "message": "Research complete! Select items to include.",
                "results_summary": session.results_summary(),
            }),
        );
        Ok(())
    }

    /// `Ok(false)` once the session is gone or superseded. Sub-tasks a retry
    /// already picked up are skipped, and results from a run that a later
    /// retry overtook are dropped.
    async fn research_sub_task(
        &self,
        session_id: &str,
        epoch: &str,
        index: usize,
        total: usize,
        planned: SubTask,
    ) -> StudioResult<bool> {
        let mut claimed = None;
        let started = self
            .apply(session_id, Some(epoch), |session| {
                if let Some(stored) = session.sub_task_mut(&planned.id) {
                    if stored.status == SubTaskStatus::Pending {
                        stored.mark_in_progress();
                        claimed = Some(stored.clone());
                    }
                }
                Ok(())
            })
            .await?;
        if started.is_none() {
            return Ok(false);
        }
        let Some(task) = claimed else {
            debug!(session_id, sub_task = %planned.id, "sub-task already retried, skipping");
            return Ok(true);
        };
        self.emit(
            session_id,
            ORCH_RESEARCHING,
            json!({
                "message": format!("Researching: {}", task.name),
                "current": index + 1,
                "total": total,
                "sub_task_id": task.id,
            }),
        );

        let results = self.inner.research.execute(&task).await;
        let sparse = results.is_sparse();
        let (web_count, image_count) = (results.web_items.len(), results.images.len());
        let mut kept = false;
        let stored = self
            .apply(session_id, Some(epoch), |session| {
                if !is_latest_run(session, &task) {
                    return Ok(());
                }
                session.set_results(task.id.clone(), results);
                if let Some(stored) = session.sub_task_mut(&task.id) {
                    if sparse {
                        stored.mark_failed(INSUFFICIENT_RESULTS);
                    } else {
                        stored.mark_complete();
                    }
                }
                kept = true;
                Ok(())
            })
            .await?;
        if stored.is_none() {
            return Ok(false);
        }
        if !kept {
            debug!(session_id, sub_task = %task.id, "retry overtook research run, results dropped");
            return Ok(true);
        }
        info!(session_id, sub_task = %task.id, web_count, image_count, "sub-task researched");
        if sparse {
            self.emit(
                session_id,
                ORCH_QUESTION,
                json!({
                    "message": format!(
                        "Found few results for '{}'. Provide a broader query or skip?",
                        task.name
                    ),
                    "sub_task_id": task.id,
                    "options": ["skip", "retry"],
                }),
            );
        }
        Ok(true)
    }

    async fn run_generation(&self, session_id: &str, epoch: &str) -> StudioResult<()> {
        let Some(session) = self.current(session_id, epoch).await? else {
            return Ok(());
        };
        self.emit(
            session_id,
            ORCH_GENERATING,
            json!({"message": "Analyzing selections and generating post..."}),
        );
        let selections = session.user_selections.clone().unwrap_or_default();
        let (web_items, images) = session.selected_items(&selections);

        let persona = self
            .inner
            .caps
            .personas
            .get(&session.influencer_id)
            .await
            .map_err(StudioError::storage)?
            .ok_or_else(|| StudioError::PersonaNotFound(session.influencer_id.clone()))?;
        let avatar_url = persona.avatar().ok_or_else(|| {
            StudioError::failed(ErrorKind::Generation, "Influencer has no avatar")
        })?;
        let avatar = self
            .inner
            .caps
            .fetcher
            .fetch(avatar_url, self.inner.settings.fetch_timeout)
            .await
            .map_err(|err| {
                StudioError::failed(
                    ErrorKind::Capability,
                    format!(
                        "could not download influencer avatar: {}",
                        error_chain_text(&err, ERROR_DETAIL_CHARS)
                    ),
                )
            })?;

        self.emit(
            session_id,
            ORCH_GENERATING,
            json!({"message": "Determining image usage strategy..."}),
        );
        let mut post = self
            .inner
            .composer
            .compose(ComposeInput {
                persona: &persona,
                avatar: &avatar,
                web_items: &web_items,
                images: &images,
                query: &session.query,
            })
            .await
            .map_err(|err| {
                StudioError::failed(
                    ErrorKind::Generation,
                    error_chain_text(&err, ERROR_DETAIL_CHARS),
                )
            })?;

        if self.current(session_id, epoch).await?.is_none() {
            debug!(session_id, "generation finished for a stale session");
            return Ok(());
        }
        let posting = Posting::from_generated(
            Uuid::new_v4().to_string(),
            session.influencer_id.clone(),
            session.owner_id.clone(),
            session.query.clone(),
            &post,
        );
        let posting_id = self
            .inner
            .caps
            .postings
            .insert(posting.clone())
            .await
            .map_err(StudioError::storage)?;
        post.posting_id = Some(posting_id.clone());

        let stored = self
            .apply(session_id, Some(epoch), |session| {
                session.image_usage_plan = Some(post.image_usage_plan.clone());
                session.generated_post = Some(post.clone());
                advance(session, Phase::Complete)
            })
            .await?;
        if stored.is_none() {
            return Ok(());
        }
        info!(session_id, posting_id = %posting_id, slides = post.slide_count, "post generated");

        self.inner.hub.publish(
            &influencer_topic(&session.influencer_id),
            POST_UPDATE,
            map_object(json!({
                "post_id": posting_id,
                "status": PostingStatus::Ready.as_str(),
                "image_urls": posting.image_urls,
                "image_slides": posting.image_slides,
            })),
        );
        self.emit(
            session_id,
            ORCH_POST_READY,
            json!({
                "message": "Post generated successfully!",
                "post_id": posting_id,
                "slide_count": post.slide_count,
                "grid_layout": post.grid_layout,
                "caption": post.caption,
                "slide_urls": post.slide_urls,
                "grid_url": post.grid_url,
            }),
        );
        Ok(())
    }

    async fn run_animation(
        &self,
        posting_id: &str,
        video: Arc<dyn VideoGenerator>,
        request: VideoRequest,
    ) -> StudioResult<()> {
        let generated = video.generate(&request).await.map_err(|err| {
            StudioError::failed(
                ErrorKind::Capability,
                error_chain_text(&err, ERROR_DETAIL_CHARS),
            )
        })?;
        let video_url = self.store_video(generated).await;
        let posting = self
            .update_posting(posting_id, |posting| {
                posting.status = PostingStatus::VideoReady;
                posting.video_url = Some(video_url);
                posting.error = None;
            })
            .await?;
        self.release_lock(&post_topic(posting_id));
        info!(posting_id, "video ready");
        self.publish_posting(&posting, "Video ready!");
        Ok(())
    }

    async fn store_video(&self, video: GeneratedVideo) -> String {
        let (Some(bytes), Some(blobs)) = (video.bytes, self.inner.caps.blobs.as_ref()) else {
            return video.url;
        };
        let key = format!("orchestrator/videos/{}.mp4", Uuid::new_v4());
        match blobs.put(&key, bytes, "video/mp4").await {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "video upload failed, keeping provider URL");
                video.url
            }
        }
    }

    async fn record_video_failure(&self, posting_id: &str, detail: String) {
        let message = format!("Video generation failed: {detail}");
        match self
            .update_posting(posting_id, |posting| {
                posting.status = PostingStatus::VideoFailed;
                posting.error = Some(detail);
            })
            .await
        {
            Ok(posting) => {
                self.release_lock(&post_topic(posting_id));
                warn!(posting_id, error = %message, "animation failed");
                self.publish_posting(&posting, &message);
            }
            Err(err) => error!(posting_id, error = %err, "could not record animation failure"),
        }
    }

    async fn update_posting<F>(&self, posting_id: &str, update: F) -> StudioResult<Posting>
    where
        F: FnOnce(&mut Posting) + Send,
    {
        let lock = self.lock_for(&post_topic(posting_id));
        let _guard = lock.lock().await;
        let postings = &self.inner.caps.postings;
        let mut posting = postings
            .get(posting_id)
            .await
            .map_err(StudioError::storage)?
            .ok_or_else(|| StudioError::PostingNotFound(posting_id.to_string()))?;
        update(&mut posting);
        posting.touch();
        postings
            .update(posting.clone())
            .await
            .map_err(StudioError::storage)?;
        Ok(posting)
    }

    fn publish_posting(&self, posting: &Posting, message: &str) {
        let hub = &self.inner.hub;
        hub.publish(
            &post_topic(&posting.id),
            STATUS_UPDATE,
            map_object(json!({
                "post_id": posting.id,
                "status": posting.status.as_str(),
                "message": message,
                "video_url": posting.video_url,
                "error": posting.error,
            })),
        );
        hub.publish(
            &influencer_topic(&posting.influencer_id),
            POST_UPDATE,
            map_object(json!({
                "post_id": posting.id,
                "status": posting.status.as_str(),
                "video_url": posting.video_url,
            })),
        );
    }

    fn emit(&self, session_id: &str, event_type: &str, payload: Value) {
        self.inner
            .hub
            .publish(&session_topic(session_id), event_type, map_object(payload));
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Forgets the lock for `key` unless someone is holding or waiting on it.
    fn release_lock(&self, key: &str) {
        self.inner
            .locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// The stored session, if it still carries `epoch`.
    async fn current(
        &self,
        session_id: &str,
        epoch: &str,
    ) -> StudioResult<Option<OrchestratorSession>> {
        let session = self
            .inner
            .caps
            .sessions
            .get(session_id)
            .await
            .map_err(StudioError::storage)?;
        Ok(session.filter(|session| session.epoch == epoch))
    }

    /// Read-modify-write under the session lock, then persist. `Ok(None)`
    /// when the session is gone or, with `epoch` set, was superseded.
    async fn apply<F>(
        &self,
        session_id: &str,
        epoch: Option<&str>,
        update: F,
    ) -> StudioResult<Option<OrchestratorSession>>
    where
        F: FnOnce(&mut OrchestratorSession) -> StudioResult<()> + Send,
    {
        let lock = self.lock_for(session_id);
        let guard = lock.lock().await;
        let sessions = &self.inner.caps.sessions;
        let Some(mut session) = sessions
            .get(session_id)
            .await
            .map_err(StudioError::storage)?
        else {
            drop(guard);
            drop(lock);
            self.release_lock(session_id);
            return Ok(None);
        };
        if epoch.is_some_and(|epoch| epoch != session.epoch) {
            return Ok(None);
        }
        update(&mut session)?;
        session.touch();
        sessions
            .put(session.clone())
            .await
            .map_err(StudioError::storage)?;
        Ok(Some(session))
    }

    fn spawn_phase<F>(&self, session_id: String, epoch: String, stage: &'static str, body: F)
    where
        F: Future<Output = StudioResult<()>> + Send + 'static,
    {
        let this = self.clone();
        let span_id = session_id.clone();
        self.spawn_supervised(
            stage,
            body.instrument(info_span!("phase", stage, session_id = %span_id)),
            move |kind, detail| async move {
                this.fail_session(&session_id, &epoch, stage, kind, detail)
                    .await
            },
        );
    }

    /// Runs `body` on the tracker and hands any error, panic or cancellation
    /// to `on_failure`.
    fn spawn_supervised<F, R, RF>(&self, stage: &'static str, body: F, on_failure: R)
    where
        F: Future<Output = StudioResult<()>> + Send + 'static,
        R: FnOnce(ErrorKind, String) -> RF + Send + 'static,
        RF: Future<Output = ()> + Send + 'static,
    {
        let tracker = &self.inner.tracker;
        let handle = tracker.spawn(body);
        tracker.spawn(async move {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some((err.kind(), err.to_string())),
                Err(join_err) if join_err.is_panic() => Some((
                    ErrorKind::Internal,
                    format!("{stage} task panicked: {}", panic_text(join_err.into_panic())),
                )),
                Err(_) => Some((ErrorKind::Internal, format!("{stage} task was cancelled"))),
            };
            if let Some((kind, detail)) = failure {
                on_failure(kind, detail).await;
            }
        });
    }

    async fn fail_session(
        &self,
        session_id: &str,
        epoch: &str,
        stage: &str,
        kind: ErrorKind,
        detail: String,
    ) {
        let message = format!("{stage} failed: {detail}");
        let recorded = self
            .apply(session_id, Some(epoch), |session| {
                session.fail(kind, detail);
                Ok(())
            })
            .await;
        match recorded {
            Ok(Some(_)) => {
                warn!(session_id, kind = %kind, error = %message, "session failed");
                self.emit(
                    session_id,
                    ORCH_ERROR,
                    json!({"message": message, "kind": kind.as_str()}),
                );
            }
            Ok(None) => debug!(session_id, "failure for a stale session dropped"),
            Err(err) => error!(session_id, error = %err, "could not record session failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use postcraft_contracts::events::session_topic;
    use postcraft_contracts::session::{
        ErrorKind, OrchestratorSession, Phase, PostingStatus, SubTaskStatus, UserSelections,
    };
    use serde_json::json;

    use super::{
        bound_plan, Capabilities, Orchestrator, OrchestratorSettings, PlanEdit, StartRequest,
    };
    use crate::capabilities::{PostingStore, TextOutput};
    use crate::error::StudioError;
    use crate::hub::EventHub;
    use crate::store::{InMemoryPersonaStore, InMemoryPostingStore, InMemorySessionStore};
    use crate::testkit::{
        persona, FakeImageGenerator, FakeImageSearch, FakeVideo, FakeWebSearch, ImageMode,
        MemoryBlobStore, ScriptedText, SearchGate, StaticFetcher,
    };

    struct Harness {
        orchestrator: Orchestrator,
        hub: EventHub,
        postings: Arc<InMemoryPostingStore>,
        images: Arc<FakeImageGenerator>,
        video: Arc<FakeVideo>,
    }

    struct Setup {
        replies: Vec<Result<TextOutput, String>>,
        web: FakeWebSearch,
        image_search: FakeImageSearch,
        images: FakeImageGenerator,
        video: FakeVideo,
        settings: OrchestratorSettings,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                replies: vec![Ok(plan_reply())],
                web: FakeWebSearch::with_hits(3),
                image_search: FakeImageSearch::with_hits(2),
                images: FakeImageGenerator::composite(),
                video: FakeVideo::new(false),
                settings: OrchestratorSettings::default(),
            }
        }
    }

    fn plan_reply() -> TextOutput {
        TextOutput::Structured(json!({"sub_tasks": [
            {"name": "Beans", "queries": ["espresso beans"]},
            {"name": "Gear", "queries": ["espresso machine"]}
        ]}))
    }

    fn harness(setup: Setup) -> Harness {
        let hub = EventHub::new(64, 64, Duration::from_secs(30));
        let postings = Arc::new(InMemoryPostingStore::new());
        let images = Arc::new(setup.images);
        let video = Arc::new(setup.video);
        let caps = Capabilities {
            text: Arc::new(ScriptedText::new(setup.replies)),
            images: images.clone(),
            video: Some(video.clone()),
            web_search: Arc::new(setup.web),
            image_search: Arc::new(setup.image_search),
            fetcher: Arc::new(StaticFetcher::new()),
            blobs: Some(Arc::new(MemoryBlobStore::default())),
            personas: Arc::new(InMemoryPersonaStore::with_personas([persona()])),
            postings: postings.clone(),
            sessions: Arc::new(InMemorySessionStore::new()),
        };
        Harness {
            orchestrator: Orchestrator::new(caps, hub.clone(), setup.settings),
            hub,
            postings,
            images,
            video,
        }
    }

    fn request(session_id: &str) -> StartRequest {
        StartRequest {
            influencer_id: "inf-1".to_string(),
            query: "espresso at home".to_string(),
            session_id: Some(session_id.to_string()),
            ..StartRequest::default()
        }
    }

    fn event_types(hub: &EventHub, session_id: &str) -> Vec<String> {
        hub.recent(&session_topic(session_id))
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }

    async fn drive_to_selection(h: &Harness, session_id: &str) -> anyhow::Result<()> {
        h.orchestrator.start(request(session_id)).await?;
        h.orchestrator.wait_idle().await;
        let session = h.orchestrator.session(session_id).await?;
        assert_eq!(session.phase, Phase::PlanReview);
        let edits = session.research_plan.iter().map(PlanEdit::from).collect();
        h.orchestrator.edit_plan(session_id, edits).await?;
        h.orchestrator.wait_idle().await;
        Ok(())
    }

    fn select_two_of_each(session: &OrchestratorSession) -> UserSelections {
        let mut selections = UserSelections::default();
        if let Some(results) = session.research_results.values().next() {
            selections
                .web_item_ids
                .extend(results.web_items.iter().take(2).map(|item| item.id.clone()));
            selections
                .image_ids
                .extend(results.images.iter().take(2).map(|item| item.id.clone()));
        }
        selections
    }

    /// Starts a session and approves its plan without waiting for research.
    async fn approve_plan(h: &Harness, session_id: &str) -> anyhow::Result<Vec<String>> {
        h.orchestrator.start(request(session_id)).await?;
        h.orchestrator.wait_idle().await;
        let session = h.orchestrator.session(session_id).await?;
        let edits = session.research_plan.iter().map(PlanEdit::from).collect();
        h.orchestrator.edit_plan(session_id, edits).await?;
        Ok(session.research_plan.iter().map(|task| task.id.clone()).collect())
    }

    fn web_titles(session: &OrchestratorSession, sub_task_id: &str) -> Vec<String> {
        session
            .research_results
            .get(sub_task_id)
            .map(|results| results.web_items.iter().map(|item| item.title.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn happy_path_completes_with_post_and_events() -> anyhow::Result<()> {
        let h = harness(Setup {
            replies: vec![
                Ok(plan_reply()),
                Ok(TextOutput::Structured(json!({"image_usage_plan": [{
                    "selected_image_url": "https://img.test/espresso-beans/0.png",
                    "usage_type": "reference", "reference_label": "[2]",
                    "role": "product", "reasoning": "hero product"
                }]}))),
                Ok(TextOutput::Structured(json!({
                    "slide_count": 2, "grid_layout": "1x2", "caption": "Morning shots #espresso",
                    "slides": [{"panel_number": 1, "panel_description": "pulling a shot"},
                               {"panel_number": 2, "panel_description": "latte art"}]
                }))),
            ],
            ..Setup::default()
        });
        drive_to_selection(&h, "s-happy").await?;

        let session = h.orchestrator.session("s-happy").await?;
        assert_eq!(session.phase, Phase::Selection);
        let summary = session.results_summary();
        assert!(summary
            .values()
            .all(|counts| counts.web_count == 3 && counts.image_count == 2));
        assert!(session
            .research_plan
            .iter()
            .all(|task| task.status == SubTaskStatus::Complete));

        let selections = select_two_of_each(&session);
        assert_eq!(selections.web_item_ids.len(), 2);
        assert_eq!(selections.image_ids.len(), 2);
        h.orchestrator
            .submit_selections("s-happy", selections.clone())
            .await?;
        h.orchestrator.wait_idle().await;

        let session = h.orchestrator.session("s-happy").await?;
        assert_eq!(session.phase, Phase::Complete);
        assert_eq!(session.user_selections.as_ref(), Some(&selections));
        let post = session
            .generated_post
            .ok_or_else(|| anyhow::anyhow!("missing post"))?;
        assert_eq!(post.slide_urls.len(), 2);
        assert_eq!(post.caption, "Morning shots #espresso");
        let posting_id = post
            .posting_id
            .ok_or_else(|| anyhow::anyhow!("missing posting id"))?;
        let posting = h
            .postings
            .get(&posting_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("posting not stored"))?;
        assert_eq!(posting.status, PostingStatus::Ready);
        assert_eq!(posting.image_urls, post.slide_urls);
        assert_eq!(h.images.calls()[0].labels, vec!["[1]", "[2]"]);

        assert_eq!(
            event_types(&h.hub, "s-happy"),
            vec![
                "orch_planning",
                "orch_plan_ready",
                "orch_researching",
                "orch_researching",
                "orch_researching",
                "orch_research_ready",
                "orch_generating",
                "orch_generating",
                "orch_post_ready",
            ]
        );
        let influencer_events = h.hub.recent("influencer:inf-1");
        assert_eq!(influencer_events.len(), 1);
        assert_eq!(influencer_events[0].str_field("status"), Some("ready"));
        Ok(())
    }

    #[tokio::test]
    async fn sparse_research_asks_and_retry_recovers() -> anyhow::Result<()> {
        let h = harness(Setup {
            web: FakeWebSearch::with_hits(0).hits_for("espresso tamper", 3),
            image_search: FakeImageSearch::with_hits(0),
            ..Setup::default()
        });
        drive_to_selection(&h, "s-sparse").await?;

        let session = h.orchestrator.session("s-sparse").await?;
        assert_eq!(session.phase, Phase::Selection);
        assert!(session.research_plan.iter().all(|task| {
            task.status == SubTaskStatus::Failed
                && task.error.as_deref() == Some("Insufficient results found")
        }));
        let questions = h
            .hub
            .recent(&session_topic("s-sparse"))
            .into_iter()
            .filter(|event| event.event_type == "orch_question")
            .collect::<Vec<_>>();
        assert_eq!(questions.len(), 2);
        assert_eq!(
            questions[0].str_field("message"),
            Some("Found few results for 'Beans'. Provide a broader query or skip?")
        );
        assert_eq!(questions[0].payload["options"], json!(["skip", "retry"]));

        let first = session.research_plan[0].id.clone();
        let outcome = h
            .orchestrator
            .retry_subtask("s-sparse", &first, Some("espresso tamper".to_string()))
            .await?;
        assert_eq!(outcome.status, SubTaskStatus::Complete);
        assert_eq!(outcome.web_count, 3);

        let second = session.research_plan[1].id.clone();
        let outcome = h.orchestrator.retry_subtask("s-sparse", &second, None).await?;
        assert_eq!(outcome.status, SubTaskStatus::Failed);

        let session = h.orchestrator.session("s-sparse").await?;
        assert_eq!(session.phase, Phase::Selection);
        assert_eq!(session.research_plan[0].queries, vec!["espresso tamper"]);
        assert_eq!(session.research_plan[0].status, SubTaskStatus::Complete);
        assert_eq!(
            session.research_plan[1].error.as_deref(),
            Some("Still no results found")
        );
        Ok(())
    }

    #[tokio::test]
    async fn retry_ahead_of_research_keeps_its_results() -> anyhow::Result<()> {
        let gate = Arc::new(SearchGate::default());
        let h = harness(Setup {
            web: FakeWebSearch::with_hits(3).held_on("espresso beans", gate.clone()),
            ..Setup::default()
        });
        let ids = approve_plan(&h, "s-ahead").await?;
        tokio::time::timeout(Duration::from_secs(5), gate.reached()).await?;

        let outcome = h
            .orchestrator
            .retry_subtask("s-ahead", &ids[1], Some("espresso tamper".to_string()))
            .await?;
        assert_eq!(outcome.status, SubTaskStatus::Complete);
        assert_eq!(outcome.web_count, 3);
        gate.release();
        h.orchestrator.wait_idle().await;

        let session = h.orchestrator.session("s-ahead").await?;
        assert_eq!(session.phase, Phase::Selection);
        assert_eq!(session.research_plan[1].queries, vec!["espresso tamper"]);
        assert_eq!(session.research_plan[1].status, SubTaskStatus::Complete);
        assert_eq!(session.research_plan[1].attempts, 1);
        assert!(web_titles(&session, &ids[1])
            .iter()
            .all(|title| title.starts_with("espresso tamper")));
        assert_eq!(web_titles(&session, &ids[0]).len(), 3);
        let gear_started = h
            .hub
            .recent(&session_topic("s-ahead"))
            .iter()
            .any(|event| event.str_field("sub_task_id") == Some(ids[1].as_str()));
        assert!(!gear_started);
        Ok(())
    }

    #[tokio::test]
    async fn retry_during_a_search_drops_the_older_run() -> anyhow::Result<()> {
        let gate = Arc::new(SearchGate::default());
        let h = harness(Setup {
            web: FakeWebSearch::with_hits(3).held_on("espresso machine", gate.clone()),
            ..Setup::default()
        });
        let ids = approve_plan(&h, "s-overtaken").await?;
        tokio::time::timeout(Duration::from_secs(5), gate.reached()).await?;

        h.orchestrator
            .retry_subtask("s-overtaken", &ids[1], Some("espresso tamper".to_string()))
            .await?;
        gate.release();
        h.orchestrator.wait_idle().await;

        let session = h.orchestrator.session("s-overtaken").await?;
        assert_eq!(session.phase, Phase::Selection);
        assert_eq!(session.research_plan[1].attempts, 2);
        assert_eq!(session.research_plan[1].status, SubTaskStatus::Complete);
        let titles = web_titles(&session, &ids[1]);
        assert_eq!(titles.len(), 3);
        assert!(titles.iter().all(|title| title.starts_with("espresso tamper")));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_research_reports_each_sub_task_in_plan_order() -> anyhow::Result<()> {
        let gate = Arc::new(SearchGate::default());
        let h = harness(Setup {
            web: FakeWebSearch::with_hits(3).held_on("espresso beans", gate.clone()),
            settings: OrchestratorSettings {
                research_concurrency: 2,
                ..OrchestratorSettings::default()
            },
            ..Setup::default()
        });
        let ids = approve_plan(&h, "s-wide").await?;
        tokio::time::timeout(Duration::from_secs(5), gate.reached()).await?;

        let mut gear_done = false;
        for _ in 0..200 {
            let session = h.orchestrator.session("s-wide").await?;
            if session.research_results.contains_key(&ids[1]) {
                gear_done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gear_done, "second sub-task should finish while the first is held");
        gate.release();
        h.orchestrator.wait_idle().await;

        let session = h.orchestrator.session("s-wide").await?;
        assert_eq!(session.phase, Phase::Selection);
        let stored: Vec<&String> = session.research_results.keys().collect();
        assert_eq!(stored, ids.iter().collect::<Vec<_>>());

        let mut started: Vec<(u64, u64)> = h
            .hub
            .recent(&session_topic("s-wide"))
            .iter()
            .filter(|event| event.event_type == "orch_researching")
            .filter_map(|event| {
                let current = event.payload.get("current")?.as_u64()?;
                let total = event.payload.get("total")?.as_u64()?;
                Some((current, total))
            })
            .collect();
        started.sort_unstable();
        assert_eq!(started, vec![(1, 2), (2, 2)]);
        Ok(())
    }

    #[tokio::test]
    async fn composer_failure_moves_session_to_error() -> anyhow::Result<()> {
        let h = harness(Setup {
            images: FakeImageGenerator::new(ImageMode::Fail),
            ..Setup::default()
        });
        drive_to_selection(&h, "s-fail").await?;
        h.orchestrator
            .submit_selections("s-fail", UserSelections::default())
            .await?;
        h.orchestrator.wait_idle().await;

        let session = h.orchestrator.session("s-fail").await?;
        assert_eq!(session.phase, Phase::Error);
        assert_eq!(session.error_kind, Some(ErrorKind::Generation));
        assert!(session.generated_post.is_none());
        assert!(h.postings.is_empty());
        let events = h.hub.recent(&session_topic("s-fail"));
        let last = events.last().ok_or_else(|| anyhow::anyhow!("no events"))?;
        assert_eq!(last.event_type, "orch_error");
        assert_eq!(last.str_field("kind"), Some("generation"));
        assert!(last
            .str_field("message")
            .is_some_and(|message| message.starts_with("Generation failed: ")));
        Ok(())
    }

    #[tokio::test]
    async fn panicking_phase_is_recorded_as_internal_error() -> anyhow::Result<()> {
        let h = harness(Setup {
            images: FakeImageGenerator::new(ImageMode::Panic),
            ..Setup::default()
        });
        drive_to_selection(&h, "s-panic").await?;
        h.orchestrator
            .submit_selections("s-panic", UserSelections::default())
            .await?;
        h.orchestrator.wait_idle().await;

        let session = h.orchestrator.session("s-panic").await?;
        assert_eq!(session.phase, Phase::Error);
        assert_eq!(session.error_kind, Some(ErrorKind::Internal));
        assert!(session
            .error
            .as_deref()
            .is_some_and(|error| error.contains("image backend crashed")));
        Ok(())
    }

    #[tokio::test]
    async fn preconditions_are_checked_synchronously() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let missing = h
            .orchestrator
            .start(StartRequest {
                influencer_id: "nobody".to_string(),
                query: "x".to_string(),
                ..StartRequest::default()
            })
            .await;
        assert!(matches!(missing, Err(StudioError::PersonaNotFound(_))));
        let blank = h
            .orchestrator
            .start(StartRequest {
                query: "   ".to_string(),
                ..request("s-blank")
            })
            .await;
        assert!(matches!(blank, Err(StudioError::InvalidInput(_))));

        h.orchestrator.start(request("s-pre")).await?;
        h.orchestrator.wait_idle().await;
        let submit = h
            .orchestrator
            .submit_selections("s-pre", UserSelections::default())
            .await;
        assert!(matches!(submit, Err(StudioError::InvalidPhase { .. })));
        let retry = h.orchestrator.retry_subtask("s-pre", "any", None).await;
        assert!(matches!(retry, Err(StudioError::InvalidPhase { .. })));
        let empty = h
            .orchestrator
            .edit_plan(
                "s-pre",
                vec![PlanEdit {
                    name: "Empty".to_string(),
                    ..PlanEdit::default()
                }],
            )
            .await;
        assert!(matches!(empty, Err(StudioError::InvalidInput(_))));

        let session = h.orchestrator.session("s-pre").await?;
        let edits: Vec<PlanEdit> = session.research_plan.iter().map(PlanEdit::from).collect();
        h.orchestrator.edit_plan("s-pre", edits.clone()).await?;
        let again = h.orchestrator.edit_plan("s-pre", edits).await;
        assert!(matches!(again, Err(StudioError::InvalidPhase { .. })));
        h.orchestrator.wait_idle().await;

        let unknown = h.orchestrator.session("nope").await;
        assert!(matches!(unknown, Err(StudioError::SessionNotFound(_))));
        let animate = h.orchestrator.animate_post("s-pre", None, None).await;
        assert!(matches!(animate, Err(StudioError::InvalidPhase { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn deleted_sessions_stop_background_work() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        h.orchestrator.start(request("s-gone")).await?;
        assert!(h.orchestrator.delete("s-gone").await?);
        h.orchestrator.wait_idle().await;

        assert!(h.orchestrator.session("s-gone").await.is_err());
        assert!(!event_types(&h.hub, "s-gone").contains(&"orch_plan_ready".to_string()));
        assert!(!h.orchestrator.delete("s-gone").await?);
        assert!(!h.orchestrator.inner.locks.contains_key("s-gone"));
        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_finished_session_forgets_its_locks_and_post_topic() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        drive_to_selection(&h, "s-done").await?;
        h.orchestrator
            .submit_selections("s-done", UserSelections::default())
            .await?;
        h.orchestrator.wait_idle().await;
        let posting_id = h.orchestrator.animate_post("s-done", None, None).await?;
        h.orchestrator.wait_idle().await;

        let post_topic = format!("post:{posting_id}");
        assert!(!h.orchestrator.inner.locks.contains_key(&post_topic));
        assert_eq!(h.hub.recent(&post_topic).len(), 2);
        assert!(h.orchestrator.inner.locks.contains_key("s-done"));

        assert!(h.orchestrator.delete("s-done").await?);
        assert!(!h.orchestrator.inner.locks.contains_key("s-done"));
        assert!(h.hub.recent(&post_topic).is_empty());
        assert!(h.postings.get(&posting_id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn restarting_a_session_id_supersedes_the_old_run() -> anyhow::Result<()> {
        let h = harness(Setup {
            replies: vec![Ok(plan_reply()), Ok(plan_reply())],
            ..Setup::default()
        });
        h.orchestrator.start(request("s-dup")).await?;
        let first_epoch = h.orchestrator.session("s-dup").await?.epoch;
        h.orchestrator
            .start(StartRequest {
                query: "pour over".to_string(),
                ..request("s-dup")
            })
            .await?;
        h.orchestrator.wait_idle().await;

        let session = h.orchestrator.session("s-dup").await?;
        assert_ne!(session.epoch, first_epoch);
        assert_eq!(session.query, "pour over");
        assert_eq!(session.phase, Phase::PlanReview);
        let ready = event_types(&h.hub, "s-dup")
            .into_iter()
            .filter(|event| event == "orch_plan_ready")
            .count();
        assert_eq!(ready, 1);
        Ok(())
    }

    #[tokio::test]
    async fn animate_post_stores_video_on_posting() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        drive_to_selection(&h, "s-video").await?;
        h.orchestrator
            .submit_selections("s-video", UserSelections::default())
            .await?;
        h.orchestrator.wait_idle().await;

        let posting_id = h.orchestrator.animate_post("s-video", None, None).await?;
        h.orchestrator.wait_idle().await;

        let posting = h
            .postings
            .get(&posting_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("posting missing"))?;
        assert_eq!(posting.status, PostingStatus::VideoReady);
        assert!(posting
            .video_url
            .as_deref()
            .is_some_and(|url| url.contains("orchestrator/videos/")));
        let requests = h.video.requests();
        assert_eq!(requests[0].duration_seconds, 6);
        assert_eq!(requests[0].aspect_ratio, "9:16");
        assert_eq!(requests[0].source_image, posting.grid_image_url);
        let statuses: Vec<String> = h
            .hub
            .recent(&format!("post:{posting_id}"))
            .iter()
            .filter_map(|event| event.str_field("status").map(str::to_string))
            .collect();
        assert_eq!(statuses, vec!["generating_video", "video_ready"]);
        assert_eq!(
            h.orchestrator.session("s-video").await?.phase,
            Phase::Complete
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_animation_marks_posting() -> anyhow::Result<()> {
        let h = harness(Setup {
            video: FakeVideo::new(true),
            ..Setup::default()
        });
        drive_to_selection(&h, "s-novideo").await?;
        h.orchestrator
            .submit_selections("s-novideo", UserSelections::default())
            .await?;
        h.orchestrator.wait_idle().await;
        let posting_id = h.orchestrator.animate_post("s-novideo", Some(8), None).await?;
        h.orchestrator.wait_idle().await;

        let posting = h
            .postings
            .get(&posting_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("posting missing"))?;
        assert_eq!(posting.status, PostingStatus::VideoFailed);
        assert!(posting
            .error
            .as_deref()
            .is_some_and(|error| error.contains("video quota exhausted")));
        Ok(())
    }

    #[test]
    fn edited_plans_are_bounded() -> anyhow::Result<()> {
        let edits: Vec<PlanEdit> = (0..7)
            .map(|idx| PlanEdit {
                id: None,
                name: if idx == 0 { " ".to_string() } else { format!("t{idx}") },
                queries: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            })
            .collect();
        let plan = bound_plan(edits)?;
        assert_eq!(plan.len(), 5);
        assert_eq!(plan[0].name, "Sub-task 1");
        assert!(plan.iter().all(|task| task.queries.len() == 4));

        let duplicate = bound_plan(vec![
            PlanEdit {
                id: Some("x".into()),
                name: "a".into(),
                queries: vec!["q".into()],
            },
            PlanEdit {
                id: Some("x".into()),
                name: "b".into(),
                queries: vec!["q".into()],
            },
        ]);
        assert!(matches!(duplicate, Err(StudioError::InvalidInput(_))));
        assert!(bound_plan(Vec::new()).is_err());
        Ok(())
    }
}
