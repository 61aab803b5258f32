use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use postcraft_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use postcraft_contracts::events::{Event, EventJournal};
use postcraft_contracts::runs::{write_summary, SessionSummary};
use postcraft_contracts::session::{
    GridLayout, OrchestratorSession, Persona, Phase, PostingStatus, SubTaskStatus, UserSelections,
};
use postcraft_engine::capabilities::{ImageFetcher, PersonaStore, PostingStore};
use postcraft_engine::grid::{split_grid, split_layout};
use postcraft_engine::orchestrator::PlanEdit;
use postcraft_engine::providers::HttpImageFetcher;
use postcraft_engine::store::InMemoryPersonaStore;
use postcraft_engine::{EventHub, HubMessage, Orchestrator, StartRequest, StudioConfig};
use serde_json::{json, Map, Value};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "postcraft=info,postcraft_engine=info";
const DEFAULT_INFLUENCER_ID: &str = "cli-influencer";
const JOURNAL_DRAIN: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "postcraft", version, about = "Research-driven influencer post studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan, research and generate one post without review stops.
    Run(RunArgs),
    /// Interactive session driven by slash commands.
    Chat(ChatArgs),
    /// Split a local composite image into slide panels.
    Split(SplitArgs),
}

#[derive(Debug, Args)]
struct PersonaArgs {
    /// JSON file with one persona or an array of personas.
    #[arg(long)]
    personas: Option<PathBuf>,
    #[arg(long)]
    influencer_id: Option<String>,
    #[arg(long)]
    influencer_name: Option<String>,
    #[arg(long = "niche")]
    niches: Vec<String>,
    #[arg(long)]
    tone: Option<String>,
    #[arg(long)]
    avatar_url: Option<String>,
}

#[derive(Debug, Args)]
struct ProviderArgs {
    #[arg(long)]
    text_provider: Option<String>,
    #[arg(long)]
    image_provider: Option<String>,
    #[arg(long)]
    video_provider: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    query: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    hint: Option<String>,
    /// Images carried into generation, in result order.
    #[arg(long, default_value_t = 6)]
    max_images: usize,
    /// Retry failed sub-tasks once with a broadened query.
    #[arg(long)]
    retry_failed: bool,
    #[arg(long)]
    animate: bool,
    #[arg(long)]
    duration_seconds: Option<u32>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[command(flatten)]
    persona: PersonaArgs,
    #[command(flatten)]
    providers: ProviderArgs,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    persona: PersonaArgs,
    #[command(flatten)]
    providers: ProviderArgs,
}

#[derive(Debug, Parser)]
struct SplitArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// One of 1x2, 2x1, 2x2, 2x3, 3x2.
    #[arg(long, conflicts_with_all = ["rows", "cols"])]
    layout: Option<String>,
    #[arg(long, requires = "cols")]
    rows: Option<u32>,
    #[arg(long, requires = "rows")]
    cols: Option<u32>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("postcraft error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_run(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Split(args) => run_split(args),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn build_config(providers: &ProviderArgs, personas: &PersonaArgs) -> StudioConfig {
    let mut config = StudioConfig::from_env();
    if providers.text_provider.is_some() {
        config.text_provider = providers.text_provider.clone();
    }
    if providers.image_provider.is_some() {
        config.image_provider = providers.image_provider.clone();
    }
    if providers.video_provider.is_some() {
        config.video_provider = providers.video_provider.clone();
    }
    if providers.text_model.is_some() {
        config.text_model = providers.text_model.clone();
    }
    if providers.image_model.is_some() {
        config.image_model = providers.image_model.clone();
    }
    if personas.personas.is_some() {
        config.personas_file = personas.personas.clone();
    }
    config
}

/// Loads personas from file and adds the one described by flags. Returns the
/// store and the influencer id sessions start for.
async fn persona_store(
    config: &StudioConfig,
    args: &PersonaArgs,
) -> Result<(Arc<InMemoryPersonaStore>, String)> {
    let store = config.load_personas().await?;
    let influencer_id = args
        .influencer_id
        .clone()
        .unwrap_or_else(|| DEFAULT_INFLUENCER_ID.to_string());
    if args.influencer_name.is_some() || config.personas_file.is_none() {
        let name = args
            .influencer_name
            .clone()
            .unwrap_or_else(|| "Postcraft Creator".to_string());
        store.insert(Persona {
            id: influencer_id.clone(),
            name,
            niches: args.niches.clone(),
            tone: args.tone.clone(),
            avatar_url: args.avatar_url.clone(),
            ..Persona::default()
        });
    }
    if store.get(&influencer_id).await?.is_none() {
        bail!("influencer {influencer_id} is not in the personas file");
    }
    Ok((Arc::new(store), influencer_id))
}

struct Studio {
    config: StudioConfig,
    hub: EventHub,
    personas: Arc<InMemoryPersonaStore>,
    orchestrator: Orchestrator,
    postings: Arc<dyn PostingStore>,
}

impl Studio {
    fn new(config: StudioConfig, hub: EventHub, personas: Arc<InMemoryPersonaStore>) -> Result<Self> {
        let caps = config.capabilities(personas.clone() as Arc<dyn PersonaStore>)?;
        let postings = caps.postings.clone();
        let orchestrator = Orchestrator::new(caps, hub.clone(), config.settings());
        info!(config = ?config.describe(), "studio ready");
        Ok(Self {
            config,
            hub,
            personas,
            orchestrator,
            postings,
        })
    }

    /// Rebuilds providers after a settings change. Existing in-memory sessions
    /// are dropped.
    fn rebuild(&mut self) -> Result<()> {
        let rebuilt = Self::new(self.config.clone(), self.hub.clone(), self.personas.clone())?;
        *self = rebuilt;
        Ok(())
    }
}

struct JournalTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl JournalTask {
    fn spawn(runtime: &Runtime, hub: &EventHub, path: PathBuf, echo: bool) -> Self {
        let journal = EventJournal::new(path);
        let mut subscription = hub.subscribe_all();
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    message = subscription.next() => match message {
                        HubMessage::Event(event) => record_event(&journal, &event, echo),
                        HubMessage::Keepalive => continue,
                        HubMessage::Closed => break,
                    },
                    _ = &mut stopped => {
                        while let Some(event) = subscription.next_event(JOURNAL_DRAIN).await {
                            record_event(&journal, &event, echo);
                        }
                        break;
                    }
                }
            }
        });
        Self { stop, handle }
    }

    fn finish(self, runtime: &Runtime) {
        let _ = self.stop.send(());
        if let Err(err) = runtime.block_on(self.handle) {
            warn!(error = %err, "event journal task failed");
        }
    }
}

fn record_event(journal: &EventJournal, event: &Event, echo: bool) {
    if let Err(err) = journal.append(event) {
        warn!(error = %format!("{err:#}"), path = %journal.path().display(), "event journal write failed");
    }
    if echo {
        let detail = event
            .str_field("message")
            .or_else(|| event.str_field("status"))
            .unwrap_or("");
        println!("[{}] {detail}", event.event_type);
    }
}

fn run_run(args: RunArgs) -> Result<i32> {
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let runtime = Runtime::new().context("failed to start async runtime")?;
    let config = build_config(&args.providers, &args.persona);
    let (personas, influencer_id) = runtime.block_on(persona_store(&config, &args.persona))?;
    let hub = config.hub();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let journal = JournalTask::spawn(&runtime, &hub, events_path, false);
    let studio = Studio::new(config, hub, personas)?;

    let request = StartRequest {
        influencer_id,
        query: args.query.clone(),
        post_type_hint: args.hint.clone(),
        ..StartRequest::default()
    };
    let outcome = runtime.block_on(drive_session(&studio, request, &args));
    journal.finish(&runtime);
    let session = outcome?;

    write_run_summary(&args.out, &session, &studio.config)?;
    if session.phase != Phase::Complete {
        eprintln!(
            "Session {} ended in {}: {}",
            session.session_id,
            session.phase,
            session.error.as_deref().unwrap_or("unknown error")
        );
        return Ok(1);
    }
    if let Some(post) = session.generated_post.as_ref() {
        println!("Caption: {}", post.caption);
        println!("Grid: {}", preview_url(&post.grid_url));
        let written = runtime.block_on(save_post_images(&args.out, &post.grid_url, post.grid_layout))?;
        for path in written {
            println!("Wrote {}", path.display());
        }
    }
    Ok(0)
}

/// Walks one session through every phase, approving the generated plan and
/// selecting every web item plus the first `max_images` images.
async fn drive_session(
    studio: &Studio,
    request: StartRequest,
    args: &RunArgs,
) -> Result<OrchestratorSession> {
    let orchestrator = &studio.orchestrator;
    let session_id = orchestrator.start(request).await?;
    println!("Session {session_id} started");

    orchestrator.wait_idle().await;
    let session = orchestrator.session(&session_id).await?;
    if session.phase != Phase::PlanReview {
        return Ok(session);
    }
    let plan: Vec<PlanEdit> = session.research_plan.iter().map(PlanEdit::from).collect();
    print_plan(&plan);
    orchestrator.edit_plan(&session_id, plan).await?;

    orchestrator.wait_idle().await;
    let mut session = orchestrator.session(&session_id).await?;
    if session.phase != Phase::Selection {
        return Ok(session);
    }
    if args.retry_failed {
        let failed: Vec<String> = session
            .research_plan
            .iter()
            .filter(|task| task.status == SubTaskStatus::Failed)
            .map(|task| task.id.clone())
            .collect();
        for sub_task_id in failed {
            let outcome = orchestrator.retry_subtask(&session_id, &sub_task_id, None).await?;
            println!(
                "Retried {}: {} ({} web, {} images)",
                outcome.sub_task_id,
                outcome.status.as_str(),
                outcome.web_count,
                outcome.image_count
            );
        }
        session = orchestrator.session(&session_id).await?;
    }
    print_results(&session);
    let selections = select_everything(&session, args.max_images);
    orchestrator.submit_selections(&session_id, selections).await?;

    orchestrator.wait_idle().await;
    let session = orchestrator.session(&session_id).await?;
    if session.phase == Phase::Complete && args.animate {
        animate(studio, &session_id, args.duration_seconds, args.aspect_ratio.clone()).await?;
    }
    Ok(session)
}

async fn animate(
    studio: &Studio,
    session_id: &str,
    duration_seconds: Option<u32>,
    aspect_ratio: Option<String>,
) -> Result<()> {
    let posting_id = studio
        .orchestrator
        .animate_post(session_id, duration_seconds, aspect_ratio)
        .await?;
    println!("Animating post {posting_id}...");
    studio.orchestrator.wait_idle().await;
    let Some(posting) = studio.postings.get(&posting_id).await? else {
        bail!("posting {posting_id} disappeared");
    };
    match (posting.status, posting.video_url.as_deref()) {
        (PostingStatus::VideoReady, Some(url)) => println!("Video: {url}"),
        _ => println!(
            "Video failed: {}",
            posting.error.as_deref().unwrap_or("no video produced")
        ),
    }
    Ok(())
}

fn select_everything(session: &OrchestratorSession, max_images: usize) -> UserSelections {
    let mut selections = UserSelections::default();
    for results in session.research_results.values() {
        selections
            .web_item_ids
            .extend(results.web_items.iter().map(|item| item.id.clone()));
    }
    selections.image_ids.extend(
        session
            .research_results
            .values()
            .flat_map(|results| results.images.iter())
            .take(max_images)
            .map(|image| image.id.clone()),
    );
    selections
}

fn write_run_summary(out: &Path, session: &OrchestratorSession, config: &StudioConfig) -> Result<()> {
    let summary = SessionSummary::from_session(session);
    let described: Map<String, Value> = config
        .describe()
        .into_iter()
        .map(|(key, value)| (key.to_string(), Value::String(value)))
        .collect();
    let mut extra = Map::new();
    extra.insert("config".to_string(), Value::Object(described));
    if let Some(post) = session.generated_post.as_ref() {
        extra.insert("caption".to_string(), json!(post.caption));
        let slide_urls: Vec<String> = post.slide_urls.iter().map(String::as_str).map(preview_url).collect();
        extra.insert("slide_urls".to_string(), json!(slide_urls));
    }
    write_summary(&out.join("summary.json"), &summary, Some(&extra))
}

/// Downloads the composite and writes it plus its panels next to the summary.
async fn save_post_images(out: &Path, grid_url: &str, layout: GridLayout) -> Result<Vec<PathBuf>> {
    let fetched = match HttpImageFetcher::new()
        .fetch(grid_url, Duration::from_secs(60))
        .await
    {
        Ok(fetched) => fetched,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "composite not saved locally");
            return Ok(Vec::new());
        }
    };
    let mut written = Vec::new();
    let grid_path = out.join(format!("grid.{}", extension_for(&fetched.mime_type)));
    std::fs::write(&grid_path, &fetched.bytes)
        .with_context(|| format!("failed to write {}", grid_path.display()))?;
    written.push(grid_path);
    written.extend(write_panels(out, split_layout(&fetched.bytes, layout)?)?);
    Ok(written)
}

fn write_panels(out: &Path, panels: Vec<Vec<u8>>) -> Result<Vec<PathBuf>> {
    panels
        .into_iter()
        .enumerate()
        .map(|(idx, bytes)| {
            let path = out.join(format!("slide-{}.jpg", idx + 1));
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(path)
        })
        .collect()
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

/// Data URIs are shortened for terminal output.
fn preview_url(url: &str) -> String {
    if url.starts_with("data:") {
        let head: String = url.chars().take(32).collect();
        return format!("{head}... ({} bytes)", url.len());
    }
    url.to_string()
}

fn run_split(args: SplitArgs) -> Result<i32> {
    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let panels = match (args.layout.as_deref(), args.rows, args.cols) {
        (Some(raw), _, _) => {
            let Some(layout) = GridLayout::parse(raw) else {
                bail!("unsupported grid layout {raw}");
            };
            split_layout(&bytes, layout)?
        }
        (None, Some(rows), Some(cols)) => split_grid(&bytes, rows, cols)?,
        _ => bail!("pass --layout or both --rows and --cols"),
    };
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    for path in write_panels(&args.out, panels)? {
        println!("Wrote {}", path.display());
    }
    Ok(0)
}

struct ChatState {
    influencer_id: String,
    post_type_hint: Option<String>,
    session_id: Option<String>,
    pending_plan: Option<Vec<PlanEdit>>,
    selections: UserSelections,
    needs_rebuild: bool,
}

impl ChatState {
    fn reset_session(&mut self) {
        self.session_id = None;
        self.pending_plan = None;
        self.selections = UserSelections::default();
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let runtime = Runtime::new().context("failed to start async runtime")?;
    let config = build_config(&args.providers, &args.persona);
    let (personas, influencer_id) = runtime.block_on(persona_store(&config, &args.persona))?;
    let hub = config.hub();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let journal = JournalTask::spawn(&runtime, &hub, events_path, true);
    let mut studio = Studio::new(config, hub, personas)?;
    let mut state = ChatState {
        influencer_id,
        post_type_hint: None,
        session_id: None,
        pending_plan: None,
        selections: UserSelections::default(),
        needs_rebuild: false,
    };

    let stdin = io::stdin();
    let mut line = String::new();
    println!("Postcraft chat started. Type a topic to begin, /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        if intent.action == "noop" {
            continue;
        }
        if intent.action == "quit" {
            break;
        }
        if let Err(err) = handle_intent(&runtime, &mut studio, &mut state, &intent, &args.out) {
            println!("{} failed: {err:#}", intent.action);
        }
    }

    if let Some(session_id) = state.session_id.as_deref() {
        if let Ok(session) = runtime.block_on(studio.orchestrator.session(session_id)) {
            write_run_summary(&args.out, &session, &studio.config)?;
        }
    }
    runtime.block_on(studio.orchestrator.wait_idle());
    journal.finish(&runtime);
    Ok(())
}

fn handle_intent(
    runtime: &Runtime,
    studio: &mut Studio,
    state: &mut ChatState,
    intent: &Intent,
    out: &Path,
) -> Result<()> {
    match intent.action.as_str() {
        "help" => println!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
        "set_persona" => {
            let Some(id) = value_as_non_empty_string(intent.settings_update.get("persona")) else {
                println!("Persona: {}", state.influencer_id);
                return Ok(());
            };
            if runtime.block_on(studio.personas.get(&id))?.is_none() {
                bail!("unknown influencer {id}");
            }
            println!("Persona set to {id}");
            state.influencer_id = id;
        }
        "set_post_type" => {
            state.post_type_hint = value_as_non_empty_string(intent.settings_update.get("post_type"));
            println!(
                "Post type hint: {}",
                state.post_type_hint.as_deref().unwrap_or("(none)")
            );
        }
        "set_text_model" | "set_image_model" => {
            let key = if intent.action == "set_text_model" {
                "text_model"
            } else {
                "image_model"
            };
            let model = value_as_non_empty_string(intent.settings_update.get(key));
            if key == "text_model" {
                studio.config.text_model = model.clone();
            } else {
                studio.config.image_model = model.clone();
            }
            state.needs_rebuild = true;
            println!(
                "{key} set to {} (applies to the next session)",
                model.as_deref().unwrap_or("default")
            );
        }
        "start" => {
            let Some(query) = intent.prompt.clone() else {
                return Ok(());
            };
            if state.needs_rebuild {
                studio.rebuild()?;
                state.needs_rebuild = false;
            }
            state.reset_session();
            let request = StartRequest {
                influencer_id: state.influencer_id.clone(),
                query,
                post_type_hint: state.post_type_hint.clone(),
                ..StartRequest::default()
            };
            let session_id = runtime.block_on(studio.orchestrator.start(request))?;
            println!("Session {session_id} started. /plan shows the research plan once ready.");
            state.session_id = Some(session_id);
        }
        "show_plan" => {
            let session = current_session(runtime, studio, state)?;
            let plan = pending_plan(state, &session)?;
            print_plan(plan);
        }
        "set_queries" | "rename_sub_task" => {
            let session = current_session(runtime, studio, state)?;
            let plan = pending_plan(state, &session)?;
            let Some(task) = intent.position().and_then(|position| plan.get_mut(position)) else {
                bail!("no such sub-task");
            };
            let words = intent.words();
            if intent.action == "set_queries" {
                task.queries = words;
            } else {
                task.name = words.join(" ");
            }
            print_plan(plan);
        }
        "add_sub_task" => {
            let session = current_session(runtime, studio, state)?;
            let plan = pending_plan(state, &session)?;
            let name = intent.words().join(" ");
            if name.trim().is_empty() {
                bail!("/add needs a sub-task name");
            }
            plan.push(PlanEdit {
                id: None,
                queries: vec![name.clone()],
                name,
            });
            print_plan(plan);
        }
        "drop_sub_task" => {
            let session = current_session(runtime, studio, state)?;
            let plan = pending_plan(state, &session)?;
            drop_positions(plan, &intent.words())?;
            print_plan(plan);
        }
        "approve_plan" => {
            let session = current_session(runtime, studio, state)?;
            let plan = pending_plan(state, &session)?.clone();
            let accepted = runtime.block_on(studio.orchestrator.edit_plan(&session.session_id, plan))?;
            state.pending_plan = None;
            println!("Researching {} sub-tasks. /results once research is ready.", accepted.len());
        }
        "show_results" => {
            let session = current_session(runtime, studio, state)?;
            print_results(&session);
        }
        "retry_sub_task" => {
            let session = current_session(runtime, studio, state)?;
            let Some(task) = intent
                .position()
                .and_then(|position| session.research_plan.get(position))
            else {
                bail!("no such sub-task");
            };
            let words = intent.words();
            let custom = (!words.is_empty()).then(|| words.join(" "));
            let outcome = runtime.block_on(studio.orchestrator.retry_subtask(
                &session.session_id,
                &task.id,
                custom,
            ))?;
            println!(
                "{}: {} ({} web, {} images)",
                task.name,
                outcome.status.as_str(),
                outcome.web_count,
                outcome.image_count
            );
        }
        "select" | "unselect" => {
            let session = current_session(runtime, studio, state)?;
            let words = intent.words();
            if intent.action == "select" {
                apply_selection(&mut state.selections, &session, &words);
            } else {
                for id in &words {
                    state.selections.web_item_ids.remove(id);
                    state.selections.image_ids.remove(id);
                }
            }
            println!(
                "Selected {} web items and {} images",
                state.selections.web_item_ids.len(),
                state.selections.image_ids.len()
            );
        }
        "generate" => {
            let session = current_session(runtime, studio, state)?;
            runtime.block_on(
                studio
                    .orchestrator
                    .submit_selections(&session.session_id, state.selections.clone()),
            )?;
            println!("Generating post. /status shows progress.");
        }
        "animate" => {
            let session = current_session(runtime, studio, state)?;
            let duration = intent
                .command_args
                .get("duration_seconds")
                .and_then(Value::as_u64)
                .and_then(|seconds| u32::try_from(seconds).ok());
            let aspect_ratio = value_as_non_empty_string(intent.command_args.get("aspect_ratio"));
            runtime.block_on(animate(studio, &session.session_id, duration, aspect_ratio))?;
        }
        "status" => {
            let session = current_session(runtime, studio, state)?;
            print_status(&session);
            if session.phase.is_terminal() {
                write_run_summary(out, &session, &studio.config)?;
            }
            if let Some(post) = session.generated_post.as_ref() {
                for path in runtime.block_on(save_post_images(out, &post.grid_url, post.grid_layout))? {
                    println!("Wrote {}", path.display());
                }
            }
        }
        "delete" => {
            let Some(session_id) = state.session_id.clone() else {
                bail!("no active session");
            };
            let existed = runtime.block_on(studio.orchestrator.delete(&session_id))?;
            state.reset_session();
            println!(
                "Session {session_id} {}",
                if existed { "deleted" } else { "was already gone" }
            );
        }
        "invalid" => {
            let error = value_as_non_empty_string(intent.command_args.get("error"))
                .unwrap_or_else(|| "invalid command".to_string());
            println!("{error}");
        }
        "unknown" => {
            let command = value_as_non_empty_string(intent.command_args.get("command"))
                .unwrap_or_default();
            println!("Unknown command /{command}. Type /help for commands.");
        }
        other => println!("Unhandled action {other}"),
    }
    Ok(())
}

fn current_session(
    runtime: &Runtime,
    studio: &Studio,
    state: &ChatState,
) -> Result<OrchestratorSession> {
    let Some(session_id) = state.session_id.as_deref() else {
        bail!("no active session, type a topic first");
    };
    Ok(runtime.block_on(studio.orchestrator.session(session_id))?)
}

/// The locally edited plan, seeded from the session on first use.
fn pending_plan<'a>(
    state: &'a mut ChatState,
    session: &OrchestratorSession,
) -> Result<&'a mut Vec<PlanEdit>> {
    if session.phase != Phase::PlanReview {
        bail!("session is in {}, not plan_review", session.phase);
    }
    Ok(state
        .pending_plan
        .get_or_insert_with(|| session.research_plan.iter().map(PlanEdit::from).collect()))
}

/// Removes 1-based positions, highest first so earlier indexes stay valid.
fn drop_positions(plan: &mut Vec<PlanEdit>, words: &[String]) -> Result<()> {
    let mut positions = Vec::with_capacity(words.len());
    for word in words {
        match word.parse::<usize>() {
            Ok(position) if position >= 1 && position <= plan.len() => positions.push(position - 1),
            _ => bail!("'{word}' is not a sub-task number"),
        }
    }
    positions.sort_unstable();
    positions.dedup();
    for position in positions.into_iter().rev() {
        plan.remove(position);
    }
    Ok(())
}

/// `all` selects every item. Other words are item ids, matched against web
/// items first.
fn apply_selection(selections: &mut UserSelections, session: &OrchestratorSession, words: &[String]) {
    let select_all = words.iter().any(|word| word.eq_ignore_ascii_case("all"));
    for results in session.research_results.values() {
        for item in &results.web_items {
            if select_all || words.contains(&item.id) {
                selections.web_item_ids.insert(item.id.clone());
            }
        }
        for image in &results.images {
            if select_all || words.contains(&image.id) {
                selections.image_ids.insert(image.id.clone());
            }
        }
    }
}

fn print_plan(plan: &[PlanEdit]) {
    if plan.is_empty() {
        println!("(empty plan)");
        return;
    }
    for (idx, task) in plan.iter().enumerate() {
        println!("{}. {} [{}]", idx + 1, task.name, task.queries.join(" | "));
    }
}

fn print_results(session: &OrchestratorSession) {
    for (idx, task) in session.research_plan.iter().enumerate() {
        println!("{}. {} ({})", idx + 1, task.name, task.status.as_str());
        if let Some(error) = task.error.as_deref() {
            println!("   {error}");
        }
        let Some(results) = session.research_results.get(&task.id) else {
            continue;
        };
        for item in &results.web_items {
            println!("   web {} {}", item.id, item.title);
        }
        for image in &results.images {
            println!("   img {} {}", image.id, image.title);
        }
    }
}

fn print_status(session: &OrchestratorSession) {
    println!("Session {} is in {}", session.session_id, session.phase);
    if let Some(error) = session.error.as_deref() {
        let kind = session
            .error_kind
            .map(|kind| kind.as_str())
            .unwrap_or("unknown");
        println!("Error ({kind}): {error}");
    }
    if let Some(post) = session.generated_post.as_ref() {
        println!("Caption: {}", post.caption);
        println!("Layout: {} ({} slides)", post.grid_layout.as_str(), post.slide_count);
        println!("Grid: {}", preview_url(&post.grid_url));
        if let Some(posting_id) = post.posting_id.as_deref() {
            println!("Posting: {posting_id}");
        }
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
