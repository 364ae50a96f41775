//! Run tracking — the durable transcript of every streamed request.
//!
//! Each session produces a `Run` plus an ordered `RunEvent` log with a
//! dense per-run sequence number, enabling resume-and-replay. Runs are
//! persisted to a JSONL file and kept in a bounded in-memory ring; run
//! events fan out live over per-run broadcast channels.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use ed_domain::event::{LoopStopReason, MetaPhase, StreamEvent, TerminationReason};

use super::truncate_str;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status & state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Fine-grained position inside one run, for resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    LlmStream,
    ToolExec,
    Apply,
    NextTurn,
    Complete,
    Failed,
    Cancelled,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub chat_id: String,
    pub user_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub status: RunStatus,
    pub state: RunState,
    pub current_turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_stop_reason: Option<LoopStopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Resume checkpoint and workflow linkage.
    #[serde(default)]
    pub metadata: Value,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// First ~200 chars of the assistant output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}

impl Run {
    pub fn new(
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        user_message_id: impl Into<String>,
        assistant_message_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            user_message_id: user_message_id.into(),
            assistant_message_id: assistant_message_id.into(),
            status: RunStatus::Queued,
            state: RunState::Init,
            current_turn: 0,
            termination_reason: None,
            loop_stop_reason: None,
            error_message: None,
            metadata: Value::Null,
            started_at: Utc::now(),
            ended_at: None,
            output_preview: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, state: RunState) {
        self.status = status;
        self.state = state;
        self.ended_at = Some(Utc::now());
    }
}

/// One persisted stream event, densely sequenced within its run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub run_id: Uuid,
    pub seq: u64,
    pub event_type: String,
    pub event: StreamEvent,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_RUNS_IN_MEMORY: usize = 1000;
const MAX_EVENTS_PER_RUN: usize = 10_000;

pub struct RunStore {
    inner: RwLock<RunStoreInner>,
    log_path: PathBuf,
    /// Per-run live channels for SSE replay subscribers.
    channels: RwLock<HashMap<Uuid, broadcast::Sender<RunEventRecord>>>,
}

struct RunStoreInner {
    runs: VecDeque<Run>,
    index: HashMap<Uuid, usize>,
    /// Logical sequence of the front ring element, so index values never
    /// need bulk adjustment when the ring pops.
    base_seq: usize,
    /// run_id → ordered event log.
    events: HashMap<Uuid, Vec<RunEventRecord>>,
}

impl RunStoreInner {
    fn new(runs: VecDeque<Run>) -> Self {
        let mut index = HashMap::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            index.insert(run.id, i);
        }
        Self {
            runs,
            index,
            base_seq: 0,
            events: HashMap::new(),
        }
    }

    fn get(&self, id: &Uuid) -> Option<&Run> {
        let seq = *self.index.get(id)?;
        self.runs.get(seq - self.base_seq)
    }

    fn get_mut(&mut self, id: &Uuid) -> Option<&mut Run> {
        let seq = *self.index.get(id)?;
        self.runs.get_mut(seq - self.base_seq)
    }

    fn push_back(&mut self, run: Run) {
        let seq = self.base_seq + self.runs.len();
        self.index.insert(run.id, seq);
        self.runs.push_back(run);
    }

    fn pop_front(&mut self) {
        if let Some(run) = self.runs.pop_front() {
            self.index.remove(&run.id);
            self.events.remove(&run.id);
            self.base_seq += 1;
        }
    }
}

impl RunStore {
    /// Open the store, reloading recent runs from the JSONL log.
    pub fn new(state_dir: &Path) -> Self {
        let dir = state_dir.join("runs");
        std::fs::create_dir_all(&dir).ok();
        let log_path = dir.join("runs.jsonl");
        let (runs, total_on_disk) = Self::load_recent(&log_path);

        if total_on_disk > runs.len() {
            tracing::info!(
                kept = runs.len(),
                pruned = total_on_disk - runs.len(),
                "pruning runs JSONL on disk"
            );
            Self::rewrite_jsonl(&log_path, &runs);
        }

        Self {
            inner: RwLock::new(RunStoreInner::new(runs)),
            log_path,
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn load_recent(path: &Path) -> (VecDeque<Run>, usize) {
        let mut runs = VecDeque::new();
        let mut total = 0;
        if let Ok(content) = std::fs::read_to_string(path) {
            let lines: Vec<&str> = content.lines().collect();
            total = lines.len();
            for line in lines.iter().rev().take(MAX_RUNS_IN_MEMORY) {
                if let Ok(run) = serde_json::from_str::<Run>(line) {
                    runs.push_front(run);
                }
            }
        }
        (runs, total)
    }

    fn rewrite_jsonl(path: &Path, runs: &VecDeque<Run>) {
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for run in runs {
                if let Ok(json) = serde_json::to_string(run) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    // ── Runs ─────────────────────────────────────────────────────────

    pub fn insert(&self, run: Run) -> Uuid {
        let id = run.id;
        let mut inner = self.inner.write();
        inner.push_back(run);
        if inner.runs.len() > MAX_RUNS_IN_MEMORY {
            inner.pop_front();
        }
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Run> {
        self.inner.read().get(id).cloned()
    }

    pub fn update<F>(&self, id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Run),
    {
        let mut inner = self.inner.write();
        if let Some(run) = inner.get_mut(id) {
            f(run);
            return true;
        }
        false
    }

    /// Append the run's current state to the JSONL log.
    pub fn persist(&self, run: &Run) {
        if let Ok(json) = serde_json::to_string(run) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    pub fn list(&self, chat_id: Option<&str>, limit: usize, offset: usize) -> (Vec<Run>, usize) {
        let inner = self.inner.read();
        let filter = |r: &&Run| chat_id.map_or(true, |c| r.chat_id == c);
        let total = inner.runs.iter().rev().filter(filter).count();
        let page = inner
            .runs
            .iter()
            .rev()
            .filter(filter)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    // ── Run events ───────────────────────────────────────────────────

    /// Record a stream event against the run, assigning the next dense
    /// sequence number, and fan it out to live subscribers.
    ///
    /// A second terminal `session_complete` meta for the same run is
    /// dropped — exactly one terminal frame per run survives.
    pub fn emit(&self, run_id: &Uuid, event: StreamEvent) -> Option<u64> {
        let record = {
            let mut inner = self.inner.write();
            let log = inner.events.entry(*run_id).or_default();

            if is_terminal_meta(&event)
                && log.iter().any(|r| is_terminal_meta(&r.event))
            {
                tracing::warn!(run_id = %run_id, "duplicate terminal meta suppressed");
                return None;
            }
            if log.len() >= MAX_EVENTS_PER_RUN {
                return None;
            }

            let record = RunEventRecord {
                run_id: *run_id,
                seq: log.len() as u64 + 1,
                event_type: event.kind().to_string(),
                event,
            };
            log.push(record.clone());
            record
        };

        let seq = record.seq;
        if let Some(tx) = self.channels.read().get(run_id) {
            let _ = tx.send(record);
        }
        Some(seq)
    }

    /// The persisted event log, ordered by `seq`, optionally from a
    /// checkpoint onwards.
    pub fn events(&self, run_id: &Uuid, after_seq: u64) -> Vec<RunEventRecord> {
        self.inner
            .read()
            .events
            .get(run_id)
            .map(|log| {
                log.iter()
                    .filter(|r| r.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscribe(&self, run_id: &Uuid) -> broadcast::Receiver<RunEventRecord> {
        let mut channels = self.channels.write();
        channels
            .entry(*run_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    pub fn cleanup_channel(&self, run_id: &Uuid) {
        self.channels.write().remove(run_id);
    }

    /// Record the output preview on the way out.
    pub fn set_output_preview(&self, run_id: &Uuid, output: &str) {
        self.update(run_id, |r| {
            r.output_preview = Some(truncate_str(output, 200));
        });
    }
}

fn is_terminal_meta(event: &StreamEvent) -> bool {
    matches!(
        event,
        StreamEvent::Meta {
            phase: MetaPhase::SessionComplete,
            ..
        }
    )
}
