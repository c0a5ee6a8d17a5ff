//! Per-workflow filesystem monitoring.
//!
//! One [`AgentDirectoryMonitor`] per adw_id watches `agents/<adw_id>/` and
//! the shared `specs/` directory from a dedicated OS thread. A `notify`
//! watcher wakes the thread promptly when files appear, but the 1 s polling
//! loop is the source of truth — watcher events only shorten the wait.
//!
//! Events cross into the async world over an unbounded channel; a single
//! consumer task on the runtime drains it into the connection manager. The
//! monitor knows nothing about WebSockets.

pub mod parser;

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant, UNIX_EPOCH};

use notify::{RecursiveMode, Watcher};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::events::{AgentLog, Event, EventPayload};

/// Normal polling period.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Backoff after a cycle-level error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// How long `stop()` waits for the polling thread.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_FILENAME: &str = "adw_state.json";
const JSONL_FILENAME: &str = "raw_output.jsonl";
const EXECUTION_LOG_FILENAME: &str = "execution.log";
const SCREENSHOT_DIR: &str = "review_img";
const SCREENSHOT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

/// Handle to one workflow's monitor. `start`/`stop` are idempotent.
pub struct AgentDirectoryMonitor {
    adw_id: String,
    agent_dir: PathBuf,
    specs_dir: PathBuf,
    events: UnboundedSender<Event>,
    poll_interval: Duration,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    watcher: Option<notify::RecommendedWatcher>,
}

impl AgentDirectoryMonitor {
    pub fn new(
        adw_id: &str,
        agents_dir: &Path,
        specs_dir: &Path,
        events: UnboundedSender<Event>,
    ) -> Self {
        Self {
            adw_id: adw_id.to_string(),
            agent_dir: agents_dir.join(adw_id),
            specs_dir: specs_dir.to_path_buf(),
            events,
            poll_interval: POLL_INTERVAL,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
            watcher: None,
        }
    }

    /// Shorten the polling period (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Begin observing. Creates the workflow directory if it does not
    /// exist yet; the worker may not have started writing.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            warn!(adw_id = %self.adw_id, "monitor already running");
            return;
        }

        if let Err(e) = std::fs::create_dir_all(&self.agent_dir) {
            warn!(adw_id = %self.adw_id, error = %e, "could not create agent directory");
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        let (wake_tx, wake_rx) = std::sync::mpsc::channel::<()>();

        // The watcher only accelerates discovery; losing it degrades to
        // pure polling.
        match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if res.is_ok() {
                let _ = wake_tx.send(());
            }
        }) {
            Ok(mut watcher) => {
                if let Err(e) = watcher.watch(&self.agent_dir, RecursiveMode::Recursive) {
                    warn!(adw_id = %self.adw_id, error = %e, "failed to watch agent directory");
                }
                if self.specs_dir.exists()
                    && let Err(e) = watcher.watch(&self.specs_dir, RecursiveMode::NonRecursive)
                {
                    warn!(adw_id = %self.adw_id, error = %e, "failed to watch specs directory");
                }
                self.watcher = Some(watcher);
            }
            Err(e) => {
                warn!(adw_id = %self.adw_id, error = %e, "filesystem watcher unavailable, polling only");
            }
        }

        let mut worker = MonitorWorker {
            adw_id: self.adw_id.clone(),
            agent_dir: self.agent_dir.clone(),
            specs_dir: self.specs_dir.clone(),
            events: self.events.clone(),
            file_positions: HashMap::new(),
            tracked_jsonl: HashSet::new(),
            seen_screenshots: HashSet::new(),
            seen_specs: HashSet::new(),
            previous_state: None,
        };
        let stop_flag = Arc::clone(&self.stop_flag);
        let poll_interval = self.poll_interval;

        self.thread = Some(std::thread::spawn(move || {
            worker.run(stop_flag, wake_rx, poll_interval);
        }));

        info!(adw_id = %self.adw_id, "agent directory monitor started");
    }

    /// Stop observing. Joins the polling thread with a bounded wait and
    /// releases the watcher.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop_flag.store(true, Ordering::SeqCst);
        self.watcher = None;

        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if thread.is_finished() {
            let _ = thread.join();
        } else {
            warn!(adw_id = %self.adw_id, "polling thread did not stop in time, detaching");
        }
        info!(adw_id = %self.adw_id, "agent directory monitor stopped");
    }
}

impl Drop for AgentDirectoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the polling thread.
struct MonitorWorker {
    adw_id: String,
    agent_dir: PathBuf,
    specs_dir: PathBuf,
    events: UnboundedSender<Event>,
    /// Byte offsets per tailed file.
    file_positions: HashMap<PathBuf, u64>,
    tracked_jsonl: HashSet<PathBuf>,
    seen_screenshots: HashSet<PathBuf>,
    seen_specs: HashSet<PathBuf>,
    previous_state: Option<Map<String, Value>>,
}

impl MonitorWorker {
    fn run(&mut self, stop_flag: Arc<AtomicBool>, wake_rx: Receiver<()>, poll_interval: Duration) {
        let mut wait = poll_interval;
        while !stop_flag.load(Ordering::SeqCst) {
            match self.poll_cycle() {
                Ok(()) => wait = poll_interval,
                Err(e) => {
                    error!(adw_id = %self.adw_id, error = %e, "error in polling loop");
                    wait = ERROR_BACKOFF;
                }
            }

            // Sleep until the next tick, waking early on watcher activity.
            match wake_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Watcher gone; fall back to plain sleeping.
                    std::thread::sleep(wait);
                }
            }
        }
    }

    fn poll_cycle(&mut self) -> anyhow::Result<()> {
        self.check_state_changes();
        self.discover_and_tail()?;
        self.check_screenshots()?;
        self.check_specs();
        Ok(())
    }

    fn emit(&self, payload: EventPayload) {
        if self.events.send(Event::new(payload)).is_err() {
            warn!(adw_id = %self.adw_id, "event channel closed, dropping event");
        }
    }

    // ── State diffing ────────────────────────────────────────────────

    fn check_state_changes(&mut self) {
        let state_path = self.agent_dir.join(STATE_FILENAME);
        let raw = match std::fs::read_to_string(&state_path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let current: Map<String, Value> = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(adw_id = %self.adw_id, "state file is not a JSON object");
                return;
            }
            Err(e) => {
                error!(adw_id = %self.adw_id, error = %e, "invalid JSON in state file");
                return;
            }
        };

        let changed_fields = match &self.previous_state {
            None => {
                let mut keys: Vec<String> = current.keys().cloned().collect();
                keys.sort();
                info!(adw_id = %self.adw_id, "initial state loaded");
                keys
            }
            Some(previous) if *previous != current => {
                let mut changed: Vec<String> = previous
                    .keys()
                    .chain(current.keys())
                    .filter(|key| previous.get(*key) != current.get(*key))
                    .cloned()
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                changed.sort();
                info!(adw_id = %self.adw_id, ?changed, "state changed");
                changed
            }
            Some(_) => return,
        };

        self.previous_state = Some(current.clone());
        self.emit(EventPayload::AgentUpdated {
            adw_id: self.adw_id.clone(),
            state: Value::Object(current),
            changed_fields,
        });
    }

    // ── JSONL and execution-log tailing ──────────────────────────────

    fn discover_and_tail(&mut self) -> anyhow::Result<()> {
        let entries = match std::fs::read_dir(&self.agent_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        for entry in entries.flatten() {
            let subdir = entry.path();
            if !subdir.is_dir() {
                continue;
            }
            let agent_role = entry.file_name().to_string_lossy().to_string();

            let jsonl_path = subdir.join(JSONL_FILENAME);
            if jsonl_path.exists() {
                if self.tracked_jsonl.insert(jsonl_path.clone()) {
                    info!(adw_id = %self.adw_id, path = %jsonl_path.display(), "discovered JSONL file");
                }
                self.tail_jsonl(&jsonl_path);
            }

            let log_path = subdir.join(EXECUTION_LOG_FILENAME);
            if log_path.exists() {
                self.tail_execution_log(&log_path, &agent_role);
            }
        }
        Ok(())
    }

    fn tail_jsonl(&mut self, path: &Path) {
        let lines = match self.read_new_lines(path) {
            Ok(lines) => lines,
            Err(e) => {
                error!(adw_id = %self.adw_id, path = %path.display(), error = %e, "error tailing JSONL");
                return;
            }
        };
        for line in lines {
            match serde_json::from_str::<Value>(&line) {
                Ok(record) => {
                    for payload in parser::parse_agent_line(&self.adw_id, &record) {
                        self.emit(payload);
                    }
                }
                Err(e) => {
                    error!(adw_id = %self.adw_id, error = %e, "invalid JSONL line");
                }
            }
        }
    }

    fn tail_execution_log(&mut self, path: &Path, agent_role: &str) {
        let lines = match self.read_new_lines(path) {
            Ok(lines) => lines,
            Err(e) => {
                error!(adw_id = %self.adw_id, path = %path.display(), error = %e, "error tailing log");
                return;
            }
        };
        for line in lines {
            self.emit(EventPayload::AgentLog(AgentLog {
                adw_id: self.adw_id.clone(),
                agent_role: Some(agent_role.to_string()),
                level: classify_log_level(&line).to_string(),
                message: line,
                source: Some(EXECUTION_LOG_FILENAME.to_string()),
                session_id: None,
            }));
        }
    }

    /// Read complete lines appended since the last tail of `path`,
    /// advancing the stored byte offset. A trailing partial line (no
    /// newline yet) is left for the next cycle.
    fn read_new_lines(&mut self, path: &Path) -> std::io::Result<Vec<String>> {
        let offset = self.file_positions.get(path).copied().unwrap_or(0);
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut position = reader.seek(SeekFrom::Start(offset))?;

        let mut lines = Vec::new();
        loop {
            let mut buf = String::new();
            let read = reader.read_line(&mut buf)?;
            if read == 0 {
                break;
            }
            if !buf.ends_with('\n') {
                // Mid-write append; retry next poll.
                break;
            }
            position += read as u64;
            let line = buf.trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }

        self.file_positions.insert(path.to_path_buf(), position);
        Ok(lines)
    }

    // ── Screenshot discovery ─────────────────────────────────────────

    fn check_screenshots(&mut self) -> anyhow::Result<()> {
        let entries = match std::fs::read_dir(&self.agent_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        for entry in entries.flatten() {
            let screenshots_dir = entry.path().join(SCREENSHOT_DIR);
            if !screenshots_dir.is_dir() {
                continue;
            }
            let images = match std::fs::read_dir(&screenshots_dir) {
                Ok(images) => images,
                Err(_) => continue,
            };
            for image in images.flatten() {
                let path = image.path();
                let is_image = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| SCREENSHOT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false);
                if !is_image || self.seen_screenshots.contains(&path) {
                    continue;
                }
                self.seen_screenshots.insert(path.clone());
                info!(adw_id = %self.adw_id, screenshot = %path.display(), "new screenshot detected");

                let rel_path = path
                    .strip_prefix(&self.agent_dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                self.emit(EventPayload::ScreenshotAvailable {
                    adw_id: self.adw_id.clone(),
                    screenshot_path: rel_path,
                    screenshot_type: Some("review".to_string()),
                    metadata: file_metadata(&path),
                });
            }
        }
        Ok(())
    }

    // ── Spec discovery ───────────────────────────────────────────────

    fn check_specs(&mut self) {
        let entries = match std::fs::read_dir(&self.specs_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".md") || !name.contains(&self.adw_id) {
                continue;
            }
            if self.seen_specs.contains(&path) {
                continue;
            }
            self.seen_specs.insert(path.clone());
            info!(adw_id = %self.adw_id, spec = %name, "new spec detected");

            let lower = name.to_lowercase();
            let spec_type = if lower.contains("patch") {
                "patch"
            } else if lower.contains("review") {
                "review"
            } else {
                "plan"
            };

            self.emit(EventPayload::SpecCreated {
                adw_id: self.adw_id.clone(),
                spec_path: path.to_string_lossy().to_string(),
                spec_type: Some(spec_type.to_string()),
                metadata: file_metadata(&path),
            });
        }
    }
}

/// Classify a plain log line by substring, mirroring the level tags the
/// stage scripts write.
fn classify_log_level(line: &str) -> &'static str {
    if line.contains("ERROR") || line.contains("FAILED") {
        "ERROR"
    } else if line.contains("WARNING") || line.contains("WARN") {
        "WARNING"
    } else if line.contains("SUCCESS") {
        "SUCCESS"
    } else {
        "INFO"
    }
}

fn file_metadata(path: &Path) -> Value {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match std::fs::metadata(path) {
        Ok(meta) => {
            let created_at = meta
                .created()
                .or_else(|_| meta.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64());
            json!({
                "file_size": meta.len(),
                "created_at": created_at,
                "file_name": file_name,
            })
        }
        Err(_) => json!({ "file_name": file_name }),
    }
}

// ── Monitor registry ─────────────────────────────────────────────────

/// Registry of active monitors, one per workflow.
pub struct LogStreamer {
    monitors: std::sync::Mutex<HashMap<String, AgentDirectoryMonitor>>,
    agents_dir: PathBuf,
    specs_dir: PathBuf,
    events: UnboundedSender<Event>,
}

impl LogStreamer {
    pub fn new(agents_dir: PathBuf, specs_dir: PathBuf, events: UnboundedSender<Event>) -> Self {
        Self {
            monitors: std::sync::Mutex::new(HashMap::new()),
            agents_dir,
            specs_dir,
            events,
        }
    }

    /// Start monitoring a workflow. Refuses when already monitored.
    pub fn start_monitoring(&self, adw_id: &str) -> bool {
        let mut monitors = self.lock();
        if monitors.contains_key(adw_id) {
            warn!(adw_id, "already monitoring");
            return false;
        }
        let mut monitor = AgentDirectoryMonitor::new(
            adw_id,
            &self.agents_dir,
            &self.specs_dir,
            self.events.clone(),
        );
        monitor.start();
        monitors.insert(adw_id.to_string(), monitor);
        info!(adw_id, "started monitoring");
        true
    }

    /// Stop monitoring a workflow. No-op when absent.
    pub fn stop_monitoring(&self, adw_id: &str) -> bool {
        let mut monitor = {
            let mut monitors = self.lock();
            match monitors.remove(adw_id) {
                Some(monitor) => monitor,
                None => {
                    debug!(adw_id, "not monitoring");
                    return false;
                }
            }
        };
        monitor.stop();
        info!(adw_id, "stopped monitoring");
        true
    }

    pub fn is_monitoring(&self, adw_id: &str) -> bool {
        self.lock().contains_key(adw_id)
    }

    pub fn active_monitors(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Shutdown path: stop every active monitor.
    pub fn stop_all(&self) {
        let adw_ids = self.active_monitors();
        for adw_id in adw_ids {
            self.stop_monitoring(&adw_id);
        }
        info!("stopped all agent monitors");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentDirectoryMonitor>> {
        self.monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
