use anyhow::Result;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tomb_core::{EventEnvelope, EventKind, runtime_dir};
use uuid::Uuid;

pub struct Observer {
    log_path: Option<PathBuf>,
    seq: AtomicU64,
    verbose: AtomicBool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: Some(dir.join("observe.log")),
            seq: AtomicU64::new(0),
            verbose: AtomicBool::new(false),
        })
    }

    /// An observer without a log file; verbose and warn lines still go to stderr.
    pub fn detached() -> Self {
        Self {
            log_path: None,
            seq: AtomicU64::new(0),
            verbose: AtomicBool::new(false),
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Stamps and records an event. Failures to write are reported, never propagated.
    pub fn record(&self, session_id: Uuid, kind: EventKind) {
        let event = EventEnvelope {
            seq_no: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            at: Utc::now(),
            session_id,
            kind,
        };
        if let Err(err) = self.record_event(&event) {
            eprintln!("[tomb WARN] failed to record event {}: {err}", event.seq_no);
        }
    }

    pub fn record_event(&self, event: &EventEnvelope) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.verbose_log(&format!("event {json}"));
        self.append_log_line(&format!("{} EVENT {json}", Utc::now().to_rfc3339()))
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Log a message to stderr with `[tomb]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.is_verbose() {
            eprintln!("[tomb] {msg}");
        }
    }

    /// Log a warning. Always written to stderr, and to the log file when attached.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[tomb WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
