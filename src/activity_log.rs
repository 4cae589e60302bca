// src/activity_log.rs
// Size- and age-bounded append log, newest line first on disk.
// Not on the hot path: each emit rewrites the whole file.

use chrono::{Local, NaiveDateTime, TimeDelta};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

/// Emits between garbage-collection passes
const GC_EVERY: usize = 100;

struct LogState {
    /// Newest first
    lines: VecDeque<String>,
    emits_since_gc: usize,
}

/// Reverse-chronological activity log.
///
/// Lines are prepended, the buffer is capped at `max_lines`, and lines whose
/// leading `YYYY-MM-DD HH:MM:SS` timestamp is older than `max_age_days` are
/// dropped on the periodic GC pass. Unparseable lines are kept.
pub struct ActivityLog {
    path: PathBuf,
    max_lines: usize,
    max_age_days: i64,
    state: Mutex<LogState>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize, max_age_days: i64) -> Self {
        let path = path.into();
        let mut lines = VecDeque::with_capacity(max_lines);

        // Seed from the last max_lines lines of an existing file
        if let Ok(existing) = std::fs::read_to_string(&path) {
            let all: Vec<&str> = existing.lines().collect();
            let start = all.len().saturating_sub(max_lines);
            for line in &all[start..] {
                lines.push_back(line.to_string());
            }
        }

        let log = Self {
            path,
            max_lines,
            max_age_days,
            state: Mutex::new(LogState {
                lines,
                emits_since_gc: 0,
            }),
        };
        log.with_state(|state| Self::gc(state, max_age_days, max_lines));
        log
    }

    /// Append a line (it becomes the newest, i.e. the first on disk).
    pub fn emit(&self, level: &str, message: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{stamp} {level:<8} {message}");

        self.with_state(|state| {
            state.lines.push_front(line);
            state.lines.truncate(self.max_lines);

            state.emits_since_gc += 1;
            if state.emits_since_gc >= GC_EVERY {
                state.emits_since_gc = 0;
                Self::gc(state, self.max_age_days, self.max_lines);
            }
        });

        if let Err(e) = self.flush() {
            tracing::debug!("activity log write failed: {e}");
        }
    }

    /// Current lines, newest first.
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().unwrap().lines.iter().cloned().collect()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LogState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn gc(state: &mut LogState, max_age_days: i64, max_lines: usize) {
        let cutoff = Local::now().naive_local() - TimeDelta::days(max_age_days);

        let mut kept = VecDeque::with_capacity(max_lines);
        for line in state.lines.drain(..) {
            match parse_line_timestamp(&line) {
                Some(stamp) if stamp < cutoff => {}
                _ => kept.push_back(line),
            }
        }
        kept.truncate(max_lines);
        state.lines = kept;
    }

    fn flush(&self) -> std::io::Result<()> {
        let content = {
            let state = self.state.lock().unwrap();
            let mut out = String::new();
            for line in &state.lines {
                out.push_str(line);
                out.push('\n');
            }
            out
        };
        std::fs::write(&self.path, content)
    }
}

/// Parse `YYYY-MM-DD HH:MM:SS` from the first 19 characters of a line.
fn parse_line_timestamp(line: &str) -> Option<NaiveDateTime> {
    if line.len() < 19 {
        return None;
    }
    NaiveDateTime::parse_from_str(&line[..19], "%Y-%m-%d %H:%M:%S").ok()
}
