// =============================================================================
// Persistence — session snapshots and backfill archival
// =============================================================================
//
// Two independent concerns: (1) a best-effort per-symbol snapshot of
// session status written on shutdown and read back on startup, purely
// informational until a session is explicitly restarted — it does not
// reconstruct a `DryRunEngine`'s resting-order book; and (2) JSONL archive
// writers for raw trade/orderbook/funding events when archival is enabled.
//
// Snapshot writes use the same atomic tmp + rename pattern as the engine's
// hot-reloadable configuration, so a crash mid-write never corrupts the
// previous snapshot.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::session::{Session, SessionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub symbol: String,
    pub saved_at_ms: i64,
    pub status: SnapshotStatus,
}

/// A serializable mirror of `SessionStatus` — `Fp` fields are stored as
/// plain floats since the snapshot is read by humans and future versions of
/// this binary alike, not round-tripped through the fixed-point engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub state: String,
    pub mark_price: Option<f64>,
    pub realized_pnl: f64,
    pub funding_pnl: f64,
    pub event_count: u64,
}

impl From<&SessionStatus> for SnapshotStatus {
    fn from(s: &SessionStatus) -> Self {
        Self {
            state: format!("{:?}", s.state),
            mark_price: s.mark_price.map(|p| p.from_fp()),
            realized_pnl: s.realized_pnl.from_fp(),
            funding_pnl: s.funding_pnl.from_fp(),
            event_count: s.event_count,
        }
    }
}

fn snapshot_path(sessions_dir: &str, symbol: &str) -> PathBuf {
    Path::new(sessions_dir).join(format!("{symbol}.json"))
}

pub fn save_session_snapshot(sessions_dir: &str, symbol: &str, session: &Session) -> Result<()> {
    std::fs::create_dir_all(sessions_dir).with_context(|| format!("failed to create sessions dir {sessions_dir}"))?;

    let snapshot = SessionSnapshot {
        symbol: symbol.to_string(),
        saved_at_ms: chrono::Utc::now().timestamp_millis(),
        status: SnapshotStatus::from(&session.status()),
    };
    let content = serde_json::to_string_pretty(&snapshot).context("failed to serialize session snapshot")?;

    let path = snapshot_path(sessions_dir, symbol);
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content).with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, &path).with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

    info!(symbol, path = %path.display(), "session snapshot saved (atomic)");
    Ok(())
}

/// Best-effort load for diagnostics/logging on startup. Returns `None` when
/// no snapshot exists or it fails to parse — a missing snapshot is the
/// common case on a fresh deployment, not an error.
pub fn load_session_snapshot(sessions_dir: &str, symbol: &str) -> Option<SessionSnapshot> {
    let path = snapshot_path(sessions_dir, symbol);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(symbol, error = %e, "failed to parse session snapshot, ignoring");
            None
        }
    }
}

pub fn ensure_backfill_dirs(sessions_dir: &str, symbols: &[String]) -> Result<()> {
    std::fs::create_dir_all(sessions_dir).with_context(|| format!("failed to create sessions dir {sessions_dir}"))?;
    for symbol in symbols {
        let dir = backfill_dir(symbol);
        std::fs::create_dir_all(&dir).with_context(|| format!("failed to create backfill dir {}", dir.display()))?;
    }
    Ok(())
}

fn backfill_dir(symbol: &str) -> PathBuf {
    Path::new("data/backfill").join(symbol)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStream {
    Trade,
    Orderbook,
    Funding,
}

impl ArchiveStream {
    fn file_name(self) -> &'static str {
        match self {
            ArchiveStream::Trade => "trade.jsonl",
            ArchiveStream::Orderbook => "orderbook.jsonl",
            ArchiveStream::Funding => "funding.jsonl",
        }
    }
}

/// Append one JSON line to the raw archive for `symbol`/`stream`. Opens and
/// closes the file on every call — archival volume is event-rate bound, not
/// latency sensitive, so a held-open file handle per stream isn't worth the
/// extra lifetime management.
pub fn append_archive_line(symbol: &str, stream: ArchiveStream, value: &serde_json::Value) -> Result<()> {
    let dir = backfill_dir(symbol);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create backfill dir {}", dir.display()))?;
    let path = dir.join(stream.file_name());

    let mut file = OpenOptions::new().create(true).append(true).open(&path).with_context(|| format!("failed to open archive file {}", path.display()))?;
    let line = serde_json::to_string(value).context("failed to serialize archive record")?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to archive file {}", path.display()))?;
    Ok(())
}
