//! Change leases: which build currently owns a change, across processes.
//!
//! [`BuildCoordinator`](crate::BuildCoordinator) only sees builds of its own
//! process, while every `ess ci run` is a process of its own. A lease file
//! under `<state_dir>/changes/` names the build holding a change key. Each
//! holder polls its file; once a newer build that aborts previous builds has
//! taken the file over, the holder's token is cancelled and its pipeline
//! goes to cleanup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::obs;

/// How often a holder checks whether its lease was taken over.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    pid: u32,
    change_key: String,
    abort_previous: bool,
    acquired_at: DateTime<Utc>,
}

/// Lease on a change key, held for the duration of one build.
///
/// Dropping the lease stops watching and removes the file, unless a newer
/// build holds it by then.
#[derive(Debug)]
pub struct ChangeLease {
    path: PathBuf,
    owner: String,
    change_key: String,
    token: CancellationToken,
    watcher: JoinHandle<()>,
}

impl ChangeLease {
    /// Take over the lease of `change_key`.
    ///
    /// With `abort_previous`, the build holding the lease so far cancels
    /// itself within one poll interval. Without it, that build keeps running
    /// but stops watching.
    pub async fn acquire(state_dir: &Path, change_key: &str, abort_previous: bool) -> Result<Self> {
        let dir = state_dir.join("changes");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", lease_file_stem(change_key)));

        let record = LeaseRecord {
            owner: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            change_key: change_key.to_string(),
            abort_previous,
            acquired_at: Utc::now(),
        };

        if let Some(previous) = read_record(&path).await {
            if abort_previous {
                obs::emit_build_superseded(change_key, &previous.pid);
            } else {
                debug!(change_key = %change_key, previous_pid = previous.pid, "previous build left running");
            }
        }
        write_record(&path, &record).await?;

        let token = CancellationToken::new();
        let watcher = tokio::spawn(watch(path.clone(), record.owner.clone(), token.clone()));
        Ok(Self {
            path,
            owner: record.owner,
            change_key: record.change_key,
            token,
            watcher,
        })
    }

    /// Token cancelled when a newer build of the change aborts this one.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn change_key(&self) -> &str {
        &self.change_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ChangeLease {
    fn drop(&mut self) {
        self.watcher.abort();
        let still_held = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LeaseRecord>(&bytes).ok())
            .is_some_and(|record| record.owner == self.owner);
        if still_held {
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "failed to remove lease");
            }
        }
    }
}

/// File name of a change key's lease; change keys contain `/`.
fn lease_file_stem(change_key: &str) -> String {
    hex::encode(Sha256::digest(change_key.as_bytes()))
}

async fn read_record(path: &Path) -> Option<LeaseRecord> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read lease");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable lease");
            None
        }
    }
}

/// Write the lease through a temporary file so readers never see half of it.
async fn write_record(path: &Path, record: &LeaseRecord) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(record).map_err(std::io::Error::from)?;
    let tmp = path.with_extension(format!("{}.tmp", record.owner));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn watch(path: PathBuf, owner: String, token: CancellationToken) {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let Some(record) = read_record(&path).await else {
            continue;
        };
        if record.owner == owner {
            continue;
        }
        if record.abort_previous {
            info!(
                change_key = %record.change_key,
                newer_pid = record.pid,
                "newer build of this change started, aborting"
            );
            token.cancel();
        } else {
            debug!(change_key = %record.change_key, "lease taken over, build keeps running");
        }
        return;
    }
}
