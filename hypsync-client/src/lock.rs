//! Cross-process locking around cache refreshes.
//!
//! A refresh in progress is signalled by a lock folder next to the cache
//! file, with a sibling `lock-pid` file naming the holder. Batch files
//! written into the folder are the unit of durable progress: a successor
//! taking over a crashed refresh resumes from the newest batch instead of
//! refetching.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Name of the holder file, written next to the lock folder.
const PID_FILE: &str = "lock-pid";

/// Lock state for one cache file.
#[derive(Clone, Debug)]
pub struct RefreshLock {
    dir: PathBuf,
    pid_file: PathBuf,
}

/// Outcome of a claim attempt.
pub enum Claim {
    /// The caller holds the lock and drives the refresh.
    Claimed(ClaimGuard),
    /// A live peer holds the lock; the caller should wait it out.
    Busy,
}

enum Holder {
    Live,
    Dead,
    Missing,
}

impl RefreshLock {
    /// Lock paths for a cache file: `.lock-{basename}` plus the sibling
    /// holder file.
    pub fn for_cache_file(cache: &Path) -> Result<Self> {
        let name = cache
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Usage(format!("bad cache path {}", cache.display())))?;
        Ok(Self {
            dir: cache.with_file_name(format!(".lock-{name}")),
            pid_file: cache.with_file_name(PID_FILE),
        })
    }

    /// Whether a refresh is currently marked in progress.
    pub fn in_progress(&self) -> bool {
        self.dir.exists()
    }

    /// Tries to take the lock, repairing after dead holders.
    ///
    /// A holder file naming a dead process, an unparseable holder file, or a
    /// folder without one all count as abandoned; the caller inherits the
    /// folder and any batch files in it.
    pub fn try_claim(&self) -> Result<Claim> {
        match fs::create_dir(&self.dir) {
            Ok(()) => {
                self.write_pid_file()?;
                Ok(Claim::Claimed(ClaimGuard::new(self.clone())))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.holder()? {
                Holder::Live => Ok(Claim::Busy),
                Holder::Dead | Holder::Missing => {
                    if let Err(e) = fs::remove_file(&self.pid_file)
                        && e.kind() != ErrorKind::NotFound
                    {
                        return Err(e.into());
                    }
                    info!(
                        "taking over abandoned refresh lock at {}",
                        self.dir.display()
                    );
                    self.write_pid_file()?;
                    Ok(Claim::Claimed(ClaimGuard::new(self.clone())))
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let start_time = process_start_time(pid).unwrap_or(0);
        let staged = self.pid_file.with_extension("tmp");
        fs::write(&staged, format!("{pid},{start_time}"))?;
        fs::rename(&staged, &self.pid_file)?;
        Ok(())
    }

    fn holder(&self) -> Result<Holder> {
        let text = match fs::read_to_string(&self.pid_file) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Missing),
            Err(e) => return Err(e.into()),
        };
        let Some((pid, start_time)) = parse_pid_stamp(text.trim()) else {
            warn!("unparseable holder file {}: {text:?}", self.pid_file.display());
            return Ok(Holder::Dead);
        };
        // A pid alone is unreliable because of reuse; the start time must
        // match too.
        match process_start_time(pid) {
            Some(observed) if observed == start_time => Ok(Holder::Live),
            _ => Ok(Holder::Dead),
        }
    }
}

/// Held lock over one refresh. Dropping without [`ClaimGuard::complete`]
/// releases the holder file but keeps the batch files for a successor.
pub struct ClaimGuard {
    lock: RefreshLock,
    completed: bool,
}

impl ClaimGuard {
    fn new(lock: RefreshLock) -> Self {
        Self {
            lock,
            completed: false,
        }
    }

    /// Greatest batch cursor left behind by this or a previous holder.
    ///
    /// Batch files are named by their last row's `updated`, so the greatest
    /// name in lexicographic order is the resume point.
    pub fn resume_cursor(&self) -> Result<Option<String>> {
        Ok(self.batch_names()?.into_iter().next_back())
    }

    /// Writes one batch of rows, named by the last row's cursor.
    pub fn write_batch(&self, rows: &[Value]) -> Result<()> {
        let Some(last) = rows.last() else {
            return Ok(());
        };
        let stamp = last
            .get("updated")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Decode("batch row missing updated".to_owned()))?;
        fs::write(self.lock.dir.join(stamp), serde_json::to_vec(rows)?)?;
        Ok(())
    }

    /// All batched rows, in batch-name order.
    pub fn batch_rows(&self) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        for name in self.batch_names()? {
            let bytes = fs::read(self.lock.dir.join(&name))?;
            let batch: Vec<Value> = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Decode(format!("batch file {name:?}: {e}")))?;
            rows.extend(batch);
        }
        Ok(rows)
    }

    fn batch_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.lock.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Removes the lock folder and holder file after a persisted refresh.
    pub fn complete(mut self) -> Result<()> {
        fs::remove_dir_all(&self.lock.dir)?;
        self.completed = true;
        if let Err(e) = fs::remove_file(&self.lock.pid_file)
            && e.kind() != ErrorKind::NotFound
        {
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.completed {
            let _ = fs::remove_file(&self.lock.pid_file);
        }
    }
}

fn parse_pid_stamp(text: &str) -> Option<(u32, u64)> {
    let (pid, start_time) = text.split_once(',')?;
    Some((pid.trim().parse().ok()?, start_time.trim().parse().ok()?))
}

fn process_start_time(pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.start_time())
}
