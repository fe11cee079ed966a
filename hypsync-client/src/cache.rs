//! On-disk memoization of one group's annotations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{TryStreamExt, pin_mut};
use serde_json::{Value, json};
use tokio::fs;
use tokio::time;
use tracing::{debug, info};

use crate::annotation::Annotation;
use crate::error::{Error, Result};
use crate::lock::{Claim, ClaimGuard, RefreshLock};
use crate::paginate::{AnnoFetcher, FetchOptions};

/// Rows per durable batch file during a refresh.
pub const BATCH_ROWS: usize = 2000;

/// Poll period while waiting out a peer's refresh.
const FOLLOW_POLL: Duration = Duration::from_secs(1);

/// Crash-safe local replica of one group's annotations.
///
/// Composes a file store (the cache path) with a remote source (the
/// fetcher); the group binding comes from the fetcher's client.
#[derive(Debug)]
pub struct Memoizer {
    path: PathBuf,
    fetcher: AnnoFetcher,
}

impl Memoizer {
    pub fn new(path: impl Into<PathBuf>, fetcher: AnnoFetcher) -> Self {
        Self {
            path: path.into(),
            fetcher,
        }
    }

    /// Cache file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Group this replica is bound to.
    pub fn group(&self) -> &str {
        self.fetcher.api().group()
    }

    /// The remote source behind this replica.
    pub fn fetcher(&self) -> &AnnoFetcher {
        &self.fetcher
    }

    fn check_group(&self, records: &[Annotation]) -> Result<()> {
        if let Some(first) = records.first()
            && first.group != self.group()
        {
            return Err(Error::GroupMismatch {
                expected: self.group().to_owned(),
                found: first.group.clone(),
            });
        }
        Ok(())
    }

    /// Reads the cache file.
    ///
    /// A missing or empty file loads as no records. Both the current
    /// two-element form and the legacy bare row list are accepted.
    pub async fn load(&self) -> Result<(Vec<Annotation>, Option<String>)> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("cache file {} does not exist", self.path.display());
                return Ok((Vec::new(), None));
            }
            Err(e) => return Err(e.into()),
        };
        let (records, last_sync_updated) = decode_cache(&bytes)?;
        self.check_group(&records)?;
        Ok((records, last_sync_updated))
    }

    /// Rewrites the cache file from the given records.
    ///
    /// On first write the file is created empty and chmodded to `0600`
    /// before any contents land in it.
    pub async fn persist(&self, records: &[Annotation]) -> Result<()> {
        if !self.path.exists() {
            fs::write(&self.path, b"").await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).await?;
            }
        }
        let last_sync_updated = records.last().map(|a| a.updated.as_str());
        let doc = json!([records, last_sync_updated]);
        fs::write(&self.path, serde_json::to_vec(&doc)?).await?;
        debug!(
            "memoized {} records to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Brings `records` up to date with the server and persists the result.
    ///
    /// `since` is the caller's snapshot cursor; when absent it is derived
    /// from the records themselves. Returns the records that are new or
    /// changed relative to that cursor.
    pub async fn refresh(
        &self,
        records: &mut Vec<Annotation>,
        since: Option<String>,
    ) -> Result<Vec<Annotation>> {
        self.refresh_with(records, since, |_| {}).await
    }

    /// [`Memoizer::refresh`] with a callback applied to each new record.
    pub async fn refresh_with(
        &self,
        records: &mut Vec<Annotation>,
        since: Option<String>,
        on_new: impl FnMut(&Annotation),
    ) -> Result<Vec<Annotation>> {
        self.check_group(records)?;
        let since = since.or_else(|| records.last().map(|a| a.updated.clone()));
        let lock = RefreshLock::for_cache_file(&self.path)?;
        match lock.try_claim()? {
            Claim::Claimed(guard) => self.drive_refresh(records, since, guard, on_new).await,
            Claim::Busy => self.follow(&lock, records, since).await,
        }
    }

    /// Refreshes from an explicit resume cursor.
    ///
    /// Only valid with an empty record list: combining a pre-loaded cache
    /// with a foreign cursor would leave holes in the replica.
    pub async fn refresh_after(
        &self,
        records: &mut Vec<Annotation>,
        search_after: String,
    ) -> Result<Vec<Annotation>> {
        if !records.is_empty() {
            return Err(Error::Usage(
                "explicit search_after together with existing records".to_owned(),
            ));
        }
        self.refresh_with(records, Some(search_after), |_| {}).await
    }

    /// Loads the replica and refreshes it in one step.
    pub async fn get_annos(&self) -> Result<Vec<Annotation>> {
        let (mut records, last_sync_updated) = self.load().await?;
        self.refresh(&mut records, last_sync_updated).await?;
        Ok(records)
    }

    async fn drive_refresh(
        &self,
        records: &mut Vec<Annotation>,
        since: Option<String>,
        guard: ClaimGuard,
        mut on_new: impl FnMut(&Annotation),
    ) -> Result<Vec<Annotation>> {
        // A crashed predecessor's batches count as progress; resume past
        // whichever cursor is newest.
        let resume = std::cmp::max(since.clone(), guard.resume_cursor()?);
        if resume > since {
            info!(resume = resume.as_deref(), "resuming a predecessor's refresh");
        }

        let stream = self.fetcher.rows(FetchOptions {
            search_after: resume,
            ..FetchOptions::default()
        });
        pin_mut!(stream);
        let mut batch = Vec::new();
        while let Some(row) = stream.try_next().await? {
            batch.push(row);
            if batch.len() >= BATCH_ROWS {
                guard.write_batch(&batch)?;
                batch.clear();
            }
        }
        guard.write_batch(&batch)?;

        let incoming = guard
            .batch_rows()?
            .into_iter()
            .map(Annotation::from_row)
            .collect::<Result<Vec<_>>>()?;
        merge_records(records, incoming.clone());
        let new: Vec<Annotation> = match &since {
            Some(since) => incoming
                .into_iter()
                .filter(|a| a.updated.as_str() > since.as_str())
                .collect(),
            None => incoming,
        };
        for anno in &new {
            on_new(anno);
        }

        self.persist(records).await?;
        guard.complete()?;
        info!("refresh added or updated {} records", new.len());
        Ok(new)
    }

    async fn follow(
        &self,
        lock: &RefreshLock,
        records: &mut Vec<Annotation>,
        since: Option<String>,
    ) -> Result<Vec<Annotation>> {
        info!("another process is refreshing this cache, waiting");
        while lock.in_progress() {
            time::sleep(FOLLOW_POLL).await;
        }
        let (fresh, _) = self.load().await?;
        let new = fresh
            .iter()
            .filter(|a| match &since {
                Some(since) => a.updated.as_str() > since.as_str(),
                None => true,
            })
            .cloned()
            .collect();
        *records = fresh;
        Ok(new)
    }

    /// Appends one record and persists.
    pub async fn add(&self, anno: Annotation, records: &mut Vec<Annotation>) -> Result<()> {
        records.push(anno);
        self.persist(records).await
    }

    /// Replaces the record sharing the incoming id and persists.
    pub async fn update(&self, anno: Annotation, records: &mut Vec<Annotation>) -> Result<()> {
        records.retain(|a| a.id != anno.id);
        records.push(anno);
        self.persist(records).await
    }

    /// Removes the record with the given id and persists.
    pub async fn delete(&self, id: &str, records: &mut Vec<Annotation>) -> Result<()> {
        let before = records.len();
        records.retain(|a| a.id != id);
        if records.len() == before {
            return Err(Error::Usage(format!("no annotation with id {id:?}")));
        }
        self.persist(records).await
    }
}

/// Merges incoming records into the list: a record sharing an existing id
/// replaces it, everything is re-sorted by `updated`.
///
/// Two revisions carrying the same `updated` stamp would defeat the dedup;
/// the server's monotone timestamps are relied on here.
pub fn merge_records(records: &mut Vec<Annotation>, incoming: Vec<Annotation>) {
    for anno in incoming {
        records.retain(|a| a.id != anno.id);
        records.push(anno);
    }
    records.sort_by(|a, b| a.updated.cmp(&b.updated));
}

fn decode_cache(bytes: &[u8]) -> Result<(Vec<Annotation>, Option<String>)> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok((Vec::new(), None));
    }
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::Decode(format!("cache file is not JSON: {e}")))?;
    let Value::Array(items) = value else {
        return Err(Error::Decode("cache file is not a JSON array".to_owned()));
    };
    if items.is_empty() {
        return Ok((Vec::new(), None));
    }

    let is_current_form = items.len() == 2
        && items[0].is_array()
        && (items[1].is_string() || items[1].is_null());
    let (rows, last_sync_updated) = if is_current_form {
        let mut items = items;
        let last_sync_updated = match items.pop() {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let Some(Value::Array(rows)) = items.pop() else {
            return Err(Error::Decode("cache file rows are not a list".to_owned()));
        };
        (rows, last_sync_updated)
    } else {
        // Legacy shape: a bare list of rows.
        (items, None)
    };

    let records = rows
        .into_iter()
        .map(Annotation::from_row)
        .collect::<Result<Vec<_>>>()?;
    let last_sync_updated =
        last_sync_updated.or_else(|| records.last().map(|a| a.updated.clone()));
    Ok((records, last_sync_updated))
}
