//! Depot downloads: each unique chunk is fetched once and written to every
//! place it occurs.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::error::ContentError;
use crate::http::HttpClient;
use crate::manifest::{ChunkId, ChunkRecord, DepotKey, FileRecord};
use crate::pool::ContentPool;

pub const DEFAULT_PARALLELISM: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    pub path: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    pub chunk: ChunkRecord,
    pub locations: Vec<ChunkLocation>,
}

/// Unique chunks of a file list, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<PlannedChunk>,
    directories: Vec<String>,
    files: Vec<(String, u64)>,
}

impl ChunkPlan {
    pub fn from_files(files: &[FileRecord]) -> Self {
        let mut plan = Self::default();
        let mut index: HashMap<ChunkId, usize> = HashMap::new();

        for file in files {
            if file.is_directory() {
                plan.directories.push(file.path.clone());
                continue;
            }
            plan.files.push((file.path.clone(), file.size));

            for chunk in &file.chunks {
                let location = ChunkLocation { path: file.path.clone(), offset: chunk.offset };
                match index.get(&chunk.id) {
                    Some(&i) => plan.chunks[i].locations.push(location),
                    None => {
                        index.insert(chunk.id.clone(), plan.chunks.len());
                        plan.chunks.push(PlannedChunk {
                            chunk: chunk.clone(),
                            locations: vec![location],
                        });
                    }
                }
            }
        }
        plan
    }

    pub fn chunks(&self) -> &[PlannedChunk] {
        &self.chunks
    }

    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    /// Regular files with their declared sizes.
    pub fn files(&self) -> &[(String, u64)] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Decompressed bytes to fetch, counting each unique chunk once.
    pub fn download_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.chunk.original_size)).sum()
    }

    pub fn write_count(&self) -> usize {
        self.chunks.iter().map(|c| c.locations.len()).sum()
    }
}

/// Destination for downloaded chunk data.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn create_dir(&self, _path: &str) -> Result<(), ContentError> {
        Ok(())
    }

    /// Called once per regular file before any chunk is written to it.
    async fn create_file(&self, _path: &str, _size: u64) -> Result<(), ContentError> {
        Ok(())
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), ContentError>;
}

/// Writes a depot under a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins a manifest path onto the root, rejecting anything that would
    /// escape it.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ContentError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe || path.is_empty() {
            return Err(ContentError::UnsafePath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ChunkSink for DirectorySink {
    async fn create_dir(&self, path: &str) -> Result<(), ContentError> {
        tokio::fs::create_dir_all(self.resolve(path)?).await?;
        Ok(())
    }

    async fn create_file(&self, path: &str, size: u64) -> Result<(), ContentError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&target).await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), ContentError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&target)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// What to download and how to authorize it.
#[derive(Debug, Clone)]
pub struct DepotJob {
    pub depot_id: u32,
    pub app_ticket: Vec<u8>,
    pub depot_key: DepotKey,
    /// Chunks in flight at once.
    pub parallelism: usize,
}

impl DepotJob {
    pub fn new(depot_id: u32, app_ticket: Vec<u8>, depot_key: DepotKey) -> Self {
        Self { depot_id, app_ticket, depot_key, parallelism: DEFAULT_PARALLELISM }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub chunks_fetched: usize,
    pub chunk_writes: usize,
    pub bytes_fetched: u64,
}

/// Fetches every chunk of `plan` once and fans it out to `sink`.
pub async fn download_depot<H, S>(
    pool: &ContentPool<H>,
    job: &DepotJob,
    plan: &ChunkPlan,
    sink: Arc<S>,
) -> Result<DownloadStats, ContentError>
where
    H: HttpClient + ?Sized + 'static,
    S: ChunkSink + ?Sized + 'static,
{
    for dir in plan.directories() {
        sink.create_dir(dir).await?;
    }
    for (path, size) in plan.files() {
        sink.create_file(path, *size).await?;
    }

    let job = Arc::new(job.clone());
    let total = plan.download_bytes();
    let parallelism = job.parallelism.max(1);
    let mut stats = DownloadStats::default();
    let mut pending = plan.chunks().iter().cloned();
    let mut tasks = JoinSet::new();
    let mut failure: Option<ContentError> = None;

    loop {
        while failure.is_none() && tasks.len() < parallelism {
            let Some(planned) = pending.next() else {
                break;
            };
            let pool = pool.clone();
            let job = Arc::clone(&job);
            let sink = Arc::clone(&sink);
            tasks.spawn(async move { fetch_and_write(&pool, &job, planned, &*sink).await });
        }

        // After a failure, in-flight chunks finish but no new ones start.
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let outcome = match joined {
            Ok(result) => result,
            Err(err) => Err(ContentError::Io(std::io::Error::other(err))),
        };
        match outcome {
            Ok((bytes, writes)) => {
                stats.chunks_fetched += 1;
                stats.chunk_writes += writes;
                stats.bytes_fetched += bytes;
                log::info!("depot {}: {}/{} bytes", job.depot_id, stats.bytes_fetched, total);
            }
            Err(err) if failure.is_none() => {
                log::warn!("depot {}: stopping after chunk failure: {}", job.depot_id, err);
                failure = Some(err);
            }
            Err(err) => log::debug!("depot {}: further chunk failure: {}", job.depot_id, err),
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(stats),
    }
}

async fn fetch_and_write<H, S>(
    pool: &ContentPool<H>,
    job: &DepotJob,
    planned: PlannedChunk,
    sink: &S,
) -> Result<(u64, usize), ContentError>
where
    H: HttpClient + ?Sized + 'static,
    S: ChunkSink + ?Sized,
{
    let chunk = &planned.chunk;
    let data = pool.download_chunk(job.depot_id, &chunk.id, &job.app_ticket, &job.depot_key).await?;
    if data.len() as u64 != u64::from(chunk.original_size) {
        return Err(ContentError::ChunkSize {
            chunk: chunk.id.to_hex(),
            expected: u64::from(chunk.original_size),
            actual: data.len() as u64,
        });
    }

    for location in &planned.locations {
        sink.write_chunk(&location.path, location.offset, &data).await?;
    }
    Ok((data.len() as u64, planned.locations.len()))
}
