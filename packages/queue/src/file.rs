//! Directory backed job queue.
//!
//! Layout under `<base_dir>/<queue>/`:
//!
//! - `created/`  - producers drop `<name>.json` descriptors here
//! - `received/` - taken by a worker
//! - `started/`  - executing
//! - `finished/` - done
//! - `log/`      - build output as `<name>.log`, created on first write
//!
//! Every lifecycle step is a rename of the descriptor into the next
//! directory, so a crash leaves each job in exactly one place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use intake_core::{
    FinishState, Job, JobDescriptor, JobError, JobFuture, JobPayload, JobState, RawPayload,
    StartAttributes,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::{JobQueue, JobStream, QueueError, QueueFuture};

/// How often `created/` is listed.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DESCRIPTOR_SUFFIX: &str = ".json";
const LOG_SUFFIX: &str = ".log";

/// Descriptor names handed to a consumer and still sitting in `created/`.
///
/// Keeps one process from emitting the same descriptor twice while the
/// consumer has not yet moved it to `received/`.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    fn insert(&self, name: &str) {
        self.lock().insert(name.to_string());
    }

    fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Forget names that are no longer in `created/`.
    fn retain_listed(&self, listed: &HashSet<String>) {
        self.lock().retain(|name| listed.contains(name));
    }
}

/// A job queue that polls a directory for descriptors.
#[derive(Debug, Clone)]
pub struct FileJobQueue {
    queue: String,
    base_dir: PathBuf,
    created_dir: PathBuf,
    received_dir: PathBuf,
    started_dir: PathBuf,
    finished_dir: PathBuf,
    log_dir: PathBuf,
    poll_interval: Duration,
    in_flight: InFlight,
}

impl FileJobQueue {
    /// Create a queue rooted at `<base_dir>/<queue>`.
    ///
    /// Fails if `base_dir` does not exist or is not writable. The state
    /// directories are created; `log/` is created on first use.
    pub fn new(base_dir: impl AsRef<Path>, queue: impl Into<String>) -> Result<Self, QueueError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let queue = queue.into();

        let metadata = std::fs::metadata(&base_dir).map_err(|source| QueueError::BaseDir {
            path: base_dir.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(QueueError::NotADirectory(base_dir));
        }
        ensure_writable(&base_dir)?;

        let queue_dir = base_dir.join(&queue);
        let created_dir = queue_dir.join("created");
        let received_dir = queue_dir.join("received");
        let started_dir = queue_dir.join("started");
        let finished_dir = queue_dir.join("finished");
        let log_dir = queue_dir.join("log");

        for dir in [&created_dir, &received_dir, &started_dir, &finished_dir] {
            std::fs::create_dir_all(dir)?;
        }

        tracing::info!(queue = %queue, base_dir = ?base_dir, "Opened file job queue");

        Ok(Self {
            queue,
            base_dir,
            created_dir,
            received_dir,
            started_dir,
            finished_dir,
            log_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            in_flight: InFlight::default(),
        })
    }

    /// Set how often `created/` is polled.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory producers write descriptors into.
    pub fn created_dir(&self) -> &Path {
        &self.created_dir
    }

    /// Like [`JobQueue::jobs`], but yields the concrete job type.
    pub fn file_jobs(&self, cancel: CancellationToken) -> mpsc::Receiver<FileJob> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.clone().poll(tx, cancel, |job| job));
        rx
    }

    async fn poll<T: Send + 'static>(
        self,
        tx: mpsc::Sender<T>,
        cancel: CancellationToken,
        wrap: fn(FileJob) -> T,
    ) {
        tracing::debug!(queue = %self.queue, "Polling for jobs in {:?}", self.created_dir);

        loop {
            if !self.tick(&tx, &cancel, wrap).await {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::debug!(queue = %self.queue, "Stopped polling for jobs");
    }

    /// List `created/` once and emit every new descriptor.
    ///
    /// Returns `false` once the loop should stop.
    async fn tick<T>(
        &self,
        tx: &mpsc::Sender<T>,
        cancel: &CancellationToken,
        wrap: fn(FileJob) -> T,
    ) -> bool {
        let mut entries = match fs::read_dir(&self.created_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    dir = ?self.created_dir,
                    "input directory read error"
                );
                return true;
            }
        };

        let mut listed = HashSet::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        dir = ?self.created_dir,
                        "input directory read error"
                    );
                    break;
                }
            };

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if is_dir || !name.ends_with(DESCRIPTOR_SUFFIX) {
                continue;
            }

            listed.insert(name.clone());
            if self.in_flight.contains(&name) {
                continue;
            }

            let job = match self.load(&name).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(error = %e, file = %name, "job descriptor load error");
                    continue;
                }
            };

            tracing::debug!(
                queue = %self.queue,
                file = %name,
                id = job.payload().id,
                "Discovered job"
            );
            self.in_flight.insert(&name);

            let sent = tokio::select! {
                _ = cancel.cancelled() => false,
                sent = tx.send(wrap(job)) => sent.is_ok(),
            };
            if !sent {
                self.in_flight.remove(&name);
                return false;
            }
        }

        self.in_flight.retain_listed(&listed);
        true
    }

    async fn load(&self, name: &str) -> Result<FileJob, JobError> {
        let created_file = self.created_dir.join(name);
        let bytes = fs::read(&created_file).await?;
        let descriptor = JobDescriptor::parse(&bytes)?;

        let stem = name.strip_suffix(DESCRIPTOR_SUFFIX).unwrap_or(name);

        Ok(FileJob {
            name: name.to_string(),
            descriptor,
            state: JobState::Created,
            created_file,
            received_file: self.received_dir.join(name),
            started_file: self.started_dir.join(name),
            finished_file: self.finished_dir.join(name),
            log_file: self.log_dir.join(format!("{stem}{LOG_SUFFIX}")),
            in_flight: self.in_flight.clone(),
        })
    }
}

impl JobQueue for FileJobQueue {
    fn jobs(&self, cancel: CancellationToken) -> Result<JobStream, QueueError> {
        let (tx, rx) = mpsc::channel(1);
        let boxed = |job: FileJob| Box::new(job) as Box<dyn Job>;
        tokio::spawn(self.clone().poll(tx, cancel, boxed));
        Ok(JobStream::new(rx))
    }

    fn cleanup(&self) -> QueueFuture<'_, ()> {
        // Nothing to release; the directories are the durable state.
        Box::pin(async { Ok(()) })
    }
}

fn ensure_writable(base_dir: &Path) -> Result<(), QueueError> {
    let marker = base_dir.join(format!(".write-test-{}", Ulid::new()));
    let to_error = |source| QueueError::BaseDir {
        path: base_dir.to_path_buf(),
        source,
    };

    std::fs::File::create(&marker).map_err(to_error)?;
    std::fs::remove_file(&marker).map_err(to_error)?;
    Ok(())
}

/// A job read from a [`FileJobQueue`].
#[derive(Debug)]
pub struct FileJob {
    name: String,
    descriptor: JobDescriptor,
    state: JobState,
    created_file: PathBuf,
    received_file: PathBuf,
    started_file: PathBuf,
    finished_file: PathBuf,
    log_file: PathBuf,
    in_flight: InFlight,
}

impl FileJob {
    /// Descriptor file name, e.g. `42.json`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_file(&self) -> &Path {
        &self.created_file
    }

    pub fn received_file(&self) -> &Path {
        &self.received_file
    }

    pub fn started_file(&self) -> &Path {
        &self.started_file
    }

    pub fn finished_file(&self) -> &Path {
        &self.finished_file
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Path the descriptor currently lives at.
    fn current_file(&self) -> &Path {
        match self.state {
            JobState::Created | JobState::Requeued => &self.created_file,
            JobState::Received => &self.received_file,
            JobState::Started => &self.started_file,
            JobState::Finished { .. } => &self.finished_file,
        }
    }

    async fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        let next = self.state.advance(next)?;
        let from = self.current_file().to_path_buf();
        let to = match next {
            JobState::Received => &self.received_file,
            JobState::Started => &self.started_file,
            JobState::Finished { .. } => &self.finished_file,
            JobState::Created | JobState::Requeued => &self.created_file,
        };

        fs::rename(&from, to).await?;
        tracing::debug!(file = %self.name, from = %self.state, to = %next, "Moved job");
        self.state = next;
        Ok(())
    }
}

impl Job for FileJob {
    fn payload(&self) -> &JobPayload {
        &self.descriptor.payload
    }

    fn start_attributes(&self) -> &StartAttributes {
        &self.descriptor.start_attributes
    }

    fn raw_payload(&self) -> &RawPayload {
        &self.descriptor.raw
    }

    fn state(&self) -> JobState {
        self.state
    }

    fn received(&mut self) -> JobFuture<'_, ()> {
        Box::pin(self.transition(JobState::Received))
    }

    fn started(&mut self) -> JobFuture<'_, ()> {
        Box::pin(self.transition(JobState::Started))
    }

    fn finish(&mut self, result: FinishState) -> JobFuture<'_, ()> {
        Box::pin(async move {
            self.transition(JobState::Finished { result }).await?;
            tracing::info!(
                file = %self.name,
                id = self.payload().id,
                result = %result,
                "Finished job"
            );
            Ok(())
        })
    }

    fn requeue(&mut self) -> JobFuture<'_, ()> {
        Box::pin(async move {
            self.transition(JobState::Requeued).await?;
            self.in_flight.remove(&self.name);
            tracing::info!(file = %self.name, id = self.payload().id, "Requeued job");
            Ok(())
        })
    }

    fn write_log<'a>(&'a mut self, output: &'a str) -> JobFuture<'a, ()> {
        Box::pin(async move {
            if let Some(log_dir) = self.log_file.parent() {
                fs::create_dir_all(log_dir).await?;
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_file)
                .await?;
            file.write_all(output.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

impl Drop for FileJob {
    fn drop(&mut self) {
        // Emitted but never taken, e.g. left in the stream buffer.
        if self.state == JobState::Created {
            self.in_flight.remove(&self.name);
        }
    }
}
