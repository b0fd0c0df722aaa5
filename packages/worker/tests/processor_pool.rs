#![allow(clippy::disallowed_methods)]

use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker::{MemoryBroker, MessageBroker, QueueStats};
use intake_core::OutcomePolicy;
use job_queue::{BrokerJobQueue, FileJobQueue, JobQueue, ReportingConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{ExecError, ExecFuture, ExecRequest, Executor, ProcessorPool, WorkerError};

const MIB: usize = 1024 * 1024;

const QUEUE: &str = "builds.linux";

/// What a fake executor does with each job.
#[derive(Clone)]
enum Script {
    /// Print the lines, then exit with the code.
    Exit(Vec<&'static str>, i32),
    /// Print nothing until aborted.
    Hang,
    /// Print 64 KiB chunks forever.
    Flood,
    /// Print a line every interval until aborted.
    Ticking(Duration),
    /// Fail to create the build environment.
    NoVm,
    /// Sleep, then pass.
    Slow(Duration),
}

struct FakeExecutor {
    script: Script,
    runs: AtomicUsize,
}

impl FakeExecutor {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            runs: AtomicUsize::new(0),
        })
    }
}

impl Executor for FakeExecutor {
    fn run(&self, request: ExecRequest) -> ExecFuture<'_> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let script = self.script.clone();
        Box::pin(async move {
            match script {
                Script::Exit(lines, code) => {
                    for line in lines {
                        let _ = request.output.send(line.to_string()).await;
                    }
                    Ok(code)
                }
                Script::Hang => {
                    request.abort.cancelled().await;
                    Err(ExecError::Aborted)
                }
                Script::Flood => loop {
                    tokio::select! {
                        _ = request.abort.cancelled() => return Err(ExecError::Aborted),
                        sent = request.output.send("x".repeat(64 * 1024)) => {
                            if sent.is_err() {
                                return Err(ExecError::Aborted);
                            }
                        }
                    }
                },
                Script::Ticking(interval) => loop {
                    tokio::select! {
                        _ = request.abort.cancelled() => return Err(ExecError::Aborted),
                        _ = tokio::time::sleep(interval) => {
                            let _ = request.output.send(".\n".to_string()).await;
                        }
                    }
                },
                Script::NoVm => Err(ExecError::VmCreation("no capacity".to_string())),
                Script::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    let _ = request.output.send("done\n".to_string()).await;
                    Ok(0)
                }
            }
        })
    }
}

/// Fails to create a VM on the first attempt of the listed jobs, passes otherwise.
struct FlakyExecutor {
    flaky: Vec<u64>,
    attempts: Mutex<HashMap<u64, usize>>,
}

impl FlakyExecutor {
    fn attempts(&self, id: u64) -> usize {
        self.attempts.lock().unwrap().get(&id).copied().unwrap_or(0)
    }
}

impl Executor for FlakyExecutor {
    fn run(&self, request: ExecRequest) -> ExecFuture<'_> {
        let id = request.payload.id;
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let attempt = attempts.entry(id).or_default();
            *attempt += 1;
            *attempt
        };
        let fail = attempt == 1 && self.flaky.contains(&id);
        Box::pin(async move {
            if fail {
                return Err(ExecError::VmCreation("no capacity".to_string()));
            }
            let _ = request.output.send(format!("job {id}\n")).await;
            Ok(0)
        })
    }
}

type PoolHandle = JoinHandle<Result<(), WorkerError>>;

fn spawn(
    pool: ProcessorPool,
    queue: Arc<dyn JobQueue>,
    executor: Arc<dyn Executor>,
) -> (CancellationToken, PoolHandle) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { pool.run(queue.as_ref(), executor, cancel).await }
    });
    (cancel, handle)
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    queue: Arc<FileJobQueue>,
}

impl Harness {
    fn new() -> Result<Self, Box<dyn Error>> {
        Self::polling(Duration::from_millis(20))
    }

    fn polling(interval: Duration) -> Result<Self, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join(QUEUE);
        let queue = FileJobQueue::new(dir.path(), QUEUE)?.with_poll_interval(interval);
        Ok(Self {
            _dir: dir,
            root,
            queue: Arc::new(queue),
        })
    }

    fn submit(&self, id: u64) -> Result<(), Box<dyn Error>> {
        self.submit_json(id, &format!(r#"{{"id":{id}}}"#))
    }

    fn submit_json(&self, id: u64, json: &str) -> Result<(), Box<dyn Error>> {
        std::fs::write(self.root.join(format!("created/{id}.json")), json)?;
        Ok(())
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn log(&self, id: u64) -> String {
        std::fs::read_to_string(self.path(&format!("log/{id}.log"))).unwrap_or_default()
    }

    fn spawn(
        &self,
        pool: ProcessorPool,
        executor: Arc<dyn Executor>,
    ) -> (CancellationToken, PoolHandle) {
        spawn(pool, self.queue.clone(), executor)
    }
}

fn policy() -> OutcomePolicy {
    OutcomePolicy {
        hard_timeout: Duration::from_secs(30 * 60),
        log_timeout: Duration::from_secs(30 * 60),
        max_log_length: MIB as u64,
    }
}

/// Poll `check` until it holds, giving up once `budget` has passed on the
/// runtime clock.
async fn wait_for(
    budget: Duration,
    mut check: impl FnMut() -> bool,
) -> Result<(), Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + budget;
    let step = budget / 250;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(step).await;
    }
    if check() {
        return Ok(());
    }
    Err(format!("condition not reached within {budget:?}").into())
}

const SHORT: Duration = Duration::from_secs(5);

fn exists(path: &Path) -> bool {
    path.exists()
}

#[tokio::test]
async fn passing_job_is_finished_with_its_log() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new()?;
    harness.submit(1)?;

    let executor = FakeExecutor::new(Script::Exit(vec!["$ make\n", "ok\n"], 0));
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy()), executor);

    let finished = harness.path("finished/1.json");
    wait_for(SHORT, || exists(&finished)).await?;
    assert_eq!(harness.log(1), "$ make\nok\n");
    assert!(!harness.path("created/1.json").exists());

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn failing_exit_code_still_finishes() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new()?;
    harness.submit(2)?;

    let executor = FakeExecutor::new(Script::Exit(vec!["boom\n"], 1));
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy()), executor);

    let finished = harness.path("finished/2.json");
    wait_for(SHORT, || exists(&finished)).await?;
    assert_eq!(harness.log(2), "boom\n");

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_job_is_terminated() -> Result<(), Box<dyn Error>> {
    let harness = Harness::polling(Duration::from_secs(5))?;
    harness.submit(3)?;

    let policy = OutcomePolicy {
        hard_timeout: Duration::from_secs(20 * 60),
        log_timeout: Duration::from_secs(10 * 60),
        ..policy()
    };
    let executor = FakeExecutor::new(Script::Hang);
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy), executor);

    let finished = harness.path("finished/3.json");
    wait_for(Duration::from_secs(30 * 60), || exists(&finished)).await?;
    let log = harness.log(3);
    assert!(
        log.contains("No output has been received in the last 10 minutes"),
        "{log}"
    );
    assert!(log.contains("The build has been terminated."));

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn wall_clock_limit_stops_chatty_job() -> Result<(), Box<dyn Error>> {
    let harness = Harness::polling(Duration::from_secs(5))?;
    harness.submit(4)?;

    let policy = OutcomePolicy {
        hard_timeout: Duration::from_secs(20 * 60),
        log_timeout: Duration::from_secs(10 * 60),
        ..policy()
    };
    let executor = FakeExecutor::new(Script::Ticking(Duration::from_secs(60)));
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy), executor);

    let finished = harness.path("finished/4.json");
    wait_for(Duration::from_secs(40 * 60), || exists(&finished)).await?;
    let log = harness.log(4);
    assert!(log.starts_with(".\n"));
    assert!(log.contains("We're sorry but your test run exceeded 20 minutes."), "{log}");
    assert!(!log.contains("No output has been received"));

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn job_timeout_is_reported_in_whole_minutes() -> Result<(), Box<dyn Error>> {
    let harness = Harness::polling(Duration::from_secs(5))?;
    harness.submit_json(12, r#"{"id":12,"timeouts":{"hard_limit":90}}"#)?;

    let executor = FakeExecutor::new(Script::Ticking(Duration::from_secs(7)));
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy()), executor);

    let finished = harness.path("finished/12.json");
    wait_for(Duration::from_secs(10 * 60), || exists(&finished)).await?;
    let log = harness.log(12);
    assert!(log.contains("exceeded 2 minutes"), "{log}");
    assert_eq!(log.lines().filter(|line| *line == ".").count(), 17);

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn oversized_log_is_cut_off() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new()?;
    harness.submit(5)?;

    let executor = FakeExecutor::new(Script::Flood);
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy()), executor);

    let finished = harness.path("finished/5.json");
    wait_for(SHORT, || exists(&finished)).await?;
    let log = harness.log(5);
    let (output, message) = log.split_at(MIB);
    assert!(output.bytes().all(|b| b == b'x'));
    assert!(message.starts_with("\n\nThe log length has exceeded the limit of 1 MiB"));

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn vm_creation_failure_requeues() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new()?;
    harness.submit(6)?;

    let executor = FakeExecutor::new(Script::NoVm);
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy()), executor.clone());

    wait_for(SHORT, || executor.runs.load(Ordering::SeqCst) >= 2).await?;
    cancel.cancel();
    handle.await??;

    assert!(harness.path("created/6.json").exists());
    assert!(!harness.path("finished/6.json").exists());
    assert!(harness.log(6).contains("there was an error starting a new VM"));
    Ok(())
}

#[tokio::test]
async fn cancel_request_stops_running_job() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new()?;
    harness.submit(7)?;

    let pool = ProcessorPool::new(1, policy());
    let cancellations = pool.cancellations();
    let (cancel, handle) = harness.spawn(pool, FakeExecutor::new(Script::Hang));

    wait_for(SHORT, || cancellations.running() == vec![7]).await?;
    assert!(cancellations.cancel(7));

    let finished = harness.path("finished/7.json");
    wait_for(SHORT, || exists(&finished)).await?;
    assert!(harness.log(7).contains("Done: Job Cancelled"));
    assert!(cancellations.running().is_empty());

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn shutdown_lets_running_job_finish() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new()?;
    harness.submit(8)?;

    let executor = FakeExecutor::new(Script::Slow(Duration::from_millis(200)));
    let (cancel, handle) = harness.spawn(ProcessorPool::new(1, policy()), executor.clone());

    wait_for(SHORT, || executor.runs.load(Ordering::SeqCst) == 1).await?;
    cancel.cancel();
    handle.await??;

    assert!(harness.path("finished/8.json").exists());
    assert_eq!(harness.log(8), "done\n");
    Ok(())
}

#[tokio::test]
async fn pool_spreads_jobs_over_processors() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new()?;
    for id in 10..16 {
        harness.submit(id)?;
    }

    let executor = FakeExecutor::new(Script::Slow(Duration::from_millis(50)));
    let (cancel, handle) = harness.spawn(ProcessorPool::new(3, policy()), executor.clone());

    let all_finished = || (10..16).all(|id| exists(&harness.path(&format!("finished/{id}.json"))));
    wait_for(SHORT, all_finished).await?;
    assert_eq!(executor.runs.load(Ordering::SeqCst), 6);

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn broker_jobs_are_acked_or_redelivered() -> Result<(), Box<dyn Error>> {
    let broker = Arc::new(MemoryBroker::start().await?);
    let queue =
        BrokerJobQueue::new(broker.clone(), QUEUE, 2, ReportingConfig::default()).await?;
    for id in [1, 2] {
        let body = format!(r#"{{"id":{id}}}"#).into_bytes();
        broker.publish("", QUEUE, "application/json", body).await?;
    }

    let executor = Arc::new(FlakyExecutor {
        flaky: vec![2],
        attempts: Mutex::default(),
    });
    let pool = ProcessorPool::new(2, policy());
    let (cancel, handle) = spawn(pool, Arc::new(queue), executor.clone());

    let mut drained = false;
    for _ in 0..250 {
        if executor.attempts(2) == 2
            && broker.queue_stats(QUEUE).await? == Some(QueueStats::default())
        {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained, "jobs were not settled");
    assert_eq!(executor.attempts(1), 1);

    // received, started and a final state for each of the three runs
    assert_eq!(
        broker.queue_stats("reporting.jobs.builds").await?,
        Some(QueueStats { ready: 9, unacked: 0 })
    );

    cancel.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn broker_loss_fails_the_pool() -> Result<(), Box<dyn Error>> {
    let broker = Arc::new(MemoryBroker::start().await?);
    let queue =
        BrokerJobQueue::new(broker.clone(), QUEUE, 1, ReportingConfig::default()).await?;

    let executor = FakeExecutor::new(Script::Exit(vec![], 0));
    let (_cancel, handle) = spawn(ProcessorPool::new(2, policy()), Arc::new(queue), executor);

    broker.close().await?;
    let result = tokio::time::timeout(SHORT, handle).await??;
    assert!(matches!(result, Err(WorkerError::Queue(_))), "{result:?}");
    Ok(())
}
