//! Worker client: pulls assignments, runs them, reports transcripts.
//!
//! Two long-lived tasks per worker:
//! - **Heartbeat handler**: subscribes to the commander's heartbeat
//!   broadcast, answers each beat with this worker's public IP, and shuts
//!   the puller down when the commander reports the run is done.
//! - **Pull loop**: receives one [`TestSpec`](crate::fabric::Message)
//!   at a time, downloads the submission plus the shared harness files,
//!   executes the command sequence, and sends the base64 transcript back.
//!
//! Commands run without sandboxing; one worker per machine (or per
//! dedicated directory) keeps assignments from trampling each other.

pub mod executor;
pub mod ident;

pub use executor::{TestExecutor, TestOutcome};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, OnceCell};

use crate::config::WorkerConfig;
use crate::error::{GridError, Result};
use crate::fabric::{Message, Puller, Requester, Subscriber, COMMON_KEY};
use crate::files;

pub struct WorkerClient {
    config: WorkerConfig,
    subscriber: Subscriber,
    sub_rx: mpsc::Receiver<Message>,
    puller: Arc<Puller>,
    pull_rx: mpsc::Receiver<Message>,
    file_client: Requester,
    result_client: Requester,
    heartbeat_client: Arc<Requester>,
    finished: Arc<AtomicBool>,
    executor: TestExecutor,
}

impl WorkerClient {
    /// Connect all five sockets to the commander.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        let (subscriber, sub_rx) = Subscriber::connect(&config.heartbeat_addr()).await?;
        let (puller, pull_rx) = Puller::connect(&config.work_addr()).await?;
        let file_client = Requester::connect(&config.file_addr()).await?;
        let result_client = Requester::connect(&config.result_addr()).await?;
        let heartbeat_client = Requester::connect(&config.heartbeat_resp_addr()).await?;

        tracing::info!(
            commander = %config.remote_ip,
            base_port = config.remote_port,
            "Connected to commander"
        );

        Ok(Self {
            config,
            subscriber,
            sub_rx,
            puller: Arc::new(puller),
            pull_rx,
            file_client,
            result_client,
            heartbeat_client: Arc::new(heartbeat_client),
            finished: Arc::new(AtomicBool::new(false)),
            executor: TestExecutor::new(),
        })
    }

    /// Process assignments until the commander reports done (or goes
    /// away), then release every socket and join the heartbeat task.
    pub async fn run(self) -> Result<()> {
        let WorkerClient {
            config,
            subscriber,
            sub_rx,
            puller,
            mut pull_rx,
            file_client,
            result_client,
            heartbeat_client,
            finished,
            executor,
        } = self;

        let heartbeat_handle = tokio::spawn(heartbeat_loop(
            sub_rx,
            heartbeat_client.clone(),
            puller.clone(),
            finished.clone(),
            config.ip_echo_endpoint.clone(),
        ));

        while let Some(message) = pull_rx.recv().await {
            match message {
                Message::TestSpec {
                    key,
                    timeout,
                    commands,
                } => {
                    if let Err(e) = run_test(
                        &config.work_dir,
                        &file_client,
                        &result_client,
                        &executor,
                        &key,
                        timeout,
                        &commands,
                    )
                    .await
                    {
                        // The commander re-queues the key once its alarm
                        // fires; nothing to do here but move on.
                        tracing::error!(key = %key, error = %e, "Assignment run failed");
                    }
                }
                other => {
                    tracing::warn!(message = ?other, "Protocol violation on work channel");
                }
            }
        }

        tracing::info!("Work channel closed, shutting down");
        subscriber.close();
        puller.close();
        file_client.close().await;
        result_client.close().await;
        heartbeat_client.close().await;
        finished.store(true, Ordering::SeqCst);
        let _ = heartbeat_handle.await;
        Ok(())
    }

    /// Whether a done-heartbeat has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Answer every heartbeat with this worker's public IP; on the first
/// `done` beat, mark the client finished and close the puller so the main
/// loop drains out.
async fn heartbeat_loop(
    mut sub_rx: mpsc::Receiver<Message>,
    heartbeat_client: Arc<Requester>,
    puller: Arc<Puller>,
    finished: Arc<AtomicBool>,
    echo_endpoint: String,
) {
    let cached_ip: OnceCell<String> = OnceCell::new();

    while let Some(message) = sub_rx.recv().await {
        let done = match message {
            Message::Heartbeat { done, .. } => done,
            other => {
                tracing::warn!(message = ?other, "Protocol violation on heartbeat channel");
                continue;
            }
        };

        if done && !finished.swap(true, Ordering::SeqCst) {
            tracing::info!("Commander reports run complete");
            puller.close();
        }

        let ip = match cached_ip
            .get_or_try_init(|| ident::discover_public_ip(&echo_endpoint))
            .await
        {
            Ok(ip) => ip.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot discover own IP, skipping heartbeat reply");
                continue;
            }
        };

        // A dropped response is recovered by the next heartbeat.
        if let Err(e) = heartbeat_client
            .request(&Message::HeartbeatResp { ip })
            .await
        {
            tracing::debug!(error = %e, "Heartbeat response dropped");
        }

        if done {
            return;
        }
    }
}

/// One full assignment cycle: fetch files, run the sequence, report.
async fn run_test(
    work_dir: &Path,
    file_client: &Requester,
    result_client: &Requester,
    executor: &TestExecutor,
    key: &str,
    timeout: u32,
    commands: &[String],
) -> Result<()> {
    tracing::info!(key = %key, timeout, "Received assignment");

    let submission = fetch_files(file_client, key).await?;
    let common = fetch_files(file_client, COMMON_KEY).await?;

    let dir = work_dir.join(key);
    std::fs::create_dir_all(&dir)?;
    // Shared harness first; submission files win on path collision.
    files::materialize(&dir, &common)?;
    files::materialize(&dir, &submission)?;

    let outcome = executor.run_sequence(&dir, commands, timeout).await;
    let payload = if outcome.timed_out {
        base64::encode(b"Failed")
    } else {
        base64::encode(&outcome.transcript)
    };

    tracing::info!(
        key = %key,
        passed = outcome.passed,
        timed_out = outcome.timed_out,
        "Reporting completion"
    );
    result_client
        .request(&Message::TestCompletion {
            key: key.to_string(),
            results: payload,
        })
        .await?;
    Ok(())
}

async fn fetch_files(client: &Requester, key: &str) -> Result<Vec<(String, String)>> {
    match client
        .request(&Message::FileReq {
            key: key.to_string(),
        })
        .await?
    {
        Message::Files { entries } => Ok(entries),
        other => Err(GridError::Protocol(format!(
            "expected a file list for {key}, got {other:?}"
        ))),
    }
}
