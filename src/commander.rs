//! Commander engine: dispatches assignments, tracks liveness, collects
//! results.
//!
//! `run()` starts five long-lived service loops and blocks until every
//! assignment is terminal:
//!
//! 1. **Heartbeat publisher** — broadcasts `Heartbeat(now, done)` every
//!    `client_timeout` seconds and sweeps dead workers.
//! 2. **Heartbeat responder** — records each worker's self-reported IP.
//! 3. **Work pusher** — pops pending keys and pushes `TestSpec`s, arming a
//!    one-shot alarm per dispatch.
//! 4. **File responder** — serves submission trees and the shared harness.
//! 5. **Result responder** — persists transcripts and marks keys finished.
//!
//! Each dispatch that produces no result within `client_timeout` is
//! re-queued by its alarm, up to the retry cap; a key that exhausts its
//! dispatches counts as a permanent failure and no longer blocks
//! completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{self, CommanderConfig};
use crate::error::{GridError, Result};
use crate::fabric::{Message, Publisher, Pusher, Responder, COMMON_KEY};
use crate::files;
use crate::scheduler::{AssignmentRegistry, LivenessTracker};

/// How long the work pusher naps when no key is pending.
const IDLE_DELAY: Duration = Duration::from_millis(250);

/// Observation hook invoked with an assignment key or a worker IP.
pub type KeyCallback = Arc<dyn Fn(&str) + Send + Sync>;

fn noop() -> KeyCallback {
    Arc::new(|_| {})
}

/// User observation channel during a run; every hook defaults to a no-op.
#[derive(Clone)]
pub struct Callbacks {
    pub on_success: KeyCallback,
    pub on_failure: KeyCallback,
    pub on_client_connected: KeyCallback,
    pub on_client_timeout: KeyCallback,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_success: noop(),
            on_failure: noop(),
            on_client_connected: noop(),
            on_client_timeout: noop(),
        }
    }
}

pub struct Commander {
    config: CommanderConfig,
    registry: Arc<AssignmentRegistry>,
    live_bots: Arc<LivenessTracker>,
    commands: Arc<Vec<String>>,
    publisher: Arc<Publisher>,
    pusher: Arc<Pusher>,
    file_responder: Arc<Responder>,
    result_responder: Arc<Responder>,
    heartbeat_responder: Arc<Responder>,
    callbacks: Callbacks,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<Result<()>>>,
}

impl Commander {
    pub async fn new(config: CommanderConfig) -> Result<Self> {
        Self::with_callbacks(config, Callbacks::default()).await
    }

    /// Open the five sockets, seed the registry from `test_dir`'s
    /// subdirectories, and load the command sequence.
    pub async fn with_callbacks(config: CommanderConfig, callbacks: Callbacks) -> Result<Self> {
        let keys = files::list_subdirs(&config.test_dir)?;
        let commands = config::read_command_file(&config.command_file)?;

        let publisher = Publisher::bind(config.heartbeat_port()).await?;
        let pusher = Pusher::bind(config.work_port()).await?;
        let file_responder = Responder::bind(config.file_port()).await?;
        let result_responder = Responder::bind(config.result_port()).await?;
        let heartbeat_responder = Responder::bind(config.heartbeat_resp_port()).await?;

        tracing::info!(
            assignments = keys.len(),
            commands = commands.len(),
            base_port = config.base_port,
            "Commander ready"
        );

        Ok(Self {
            registry: Arc::new(AssignmentRegistry::new(keys)),
            live_bots: Arc::new(LivenessTracker::new()),
            commands: Arc::new(commands),
            publisher: Arc::new(publisher),
            pusher: Arc::new(pusher),
            file_responder: Arc::new(file_responder),
            result_responder: Arc::new(result_responder),
            heartbeat_responder: Arc::new(heartbeat_responder),
            callbacks,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            config,
        })
    }

    pub fn done(&self) -> bool {
        self.registry.done()
    }

    pub fn total_assignments(&self) -> usize {
        self.registry.total()
    }

    pub fn connected_ips(&self) -> Vec<String> {
        self.live_bots.connected_ips()
    }

    /// Start the five service loops and block until every key is terminal
    /// (finished or retry-exhausted), or until shutdown.
    ///
    /// The loops stay alive after `run` returns so the final done-heartbeat
    /// keeps going out; `close` tears them down.
    pub async fn run(&self) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            tasks.spawn(Self::heartbeat_loop(
                self.publisher.clone(),
                self.registry.clone(),
                self.live_bots.clone(),
                self.callbacks.on_client_timeout.clone(),
                self.config.client_timeout,
                self.shutdown.clone(),
            ));
            tasks.spawn(Self::serve_heartbeat_responses(
                self.heartbeat_responder.clone(),
                self.live_bots.clone(),
                self.callbacks.on_client_connected.clone(),
            ));
            tasks.spawn(Self::push_loop(
                self.pusher.clone(),
                self.registry.clone(),
                self.commands.clone(),
                self.config.test_timeout,
                self.config.client_timeout,
                self.callbacks.on_failure.clone(),
                self.shutdown.clone(),
            ));
            tasks.spawn(Self::serve_files(
                self.file_responder.clone(),
                self.config.test_dir.clone(),
                self.config.common_dir.clone(),
            ));
            tasks.spawn(Self::serve_results(
                self.result_responder.clone(),
                self.registry.clone(),
                self.config.results_dir.clone(),
                self.callbacks.on_success.clone(),
            ));
        }

        tokio::select! {
            _ = self.registry.wait_for_done() => {
                tracing::info!(
                    total = self.registry.total(),
                    "Every assignment reached a terminal state"
                );
                Ok(())
            }
            _ = self.shutdown.cancelled() => Err(GridError::Shutdown),
        }
    }

    /// Tear the commander down: wait `2 × client_timeout` so the final
    /// done-heartbeat propagates, flip the shutdown flag, close all five
    /// sockets, join the service loops, and wake any completion waiters.
    pub async fn close(&self) {
        let grace = Duration::from_secs(u64::from(self.config.client_timeout) * 2);
        tracing::info!(grace_s = grace.as_secs(), "Closing commander");
        tokio::time::sleep(grace).await;

        self.shutdown.cancel();
        self.publisher.close().await;
        self.pusher.close().await;
        self.file_responder.close();
        self.result_responder.close();
        self.heartbeat_responder.close();

        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(GridError::Shutdown)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Service task failed"),
                Err(e) => tracing::error!(error = %e, "Service task panicked"),
            }
        }

        self.registry.wake_waiters();
    }

    /// Publish `Heartbeat(now, done)` every period and sweep workers that
    /// missed a whole period. Publication comes first so a slow sweep can
    /// never starve the broadcast.
    async fn heartbeat_loop(
        publisher: Arc<Publisher>,
        registry: Arc<AssignmentRegistry>,
        live_bots: Arc<LivenessTracker>,
        on_client_timeout: KeyCallback,
        client_timeout: u32,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let period = Duration::from_secs(u64::from(client_timeout));
        loop {
            let done = registry.done();
            let now = chrono::Utc::now();
            let time = now.timestamp() as f64
                + f64::from(now.timestamp_subsec_millis()) / 1000.0;

            match publisher.send(&Message::Heartbeat { time, done }).await {
                Ok(()) => tracing::debug!(done, "Heartbeat published"),
                Err(GridError::Shutdown) => return Ok(()),
                Err(e) => tracing::warn!(error = %e, "Heartbeat publish failed"),
            }

            live_bots.cleanup(period, |ip| (on_client_timeout)(ip));

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(period) => {}
            }
        }
    }

    /// Record worker identities as they answer heartbeats.
    async fn serve_heartbeat_responses(
        responder: Arc<Responder>,
        live_bots: Arc<LivenessTracker>,
        on_client_connected: KeyCallback,
    ) -> Result<()> {
        responder
            .serve(move |message| {
                if let Message::HeartbeatResp { ip } = message {
                    live_bots.add_ip(&ip, |ip| (on_client_connected)(ip));
                }
                Message::ack()
            })
            .await
    }

    /// Pop pending keys and push them to whichever puller takes them,
    /// arming one alarm per dispatch.
    async fn push_loop(
        pusher: Arc<Pusher>,
        registry: Arc<AssignmentRegistry>,
        commands: Arc<Vec<String>>,
        test_timeout: u32,
        client_timeout: u32,
        on_failure: KeyCallback,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let Some(key) = registry.pop_next() else {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(IDLE_DELAY) => {}
                }
                continue;
            };

            registry.mark_assigned(&key);
            let spec = Message::TestSpec {
                key: key.clone(),
                timeout: test_timeout,
                commands: commands.as_ref().clone(),
            };

            match pusher.push(&spec).await {
                Ok(()) => tracing::info!(key = %key, "Assignment dispatched"),
                Err(GridError::Shutdown) => return Ok(()),
                Err(e) => {
                    // The alarm below re-queues the key after the deadline.
                    tracing::warn!(key = %key, error = %e, "Push failed");
                }
            }

            tokio::spawn(Self::alarm(
                registry.clone(),
                key,
                client_timeout,
                on_failure.clone(),
                shutdown.clone(),
            ));
        }
    }

    /// One-shot deadline for a single dispatch. The commander gives up on
    /// the worker after `client_timeout`, not after the test's own budget;
    /// a result that already arrived makes this a no-op.
    async fn alarm(
        registry: Arc<AssignmentRegistry>,
        key: String,
        client_timeout: u32,
        on_failure: KeyCallback,
        shutdown: CancellationToken,
    ) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(u64::from(client_timeout))) => {}
        }
        if registry.on_timeout(&key) {
            tracing::warn!(key = %key, "No result before deadline, re-queued");
            (on_failure)(&key);
        }
    }

    /// Serve submission trees, and the shared harness under the
    /// pseudo-key. Read failures are recovered locally with an empty list;
    /// the requesting worker's dispatch then dies to its alarm and the key
    /// is retried.
    async fn serve_files(
        responder: Arc<Responder>,
        test_dir: PathBuf,
        common_dir: PathBuf,
    ) -> Result<()> {
        responder
            .serve(move |message| {
                let Message::FileReq { key } = message else {
                    return Message::ack();
                };
                if !files::is_safe_key(&key) {
                    tracing::warn!(key = %key, "Rejecting unsafe file request");
                    return Message::ack();
                }
                let dir = if key == COMMON_KEY {
                    common_dir.clone()
                } else {
                    test_dir.join(&key)
                };
                match files::read_dir_files(&dir) {
                    Ok(entries) => {
                        tracing::debug!(key = %key, files = entries.len(), "Serving files");
                        Message::Files { entries }
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "File read failed");
                        Message::ack()
                    }
                }
            })
            .await
    }

    /// Persist transcripts and mark their keys finished. A write failure
    /// leaves the key unfinished; the alarm path demotes it to a retry.
    async fn serve_results(
        responder: Arc<Responder>,
        registry: Arc<AssignmentRegistry>,
        results_dir: PathBuf,
        on_success: KeyCallback,
    ) -> Result<()> {
        responder
            .serve(move |message| {
                let Message::TestCompletion { key, results } = message else {
                    return Message::ack();
                };
                if !files::is_safe_key(&key) {
                    tracing::warn!(key = %key, "Rejecting unsafe result key");
                    return Message::ack();
                }
                match base64::decode(&results) {
                    Ok(bytes) => match files::write_result(&results_dir, &key, &bytes) {
                        Ok(path) => {
                            tracing::info!(
                                key = %key,
                                path = %path.display(),
                                bytes = bytes.len(),
                                "Result recorded"
                            );
                            registry.on_result(&key);
                            (on_success)(&key);
                        }
                        Err(e) => {
                            tracing::error!(key = %key, error = %e, "Result write failed");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Result payload is not base64");
                    }
                }
                Message::ack()
            })
            .await
    }
}
