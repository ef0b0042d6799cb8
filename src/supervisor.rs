//! Runs the emulator tasks side by side. The first task to finish, for any
//! reason, ends the run: the others are asked to stop, given a grace period,
//! then aborted.

use crate::error::EmulatorError;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Publisher,
    Consumer,
    Console,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Publisher => write!(f, "telemetry publisher"),
            TaskKind::Consumer => write!(f, "command consumer"),
            TaskKind::Console => write!(f, "operator console"),
        }
    }
}

/// Cooperative stop request observed by the tasks at their safe points.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Sending half of a [`ShutdownSignal`].
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop is requested, or the trigger is gone.
    pub async fn requested(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Task(TaskKind),
    StopRequested,
    NoTasks,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub finish: Finish,
    pub errors: Vec<(TaskKind, EmulatorError)>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&(TaskKind, EmulatorError)> {
        self.errors.first()
    }
}

type TaskResult = Result<(), EmulatorError>;

pub struct Supervisor {
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
    tasks: Vec<(TaskKind, JoinHandle<TaskResult>)>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(grace: Duration) -> Self {
        let (trigger, signal) = ShutdownSignal::channel();
        Self {
            trigger,
            signal,
            tasks: Vec::new(),
            grace,
        }
    }

    /// Signal handed to every task so it can stop cooperatively.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn spawn<F>(&mut self, kind: TaskKind, task: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        info!("▶️  Starting {}", kind);
        self.tasks.push((kind, tokio::spawn(task)));
    }

    pub async fn run(self) -> RunOutcome {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Supervisor::run`], but `stop` resolving also ends the run
    /// (normally, as if a task had completed).
    pub async fn run_until<S>(self, stop: S) -> RunOutcome
    where
        S: Future<Output = ()>,
    {
        let mut errors = Vec::new();
        if self.tasks.is_empty() {
            return RunOutcome {
                finish: Finish::NoTasks,
                errors,
            };
        }

        let mut aborts: Vec<(TaskKind, AbortHandle)> = Vec::new();
        let mut running: FuturesUnordered<_> = self
            .tasks
            .into_iter()
            .map(|(kind, handle)| {
                aborts.push((kind, handle.abort_handle()));
                handle.map(move |joined| (kind, joined))
            })
            .collect();

        tokio::pin!(stop);
        let finish = tokio::select! {
            Some((kind, joined)) = running.next() => {
                record(kind, joined, &mut errors);
                Finish::Task(kind)
            }
            () = &mut stop => {
                info!("🛑 Stop requested");
                Finish::StopRequested
            }
            else => Finish::NoTasks,
        };

        info!("Shutting down remaining tasks");
        self.trigger.trigger();

        let drained = tokio::time::timeout(self.grace, async {
            while let Some((kind, joined)) = running.next().await {
                record(kind, joined, &mut errors);
            }
        })
        .await;

        if drained.is_err() {
            warn!("Tasks still running after {:?}, aborting", self.grace);
            for (_, abort) in &aborts {
                abort.abort();
            }
            while let Some((kind, joined)) = running.next().await {
                record(kind, joined, &mut errors);
            }
        }

        RunOutcome { finish, errors }
    }
}

fn record(
    kind: TaskKind,
    joined: Result<TaskResult, JoinError>,
    errors: &mut Vec<(TaskKind, EmulatorError)>,
) {
    match joined {
        Ok(Ok(())) => info!("⏹️  {} finished", kind),
        Ok(Err(e)) => {
            error!("❌ {} failed: {}", kind, e);
            errors.push((kind, e));
        }
        Err(e) if e.is_cancelled() => warn!("{} aborted", kind),
        Err(_) => {
            error!("❌ {} panicked", kind);
            errors.push((kind, EmulatorError::TaskPanicked(kind)));
        }
    }
}
