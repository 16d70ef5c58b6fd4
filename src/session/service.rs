//! The single owner of the session registry.
//!
//! All structural mutations arrive as [`SessionCommand`]s on one channel and
//! are applied in order by one task, so `add`, sweeps and shutdown can never
//! interleave. Reads go straight to the registry's [`SessionView`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::registry::{SessionRegistry, SessionView, SweepReport};
use super::scheduler::{ExpiryScheduler, SchedulerState};
use super::OpenedCapsule;
use crate::eraser::Eraser;
use crate::error::{CapsuleError, Result};

const COMMAND_BUFFER: usize = 64;

/// Work for the registry owner
#[derive(Debug)]
pub enum SessionCommand {
    /// Register a freshly unpacked capsule
    Add {
        capsule: OpenedCapsule,
        ack: oneshot::Sender<()>,
    },
    /// Shred everything with `expires_at <= now`
    Sweep {
        now: DateTime<Utc>,
        reply: Option<oneshot::Sender<SweepReport>>,
    },
    /// Shred everything and stop; the owner exits afterwards
    ShredAll { reply: oneshot::Sender<SweepReport> },
}

/// Owner task state
pub struct SessionService {
    registry: SessionRegistry,
    commands: mpsc::Receiver<SessionCommand>,
}

impl SessionService {
    /// Move `registry` into a new owner task and return a handle to it.
    ///
    /// The scheduler is handed over idle; call
    /// [`SessionHandle::start_expiry`] to begin periodic sweeps.
    pub fn spawn(registry: SessionRegistry, scheduler: ExpiryScheduler) -> SessionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let view = registry.list_all();
        let eraser = registry.eraser();

        let service = SessionService {
            registry,
            commands: rx,
        };
        tokio::spawn(service.run());

        SessionHandle {
            commands: tx,
            view,
            scheduler: Arc::new(scheduler),
            eraser,
        }
    }

    async fn run(mut self) {
        debug!("session service started");

        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::Add { capsule, ack } => {
                    self.registry.add(capsule);
                    let _ = ack.send(());
                }
                SessionCommand::Sweep { now, reply } => {
                    let report = self.registry.sweep_expired(now).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(report);
                    }
                }
                SessionCommand::ShredAll { reply } => {
                    self.shutdown(vec![reply]).await;
                    return;
                }
            }
        }

        // Every handle is gone without a shutdown request
        warn!("session handles dropped; shredding remaining capsules");
        self.registry.shred_all().await;
    }

    async fn shutdown(mut self, mut replies: Vec<oneshot::Sender<SweepReport>>) {
        // Nothing queued behind the shutdown may be lost with the receiver
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Add { capsule, .. } => self.registry.add(capsule),
                SessionCommand::Sweep { .. } => {}
                SessionCommand::ShredAll { reply } => replies.push(reply),
            }
        }

        let report = self.registry.shred_all().await;
        info!(
            shredded = report.shredded.len(),
            failed = report.failed.len(),
            "session service shut down"
        );
        for reply in replies {
            let _ = reply.send(report.clone());
        }
    }
}

/// Cloneable front end of the [`SessionService`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    view: SessionView,
    scheduler: Arc<ExpiryScheduler>,
    eraser: Arc<dyn Eraser>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("open", &self.view.len())
            .field("scheduler", &self.scheduler.state())
            .finish()
    }
}

impl SessionHandle {
    /// Register a capsule. Once this resolves the capsule is visible in
    /// [`list_all`](Self::list_all).
    ///
    /// If the service has shut down the capsule is shredded here and
    /// [`CapsuleError::SessionClosed`] is returned.
    pub async fn add(&self, capsule: OpenedCapsule) -> Result<()> {
        let (ack, done) = oneshot::channel();
        match self.commands.send(SessionCommand::Add { capsule, ack }).await {
            Ok(()) => done.await.map_err(|_| CapsuleError::SessionClosed),
            Err(mpsc::error::SendError(command)) => {
                if let SessionCommand::Add { capsule, .. } = command {
                    self.discard(capsule).await;
                }
                Err(CapsuleError::SessionClosed)
            }
        }
    }

    /// Live view of the open capsules; no round trip through the owner
    pub fn list_all(&self) -> SessionView {
        self.view.clone()
    }

    /// Sweep now and wait for the result
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(SessionCommand::Sweep {
                now,
                reply: Some(reply),
            })
            .await
            .map_err(|_| CapsuleError::SessionClosed)?;
        done.await.map_err(|_| CapsuleError::SessionClosed)
    }

    /// Begin periodic sweeps; `false` if already started or stopped
    pub fn start_expiry(&self) -> bool {
        self.scheduler.start(self.commands.clone())
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Stop the scheduler, shred every open capsule and close the service.
    ///
    /// Resolves once all shutdown work is done, whatever state the scheduler
    /// was in.
    pub async fn shred_all(&self) -> Result<SweepReport> {
        self.scheduler.cancel();
        self.scheduler.join().await;

        let (reply, done) = oneshot::channel();
        self.commands
            .send(SessionCommand::ShredAll { reply })
            .await
            .map_err(|_| CapsuleError::SessionClosed)?;
        done.await.map_err(|_| CapsuleError::SessionClosed)
    }

    async fn discard(&self, capsule: OpenedCapsule) {
        let eraser = Arc::clone(&self.eraser);
        let dir = capsule.temp_directory().to_path_buf();
        warn!(capsule_id = %capsule.capsule_id(), "session closed; discarding capsule");
        match tokio::task::spawn_blocking(move || eraser.shred(&dir)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to shred rejected capsule"),
            Err(e) => warn!(error = %e, "shred task failed"),
        }
    }
}
