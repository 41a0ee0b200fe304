use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, RegistrationStore};
use crate::clients::ClientRegistry;
use crate::error::{WorkerError, WorkerResult};
use crate::http::Request;
use crate::network::Network;
use crate::worker::{FetchOutcome, ServiceWorker, SyncTag, WorkerState};

/// Events delivered to the worker by its host
#[derive(Debug)]
pub enum WorkerEvent {
  /// Install, then activate if allowed
  Install {
    reply: oneshot::Sender<WorkerResult<WorkerState>>,
  },
  /// Activate a waiting version
  Activate {
    reply: oneshot::Sender<WorkerResult<WorkerState>>,
  },
  /// Outgoing request from a controlled page
  Fetch {
    request: Request,
    reply: oneshot::Sender<WorkerResult<FetchOutcome>>,
  },
  /// Message posted by a page
  Message {
    data: Value,
    reply: oneshot::Sender<WorkerResult<WorkerState>>,
  },
  /// A sync tag requested while offline
  SyncRequested { tag: String },
  /// Connectivity came back; run pending syncs
  Online {
    reply: oneshot::Sender<Vec<SyncTag>>,
  },
}

/// Lifecycle events, handled strictly in arrival order.
enum LifecycleEvent {
  Install {
    reply: oneshot::Sender<WorkerResult<WorkerState>>,
  },
  Activate {
    reply: oneshot::Sender<WorkerResult<WorkerState>>,
  },
  Message {
    data: Value,
    reply: oneshot::Sender<WorkerResult<WorkerState>>,
  },
}

/// Event handler that owns the worker and dispatches events to it.
///
/// Fetch events and connectivity changes run as their own tasks so they never
/// wait behind a precache. Install, activate and messages go through a
/// separate lifecycle queue and are handled one at a time.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  task: JoinHandle<()>,
}

impl EventHandler {
  /// Spawn the dispatch loop for `worker`
  pub fn spawn<S, N, C>(worker: Arc<ServiceWorker<S, N, C>>) -> Self
  where
    S: CacheStorage + RegistrationStore + 'static,
    N: Network + 'static,
    C: ClientRegistry + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel::<LifecycleEvent>();
    let lifecycle = tokio::spawn(run_lifecycle(Arc::clone(&worker), lifecycle_rx));

    let task = tokio::spawn(async move {
      let queue = move |event: LifecycleEvent| {
        if lifecycle_tx.send(event).is_err() {
          warn!("lifecycle queue has stopped");
        }
      };

      while let Some(event) = rx.recv().await {
        match event {
          WorkerEvent::Fetch { request, reply } => {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
              let outcome = worker.fetch(&request).await;
              // The caller may have given up on the request
              let _ = reply.send(outcome);
            });
          }
          WorkerEvent::SyncRequested { tag } => worker.request_sync(&tag),
          WorkerEvent::Online { reply } => {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
              let _ = reply.send(worker.connectivity_restored().await);
            });
          }
          WorkerEvent::Install { reply } => queue(LifecycleEvent::Install { reply }),
          WorkerEvent::Activate { reply } => queue(LifecycleEvent::Activate { reply }),
          WorkerEvent::Message { data, reply } => queue(LifecycleEvent::Message { data, reply }),
        }
      }

      drop(queue);
      let _ = lifecycle.await;
      debug!("worker event loop stopped");
    });

    Self { tx, task }
  }

  fn send(&self, event: WorkerEvent) -> WorkerResult<()> {
    self
      .tx
      .send(event)
      .map_err(|_| WorkerError::InvalidState("worker event loop has stopped".to_string()))
  }

  async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent) -> WorkerResult<T> {
    let (reply, rx) = oneshot::channel();
    self.send(make(reply))?;
    rx.await
      .map_err(|_| WorkerError::InvalidState("worker dropped the event".to_string()))
  }

  pub async fn install(&self) -> WorkerResult<WorkerState> {
    self.ask(|reply| WorkerEvent::Install { reply }).await?
  }

  pub async fn activate(&self) -> WorkerResult<WorkerState> {
    self.ask(|reply| WorkerEvent::Activate { reply }).await?
  }

  pub async fn fetch(&self, request: Request) -> WorkerResult<FetchOutcome> {
    self
      .ask(|reply| WorkerEvent::Fetch { request, reply })
      .await?
  }

  pub async fn post_message(&self, data: Value) -> WorkerResult<WorkerState> {
    self.ask(|reply| WorkerEvent::Message { data, reply }).await?
  }

  pub fn request_sync(&self, tag: &str) -> WorkerResult<()> {
    self.send(WorkerEvent::SyncRequested {
      tag: tag.to_string(),
    })
  }

  pub async fn online(&self) -> WorkerResult<Vec<SyncTag>> {
    self.ask(|reply| WorkerEvent::Online { reply }).await
  }

  /// Stop accepting events and wait for queued ones to finish
  pub async fn shutdown(self) {
    drop(self.tx);
    let _ = self.task.await;
  }
}

async fn run_lifecycle<S, N, C>(
  worker: Arc<ServiceWorker<S, N, C>>,
  mut rx: mpsc::UnboundedReceiver<LifecycleEvent>,
) where
  S: CacheStorage + RegistrationStore,
  N: Network,
  C: ClientRegistry,
{
  while let Some(event) = rx.recv().await {
    match event {
      LifecycleEvent::Install { reply } => {
        let _ = reply.send(worker.register().await);
      }
      LifecycleEvent::Activate { reply } => {
        let _ = reply.send(worker.activate());
      }
      LifecycleEvent::Message { data, reply } => {
        let _ = reply.send(worker.on_message(&data));
      }
    }
  }
}
