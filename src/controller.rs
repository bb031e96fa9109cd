//! The offline controller: a single reactive process that owns the cache
//! store, the policy engine and the sync queue, and responds to a fixed
//! set of events.
//!
//! Handlers run to completion, suspending only at network and storage
//! calls. Fetches for independent requests are spawned so they interleave;
//! queue drains run inline so a class queue is never drained by two
//! handlers at once. No handler failure ever tears down the loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::http::{FetchRequest, ResponseSnapshot};
use crate::net::NetworkFetch;
use crate::notify::{Notifier, PushPayload};
use crate::policy::{FetchFailure, PolicyConfig, PolicyEngine};
use crate::queue::{SyncQueue, SyncReport};
use crate::router;

/// Events the controller subscribes to. Each produces at most one reply.
#[derive(Debug)]
pub enum ControllerEvent {
  /// First install: precache static assets, create generations
  Install {
    reply: oneshot::Sender<Result<usize, FetchFailure>>,
  },
  /// New version took over: drop superseded generations
  Activate {
    reply: oneshot::Sender<Result<(), FetchFailure>>,
  },
  /// Intercepted outgoing request
  Fetch {
    request: FetchRequest,
    reply: oneshot::Sender<Result<ResponseSnapshot, FetchFailure>>,
  },
  /// Reconnection signal carrying a class tag ("sync-sales")
  Sync {
    tag: String,
    reply: oneshot::Sender<SyncReport>,
  },
  /// Inbound push payload
  Push(PushPayload),
  /// User interacted with a displayed notification
  NotificationClick {
    action: String,
    url: Option<String>,
  },
  /// Platform connectivity signal
  Connectivity(bool),
}

/// Cloneable handle collaborators use to reach the controller.
#[derive(Clone)]
pub struct ControllerHandle {
  tx: mpsc::UnboundedSender<ControllerEvent>,
  online: Arc<AtomicBool>,
}

impl ControllerHandle {
  pub async fn install(&self) -> Result<usize, FetchFailure> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(ControllerEvent::Install { reply: tx })
      .map_err(|_| FetchFailure::ControllerClosed)?;
    rx.await.map_err(|_| FetchFailure::ControllerClosed)?
  }

  pub async fn activate(&self) -> Result<(), FetchFailure> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(ControllerEvent::Activate { reply: tx })
      .map_err(|_| FetchFailure::ControllerClosed)?;
    rx.await.map_err(|_| FetchFailure::ControllerClosed)?
  }

  pub async fn fetch(&self, request: FetchRequest) -> Result<ResponseSnapshot, FetchFailure> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(ControllerEvent::Fetch { request, reply: tx })
      .map_err(|_| FetchFailure::ControllerClosed)?;
    rx.await.map_err(|_| FetchFailure::ControllerClosed)?
  }

  pub async fn sync(&self, tag: &str) -> Result<SyncReport, FetchFailure> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(ControllerEvent::Sync {
        tag: tag.to_string(),
        reply: tx,
      })
      .map_err(|_| FetchFailure::ControllerClosed)?;
    rx.await.map_err(|_| FetchFailure::ControllerClosed)
  }

  pub fn push(&self, payload: PushPayload) {
    let _ = self.tx.send(ControllerEvent::Push(payload));
  }

  pub fn notification_click(&self, action: &str, url: Option<String>) {
    let _ = self.tx.send(ControllerEvent::NotificationClick {
      action: action.to_string(),
      url,
    });
  }

  pub fn set_connectivity(&self, online: bool) {
    let _ = self.tx.send(ControllerEvent::Connectivity(online));
  }

  /// Current connectivity state. Readable by collaborators; written only
  /// by the controller's event handlers.
  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

/// The event-driven controller process.
pub struct Controller<S: CacheStore, N: NetworkFetch> {
  engine: Arc<PolicyEngine<S, N>>,
  store: Arc<S>,
  queue: Arc<SyncQueue>,
  notifier: Arc<dyn Notifier>,
  config: Config,
  origin: Url,
  online: Arc<AtomicBool>,
  /// Classes with a drain currently running; keeps replay serial per class
  draining: Arc<Mutex<HashSet<String>>>,
  rx: mpsc::UnboundedReceiver<ControllerEvent>,
}

/// A poisoned in-flight set is still a usable set; keep going.
fn lock_set(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
  set.lock().unwrap_or_else(|e| e.into_inner())
}

impl<S, N> Controller<S, N>
where
  S: CacheStore + 'static,
  N: NetworkFetch + 'static,
{
  pub fn new(
    config: Config,
    store: Arc<S>,
    queue: Arc<SyncQueue>,
    net: N,
    notifier: Arc<dyn Notifier>,
  ) -> Result<(Self, ControllerHandle)> {
    let origin = config.origin_url()?;
    let engine = Arc::new(PolicyEngine::new(
      Arc::clone(&store),
      Arc::clone(&queue),
      net,
      PolicyConfig::from_config(&config),
    ));

    let (tx, rx) = mpsc::unbounded_channel();
    let online = Arc::new(AtomicBool::new(true));

    let handle = ControllerHandle {
      tx,
      online: Arc::clone(&online),
    };

    let controller = Self {
      engine,
      store,
      queue,
      notifier,
      config,
      origin,
      online,
      draining: Arc::new(Mutex::new(HashSet::new())),
      rx,
    };

    Ok((controller, handle))
  }

  /// Process events until every handle is dropped.
  pub async fn run(mut self) {
    while let Some(event) = self.rx.recv().await {
      match event {
        ControllerEvent::Install { reply } => {
          let result = self
            .engine
            .precache(&self.origin, &self.config.precache)
            .await
            .map_err(FetchFailure::from);
          let _ = reply.send(result);
        }

        ControllerEvent::Activate { reply } => {
          let keep = self.config.current_generations();
          info!(keep = ?keep, "activating, reconciling generations");
          let result = self
            .store
            .reconcile_generations(&keep)
            .map_err(FetchFailure::from);
          let _ = reply.send(result);
        }

        ControllerEvent::Fetch { request, reply } => {
          // Independent requests interleave; each one runs to completion
          // on its own task.
          let engine = Arc::clone(&self.engine);
          let api_prefix = self.config.api_prefix.clone();
          tokio::spawn(async move {
            let route = router::classify(request.path(), request.mode, &api_prefix);
            let result = engine.execute(route, &request).await;
            let _ = reply.send(result);
          });
        }

        ControllerEvent::Sync { tag, reply } => {
          self.handle_sync(tag, reply);
        }

        ControllerEvent::Push(payload) => {
          self.notifier.show(&payload);
        }

        ControllerEvent::NotificationClick { action, url } => {
          if action == "view" {
            self.notifier.open(url.as_deref().unwrap_or("/"));
          }
        }

        ControllerEvent::Connectivity(online) => {
          self.online.store(online, Ordering::SeqCst);
          info!(online, "connectivity changed");
        }
      }
    }
  }

  /// Map a sync tag to its class queue and drain it on its own task.
  ///
  /// The in-flight set admits at most one drain per class at a time, so
  /// replay stays serial within a class while the event loop remains
  /// free to dispatch fetches. A signal for a class already draining
  /// leaves its entries for the next signal.
  fn handle_sync(&self, tag: String, reply: oneshot::Sender<SyncReport>) {
    let class = tag.strip_prefix("sync-").unwrap_or(&tag).to_string();

    if !self.config.sync_classes.iter().any(|c| *c == class) {
      warn!(tag = %tag, "ignoring sync signal for unknown resource class");
      let _ = reply.send(SyncReport::default());
      return;
    }

    if !lock_set(&self.draining).insert(class.clone()) {
      warn!(class = %class, "drain already in flight, leaving entries for the next signal");
      let report = SyncReport {
        replayed: 0,
        remaining: self.queue.len(&class).unwrap_or(0),
      };
      let _ = reply.send(report);
      return;
    }

    info!(class = %class, "sync signal received, draining queue");
    let queue = Arc::clone(&self.queue);
    let engine = Arc::clone(&self.engine);
    let origin = self.origin.clone();
    let draining = Arc::clone(&self.draining);

    tokio::spawn(async move {
      let report = match queue.drain(&class, &origin, engine.network()).await {
        Ok(report) => {
          info!(
            class = %class,
            replayed = report.replayed,
            remaining = report.remaining,
            "queue drain finished"
          );
          report
        }
        Err(e) => {
          // Entries stay queued; the next signal retries them.
          warn!(class = %class, error = %e, "queue drain failed");
          SyncReport {
            replayed: 0,
            remaining: queue.len(&class).unwrap_or(0),
          }
        }
      };

      lock_set(&draining).remove(&class);
      let _ = reply.send(report);
    });
  }
}
