//! Network access behind a trait so policies and the sync queue can be
//! exercised against a mock transport.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::http::{FetchRequest, ResponseSnapshot};

/// Transient connectivity failure. Triggers the fallback ladder in the
/// policy executors; never fatal to the controller.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
  /// The transport reported a failure (DNS, connect, reset, timeout).
  #[error("network transport failed: {0}")]
  Transport(String),
  /// No connectivity at all.
  #[error("offline")]
  Offline,
}

impl From<reqwest::Error> for NetworkError {
  fn from(err: reqwest::Error) -> Self {
    NetworkError::Transport(err.to_string())
  }
}

/// The single seam through which the controller reaches the network.
pub trait NetworkFetch: Send + Sync {
  /// Issue the request and collect the full response into a snapshot.
  ///
  /// Non-2xx responses are not errors here; only transport failures are.
  fn fetch(
    &self,
    request: &FetchRequest,
  ) -> impl Future<Output = Result<ResponseSnapshot, NetworkError>> + Send;
}

impl<N: NetworkFetch> NetworkFetch for Arc<N> {
  fn fetch(
    &self,
    request: &FetchRequest,
  ) -> impl Future<Output = Result<ResponseSnapshot, NetworkError>> + Send {
    (**self).fetch(request)
  }
}

/// Real transport backed by reqwest. Relies on the client's default
/// timeout; the controller imposes none of its own.
#[derive(Clone, Default)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }
}

impl NetworkFetch for HttpClient {
  fn fetch(
    &self,
    request: &FetchRequest,
  ) -> impl Future<Output = Result<ResponseSnapshot, NetworkError>> + Send {
    let mut builder = self
      .client
      .request(request.method.as_reqwest(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    async move {
      let response = builder.send().await?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await?.to_vec();

      Ok(ResponseSnapshot {
        status,
        headers,
        body,
      })
    }
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scriptable in-memory transport used across the test modules.

  use std::collections::{HashMap, HashSet};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  use super::*;
  use crate::http::HttpMethod;

  pub struct MockNetwork {
    responses: Mutex<HashMap<String, ResponseSnapshot>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    offline: AtomicBool,
    calls: AtomicUsize,
  }

  impl MockNetwork {
    pub fn new() -> Self {
      Self {
        responses: Mutex::new(HashMap::new()),
        failing: Mutex::new(HashSet::new()),
        delays: Mutex::new(HashMap::new()),
        offline: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
      }
    }

    fn key(method: HttpMethod, url: &str) -> String {
      format!("{} {}", method.as_str(), url)
    }

    /// Script a response for a method + URL pair.
    pub fn respond(&self, method: HttpMethod, url: &str, snapshot: ResponseSnapshot) {
      self
        .responses
        .lock()
        .unwrap()
        .insert(Self::key(method, url), snapshot);
    }

    pub fn respond_ok(&self, method: HttpMethod, url: &str, body: &str) {
      self.respond(
        method,
        url,
        ResponseSnapshot {
          status: 200,
          headers: vec![("content-type".to_string(), "application/json".to_string())],
          body: body.as_bytes().to_vec(),
        },
      );
    }

    /// Make one specific method + URL pair fail with a transport error
    /// while everything else keeps working.
    pub fn fail(&self, method: HttpMethod, url: &str) {
      self.failing.lock().unwrap().insert(Self::key(method, url));
    }

    /// Hold the response for a method + URL pair open for a while.
    pub fn delay(&self, method: HttpMethod, url: &str, duration: Duration) {
      self
        .delays
        .lock()
        .unwrap()
        .insert(Self::key(method, url), duration);
    }

    /// Drop all connectivity.
    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl NetworkFetch for MockNetwork {
    fn fetch(
      &self,
      request: &FetchRequest,
    ) -> impl Future<Output = Result<ResponseSnapshot, NetworkError>> + Send {
      self.calls.fetch_add(1, Ordering::SeqCst);

      let key = Self::key(request.method, request.url.as_str());
      let delay = self.delays.lock().unwrap().get(&key).copied();
      let result = if self.offline.load(Ordering::SeqCst) {
        Err(NetworkError::Offline)
      } else if self.failing.lock().unwrap().contains(&key) {
        Err(NetworkError::Transport("connection reset".to_string()))
      } else if let Some(snapshot) = self.responses.lock().unwrap().get(&key) {
        Ok(snapshot.clone())
      } else {
        Ok(ResponseSnapshot {
          status: 404,
          headers: Vec::new(),
          body: Vec::new(),
        })
      };

      async move {
        if let Some(duration) = delay {
          tokio::time::sleep(duration).await;
        }
        result
      }
    }
  }
}
