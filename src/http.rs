//! Request and response types shared by the router, policies and stores.
//!
//! An intercepted request is reduced to the fields the controller cares
//! about: URL, method, headers, body and whether it is a full-page
//! navigation. Responses are kept as self-contained snapshots so they can
//! be persisted in a cache generation and replayed later.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// HTTP methods the controller distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  /// Whether this method mutates server state and is eligible for
  /// deferred replay when issued offline.
  pub fn is_mutating(&self) -> bool {
    !matches!(self, HttpMethod::Get)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Patch => "PATCH",
      HttpMethod::Delete => "DELETE",
    }
  }

  pub fn as_reqwest(&self) -> reqwest::Method {
    match self {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

impl std::str::FromStr for HttpMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "GET" => Ok(HttpMethod::Get),
      "POST" => Ok(HttpMethod::Post),
      "PUT" => Ok(HttpMethod::Put),
      "PATCH" => Ok(HttpMethod::Patch),
      "DELETE" => Ok(HttpMethod::Delete),
      other => Err(format!("Unsupported HTTP method: {}", other)),
    }
  }
}

impl std::fmt::Display for HttpMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Asset or API fetch issued by a loaded page
  #[default]
  Subresource,
  /// Full-page load (address bar, link click, reload)
  Navigate,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub url: Url,
  pub method: HttpMethod,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl FetchRequest {
  /// Plain subresource GET.
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: HttpMethod::Get,
      headers: Vec::new(),
      body: None,
      mode: RequestMode::Subresource,
    }
  }

  /// Full-page navigation GET.
  pub fn navigation(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// Stable cache key for this request.
  ///
  /// SHA256 over method and URL gives fixed-length keys regardless of how
  /// long the query string gets.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// URL path component.
  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Path plus query string, suitable as a replay target.
  pub fn path_and_query(&self) -> String {
    match self.url.query() {
      Some(q) => format!("{}?{}", self.url.path(), q),
      None => self.url.path().to_string(),
    }
  }

  /// The equivalent request for a given page on the same origin.
  /// Used to fall back to the cached root page for offline navigations.
  pub fn for_page(&self, path: &str) -> FetchRequest {
    let mut url = self.url.clone();
    url.set_path(path);
    url.set_query(None);
    FetchRequest::navigation(url)
  }
}

/// A persistable snapshot of a response: status, headers and full body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
      .map(|(_, value)| value.as_str())
  }

  /// Synthesized 503 for critical API paths when offline with no cached copy.
  pub fn offline_api() -> Self {
    let body = serde_json::json!({
      "error": "Offline",
      "message": "This data is not available offline",
      "offline": true,
    });

    Self {
      status: 503,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: body.to_string().into_bytes(),
    }
  }

  /// Self-contained offline page served when a navigation has no cached
  /// fallback at all. No external assets, manual retry only.
  pub fn offline_page() -> Self {
    Self {
      status: 200,
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: OFFLINE_PAGE.as_bytes().to_vec(),
    }
  }
}

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <title>ShopFlow - Offline</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
      body {
        font-family: system-ui, sans-serif;
        text-align: center;
        padding: 2rem;
        background: #fff7ed;
      }
      .container {
        max-width: 400px;
        margin: 4rem auto;
        background: white;
        padding: 2rem;
        border-radius: 1rem;
        box-shadow: 0 10px 25px rgba(0,0,0,0.1);
      }
      h1 { color: #1f2937; margin-bottom: 0.5rem; }
      p { color: #6b7280; margin-bottom: 1.5rem; }
      button {
        background: #f97316;
        color: white;
        border: none;
        padding: 0.75rem 1.5rem;
        border-radius: 0.5rem;
        cursor: pointer;
        font-size: 1rem;
      }
    </style>
  </head>
  <body>
    <div class="container">
      <h1>You're Offline</h1>
      <p>ShopFlow is not available right now. Please check your internet connection and try again.</p>
      <button onclick="window.location.reload()">Try Again</button>
    </div>
  </body>
</html>
"#;
