//! Notification display seam.
//!
//! The controller's only obligation for push signals is to request that a
//! notification be shown and, on interaction, that the target URL be
//! opened. What "showing" means belongs to the host.

use serde::Deserialize;
use tracing::info;

/// Inbound push payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
  pub title: String,
  pub body: String,
  /// Page to open when the notification is interacted with
  pub url: Option<String>,
}

/// Capability to display notifications and open pages.
pub trait Notifier: Send + Sync {
  /// Request display of a notification.
  fn show(&self, payload: &PushPayload);

  /// Request navigation to a URL after user interaction.
  fn open(&self, url: &str);
}

/// Notifier that records requests to the log. Stands in where no real
/// display capability is wired up.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, payload: &PushPayload) {
    info!(title = %payload.title, body = %payload.body, "notification requested");
  }

  fn open(&self, url: &str) {
    info!(url, "navigation requested");
  }
}
