//! Fire-and-forget notifications for lockout and rotation warnings.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

/// Sink for user-facing notices. Implementations must not block or fail; the
/// store behaves the same when notices go nowhere.
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NoticeKind, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _kind: NoticeKind, _message: &str) {}
}

/// Routes notices into the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, kind: NoticeKind, message: &str) {
        match kind {
            NoticeKind::Info => info!(target: "credvault::notice", "{message}"),
            NoticeKind::Warning | NoticeKind::Error => {
                warn!(target: "credvault::notice", kind = ?kind, "{message}")
            }
        }
    }
}
