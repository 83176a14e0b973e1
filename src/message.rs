//! Messages exchanged with the client outside the request path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineMessage {
  /// Client asks the engine to keep a copy of the current assignment
  CacheEmergency { emergency_call: Value },
  /// Broadcast after every reconciliation pass
  SyncComplete { count: usize },
}
