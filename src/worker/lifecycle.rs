use serde::{Deserialize, Serialize};

/// Lifecycle state of the cache controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  /// Constructed, nothing installed yet
  #[default]
  Parsed,
  /// Populating the cache generation from the precache manifest
  Installing,
  /// Precache complete, waiting to activate
  Installed,
  /// Deleting stale generations
  Activating,
  /// Intercepting requests
  Activated,
  /// Install failed; the host may retry
  Redundant,
}

impl WorkerState {
  /// Install may start from any settled state.
  pub fn can_install(self) -> bool {
    !matches!(self, Self::Installing | Self::Activating)
  }

  pub fn can_activate(self) -> bool {
    self == Self::Installed
  }

  /// This version has activated and owns the cache.
  pub fn is_active(self) -> bool {
    self == Self::Activated
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
