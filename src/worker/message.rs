use serde::Deserialize;
use serde_json::Value;

/// Sync tag registered by the contact form.
pub const CONTACT_FORM_SYNC: &str = "contact-form-sync";

/// Control messages pages may post to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate an installed controller without waiting
  SkipWaiting,
}

impl ControlMessage {
  /// Parse a posted message. Anything unrecognized yields `None`.
  pub fn parse(value: &Value) -> Option<Self> {
    Self::deserialize(value).ok()
  }
}
