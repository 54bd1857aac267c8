//! Extension lifecycle events
//!
//! Fired through the registry's event emitter so collaborators (and
//! downstream extensions chaining off other extensions' activation) can
//! react without the registry knowing about them.

use serde::{Deserialize, Serialize};

/// Lifecycle event payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A record was created for the id
    Loaded { id: String },

    /// The entry point completed and exports are readable
    Activated { id: String },

    /// The entry point failed
    ActivationFailed { id: String, error: String },

    /// The extension returned to the loaded state
    Deactivated { id: String },

    /// The record was removed
    Unloaded { id: String },

    /// The persisted disabled flag flipped
    Toggled { id: String, disabled: bool },
}

impl LifecycleEvent {
    /// Event name for dispatch and logging
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Loaded { .. } => "loaded",
            Self::Activated { .. } => "activated",
            Self::ActivationFailed { .. } => "activation_failed",
            Self::Deactivated { .. } => "deactivated",
            Self::Unloaded { .. } => "unloaded",
            Self::Toggled { .. } => "toggled",
        }
    }

    /// Extension id the event concerns
    pub fn id(&self) -> &str {
        match self {
            Self::Loaded { id }
            | Self::Activated { id }
            | Self::ActivationFailed { id, .. }
            | Self::Deactivated { id }
            | Self::Unloaded { id }
            | Self::Toggled { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_serialization_round_trip() {
        let cases = vec![
            (
                LifecycleEvent::Loaded {
                    id: "demo-ext".to_string(),
                },
                "loaded",
            ),
            (
                LifecycleEvent::Activated {
                    id: "demo-ext".to_string(),
                },
                "activated",
            ),
            (
                LifecycleEvent::ActivationFailed {
                    id: "demo-ext".to_string(),
                    error: "entry point panicked".to_string(),
                },
                "activation_failed",
            ),
            (
                LifecycleEvent::Toggled {
                    id: "demo-ext".to_string(),
                    disabled: true,
                },
                "toggled",
            ),
        ];

        for (event, expected) in cases {
            assert_eq!(event.event_name(), expected);
            assert_eq!(event.id(), "demo-ext");
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value.get("type").and_then(Value::as_str), Some(expected));
            let back: LifecycleEvent = serde_json::from_value(value).unwrap();
            assert_eq!(back, event);
        }
    }
}
