use std::fmt;
use std::sync::Arc;

/// Identifier of one managed vehicle, taken from the drone configuration.
///
/// The same string is the C2 `entity_id` the asset is published under, the
/// assignee the task agent matches execute requests against, and the key in
/// the state store and session map, so it must stay stable for the life of
/// the process. Clones share the underlying allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DroneId(Arc<str>);

impl DroneId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human-facing name advertised in the entity aliases component.
    pub fn display_name(&self) -> String {
        format!("Drone-{}", self.0)
    }
}

impl fmt::Display for DroneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DroneId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for DroneId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_carries_entity_prefix() {
        let id = DroneId::from("sitl-drone-1");
        assert_eq!(id.as_str(), "sitl-drone-1");
        assert_eq!(id.display_name(), "Drone-sitl-drone-1");
    }

    #[test]
    fn test_clones_compare_equal() {
        let id = DroneId::from("sitl-drone-1".to_string());
        assert_eq!(id, id.clone());
    }
}
