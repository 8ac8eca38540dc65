//! Bootstrap configuration - seeds the registry's initial globals, then the
//! running registry owns the values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named node factories the daemon should register as globals at startup,
/// mapping a factory name to a free-form set of default properties.
///
/// The daemon itself does not ship device adapters or DSP plugins (those
/// are external collaborators); this just seeds the registry with
/// placeholder globals so clients have something to enumerate and bind to
/// on a freshly booted daemon.
pub type FactoriesConfig = HashMap<String, HashMap<String, String>>;

fn default_factories() -> FactoriesConfig {
    HashMap::new()
}

/// Default properties attached to the core registry singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreDefaults {
    /// `application.name` advertised in the core's Hello reply.
    #[serde(default = "CoreDefaults::default_application_name")]
    pub application_name: String,

    /// Maximum number of objects a single peer connection may hold bound
    /// before further `CreateObject` requests are rejected.
    #[serde(default = "CoreDefaults::default_max_objects_per_peer")]
    pub max_objects_per_peer: u32,
}

impl CoreDefaults {
    fn default_application_name() -> String {
        "patchbayd".to_string()
    }

    fn default_max_objects_per_peer() -> u32 {
        4096
    }
}

impl Default for CoreDefaults {
    fn default() -> Self {
        Self {
            application_name: Self::default_application_name(),
            max_objects_per_peer: Self::default_max_objects_per_peer(),
        }
    }
}

/// Bootstrap configuration - seeds runtime, then runtime owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Node factories to pre-register.
    #[serde(default = "default_factories")]
    pub factories: FactoriesConfig,

    /// Core defaults.
    #[serde(default)]
    pub core: CoreDefaults,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_defaults() {
        let core = CoreDefaults::default();
        assert_eq!(core.application_name, "patchbayd");
        assert_eq!(core.max_objects_per_peer, 4096);
    }

    #[test]
    fn test_factories_default_empty() {
        assert!(default_factories().is_empty());
    }
}
