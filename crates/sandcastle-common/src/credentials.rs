//! Node-management client credentials produced for a cluster
//!
//! Certificate fields hold base64-encoded PEM, exactly as the files on disk do.
//! The admin kubeconfig is produced by the cluster itself and only edited
//! structurally, so it has no typed counterpart here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Node-management API client configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Talosconfig {
    /// Name of the active context
    pub context: String,
    /// Contexts keyed by name
    pub contexts: BTreeMap<String, TalosContext>,
}

/// A node-management API context
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TalosContext {
    /// Addresses the client dials (the VIP or proxy)
    pub endpoints: Vec<String>,
    /// Default target nodes
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Base64 PEM of the OS API CA
    pub ca: String,
    /// Base64 PEM admin client certificate
    pub crt: String,
    /// Base64 PEM admin client key
    pub key: String,
}

impl Talosconfig {
    /// The active context, if the file is consistent
    pub fn current(&self) -> Option<&TalosContext> {
        self.contexts.get(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn talosconfig_current_context() {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            "t1".to_string(),
            TalosContext {
                endpoints: vec!["10.87.13.37".to_string()],
                nodes: vec![],
                ca: "Q0E=".to_string(),
                crt: "Q1JU".to_string(),
                key: "S0VZ".to_string(),
            },
        );
        let tc = Talosconfig {
            context: "t1".to_string(),
            contexts,
        };

        assert_eq!(tc.current().unwrap().endpoints, vec!["10.87.13.37"]);

        let parsed: Talosconfig =
            serde_json::from_value(serde_json::to_value(&tc).unwrap()).unwrap();
        assert_eq!(parsed, tc);
    }
}
