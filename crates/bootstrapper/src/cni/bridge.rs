use async_trait::async_trait;
use command_runner::{Asset, Runner};
use serde_json::{json, Value};

use super::{CniConfig, CniManager};
use crate::constants::{BRIDGE_CONFLIST, CNI_CONF_DIR};
use crate::cruntime::Runtime;
use crate::error::BootstrapError;

/// The bridge plugin. Only works on a single node since every node would hand
/// out addresses from the same range.
#[derive(Clone, Debug)]
pub struct Bridge {
    config: CniConfig,
}

impl Bridge {
    /// Fails for multi-node clusters.
    pub fn new(config: CniConfig) -> Result<Bridge, BootstrapError> {
        if config.nodes > 1 {
            return Err(BootstrapError::config(
                "the bridge CNI does not work with multi-node clusters, use kindnet instead",
            ));
        }
        Ok(Bridge { config })
    }

    fn ipam(&self) -> Value {
        match (&self.config.pod_cidr_v4, &self.config.pod_cidr_v6) {
            (Some(v4), Some(v6)) => json!({
                "type": "host-local",
                "ranges": [[{ "subnet": v4 }], [{ "subnet": v6 }]],
            }),
            (None, Some(v6)) => json!({ "type": "host-local", "subnet": v6 }),
            _ => json!({ "type": "host-local", "subnet": self.config.cidr() }),
        }
    }

    /// The conflist, plugins in the order bridge, portmap, firewall.
    /// Masquerading is on only for IPv4-only clusters.
    pub fn conflist(&self) -> Value {
        let ipv4_only = self.config.pod_cidr_v6.is_none();
        json!({
            "cniVersion": "0.3.1",
            "name": "bridge",
            "plugins": [
                {
                    "type": "bridge",
                    "bridge": "bridge",
                    "addIf": "true",
                    "isDefaultGateway": true,
                    "forceAddress": false,
                    "ipMasq": ipv4_only,
                    "hairpinMode": true,
                    "ipam": self.ipam(),
                },
                {
                    "type": "portmap",
                    "capabilities": { "portMappings": true },
                },
                {
                    "type": "firewall",
                },
            ],
        })
    }
}

#[async_trait]
impl CniManager for Bridge {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn cidr(&self) -> String {
        self.config.cidr()
    }

    async fn apply(&self, runner: &dyn Runner, _runtime: &Runtime) -> anyhow::Result<()> {
        let contents = serde_json::to_vec_pretty(&self.conflist())?;
        runner
            .copy(&Asset::from_bytes(contents, CNI_CONF_DIR, BRIDGE_CONFLIST, "0644")?)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bridge(v4: Option<&str>, v6: Option<&str>) -> Bridge {
        Bridge::new(CniConfig {
            kubernetes_version: "v1.23.0".to_string(),
            pod_cidr_v4: v4.map(String::from),
            pod_cidr_v6: v6.map(String::from),
            nodes: 1,
        })
        .unwrap()
    }

    #[test]
    fn ipv4_only_masquerades() {
        let cfg = bridge(Some("10.244.0.0/16"), None).conflist();
        let plugin = &cfg["plugins"][0];
        assert_eq!(plugin["ipMasq"], true);
        assert_eq!(plugin["ipam"]["type"], "host-local");
        assert_eq!(plugin["ipam"]["subnet"], "10.244.0.0/16");
        let types: Vec<_> = cfg["plugins"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["bridge", "portmap", "firewall"]);
    }

    #[test]
    fn ipv6_only_does_not_masquerade() {
        let cfg = bridge(None, Some("fd00:10:244::/64")).conflist();
        let plugin = &cfg["plugins"][0];
        assert_eq!(plugin["ipMasq"], false);
        assert_eq!(plugin["ipam"]["subnet"], "fd00:10:244::/64");
    }

    #[test]
    fn dual_stack_has_two_ranges() {
        let cfg = bridge(Some("10.244.0.0/16"), Some("fd00:10:244::/64")).conflist();
        let plugin = &cfg["plugins"][0];
        assert_eq!(plugin["ipMasq"], false);
        assert_eq!(plugin["ipam"]["ranges"].as_array().unwrap().len(), 2);
        assert_eq!(plugin["ipam"]["ranges"][1][0]["subnet"], "fd00:10:244::/64");
        assert!(plugin["ipam"].get("subnet").is_none());
    }
}
