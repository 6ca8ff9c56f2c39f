//! Version-aware component options and feature gates.
//!
//! Defaults are an ordered list of rules, each gated on an inclusive semver
//! range. The effective options for a version are a fold over that list
//! followed by the user's extra options; later entries win.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use semver::Version;
use tracing::debug;

use crate::config::{ExtraOption, KubernetesConfig};
use crate::constants::GUEST_MANIFESTS_DIR;
use crate::error::BootstrapError;

/// Component names.
pub const APISERVER: &str = "apiserver";
/// Component names.
pub const CONTROLLER_MANAGER: &str = "controller-manager";
/// Component names.
pub const SCHEDULER: &str = "scheduler";
/// Component names.
pub const ETCD: &str = "etcd";
/// Component names.
pub const KUBEADM: &str = "kubeadm";
/// Component names.
pub const KUBE_PROXY: &str = "kube-proxy";
/// Component names.
pub const KUBELET: &str = "kubelet";

/// kubeadm flags that may be passed on the command line alongside
/// `--config`. Every other kubeadm option is rejected.
pub const KUBEADM_FLAG_WHITELIST: &[&str] = &[
    "ignore-preflight-errors",
    "dry-run",
    "kubeconfig",
    "kubeconfig-dir",
    "node-name",
    "cri-socket",
    "experimental-upload-certs",
    "certificate-key",
    "rootfs",
    "skip-phases",
    "pod-network-cidr",
];

/// Feature gates kubeadm itself understands; they go into the kubeadm
/// config rather than onto components.
pub const KUBEADM_FEATURE_GATES: &[&str] = &[
    "CoreDNS",
    "SelfHosting",
    "StoreCertsInSecrets",
    "DynamicKubeletConfig",
    "Auditing",
    "IPv6DualStack",
    "PublicKeysECDSA",
    "RootlessControlPlane",
    "EtcdLearnerMode",
    "UpgradeAddonsBeforeControlPlane",
    "WaitForAllControlPlaneComponents",
    "ControlPlaneKubeletLocalMode",
    "NodeLocalCRISocket",
];

/// Admission plugins enabled from 1.11.
pub const DEFAULT_ADMISSION_PLUGINS: &[&str] = &[
    "NamespaceLifecycle",
    "LimitRanger",
    "ServiceAccount",
    "DefaultStorageClass",
    "DefaultTolerationSeconds",
    "NodeRestriction",
    "MutatingAdmissionWebhook",
    "ValidatingAdmissionWebhook",
    "ResourceQuota",
];

/// Admission controllers for 1.9 and 1.10.
pub const LEGACY_ADMISSION_CONTROLLERS: &[&str] = &[
    "Initializers",
    "NamespaceLifecycle",
    "LimitRanger",
    "ServiceAccount",
    "DefaultStorageClass",
    "DefaultTolerationSeconds",
    "NodeRestriction",
    "MutatingAdmissionWebhook",
    "ValidatingAdmissionWebhook",
    "ResourceQuota",
];

/// The `v`-prefixed form of a version, as used in guest and cache paths.
/// `1.23`, `1.23.0` and `v1.23.0` all become `v1.23.0`.
pub fn version_tag(s: &str) -> String {
    match parse_version(s) {
        Ok(v) => format!("v{}", v),
        Err(_) => format!("v{}", s.trim().trim_start_matches('v')),
    }
}

/// Parses a Kubernetes version, with or without a leading `v`. A missing
/// patch component is taken as `.0`.
pub fn parse_version(s: &str) -> Result<Version, BootstrapError> {
    let trimmed = s.trim().trim_start_matches('v');
    let parsed = Version::parse(trimmed).or_else(|e| {
        if trimmed.matches('.').count() == 1 {
            Version::parse(&format!("{}.0", trimmed))
        } else {
            Err(e)
        }
    });
    parsed.map_err(|e| BootstrapError::config(format!("invalid Kubernetes version {:?}: {}", s, e)))
}

fn v(s: &str) -> Version {
    Version::parse(s).expect("version literals in this module are valid semver")
}

/// An inclusive semver range; either bound may be open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionRange {
    /// Lowest included version.
    pub gte: Option<Version>,
    /// Highest included version.
    pub lte: Option<Version>,
}

impl VersionRange {
    /// A range with no bounds.
    pub fn any() -> Self {
        VersionRange::default()
    }

    /// Versions at or above `gte`.
    pub fn at_least(gte: &str) -> Self {
        VersionRange {
            gte: Some(v(gte)),
            lte: None,
        }
    }

    /// Versions at or below `lte`.
    pub fn at_most(lte: &str) -> Self {
        VersionRange {
            gte: None,
            lte: Some(v(lte)),
        }
    }

    /// Versions within `[gte, lte]`.
    pub fn between(gte: &str, lte: &str) -> Self {
        VersionRange {
            gte: Some(v(gte)),
            lte: Some(v(lte)),
        }
    }

    /// Whether `version` falls in the range.
    pub fn contains(&self, version: &Version) -> bool {
        self.gte.as_ref().map_or(true, |g| version >= g)
            && self.lte.as_ref().map_or(true, |l| version <= l)
    }
}

/// An option gated on a version range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedOption {
    /// The option.
    pub option: ExtraOption,
    /// Versions it applies to.
    pub range: VersionRange,
}

fn rule(component: &str, key: &str, value: &str, range: VersionRange) -> VersionedOption {
    VersionedOption {
        option: ExtraOption {
            component: component.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        },
        range,
    }
}

lazy_static! {
    /// Version-gated defaults, in evaluation order.
    pub static ref DEFAULT_OPTIONS: Vec<VersionedOption> = vec![
        rule(KUBELET, "fail-swap-on", "false", VersionRange::at_least("1.8.0-alpha.0")),
        rule(KUBELET, "kubeconfig", "/etc/kubernetes/kubelet.conf", VersionRange::any()),
        rule(KUBELET, "bootstrap-kubeconfig", "/etc/kubernetes/bootstrap-kubelet.conf", VersionRange::any()),
        rule(KUBELET, "require-kubeconfig", "true", VersionRange::at_most("1.9.10")),
        rule(KUBELET, "pod-manifest-path", GUEST_MANIFESTS_DIR, VersionRange::at_most("1.11.1000")),
        rule(KUBELET, "allow-privileged", "true", VersionRange::at_most("1.15.0-alpha.3")),
        rule(KUBELET, "config", "/var/lib/kubelet/config.yaml", VersionRange::any()),
        rule(KUBELET, "cadvisor-port", "0", VersionRange::at_most("1.11.1000")),
        rule(
            APISERVER,
            "admission-control",
            &LEGACY_ADMISSION_CONTROLLERS.join(","),
            VersionRange::between("1.9.0-alpha.0", "1.10.1000"),
        ),
        rule(
            APISERVER,
            "enable-admission-plugins",
            &DEFAULT_ADMISSION_PLUGINS.join(","),
            VersionRange::at_least("1.11.0-alpha.0"),
        ),
        rule(CONTROLLER_MANAGER, "allocate-node-cidrs", "true", VersionRange::any()),
        rule(CONTROLLER_MANAGER, "leader-elect", "false", VersionRange::at_least("1.14.0")),
        rule(SCHEDULER, "leader-elect", "false", VersionRange::at_least("1.14.0")),
        rule(ETCD, "proxy-refresh-interval", "70000", VersionRange::any()),
    ];
}

/// Effective options per component, keyed by flag name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentOptions(BTreeMap<String, BTreeMap<String, String>>);

impl ComponentOptions {
    /// Options for `component`, empty if none.
    pub fn get(&self, component: &str) -> BTreeMap<String, String> {
        self.0.get(component).cloned().unwrap_or_default()
    }

    /// A single option.
    pub fn value(&self, component: &str, key: &str) -> Option<&str> {
        self.0
            .get(component)
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }

    /// Sets an option, replacing any previous value.
    pub fn set(&mut self, component: &str, key: &str, value: impl Into<String>) {
        self.0
            .entry(component.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Removes an option.
    pub fn unset(&mut self, component: &str, key: &str) -> Option<String> {
        self.0.get_mut(component).and_then(|m| m.remove(key))
    }
}

/// Checks that a kubeadm option is one kubeadm accepts on the command line.
pub fn validate_kubeadm_option(opt: &ExtraOption) -> Result<(), BootstrapError> {
    if opt.component == KUBEADM && !KUBEADM_FLAG_WHITELIST.contains(&opt.key.as_str()) {
        return Err(BootstrapError::config(format!(
            "kubeadm does not accept {:?} alongside --config; accepted options are {}",
            opt.key,
            KUBEADM_FLAG_WHITELIST.join(", ")
        )));
    }
    Ok(())
}

/// Computes the effective options for `version`.
///
/// Defaults whose range excludes `version` are dropped. User options replace
/// defaults with the same component and key; a user option that matches a
/// version-gated default inherits its range and is dropped with it.
pub fn effective_options(
    k8s: &KubernetesConfig,
    version: &Version,
) -> Result<ComponentOptions, BootstrapError> {
    let mut opts = ComponentOptions::default();
    for rule in DEFAULT_OPTIONS.iter() {
        if rule.range.contains(version) {
            opts.set(&rule.option.component, &rule.option.key, rule.option.value.clone());
        }
    }
    for extra in &k8s.extra_options {
        validate_kubeadm_option(extra)?;
        let gated = DEFAULT_OPTIONS.iter().find(|r| {
            r.option.component == extra.component && r.option.key == extra.key
        });
        if let Some(r) = gated {
            if !r.range.contains(version) {
                debug!(option = %extra, %version, "option does not apply to this version, dropping");
                continue;
            }
        }
        opts.set(&extra.component, &extra.key, extra.value.clone());
    }
    Ok(opts)
}

/// Feature gates split by who consumes them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates {
    /// Gates kubeadm understands.
    pub kubeadm: BTreeMap<String, bool>,
    /// Gates passed to the components.
    pub components: BTreeMap<String, bool>,
}

impl FeatureGates {
    /// Renders the component gates as a `feature-gates` flag value.
    pub fn component_flag(&self) -> Option<String> {
        if self.components.is_empty() {
            return None;
        }
        Some(
            self.components
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Parses comma separated `Name=bool` gates and splits them.
pub fn split_feature_gates(csv: &str) -> Result<FeatureGates, BootstrapError> {
    let mut gates = FeatureGates::default();
    for entry in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| BootstrapError::config(format!("feature gate {:?} is not Name=bool", entry)))?;
        let enabled: bool = value.trim().parse().map_err(|_| {
            BootstrapError::config(format!("feature gate {:?} must be true or false", entry))
        })?;
        let name = name.trim().to_string();
        if KUBEADM_FEATURE_GATES.contains(&name.as_str()) {
            gates.kubeadm.insert(name, enabled);
        } else {
            gates.components.insert(name, enabled);
        }
    }
    Ok(gates)
}
