//! kubeadm configuration and invocation.
//!
//! The config is rebuilt from scratch on every reconcile: a typed
//! [`KubeadmParams`] is assembled from the cluster config, then rendered once
//! into the YAML documents of the API family the Kubernetes version calls
//! for.

use std::collections::BTreeMap;

use command_runner::{shell_quote, Cmd};
use semver::Version;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ClusterConfig;
use crate::constants::{
    binary_root, control_plane_endpoint, etcd_data_dir, guest_certs_dir, kubeadm_yaml_path,
    GUEST_MANIFESTS_DIR, KUBELET_RESOLV_CONF,
};
use crate::error::BootstrapError;
use crate::versions::{
    effective_options, parse_version, split_feature_gates, ComponentOptions, APISERVER,
    CONTROLLER_MANAGER, ETCD, KUBEADM, KUBE_PROXY, SCHEDULER,
};

/// kubeadm config API families, oldest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApiFamily {
    /// Before 1.12.
    V1Alpha1,
    /// 1.12 and 1.13.
    V1Alpha3,
    /// 1.14 to 1.16.
    V1Beta1,
    /// 1.17 to 1.22.
    V1Beta2,
    /// 1.23 to 1.30.
    V1Beta3,
    /// 1.31 onwards.
    V1Beta4,
}

impl ApiFamily {
    /// Picks the family for a Kubernetes version.
    pub fn for_version(version: &Version) -> ApiFamily {
        let minor = (version.major, version.minor);
        if minor >= (1, 31) {
            ApiFamily::V1Beta4
        } else if minor >= (1, 23) {
            ApiFamily::V1Beta3
        } else if minor >= (1, 17) {
            ApiFamily::V1Beta2
        } else if minor >= (1, 14) {
            ApiFamily::V1Beta1
        } else if minor >= (1, 12) {
            ApiFamily::V1Alpha3
        } else {
            ApiFamily::V1Alpha1
        }
    }

    /// The `apiVersion` of the kubeadm documents.
    pub fn api_version(&self) -> &'static str {
        match self {
            ApiFamily::V1Alpha1 => "kubeadm.k8s.io/v1alpha1",
            ApiFamily::V1Alpha3 => "kubeadm.k8s.io/v1alpha3",
            ApiFamily::V1Beta1 => "kubeadm.k8s.io/v1beta1",
            ApiFamily::V1Beta2 => "kubeadm.k8s.io/v1beta2",
            ApiFamily::V1Beta3 => "kubeadm.k8s.io/v1beta3",
            ApiFamily::V1Beta4 => "kubeadm.k8s.io/v1beta4",
        }
    }

    /// Document kinds rendered for this family, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds = vec!["InitConfiguration", "ClusterConfiguration", "KubeletConfiguration"];
        if *self >= ApiFamily::V1Beta1 {
            kinds.push("KubeProxyConfiguration");
        }
        kinds
    }

    fn is_alpha(&self) -> bool {
        *self < ApiFamily::V1Beta1
    }
}

/// Everything a kubeadm config is rendered from.
#[derive(Clone, Debug, PartialEq)]
pub struct KubeadmParams {
    /// API family to render.
    pub family: ApiFamily,
    /// Parsed Kubernetes version.
    pub version: Version,
    /// Version string as kubeadm expects it (`v1.23.0`).
    pub kubernetes_version: String,
    /// `cc.name`.
    pub cluster_name: String,
    /// Control plane node name.
    pub node_name: String,
    /// Control plane IP.
    pub advertise_address: String,
    /// API server port.
    pub api_server_port: u16,
    /// CRI socket, `unix://` prefixed from 1.24.
    pub cri_socket: String,
    /// Runtime cgroup driver.
    pub cgroup_driver: String,
    /// Control plane image registry.
    pub image_repository: String,
    /// Pod network.
    pub pod_subnet: String,
    /// Service network.
    pub service_subnet: String,
    /// Cluster DNS domain.
    pub dns_domain: String,
    /// Effective component options.
    pub options: ComponentOptions,
    /// Gates kubeadm understands.
    pub kubeadm_feature_gates: BTreeMap<String, bool>,
    /// Gates passed to components.
    pub component_feature_gates: BTreeMap<String, bool>,
}

impl KubeadmParams {
    /// Builds the parameters for `cc`'s control plane.
    ///
    /// `cni_cidr` is the pod network of the selected CNI; a
    /// `kubeadm.pod-network-cidr` extra option overrides it.
    pub fn new(
        cc: &ClusterConfig,
        cri_socket: &str,
        cgroup_driver: &str,
        cni_cidr: &str,
    ) -> Result<Self, BootstrapError> {
        let k8s = &cc.kubernetes_config;
        let version = parse_version(&k8s.kubernetes_version)?;
        let node = cc.control_plane()?;
        let mut options = effective_options(k8s, &version)?;
        let gates = split_feature_gates(&k8s.feature_gates)?;
        if let Some(flag) = gates.component_flag() {
            for component in [APISERVER, CONTROLLER_MANAGER, SCHEDULER] {
                options.set(component, "feature-gates", flag.clone());
            }
        }
        let pod_subnet = k8s
            .pod_network_cidr_override()
            .unwrap_or(cni_cidr)
            .to_string();

        Ok(KubeadmParams {
            family: ApiFamily::for_version(&version),
            kubernetes_version: format!("v{}", version),
            cri_socket: cri_socket_uri(cri_socket, &version),
            version,
            cluster_name: cc.name.clone(),
            node_name: node.name.clone(),
            advertise_address: node.ip.clone(),
            api_server_port: node.port,
            cgroup_driver: cgroup_driver.to_string(),
            image_repository: k8s.image_repository.clone(),
            pod_subnet,
            service_subnet: k8s.service_cidr.clone(),
            dns_domain: k8s.dns_domain.clone(),
            options,
            kubeadm_feature_gates: gates.kubeadm,
            component_feature_gates: gates.components,
        })
    }

    fn extra_args(&self, component: &str) -> Value {
        self.encode_args(self.options.get(component))
    }

    // v1beta4 switched extraArgs from a map to a list of name/value pairs.
    fn encode_args(&self, args: BTreeMap<String, String>) -> Value {
        if self.family == ApiFamily::V1Beta4 {
            Value::Array(
                args.into_iter()
                    .map(|(name, value)| json!({ "name": name, "value": value }))
                    .collect(),
            )
        } else {
            json!(args)
        }
    }

    fn init_configuration(&self) -> Value {
        let endpoint = json!({
            "advertiseAddress": self.advertise_address,
            "bindPort": self.api_server_port,
        });
        let mut doc = json!({
            "apiVersion": self.family.api_version(),
            "kind": "InitConfiguration",
            "bootstrapTokens": [{
                "groups": ["system:bootstrappers:kubeadm:default-node-token"],
                "ttl": "24h0m0s",
                "usages": ["signing", "authentication"],
            }],
            "nodeRegistration": {
                "criSocket": self.cri_socket,
                "name": self.node_name,
                "kubeletExtraArgs": self.node_ip_args(),
                "taints": [],
            },
        });
        let key = if self.family.is_alpha() {
            "apiEndpoint"
        } else {
            "localAPIEndpoint"
        };
        doc[key] = endpoint;
        doc
    }

    fn node_ip_args(&self) -> Value {
        let mut args = BTreeMap::new();
        args.insert("node-ip".to_string(), self.advertise_address.clone());
        self.encode_args(args)
    }

    fn cluster_configuration(&self) -> Value {
        let mut doc = json!({
            "apiVersion": self.family.api_version(),
            "kind": "ClusterConfiguration",
            "certificatesDir": guest_certs_dir(),
            "clusterName": self.cluster_name,
            "controlPlaneEndpoint": control_plane_endpoint(self.api_server_port),
            "kubernetesVersion": self.kubernetes_version,
            "imageRepository": self.image_repository,
            "networking": {
                "dnsDomain": self.dns_domain,
                "podSubnet": self.pod_subnet,
                "serviceSubnet": self.service_subnet,
            },
            "etcd": {
                "local": {
                    "dataDir": etcd_data_dir(),
                    "extraArgs": self.extra_args(ETCD),
                },
            },
        });
        let cert_sans = json!(["127.0.0.1", "localhost", self.advertise_address]);
        if self.family.is_alpha() {
            doc["apiServerCertSANs"] = cert_sans;
            doc["apiServerExtraArgs"] = self.extra_args(APISERVER);
            doc["controllerManagerExtraArgs"] = self.extra_args(CONTROLLER_MANAGER);
            doc["schedulerExtraArgs"] = self.extra_args(SCHEDULER);
        } else {
            doc["apiServer"] = json!({
                "certSANs": cert_sans,
                "extraArgs": self.extra_args(APISERVER),
            });
            doc["controllerManager"] = json!({ "extraArgs": self.extra_args(CONTROLLER_MANAGER) });
            doc["scheduler"] = json!({ "extraArgs": self.extra_args(SCHEDULER) });
        }
        if !self.kubeadm_feature_gates.is_empty() {
            doc["featureGates"] = json!(self.kubeadm_feature_gates);
        }
        doc
    }

    fn kubelet_configuration(&self) -> Value {
        let mut doc = json!({
            "apiVersion": "kubelet.config.k8s.io/v1beta1",
            "kind": "KubeletConfiguration",
            "authentication": {
                "x509": { "clientCAFile": format!("{}/ca.crt", guest_certs_dir()) },
            },
            "cgroupDriver": self.cgroup_driver,
            "clusterDomain": self.dns_domain,
            "hairpinMode": "hairpin-veth",
            "runtimeRequestTimeout": "15m",
            "failSwapOn": false,
            "staticPodPath": GUEST_MANIFESTS_DIR,
            "imageGCHighThresholdPercent": 100,
            "evictionHard": {
                "nodefs.available": "0%",
                "nodefs.inodesFree": "0%",
                "imagefs.available": "0%",
            },
        });
        if (self.version.major, self.version.minor) == (1, 25) {
            doc["resolvConf"] = json!(KUBELET_RESOLV_CONF);
        }
        if !self.component_feature_gates.is_empty() {
            doc["featureGates"] = json!(self.component_feature_gates);
        }
        doc
    }

    fn kube_proxy_configuration(&self) -> Value {
        let mut doc = json!({
            "apiVersion": "kubeproxy.config.k8s.io/v1alpha1",
            "kind": "KubeProxyConfiguration",
            "clusterCIDR": self.pod_subnet,
            "metricsBindAddress": "0.0.0.0:10249",
            "conntrack": {
                "maxPerCore": 0,
                "tcpEstablishedTimeout": "0s",
                "tcpCloseWaitTimeout": "0s",
            },
        });
        let proxy = self.options.get(KUBE_PROXY);
        if let Value::Object(map) = &mut doc {
            for (k, v) in proxy {
                map.insert(camel_case(&k), Value::String(v));
            }
        }
        if !self.component_feature_gates.is_empty() {
            doc["featureGates"] = json!(self.component_feature_gates);
        }
        doc
    }

    /// The documents of this family, in order.
    pub fn documents(&self) -> Vec<Value> {
        let mut docs = vec![
            self.init_configuration(),
            self.cluster_configuration(),
            self.kubelet_configuration(),
        ];
        if !self.family.is_alpha() {
            docs.push(self.kube_proxy_configuration());
        }
        docs
    }

    /// Renders the config as `---` separated YAML.
    pub fn render(&self) -> anyhow::Result<String> {
        render_documents(&self.documents())
    }

    /// kubeadm options that go on the command line rather than in the config.
    pub fn command_line_flags(&self) -> Vec<String> {
        self.options
            .get(KUBEADM)
            .into_iter()
            .filter(|(k, _)| k != "pod-network-cidr" && k != "ignore-preflight-errors")
            .map(|(k, v)| format!("--{}={}", k, v))
            .collect()
    }
}

fn camel_case(flag: &str) -> String {
    let mut out = String::new();
    let mut upper = false;
    for c in flag.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Serializes documents as one `---` separated YAML stream.
pub fn render_documents(docs: &[Value]) -> anyhow::Result<String> {
    let mut out = String::new();
    for doc in docs {
        let yaml = serde_yaml::to_string(doc)?;
        let body = yaml.trim_start_matches("---").trim_start_matches('\n');
        out.push_str("---\n");
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

/// Prefixes a CRI socket path with `unix://` from 1.24 on.
pub fn cri_socket_uri(socket: &str, version: &Version) -> String {
    if (version.major, version.minor) >= (1, 24) && !socket.contains("://") {
        format!("unix://{}", socket)
    } else {
        socket.to_string()
    }
}

/// Preflight checks `kubeadm init` skips; container hosts skip a few more.
pub fn preflight_ignores(container_driver: bool) -> Vec<String> {
    let mut ignores: Vec<String> = [
        "DirAvailable--etc-kubernetes-manifests",
        "DirAvailable--var-lib-minikube",
        "DirAvailable--var-lib-minikube-etcd",
        "FileAvailable--etc-kubernetes-manifests-kube-scheduler.yaml",
        "FileAvailable--etc-kubernetes-manifests-kube-apiserver.yaml",
        "FileAvailable--etc-kubernetes-manifests-kube-controller-manager.yaml",
        "FileAvailable--etc-kubernetes-manifests-etcd.yaml",
        "Port-10250",
        "Swap",
        "NumCPU",
        "Mem",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if container_driver {
        ignores.push("SystemVerification".to_string());
        ignores.push("FileContent--proc-sys-net-bridge-bridge-nf-call-iptables".to_string());
    }
    ignores
}

/// `sudo env PATH="<binRoot>:$PATH" kubeadm <args>` as a shell command.
pub fn kubeadm_cmd(kubernetes_version: &str, args: &[String]) -> Cmd {
    let rendered = args
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    Cmd::shell(format!(
        "sudo env PATH=\"{}:$PATH\" kubeadm {}",
        binary_root(kubernetes_version),
        rendered
    ))
}

/// The `kubeadm init` invocation for `params`.
pub fn init_cmd(params: &KubeadmParams, container_driver: bool) -> Cmd {
    let mut ignores = preflight_ignores(container_driver);
    if let Some(extra) = params.options.value(KUBEADM, "ignore-preflight-errors") {
        ignores.extend(extra.split(',').map(str::to_string));
    }
    let mut args = vec![
        "init".to_string(),
        format!("--config={}", kubeadm_yaml_path()),
    ];
    args.extend(params.command_line_flags());
    args.push(format!("--ignore-preflight-errors={}", ignores.join(",")));
    kubeadm_cmd(&params.kubernetes_version, &args)
}

/// The `kubeadm reset` invocation.
pub fn reset_cmd(kubernetes_version: &str, cri_socket: &str) -> Cmd {
    kubeadm_cmd(
        kubernetes_version,
        &[
            "reset".to_string(),
            format!("--cri-socket={}", cri_socket),
            "--force".to_string(),
        ],
    )
}

/// Parses a YAML stream into its documents, skipping empty ones.
pub fn parse_documents(yaml: &str) -> anyhow::Result<Vec<Value>> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(doc)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ExtraOption;
    use crate::constants::{CONTAINERD_SOCKET, DEFAULT_POD_CIDR, DOCKER_SOCKET};

    fn cluster(version: &str) -> ClusterConfig {
        let mut cc = ClusterConfig::default_for("minikube", version);
        cc.nodes[0].ip = "192.168.49.2".to_string();
        cc
    }

    fn params(version: &str) -> KubeadmParams {
        KubeadmParams::new(&cluster(version), DOCKER_SOCKET, "cgroupfs", DEFAULT_POD_CIDR).unwrap()
    }

    fn kinds(yaml: &str) -> Vec<String> {
        parse_documents(yaml)
            .unwrap()
            .iter()
            .map(|d| d["kind"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn family_follows_version() {
        let cases = [
            ("1.11.10", ApiFamily::V1Alpha1),
            ("1.12.0", ApiFamily::V1Alpha3),
            ("1.13.5", ApiFamily::V1Alpha3),
            ("1.14.0", ApiFamily::V1Beta1),
            ("1.16.15", ApiFamily::V1Beta1),
            ("1.17.0", ApiFamily::V1Beta2),
            ("1.22.9", ApiFamily::V1Beta2),
            ("1.23.0", ApiFamily::V1Beta3),
            ("1.30.2", ApiFamily::V1Beta3),
            ("1.31.0", ApiFamily::V1Beta4),
        ];
        for (version, family) in cases {
            assert_eq!(ApiFamily::for_version(&Version::parse(version).unwrap()), family, "{}", version);
        }
    }

    #[test]
    fn rendered_kinds_match_family() {
        for version in ["v1.11.0", "v1.12.0", "v1.16.0", "v1.20.0", "v1.23.0", "v1.31.0"] {
            let p = params(version);
            let yaml = p.render().unwrap();
            assert_eq!(kinds(&yaml), p.family.kinds(), "{}", version);
        }
    }

    #[test]
    fn render_is_a_fixed_point() {
        let yaml = params("v1.23.0").render().unwrap();
        let reparsed = parse_documents(&yaml).unwrap();
        assert_eq!(render_documents(&reparsed).unwrap(), yaml);
    }

    #[test]
    fn cluster_invariants_hold() {
        let yaml = params("v1.23.0").render().unwrap();
        let docs = parse_documents(&yaml).unwrap();
        let cluster = &docs[1];
        assert_eq!(cluster["apiVersion"], "kubeadm.k8s.io/v1beta3");
        assert_eq!(cluster["clusterName"], "minikube");
        assert_eq!(cluster["controlPlaneEndpoint"], "control-plane.minikube.internal:8443");
        assert_eq!(cluster["etcd"]["local"]["dataDir"], "/var/lib/minikube/etcd");
        assert_eq!(cluster["networking"]["podSubnet"], DEFAULT_POD_CIDR);
        assert_eq!(cluster["scheduler"]["extraArgs"]["leader-elect"], "false");

        let kubelet = &docs[2];
        assert_eq!(kubelet["failSwapOn"], false);
        assert_eq!(kubelet["imageGCHighThresholdPercent"], 100);
        assert_eq!(kubelet["evictionHard"]["nodefs.available"], "0%");
        assert_eq!(kubelet["hairpinMode"], "hairpin-veth");
        assert_eq!(kubelet["runtimeRequestTimeout"], "15m");
        assert!(kubelet.get("resolvConf").is_none());
    }

    #[test]
    fn resolv_conf_only_on_1_25() {
        let docs = parse_documents(&params("v1.25.3").render().unwrap()).unwrap();
        assert_eq!(docs[2]["resolvConf"], KUBELET_RESOLV_CONF);
        let docs = parse_documents(&params("v1.26.0").render().unwrap()).unwrap();
        assert!(docs[2].get("resolvConf").is_none());
    }

    #[test]
    fn beta4_encodes_extra_args_as_lists() {
        let docs = parse_documents(&params("v1.31.0").render().unwrap()).unwrap();
        let args = docs[1]["scheduler"]["extraArgs"].as_array().unwrap();
        assert!(args.contains(&json!({"name": "leader-elect", "value": "false"})));
    }

    #[test]
    fn alpha_families_use_flat_extra_args() {
        let docs = parse_documents(&params("v1.12.0").render().unwrap()).unwrap();
        assert!(docs[1].get("apiServerExtraArgs").is_some());
        assert!(docs[1].get("apiServer").is_none());
        assert!(docs[0].get("apiEndpoint").is_some());
    }

    #[test]
    fn cri_socket_gets_unix_scheme_from_1_24() {
        let cc = cluster("v1.24.0");
        let p = KubeadmParams::new(&cc, CONTAINERD_SOCKET, "systemd", DEFAULT_POD_CIDR).unwrap();
        assert_eq!(p.cri_socket, "unix:///run/containerd/containerd.sock");
        let p = params("v1.23.0");
        assert_eq!(p.cri_socket, DOCKER_SOCKET);
    }

    #[test]
    fn pod_network_override_wins() {
        let mut cc = cluster("v1.23.0");
        cc.kubernetes_config
            .extra_options
            .push(ExtraOption::new("kubeadm", "pod-network-cidr", "192.168.0.0/16").unwrap());
        let p = KubeadmParams::new(&cc, DOCKER_SOCKET, "cgroupfs", DEFAULT_POD_CIDR).unwrap();
        let docs = parse_documents(&p.render().unwrap()).unwrap();
        assert_eq!(docs[1]["networking"]["podSubnet"], "192.168.0.0/16");
        assert_eq!(docs[3]["clusterCIDR"], "192.168.0.0/16");
        assert!(p.command_line_flags().is_empty());
    }

    #[test]
    fn gated_options_never_render() {
        let mut cc = cluster("v1.19.0");
        cc.kubernetes_config
            .extra_options
            .push(ExtraOption::new("kubelet", "cadvisor-port", "0").unwrap());
        let p = KubeadmParams::new(&cc, DOCKER_SOCKET, "cgroupfs", DEFAULT_POD_CIDR).unwrap();
        assert!(!p.render().unwrap().contains("cadvisor"));
    }

    #[test]
    fn init_command_shape() {
        let mut cc = cluster("v1.23.0");
        cc.kubernetes_config
            .extra_options
            .push(ExtraOption::new("kubeadm", "ignore-preflight-errors", "Port-8443").unwrap());
        let p = KubeadmParams::new(&cc, DOCKER_SOCKET, "cgroupfs", DEFAULT_POD_CIDR).unwrap();
        let line = init_cmd(&p, true).to_string();
        assert!(line.contains(
            "sudo env PATH=\"/var/lib/minikube/binaries/v1.23.0:$PATH\" kubeadm init --config=/var/tmp/minikube/kubeadm.yaml"
        ));
        assert!(line.contains("SystemVerification"));
        assert!(line.contains("Port-8443"));
    }

    #[test]
    fn component_feature_gates_reach_components() {
        let mut cc = cluster("v1.23.0");
        cc.kubernetes_config.feature_gates = "EphemeralContainers=true,PublicKeysECDSA=true".to_string();
        let p = KubeadmParams::new(&cc, DOCKER_SOCKET, "cgroupfs", DEFAULT_POD_CIDR).unwrap();
        let docs = parse_documents(&p.render().unwrap()).unwrap();
        assert_eq!(docs[1]["featureGates"]["PublicKeysECDSA"], true);
        assert_eq!(docs[1]["apiServer"]["extraArgs"]["feature-gates"], "EphemeralContainers=true");
        assert_eq!(docs[2]["featureGates"]["EphemeralContainers"], true);
    }

    #[test]
    fn documents_split_on_any_separator_form() {
        let yaml = "---   \r\nkind: A\r\n---  \nkind: B\n---\nkind: C\n";
        let docs = parse_documents(yaml).unwrap();
        let kinds: Vec<_> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["A", "B", "C"]);
    }
}
