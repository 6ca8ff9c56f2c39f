//! Cluster configuration.
//!
//! [`ClusterConfig`] is the desired state a reconcile works towards. It is
//! owned and persisted by the caller; the bootstrapper only reads it. Use
//! [`ClusterConfig::default_for`] for a single-node config with every default
//! set, or turn on the "cli" feature and use [`Config::new_from_flags`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::constants::{
    API_SERVER_PORT, DEFAULT_CLUSTER_NAME, DEFAULT_DNS_DOMAIN, DEFAULT_IMAGE_REPOSITORY,
    DEFAULT_KUBERNETES_VERSION, DEFAULT_POD_CIDR, DEFAULT_SERVICE_CIDR,
};
use crate::error::BootstrapError;

/// Components an extra option may target.
pub const COMPONENTS: &[&str] = &[
    "apiserver",
    "controller-manager",
    "scheduler",
    "etcd",
    "kubeadm",
    "kube-proxy",
    "kubelet",
];

/// A user-supplied `component.key=value` setting. Serialized in that same
/// string form, so a persisted config goes through the component check too.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtraOption {
    /// One of [`COMPONENTS`].
    pub component: String,
    /// Flag name without leading dashes.
    pub key: String,
    /// Flag value.
    pub value: String,
}

impl ExtraOption {
    /// Creates an option, rejecting unknown components.
    pub fn new(
        component: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, BootstrapError> {
        let component = component.into();
        if !COMPONENTS.contains(&component.as_str()) {
            return Err(BootstrapError::config(format!(
                "unknown component {:?}, expected one of {}",
                component,
                COMPONENTS.join(", ")
            )));
        }
        Ok(ExtraOption {
            component,
            key: key.into(),
            value: value.into(),
        })
    }
}

impl FromStr for ExtraOption {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lhs, value) = s.split_once('=').ok_or_else(|| {
            BootstrapError::config(format!("extra option {:?} is not component.key=value", s))
        })?;
        let (component, key) = lhs.split_once('.').ok_or_else(|| {
            BootstrapError::config(format!("extra option {:?} is not component.key=value", s))
        })?;
        if key.is_empty() {
            return Err(BootstrapError::config(format!("extra option {:?} has no key", s)));
        }
        ExtraOption::new(component, key, value)
    }
}

impl TryFrom<String> for ExtraOption {
    type Error = BootstrapError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ExtraOption> for String {
    fn from(opt: ExtraOption) -> String {
        opt.to_string()
    }
}

impl fmt::Display for ExtraOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.component, self.key, self.value)
    }
}

/// Which IP families the pod network uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
    /// Both.
    Dual,
}

impl Default for IpFamily {
    fn default() -> Self {
        IpFamily::Ipv4
    }
}

impl FromStr for IpFamily {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" | "" => Ok(IpFamily::Ipv4),
            "ipv6" => Ok(IpFamily::Ipv6),
            "dual" => Ok(IpFamily::Dual),
            other => Err(BootstrapError::config(format!("unknown ip family {:?}", other))),
        }
    }
}

/// Kubernetes settings for a cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesConfig {
    /// Requested version, e.g. `v1.23.0`.
    pub kubernetes_version: String,
    /// Cluster name.
    pub cluster_name: String,
    /// Registry control plane images are pulled from.
    pub image_repository: String,
    /// `docker`, `containerd`, `crio`, `rkt` or `remote`.
    pub container_runtime: String,
    /// CRI socket override, used by the `remote` runtime.
    pub cri_socket: Option<String>,
    /// Legacy network plugin setting (`cni` or empty).
    pub network_plugin: String,
    /// Requested CNI: empty/`auto`/`true` to pick a default, or a CNI name or
    /// a path to a manifest.
    pub cni: String,
    /// Service network.
    pub service_cidr: String,
    /// IPv4 pod network.
    pub pod_cidr_v4: Option<String>,
    /// IPv6 pod network.
    pub pod_cidr_v6: Option<String>,
    /// Pod network families.
    pub ip_family: IpFamily,
    /// Cluster DNS domain.
    pub dns_domain: String,
    /// Comma separated `Name=bool` feature gates.
    pub feature_gates: String,
    /// Extra component options.
    pub extra_options: Vec<ExtraOption>,
    /// Registries the runtime may reach without TLS.
    pub insecure_registries: Vec<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        KubernetesConfig {
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            container_runtime: "docker".to_string(),
            cri_socket: None,
            network_plugin: String::new(),
            cni: String::new(),
            service_cidr: DEFAULT_SERVICE_CIDR.to_string(),
            pod_cidr_v4: None,
            pod_cidr_v6: None,
            ip_family: IpFamily::Ipv4,
            dns_domain: DEFAULT_DNS_DOMAIN.to_string(),
            feature_gates: String::new(),
            extra_options: Vec::new(),
            insecure_registries: Vec::new(),
        }
    }
}

impl KubernetesConfig {
    /// The first extra option for `component.key`, if any.
    pub fn extra_option(&self, component: &str, key: &str) -> Option<&str> {
        self.extra_options
            .iter()
            .find(|o| o.component == component && o.key == key)
            .map(|o| o.value.as_str())
    }

    /// The `kubeadm.pod-network-cidr` override, if set.
    pub fn pod_network_cidr_override(&self) -> Option<&str> {
        self.extra_option("kubeadm", "pod-network-cidr")
    }

    /// The IPv4 and IPv6 pod networks implied by the IP family, with the
    /// default IPv4 network filled in.
    pub fn pod_cidrs(&self) -> Result<(Option<String>, Option<String>), BootstrapError> {
        let v4 = self.pod_cidr_v4.clone();
        let v6 = self.pod_cidr_v6.clone();
        match self.ip_family {
            IpFamily::Ipv4 => {
                if v6.is_some() {
                    return Err(BootstrapError::config(
                        "an IPv6 pod network was given for an IPv4 cluster",
                    ));
                }
                Ok((Some(v4.unwrap_or_else(|| DEFAULT_POD_CIDR.to_string())), None))
            }
            IpFamily::Ipv6 => match (v4, v6) {
                (Some(_), _) => Err(BootstrapError::config(
                    "an IPv4 pod network was given for an IPv6 cluster",
                )),
                (None, None) => Err(BootstrapError::config(
                    "an IPv6 cluster needs an IPv6 pod network",
                )),
                (None, v6) => Ok((None, v6)),
            },
            IpFamily::Dual => match v6 {
                None => Err(BootstrapError::config(
                    "a dual-stack cluster needs an IPv6 pod network",
                )),
                v6 => Ok((Some(v4.unwrap_or_else(|| DEFAULT_POD_CIDR.to_string())), v6)),
            },
        }
    }
}

/// One machine in the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    /// Node name.
    pub name: String,
    /// Node IP.
    pub ip: String,
    /// API server port (control plane) or kubelet port.
    pub port: u16,
    /// Whether this node runs the control plane.
    pub control_plane: bool,
    /// Whether this node only runs workloads.
    pub worker: bool,
    /// Kubernetes version on this node.
    pub kubernetes_version: String,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            name: String::new(),
            ip: String::new(),
            port: API_SERVER_PORT,
            control_plane: true,
            worker: true,
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
        }
    }
}

/// A pending scheduled stop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledStop {
    /// When the stop was requested.
    pub initiation_time: DateTime<Utc>,
    /// Seconds after initiation the cluster stops.
    pub duration_secs: u64,
}

impl ScheduledStop {
    /// When the cluster stops.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.initiation_time + chrono::Duration::seconds(self.duration_secs as i64)
    }
}

/// Desired state of a cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Profile name.
    pub name: String,
    /// Driver name, e.g. `docker`, `podman`, `kvm2`, `none`.
    pub driver: String,
    /// Kubernetes settings.
    pub kubernetes_config: KubernetesConfig,
    /// Nodes; exactly one is the control plane.
    pub nodes: Vec<Node>,
    /// Addon name to enabled.
    pub addons: BTreeMap<String, bool>,
    /// Per-addon image overrides, keyed by image name.
    pub custom_addon_images: BTreeMap<String, String>,
    /// Per-addon registry overrides, keyed by image name.
    pub custom_addon_registries: BTreeMap<String, String>,
    /// First address handed out by the load balancer addon.
    pub load_balancer_start_ip: String,
    /// Last address handed out by the load balancer addon.
    pub load_balancer_end_ip: String,
    /// `namespace/secret` of a custom default ingress certificate.
    pub custom_ingress_cert: String,
    /// Pending scheduled stop.
    pub scheduled_stop: Option<ScheduledStop>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig::default_for(DEFAULT_CLUSTER_NAME, DEFAULT_KUBERNETES_VERSION)
    }
}

impl ClusterConfig {
    /// A single-node config with every default set.
    pub fn default_for(name: &str, version: &str) -> Self {
        let mut addons = BTreeMap::new();
        addons.insert("storage-provisioner".to_string(), true);
        addons.insert("default-storageclass".to_string(), true);
        ClusterConfig {
            name: name.to_string(),
            driver: "docker".to_string(),
            kubernetes_config: KubernetesConfig {
                kubernetes_version: version.to_string(),
                cluster_name: name.to_string(),
                ..Default::default()
            },
            nodes: vec![Node {
                name: name.to_string(),
                kubernetes_version: version.to_string(),
                ..Default::default()
            }],
            addons,
            custom_addon_images: BTreeMap::new(),
            custom_addon_registries: BTreeMap::new(),
            load_balancer_start_ip: String::new(),
            load_balancer_end_ip: String::new(),
            custom_ingress_cert: String::new(),
            scheduled_stop: None,
        }
    }

    /// The control plane node.
    pub fn control_plane(&self) -> Result<&Node, BootstrapError> {
        let mut planes = self.nodes.iter().filter(|n| n.control_plane);
        match (planes.next(), planes.next()) {
            (Some(n), None) => Ok(n),
            (None, _) => Err(BootstrapError::config(format!(
                "cluster {} has no control plane node",
                self.name
            ))),
            (Some(_), Some(_)) => Err(BootstrapError::config(format!(
                "cluster {} has more than one control plane node",
                self.name
            ))),
        }
    }

    /// Whether an addon is enabled.
    pub fn addon_enabled(&self, name: &str) -> bool {
        self.addons.get(name).copied().unwrap_or(false)
    }

    /// Checks the structural invariants: a version, one control plane and
    /// consistent pod networks.
    pub fn validate(&self) -> Result<(), BootstrapError> {
        crate::versions::parse_version(&self.kubernetes_config.kubernetes_version)?;
        self.control_plane()?;
        self.kubernetes_config.pod_cidrs()?;
        Ok(())
    }
}

/// How the bootstrapper reaches the host it provisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// This machine (the "none" driver).
    Local,
    /// A container driven with `<binary> exec`.
    Oci {
        /// `docker` or `podman`.
        binary: String,
        /// Container name.
        container: String,
    },
    /// A VM reached over SSH.
    Ssh {
        /// Hostname or IP.
        host: String,
        /// sshd port.
        port: u16,
        /// Login user.
        user: String,
        /// Private key path.
        key_path: PathBuf,
    },
}

/// Everything the `minikube-bootstrap` binary needs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Desired cluster state.
    pub cluster: ClusterConfig,
    /// Host to provision.
    pub target: Target,
    /// Local binary cache root.
    pub cache_dir: PathBuf,
    /// Host-side kubeconfig for API calls, when reachable.
    pub kubeconfig: Option<PathBuf>,
    /// Tear the cluster down instead of bootstrapping it.
    pub delete: bool,
    /// After bootstrapping, keep re-applying addons at this interval until
    /// interrupted.
    pub addon_reconcile_interval: Option<std::time::Duration>,
}

impl Config {
    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(feature = "cli")]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Config::from_opts(opts)
    }

    /// Builds a config from parsed flags.
    #[cfg(feature = "cli")]
    pub fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let mut cluster = ClusterConfig::default_for(&opts.profile, &opts.kubernetes_version);
        cluster.driver = opts.driver.clone();

        let k8s = &mut cluster.kubernetes_config;
        k8s.container_runtime = opts.container_runtime.clone();
        k8s.cri_socket = opts.cri_socket.clone();
        k8s.cni = opts.cni.clone();
        k8s.image_repository = opts.image_repository.clone();
        k8s.service_cidr = opts.service_cluster_ip_range.clone();
        k8s.pod_cidr_v4 = opts.pod_cidr.clone();
        k8s.pod_cidr_v6 = opts.pod_cidr_v6.clone();
        k8s.ip_family = opts.ip_family.parse()?;
        k8s.dns_domain = opts.dns_domain.clone();
        k8s.feature_gates = opts.feature_gates.clone();
        k8s.insecure_registries = opts.insecure_registry.clone();
        k8s.extra_options = opts
            .extra_config
            .iter()
            .map(|s| s.parse())
            .collect::<Result<_, _>>()?;

        let node = &mut cluster.nodes[0];
        node.port = opts.apiserver_port;
        node.ip = opts.node_ip.clone().unwrap_or_default();
        for i in 1..opts.nodes {
            cluster.nodes.push(Node {
                name: format!("{}-m{:02}", opts.profile, i + 1),
                control_plane: false,
                kubernetes_version: opts.kubernetes_version.clone(),
                ..Default::default()
            });
        }
        for addon in &opts.addons {
            cluster.addons.insert(addon.clone(), true);
        }
        for addon in &opts.disable_addons {
            cluster.addons.insert(addon.clone(), false);
        }
        cluster.load_balancer_start_ip = opts.load_balancer_start_ip.clone().unwrap_or_default();
        cluster.load_balancer_end_ip = opts.load_balancer_end_ip.clone().unwrap_or_default();
        cluster.validate()?;

        let target = match opts.driver.as_str() {
            "none" => Target::Local,
            "docker" | "podman" => Target::Oci {
                binary: opts.driver.clone(),
                container: opts.container_name.clone().unwrap_or_else(|| opts.profile.clone()),
            },
            _ => Target::Ssh {
                host: opts
                    .ssh_ip_address
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--ssh-ip-address is required for driver {}", opts.driver))?,
                port: opts.ssh_port,
                user: opts.ssh_user.clone(),
                key_path: opts
                    .ssh_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--ssh-key is required for driver {}", opts.driver))?,
            },
        };
        let cache_dir = match opts.cache_dir {
            Some(d) => d,
            None => default_cache_dir()?,
        };
        Ok(Config {
            cluster,
            target,
            cache_dir,
            kubeconfig: opts.kubeconfig,
            delete: opts.delete,
            addon_reconcile_interval: opts
                .watch_addons
                .then(|| std::time::Duration::from_secs(opts.addon_reconcile_secs)),
        })
    }
}

/// `$HOME/.minikube/cache`.
pub fn default_cache_dir() -> anyhow::Result<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Unable to get home directory"))?
        .join(".minikube")
        .join("cache"))
}

/// CLI options for the bootstrapper.
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
#[structopt(
    name = "minikube-bootstrap",
    about = "Bootstraps a single-node Kubernetes control plane inside a container or VM"
)]
pub struct Opts {
    #[structopt(
        short = "p",
        long = "profile",
        default_value = DEFAULT_CLUSTER_NAME,
        env = "MINIKUBE_PROFILE",
        help = "The cluster (profile) name"
    )]
    profile: String,

    #[structopt(
        long = "kubernetes-version",
        default_value = DEFAULT_KUBERNETES_VERSION,
        env = "MINIKUBE_KUBERNETES_VERSION",
        help = "The Kubernetes version to bootstrap"
    )]
    kubernetes_version: String,

    #[structopt(
        long = "driver",
        default_value = "docker",
        env = "MINIKUBE_DRIVER",
        help = "The driver the host was created with: none, docker, podman or any VM driver reachable over SSH"
    )]
    driver: String,

    #[structopt(
        long = "container-runtime",
        default_value = "docker",
        env = "MINIKUBE_CONTAINER_RUNTIME",
        help = "The container runtime: docker, containerd, cri-o, rkt or remote"
    )]
    container_runtime: String,

    #[structopt(
        long = "cri-socket",
        env = "MINIKUBE_CRI_SOCKET",
        help = "The CRI socket path, for the remote runtime"
    )]
    cri_socket: Option<String>,

    #[structopt(
        long = "cni",
        default_value = "auto",
        env = "MINIKUBE_CNI",
        help = "CNI plug-in: auto, bridge, calico, cilium, flannel, kindnet, false, or a path to a CNI manifest"
    )]
    cni: String,

    #[structopt(
        long = "image-repository",
        default_value = DEFAULT_IMAGE_REPOSITORY,
        env = "MINIKUBE_IMAGE_REPOSITORY",
        help = "The registry control plane images are pulled from"
    )]
    image_repository: String,

    #[structopt(
        long = "service-cluster-ip-range",
        default_value = DEFAULT_SERVICE_CIDR,
        env = "MINIKUBE_SERVICE_CLUSTER_IP_RANGE",
        help = "The CIDR used for service cluster IPs"
    )]
    service_cluster_ip_range: String,

    #[structopt(long = "pod-cidr", env = "MINIKUBE_POD_CIDR", help = "The IPv4 pod network")]
    pod_cidr: Option<String>,

    #[structopt(long = "pod-cidr-v6", env = "MINIKUBE_POD_CIDR_V6", help = "The IPv6 pod network")]
    pod_cidr_v6: Option<String>,

    #[structopt(
        long = "ip-family",
        default_value = "ipv4",
        env = "MINIKUBE_IP_FAMILY",
        help = "The pod network IP family: ipv4, ipv6 or dual"
    )]
    ip_family: String,

    #[structopt(
        long = "dns-domain",
        default_value = DEFAULT_DNS_DOMAIN,
        env = "MINIKUBE_DNS_DOMAIN",
        help = "The cluster DNS domain"
    )]
    dns_domain: String,

    #[structopt(
        long = "feature-gates",
        default_value = "",
        env = "MINIKUBE_FEATURE_GATES",
        help = "Comma separated Name=bool feature gates"
    )]
    feature_gates: String,

    #[structopt(
        long = "extra-config",
        env = "MINIKUBE_EXTRA_CONFIG",
        help = "A component.key=value setting passed to a Kubernetes component. May be repeated"
    )]
    extra_config: Vec<String>,

    #[structopt(
        long = "insecure-registry",
        env = "MINIKUBE_INSECURE_REGISTRY",
        use_delimiter = true,
        help = "Registries the container runtime may reach without TLS"
    )]
    insecure_registry: Vec<String>,

    #[structopt(
        long = "addons",
        env = "MINIKUBE_ADDONS",
        use_delimiter = true,
        help = "Addons to enable in addition to the defaults"
    )]
    addons: Vec<String>,

    #[structopt(
        long = "disable-addons",
        env = "MINIKUBE_DISABLE_ADDONS",
        use_delimiter = true,
        help = "Addons to leave disabled"
    )]
    disable_addons: Vec<String>,

    #[structopt(
        short = "n",
        long = "nodes",
        default_value = "1",
        env = "MINIKUBE_NODES",
        help = "Number of nodes in the cluster"
    )]
    nodes: usize,

    #[structopt(
        long = "apiserver-port",
        default_value = "8443",
        env = "MINIKUBE_APISERVER_PORT",
        help = "The port the API server listens on"
    )]
    apiserver_port: u16,

    #[structopt(long = "node-ip", env = "MINIKUBE_NODE_IP", help = "The control plane node's IP")]
    node_ip: Option<String>,

    #[structopt(
        long = "container-name",
        env = "MINIKUBE_CONTAINER_NAME",
        help = "The container to provision for container drivers. Defaults to the profile name"
    )]
    container_name: Option<String>,

    #[structopt(long = "ssh-ip-address", env = "MINIKUBE_SSH_IP_ADDRESS", help = "The VM's address")]
    ssh_ip_address: Option<String>,

    #[structopt(
        long = "ssh-port",
        default_value = "22",
        env = "MINIKUBE_SSH_PORT",
        help = "The VM's SSH port"
    )]
    ssh_port: u16,

    #[structopt(
        long = "ssh-user",
        default_value = "docker",
        env = "MINIKUBE_SSH_USER",
        help = "The VM's SSH user"
    )]
    ssh_user: String,

    #[structopt(long = "ssh-key", env = "MINIKUBE_SSH_KEY", help = "The VM's SSH private key")]
    ssh_key: Option<PathBuf>,

    #[structopt(
        long = "load-balancer-start-ip",
        env = "MINIKUBE_LOAD_BALANCER_START_IP",
        help = "First address handed out by the metallb addon"
    )]
    load_balancer_start_ip: Option<String>,

    #[structopt(
        long = "load-balancer-end-ip",
        env = "MINIKUBE_LOAD_BALANCER_END_IP",
        help = "Last address handed out by the metallb addon"
    )]
    load_balancer_end_ip: Option<String>,

    #[structopt(
        long = "cache-dir",
        env = "MINIKUBE_CACHE_DIR",
        help = "Local binary cache. Defaults to $HOME/.minikube/cache"
    )]
    cache_dir: Option<PathBuf>,

    #[structopt(
        long = "kubeconfig",
        env = "MINIKUBE_KUBECONFIG",
        help = "A host-side kubeconfig for the new cluster. When unset, API calls go through the guest kubectl"
    )]
    kubeconfig: Option<PathBuf>,

    #[structopt(long = "delete", help = "Stop kubelet and reset the control plane instead of bootstrapping")]
    delete: bool,

    #[structopt(
        long = "watch-addons",
        help = "Keep reconciling addons after bootstrapping until interrupted"
    )]
    watch_addons: bool,

    #[structopt(
        long = "addon-reconcile-interval",
        default_value = "60",
        help = "Seconds between addon reconcile passes with --watch-addons"
    )]
    addon_reconcile_secs: u64,
}
