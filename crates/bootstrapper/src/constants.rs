//! Guest filesystem layout, socket paths and other fixed names.
//!
//! Guest paths are built here and nowhere else.

use command_runner::assets::join_guest_path;

use crate::versions::version_tag;

/// Where state that survives a reboot lives on the guest.
pub const GUEST_PERSISTENT_DIR: &str = "/var/lib/minikube";
/// Where regenerated per-reconcile files live on the guest.
pub const GUEST_EPHEMERAL_DIR: &str = "/var/tmp/minikube";
/// Rendered addon manifests, applied recursively.
pub const GUEST_ADDONS_DIR: &str = "/etc/kubernetes/addons";
/// Static pod manifests watched by kubelet.
pub const GUEST_MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";

/// DNS alias the control plane is reached through.
pub const CONTROL_PLANE_ALIAS: &str = "control-plane.minikube.internal";
/// Default API server port.
pub const API_SERVER_PORT: u16 = 8443;
/// Default pod network.
pub const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";
/// Default service network.
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";
/// Default cluster DNS domain.
pub const DEFAULT_DNS_DOMAIN: &str = "cluster.local";
/// Default cluster name.
pub const DEFAULT_CLUSTER_NAME: &str = "minikube";
/// Default image repository for control plane images.
pub const DEFAULT_IMAGE_REPOSITORY: &str = "k8s.gcr.io";
/// Default Kubernetes version.
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.23.0";

/// Control plane binaries transferred to the guest.
pub const KUBERNETES_BINARIES: [&str; 3] = ["kubeadm", "kubelet", "kubectl"];

/// Docker's CRI socket (dockershim).
pub const DOCKER_SOCKET: &str = "/var/run/dockershim.sock";
/// containerd's CRI socket.
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
/// CRI-O's CRI socket.
pub const CRIO_SOCKET: &str = "/var/run/crio/crio.sock";

/// Directory CNI configs are read from.
pub const CNI_CONF_DIR: &str = "/etc/cni/net.d";
/// Bridge CNI config file name.
pub const BRIDGE_CONFLIST: &str = "1-k8s.conflist";
/// Stub CNI config written before a custom CNI is applied.
pub const FAKE_CNI_CONF: &str = "86-fake.conf";
/// Suffix given to CNI configs that would conflict with the chosen CNI.
pub const CNI_DISABLED_SUFFIX: &str = ".mk_disabled";

/// crictl endpoint config.
pub const CRICTL_CONFIG: &str = "/etc/crictl.yaml";
/// Docker daemon config.
pub const DOCKER_DAEMON_CONFIG: &str = "/etc/docker/daemon.json";
/// containerd config.
pub const CONTAINERD_CONFIG: &str = "/etc/containerd/config.toml";
/// CRI-O drop-in config.
pub const CRIO_CONFIG: &str = "/etc/crio/crio.conf.d/02-crio.conf";
/// Docker's reference store.
pub const DOCKER_REPOSITORIES_JSON: &str = "/var/lib/docker/image/overlay2/repositories.json";

/// Systemd drop-in that carries kubelet's ExecStart.
pub const KUBELET_SYSTEMD_DROPIN: &str = "/etc/systemd/system/kubelet.service.d/10-kubeadm.conf";
/// Base kubelet unit.
pub const KUBELET_SERVICE_FILE: &str = "/lib/systemd/system/kubelet.service";
/// SysV init script for kubelet.
pub const KUBELET_INIT_SCRIPT: &str = "/etc/init.d/kubelet";
/// SysV restart wrapper for kubelet.
pub const SYSV_RESTART_WRAPPER: &str = "/etc/init.d/.restart_wrapper.sh";
/// resolv.conf handed to kubelet on 1.25.
pub const KUBELET_RESOLV_CONF: &str = "/etc/kubelet-resolv.conf";

/// Splits a full guest path into its directory and file name.
pub fn split_guest_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// `<persistent>/binaries/v<version>`, whichever form `version` is given in.
pub fn binary_root(version: &str) -> String {
    join_guest_path(
        &join_guest_path(GUEST_PERSISTENT_DIR, "binaries"),
        &version_tag(version),
    )
}

/// Path of one control plane binary for `version`.
pub fn binary_path(version: &str, name: &str) -> String {
    join_guest_path(&binary_root(version), name)
}

/// `<persistent>/certs`.
pub fn guest_certs_dir() -> String {
    join_guest_path(GUEST_PERSISTENT_DIR, "certs")
}

/// `<persistent>/etcd`.
pub fn etcd_data_dir() -> String {
    join_guest_path(GUEST_PERSISTENT_DIR, "etcd")
}

/// `<persistent>/kubeconfig`.
pub fn guest_kubeconfig() -> String {
    join_guest_path(GUEST_PERSISTENT_DIR, "kubeconfig")
}

/// `<ephemeral>/kubeadm.yaml`.
pub fn kubeadm_yaml_path() -> String {
    join_guest_path(GUEST_EPHEMERAL_DIR, "kubeadm.yaml")
}

/// `<ephemeral>/cni.yaml`.
pub fn cni_manifest_path() -> String {
    join_guest_path(GUEST_EPHEMERAL_DIR, "cni.yaml")
}

/// `<addons>/<name>`.
pub fn addon_path(name: &str) -> String {
    join_guest_path(GUEST_ADDONS_DIR, name)
}

/// `/etc/cni/net.d/<name>`.
pub fn cni_conf_path(name: &str) -> String {
    join_guest_path(CNI_CONF_DIR, name)
}

/// `<control-plane alias>:<port>`.
pub fn control_plane_endpoint(port: u16) -> String {
    format!("{}:{}", CONTROL_PLANE_ALIAS, port)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binaries_are_version_pinned() {
        assert_eq!(binary_root("v1.23.0"), "/var/lib/minikube/binaries/v1.23.0");
        assert_eq!(binary_root("1.23.0"), "/var/lib/minikube/binaries/v1.23.0");
        assert_eq!(binary_root("1.23"), "/var/lib/minikube/binaries/v1.23.0");
        assert_eq!(
            binary_path("v1.23.0", "kubelet"),
            "/var/lib/minikube/binaries/v1.23.0/kubelet"
        );
    }

    #[test]
    fn paths_split_into_dir_and_name() {
        assert_eq!(
            split_guest_path(KUBELET_SYSTEMD_DROPIN),
            ("/etc/systemd/system/kubelet.service.d", "10-kubeadm.conf")
        );
        assert_eq!(split_guest_path("/crictl.yaml"), ("/", "crictl.yaml"));
        assert_eq!(split_guest_path("bare"), ("", "bare"));
    }

    #[test]
    fn well_known_files() {
        assert_eq!(kubeadm_yaml_path(), "/var/tmp/minikube/kubeadm.yaml");
        assert_eq!(guest_certs_dir(), "/var/lib/minikube/certs");
        assert_eq!(cni_conf_path(BRIDGE_CONFLIST), "/etc/cni/net.d/1-k8s.conflist");
        assert_eq!(control_plane_endpoint(8443), "control-plane.minikube.internal:8443");
    }
}
