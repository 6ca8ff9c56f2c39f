//! Container image names and the image-mirror rewrite.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use semver::Version;

const IMAGE_MIRROR_JSON: &str = include_str!("../assets/image-mirror.json");

lazy_static! {
    static ref IMAGE_MIRRORS: BTreeMap<String, String> =
        serde_json::from_str(IMAGE_MIRROR_JSON).expect("embedded image mirror table is valid JSON");
}

/// The registry that stands for "no registry prefix".
pub const DOCKER_HUB: &str = "docker.io";

/// Canonical image name to mirrored `registry/path`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorTable(BTreeMap<String, String>);

impl MirrorTable {
    /// The table shipped with the binary.
    pub fn embedded() -> MirrorTable {
        MirrorTable(IMAGE_MIRRORS.clone())
    }

    /// A table from explicit entries.
    pub fn from_entries<I, K, V>(entries: I) -> MirrorTable
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        MirrorTable(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// The mirror for a canonical image name.
    pub fn get(&self, image: &str) -> Option<&str> {
        self.0.get(image).map(String::as_str)
    }
}

/// Images and registries after the mirror rewrite, keyed by image name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewrittenImages {
    /// Image references without their registry.
    pub images: BTreeMap<String, String>,
    /// The registry each image comes from. Absent means no prefix.
    pub registries: BTreeMap<String, String>,
}

impl RewrittenImages {
    /// The full reference for `name`, with its registry prefixed.
    pub fn reference(&self, name: &str) -> Option<String> {
        let image = self.images.get(name)?;
        Some(match self.registries.get(name) {
            Some(registry) if !registry.is_empty() && registry != DOCKER_HUB => {
                format!("{}/{}", registry, image)
            }
            _ => image.clone(),
        })
    }
}

/// Resolves each image against the user's overrides, then swaps in a mirror
/// when the table has one for it.
pub fn rewrite_images(
    default_images: &BTreeMap<String, String>,
    default_registries: &BTreeMap<String, String>,
    user_images: &BTreeMap<String, String>,
    user_registries: &BTreeMap<String, String>,
    mirrors: &MirrorTable,
) -> RewrittenImages {
    let mut out = RewrittenImages::default();
    for (name, default_image) in default_images {
        let image = user_images.get(name).unwrap_or(default_image);
        let registry = user_registries
            .get(name)
            .or_else(|| default_registries.get(name))
            .map(String::as_str)
            .unwrap_or("");

        let full = if !registry.is_empty() && registry != DOCKER_HUB {
            format!("{}/{}", registry, image)
        } else {
            image.clone()
        };
        let (image_name, tag) = split_tag(&full);

        match mirrors.get(image_name) {
            Some(mirror) => {
                let (mirror_registry, mirror_path) = mirror.split_once('/').unwrap_or(("", mirror));
                let rewritten = match tag {
                    Some(t) => format!("{}:{}", mirror_path, t),
                    None => mirror_path.to_string(),
                };
                out.images.insert(name.clone(), rewritten);
                if !mirror_registry.is_empty() {
                    out.registries.insert(name.clone(), mirror_registry.to_string());
                }
            }
            None => {
                out.images.insert(name.clone(), image.clone());
                if !registry.is_empty() {
                    out.registries.insert(name.clone(), registry.to_string());
                }
            }
        }
    }
    out
}

/// Splits `name:tag` on the last colon, ignoring colons in a registry port.
fn split_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.rfind(':') {
        Some(i) if !reference[i + 1..].contains('/') => (&reference[..i], Some(&reference[i + 1..])),
        _ => (reference, None),
    }
}

/// The pause image tag kubeadm expects for a Kubernetes version.
pub fn pause_version(version: &Version) -> &'static str {
    match (version.major, version.minor) {
        (1, m) if m >= 26 => "3.9",
        (1, 25) => "3.8",
        (1, 24) => "3.7",
        (1, 23) => "3.6",
        (1, 22) => "3.5",
        (1, 21) => "3.4.1",
        (1, 19) | (1, 20) => "3.2",
        _ => "3.1",
    }
}

/// The full pause image reference under `repository`.
pub fn pause_image(repository: &str, version: &Version) -> String {
    format!("{}/pause:{}", repository.trim_end_matches('/'), pause_version(version))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::versions::parse_version;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn mirror_rewrites_image_and_registry() {
        let images = map(&[("kube-apiserver", "k8s.gcr.io/kube-apiserver:v1.23.0")]);
        let mirrors = MirrorTable::from_entries(vec![(
            "k8s.gcr.io/kube-apiserver",
            "mirror.example.com/k8s-apiserver",
        )]);
        let out = rewrite_images(&images, &BTreeMap::new(), &BTreeMap::new(), &BTreeMap::new(), &mirrors);
        assert_eq!(out.images["kube-apiserver"], "k8s-apiserver:v1.23.0");
        assert_eq!(out.registries["kube-apiserver"], "mirror.example.com");
        assert_eq!(
            out.reference("kube-apiserver").unwrap(),
            "mirror.example.com/k8s-apiserver:v1.23.0"
        );
    }

    #[test]
    fn unmirrored_images_pass_through() {
        let images = map(&[
            ("StorageProvisioner", "k8s-minikube/storage-provisioner:v5"),
            ("Nginx", "nginx:1.21"),
        ]);
        let registries = map(&[("StorageProvisioner", "gcr.io")]);
        let out = rewrite_images(&images, &registries, &BTreeMap::new(), &BTreeMap::new(), &MirrorTable::default());
        for name in images.keys() {
            assert_eq!(out.images.get(name), images.get(name));
            assert_eq!(out.registries.get(name), registries.get(name));
        }
    }

    #[test]
    fn user_overrides_win_and_inputs_are_untouched() {
        let images = map(&[("Controller", "ingress-nginx/controller:v1.1.0")]);
        let registries = map(&[("Controller", "k8s.gcr.io")]);
        let user_registries = map(&[("Controller", "registry.local:5000")]);
        let before = (images.clone(), registries.clone());
        let out = rewrite_images(
            &images,
            &registries,
            &BTreeMap::new(),
            &user_registries,
            &MirrorTable::embedded(),
        );
        assert_eq!(out.registries["Controller"], "registry.local:5000");
        assert_eq!(out.images["Controller"], "ingress-nginx/controller:v1.1.0");
        assert_eq!((images, registries), before);
    }

    #[test]
    fn docker_hub_is_not_prefixed() {
        let images = map(&[("Speaker", "metallb/speaker:v0.9.6")]);
        let registries = map(&[("Speaker", "docker.io")]);
        let out = rewrite_images(&images, &registries, &BTreeMap::new(), &BTreeMap::new(), &MirrorTable::embedded());
        assert_eq!(out.registries["Speaker"], "registry.cn-hangzhou.aliyuncs.com");
        assert_eq!(out.images["Speaker"], "google_containers/metallb-speaker:v0.9.6");
    }

    #[test]
    fn tag_split_ignores_registry_port() {
        assert_eq!(split_tag("localhost:5000/pause"), ("localhost:5000/pause", None));
        assert_eq!(split_tag("localhost:5000/pause:3.6"), ("localhost:5000/pause", Some("3.6")));
    }

    #[test]
    fn pause_versions() {
        let cases = [
            ("v1.27.0", "3.9"),
            ("v1.25.3", "3.8"),
            ("v1.23.0", "3.6"),
            ("v1.21.2", "3.4.1"),
            ("v1.20.0", "3.2"),
            ("v1.16.0", "3.1"),
        ];
        for (version, tag) in cases {
            assert_eq!(pause_version(&parse_version(version).unwrap()), tag, "{}", version);
        }
        assert_eq!(
            pause_image("k8s.gcr.io", &parse_version("v1.23.0").unwrap()),
            "k8s.gcr.io/pause:3.6"
        );
    }
}
