use std::fmt::{self, Display};

/// A basic description of a Kubernetes resource type, with just enough
/// information to build request paths for the api server. All fields are
/// `&'static str` so references can be passed around without copying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct K8sType {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
}

impl K8sType {
    pub fn format_api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural_kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural_kind)
        }
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $group:expr, $version:expr, $kind:expr, $plural_kind:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            group: $group,
            version: $version,
            kind: $kind,
            plural_kind: $plural_kind,
        };
    };
}

/// The custom resource this operator watches.
k8s_type!(
    OpenSearch,
    "opensearch.reclaim-the-stack.com",
    "v1alpha1",
    "OpenSearch",
    "opensearches"
);

pub mod core {
    pub mod v1 {
        k8s_type!(Secret, "", "v1", "Secret", "secrets");
        k8s_type!(ConfigMap, "", "v1", "ConfigMap", "configmaps");
        k8s_type!(Service, "", "v1", "Service", "services");
    }
}

pub mod apps {
    pub mod v1 {
        k8s_type!(StatefulSet, "apps", "v1", "StatefulSet", "statefulsets");
        k8s_type!(Deployment, "apps", "v1", "Deployment", "deployments");
    }
}
