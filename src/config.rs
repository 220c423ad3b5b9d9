use std::collections::BTreeMap;
use std::path::{Component, PathBuf};

use clap::Parser;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::firewall::{DEFAULT_ALLOWED_MARKS, normalize_mark};
use crate::{Error, Result, delegate};

pub const DEFAULT_ANNOTATION_KEY: &str = "tenant.routing/fwmark";

const ARG_POD_NAME: &str = "K8S_POD_NAME";
const ARG_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Possible values are ADD, DEL, CHECK, VERSION
    #[arg(long, env = "CNI_COMMAND", value_parser = parse_command)]
    pub command: Command,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,

    /// Path to the network namespace
    #[arg(long, env = "CNI_NETNS")]
    pub net_ns: Option<PathBuf>,

    /// Interface name inside the container
    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,

    /// Key-value pairs separated by semi-colons
    #[arg(long, env = "CNI_ARGS", default_value = "", value_parser = parse_key_value)]
    pub args: BTreeMap<String, String>,

    /// Colon-separated list of plugin search paths
    #[arg(long, env = "CNI_PATH")]
    pub paths: Option<String>,
}

#[derive(Clone)]
pub enum Command {
    Add,
    Delete,
    Check,
    Version,
}

fn parse_command(s: &str) -> Result<Command> {
    let cmd = match s {
        "ADD" => Command::Add,
        "DEL" => Command::Delete,
        "CHECK" => Command::Check,
        "VERSION" => Command::Version,
        _ => {
            return Err(Error::InvalidRequiredEnvVariables(format!(
                "unsupported CNI_COMMAND {s:?}"
            )));
        }
    };
    Ok(cmd)
}

/// Parses `CNI_ARGS`. Only the first `=` of a pair separates key from value;
/// pairs without one are skipped.
fn parse_key_value(s: &str) -> Result<BTreeMap<String, String>> {
    let mut kv = BTreeMap::new();

    if s.is_empty() {
        return Ok(kv);
    };

    for split in s.split(";") {
        if let Some((k, v)) = split.split_once("=") {
            kv.insert(k.to_owned(), v.to_owned());
        }
    }

    Ok(kv)
}

/// The network configuration this plugin receives on stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub r#type: String,

    /// Path to the credentials used for annotation lookups. Must be absolute.
    #[serde(default)]
    pub kubeconfig: PathBuf,

    /// Annotation carrying the fwmark value.
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,

    /// Configuration for the next plugin in the chain, passed through opaque.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub delegate: Value,

    #[serde(default, rename = "prevResult", skip_serializing_if = "Option::is_none")]
    pub previous_result: Option<Value>,

    /// Overrides the built-in set of acceptable fwmark values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_marks: Option<Vec<String>>,
}

fn default_annotation_key() -> String {
    DEFAULT_ANNOTATION_KEY.into()
}

impl NetConf {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<()> {
        if self.delegate.is_null() {
            return Err(Error::InvalidNetworkConfig(
                "delegate plugin configuration is required".into(),
            ));
        }
        delegate::plugin_type(&self.delegate)?;

        if self.kubeconfig.as_os_str().is_empty() {
            return Err(Error::InvalidNetworkConfig(
                "kubeconfig path is required".into(),
            ));
        }
        if !self.kubeconfig.is_absolute() {
            return Err(Error::InvalidNetworkConfig(format!(
                "kubeconfig path must be absolute, got: {}",
                self.kubeconfig.display()
            )));
        }
        if self
            .kubeconfig
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(Error::InvalidNetworkConfig(format!(
                "kubeconfig path cannot contain '..' components: {}",
                self.kubeconfig.display()
            )));
        }

        if let Some(marks) = &self.allowed_marks {
            if marks.is_empty() {
                return Err(Error::InvalidNetworkConfig(
                    "allowedMarks must not be empty".into(),
                ));
            }
            if marks.iter().any(|m| normalize_mark(m).is_empty()) {
                return Err(Error::InvalidNetworkConfig(
                    "allowedMarks entries must not be empty".into(),
                ));
            }
        }

        Ok(())
    }

    /// The normalized set of acceptable fwmark values.
    pub fn allowed_marks(&self) -> Vec<String> {
        match &self.allowed_marks {
            Some(marks) => marks.iter().map(|m| normalize_mark(m)).collect(),
            None => DEFAULT_ALLOWED_MARKS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Identity of the pod being wired up, from `CNI_ARGS`.
#[derive(Clone, Debug)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
}

impl PodIdentity {
    pub fn from_args(args: &BTreeMap<String, String>) -> Result<Self> {
        let name = args
            .get(ARG_POD_NAME)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::InvalidRequiredEnvVariables(format!("{ARG_POD_NAME} not found in CNI_ARGS"))
            })?;
        let namespace = args
            .get(ARG_POD_NAMESPACE)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::InvalidRequiredEnvVariables(format!(
                    "{ARG_POD_NAMESPACE} not found in CNI_ARGS"
                ))
            })?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid_config() -> &'static str {
        r#"{
            "cniVersion": "1.0.0",
            "name": "tenant-routing",
            "type": "tenant-routing-cni",
            "kubeconfig": "/etc/cni/net.d/tenant-routing.kubeconfig",
            "annotationKey": "custom.tenant/fwmark",
            "delegate": {
                "type": "ptp",
                "ipMasq": true,
                "ipam": {"type": "host-local", "subnet": "10.200.0.0/16"}
            }
        }"#
    }

    #[test]
    fn test_parse_valid_config() {
        let conf = NetConf::parse(valid_config().as_bytes()).unwrap();
        assert_eq!(conf.cni_version, Version::new(1, 0, 0));
        assert_eq!(conf.name, "tenant-routing");
        assert_eq!(conf.r#type, "tenant-routing-cni");
        assert_eq!(
            conf.kubeconfig,
            PathBuf::from("/etc/cni/net.d/tenant-routing.kubeconfig")
        );
        assert_eq!(conf.annotation_key, "custom.tenant/fwmark");
        // delegate is preserved untouched
        assert_eq!(conf.delegate["type"], "ptp");
        assert_eq!(conf.delegate["ipam"]["type"], "host-local");
    }

    #[test]
    fn test_default_annotation_key() {
        let conf = NetConf::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "net",
                "type": "tenant-routing-cni",
                "kubeconfig": "/etc/kubeconfig",
                "delegate": {"type": "ptp"}
            }"#,
        )
        .unwrap();
        assert_eq!(conf.annotation_key, DEFAULT_ANNOTATION_KEY);
    }

    #[test]
    fn test_missing_delegate() {
        let err = NetConf::parse(
            br#"{"cniVersion": "1.0.0", "name": "net", "kubeconfig": "/etc/kubeconfig"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkConfig(_)));
        assert!(err.to_string().contains("delegate"));
    }

    #[test]
    fn test_delegate_missing_type() {
        let err = NetConf::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "net",
                "kubeconfig": "/etc/kubeconfig",
                "delegate": {"ipMasq": true}
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkConfig(_)));
    }

    #[test]
    fn test_missing_kubeconfig() {
        let err = NetConf::parse(
            br#"{"cniVersion": "1.0.0", "name": "net", "delegate": {"type": "ptp"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("kubeconfig path is required"));
    }

    #[test]
    fn test_relative_kubeconfig_rejected() {
        let err = NetConf::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "net",
                "kubeconfig": "etc/kubeconfig",
                "delegate": {"type": "ptp"}
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn test_traversal_kubeconfig_rejected() {
        let err = NetConf::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "net",
                "kubeconfig": "/etc/../root/.kube/config",
                "delegate": {"type": "ptp"}
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn test_invalid_json() {
        let err = NetConf::parse(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_allowed_marks_default_and_override() {
        let conf = NetConf::parse(valid_config().as_bytes()).unwrap();
        assert_eq!(conf.allowed_marks(), vec!["0x10", "0x20"]);

        let conf = NetConf::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "net",
                "kubeconfig": "/etc/kubeconfig",
                "delegate": {"type": "ptp"},
                "allowedMarks": [" 0X40 ", "0x80"]
            }"#,
        )
        .unwrap();
        assert_eq!(conf.allowed_marks(), vec!["0x40", "0x80"]);
    }

    #[test]
    fn test_empty_allowed_marks_rejected() {
        let err = NetConf::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "net",
                "kubeconfig": "/etc/kubeconfig",
                "delegate": {"type": "ptp"},
                "allowedMarks": []
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkConfig(_)));
    }

    #[test]
    fn test_parse_key_value() {
        let kv = parse_key_value("K8S_POD_NAME=web;K8S_POD_NAMESPACE=production").unwrap();
        assert_eq!(kv.get("K8S_POD_NAME").unwrap(), "web");
        assert_eq!(kv.get("K8S_POD_NAMESPACE").unwrap(), "production");
    }

    #[test]
    fn test_parse_key_value_empty() {
        assert!(parse_key_value("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_key_value_skips_malformed_pairs() {
        let kv = parse_key_value("IgnoreMe;K8S_POD_NAME=web").unwrap();
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("K8S_POD_NAME").unwrap(), "web");
    }

    #[test]
    fn test_parse_key_value_equals_in_value() {
        let kv = parse_key_value("KEY=a=b=c").unwrap();
        assert_eq!(kv.get("KEY").unwrap(), "a=b=c");
    }

    #[test]
    fn test_pod_identity() {
        let kv = parse_key_value("K8S_POD_NAME=web;K8S_POD_NAMESPACE=production").unwrap();
        let identity = PodIdentity::from_args(&kv).unwrap();
        assert_eq!(identity.name, "web");
        assert_eq!(identity.namespace, "production");
    }

    #[test]
    fn test_pod_identity_missing_name() {
        let kv = parse_key_value("K8S_POD_NAMESPACE=production").unwrap();
        let err = PodIdentity::from_args(&kv).unwrap_err();
        assert!(err.to_string().contains("K8S_POD_NAME"));
    }

    #[test]
    fn test_pod_identity_missing_namespace() {
        let kv = parse_key_value("K8S_POD_NAME=web").unwrap();
        let err = PodIdentity::from_args(&kv).unwrap_err();
        assert!(err.to_string().contains("K8S_POD_NAMESPACE"));
    }

    #[test]
    fn test_pod_identity_empty_values_rejected() {
        let kv = parse_key_value("K8S_POD_NAME=;K8S_POD_NAMESPACE=production").unwrap();
        assert!(PodIdentity::from_args(&kv).is_err());
    }
}
