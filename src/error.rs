use std::net::Ipv4Addr;
use std::time::Duration;

use semver::Version;
use thiserror::Error;

use crate::response::{CniErrorResponse, Response};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid environment variables: {0}")]
    InvalidRequiredEnvVariables(String),

    #[error("invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("delegate plugin {plugin:?} failed: {message}")]
    Delegation { plugin: String, message: String },

    #[error("no result to extract an address from")]
    MissingResult,

    #[error("unsupported result version: {0}")]
    UnsupportedResultVersion(String),

    #[error("result contains no addresses")]
    NoAddresses,

    #[error("result contains no IPv4 addresses")]
    NoIpv4Addresses,

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("mark {0:?} is not in the allowed set")]
    MarkNotAllowed(String),

    #[error("rule table failure: {0}")]
    RuleTable(String),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("kubernetes api timed out after {0:?}")]
    ApiTimeout(Duration),

    #[error(
        "configuration drift: mark {fwmark} expected for pod {namespace}/{pod} \
         (address {address}) but the mark rule is missing"
    )]
    Drift {
        fwmark: String,
        pod: String,
        namespace: String,
        address: Ipv4Addr,
    },
}

impl Error {
    pub fn into_response(self, cni_version: Version) -> Response {
        let (code, msg) = match &self {
            Error::InvalidRequiredEnvVariables(_) => (4, "Invalid Required Environment Variables"),
            Error::Io(_) => (5, "I/O Error"),
            Error::Json(_) => (6, "JSON Error"),
            Error::InvalidNetworkConfig(_) => (7, "Invalid Network Config"),
            Error::Kube(_) | Error::Kubeconfig(_) | Error::ApiTimeout(_) => (11, "Transient Error"),
            Error::Delegation { .. } => (100, "Delegate Error"),
            Error::MissingResult => (101, "Missing Result"),
            Error::UnsupportedResultVersion(_) => (102, "Unsupported Result Version"),
            Error::NoAddresses => (103, "No Addresses"),
            Error::NoIpv4Addresses => (104, "No IPv4 Addresses"),
            Error::InvalidAddress(_) => (105, "Invalid Address"),
            Error::MarkNotAllowed(_) => (106, "Mark Not Allowed"),
            Error::RuleTable(_) => (107, "Rule Table Error"),
            Error::PodNotFound { .. } | Error::NamespaceNotFound(_) => {
                (110, "Annotation Lookup Error")
            }
            Error::Drift { .. } => (120, "Configuration Drift"),
        };
        Response::Error(CniErrorResponse {
            cni_version,
            code,
            msg: msg.into(),
            details: self.to_string(),
        })
    }
}
