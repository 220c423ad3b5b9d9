use std::io::Write;
use std::process::ExitCode;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub enum Response {
    /// The delegate's result, passed through untouched.
    Success(Value),
    Error(CniErrorResponse),
    Version(VersionResponse),
    Check,
    Delete,
}

impl Response {
    pub fn write_out(self) -> ExitCode {
        let (out, code) = match &self {
            Response::Success(result) => match serde_json::to_vec(result) {
                Ok(out) => (out, ExitCode::SUCCESS),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Error(err) => match serde_json::to_vec(err) {
                Ok(out) => (out, ExitCode::FAILURE),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Version(version) => match serde_json::to_vec(version) {
                Ok(out) => (out, ExitCode::SUCCESS),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Check => (vec![], ExitCode::SUCCESS),
            Response::Delete => (vec![], ExitCode::SUCCESS),
        };
        std::io::stdout()
            .write_all(&out)
            .expect("failed to write out response to stdout");
        code
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    pub code: u32,
    pub msg: String,
    pub details: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec"
    )]
    pub supported_versions: Vec<Version>,
}
