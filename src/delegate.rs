use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::response::CniErrorResponse;
use crate::{Error, Result};

/// Bound on one delegate execution. A wedged chained plugin must not block
/// the container runtime forever.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the delegate's ADD and returns its result payload unparsed beyond
/// JSON, so it can be passed through to the runtime untouched.
pub async fn add(delegate: &Value, network_name: &str, search_path: Option<&str>) -> Result<Value> {
    let stdout = invoke("ADD", delegate, network_name, search_path).await?;
    Ok(serde_json::from_slice(&stdout)?)
}

pub async fn del(delegate: &Value, network_name: &str, search_path: Option<&str>) -> Result<()> {
    invoke("DEL", delegate, network_name, search_path).await?;
    Ok(())
}

pub async fn check(delegate: &Value, network_name: &str, search_path: Option<&str>) -> Result<()> {
    invoke("CHECK", delegate, network_name, search_path).await?;
    Ok(())
}

/// The delegate's binary name, from its `type` field.
pub fn plugin_type(delegate: &Value) -> Result<&str> {
    let conf = delegate.as_object().ok_or_else(|| {
        Error::InvalidNetworkConfig("delegate configuration must be a JSON object".into())
    })?;
    conf.get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            Error::InvalidNetworkConfig("delegate config missing required 'type' field".into())
        })
}

/// Clones the delegate blob with the parent network name injected, as the
/// chained plugin contract requires.
fn prepare(delegate: &Value, network_name: &str) -> Result<(String, Vec<u8>)> {
    let plugin = plugin_type(delegate)?.to_owned();
    let Value::Object(conf) = delegate else {
        return Err(Error::InvalidNetworkConfig(
            "delegate configuration must be a JSON object".into(),
        ));
    };
    let mut conf = conf.clone();
    conf.insert("name".into(), Value::String(network_name.into()));
    let bytes = serde_json::to_vec(&Value::Object(conf))?;
    Ok((plugin, bytes))
}

fn find_plugin(plugin: &str, search_path: &str) -> Result<PathBuf> {
    for dir in search_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(plugin);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::Delegation {
        plugin: plugin.into(),
        message: format!("not found in CNI_PATH {search_path:?}"),
    })
}

async fn invoke(
    command: &str,
    delegate: &Value,
    network_name: &str,
    search_path: Option<&str>,
) -> Result<Vec<u8>> {
    let search_path = search_path.ok_or_else(|| {
        Error::InvalidRequiredEnvVariables("CNI_PATH environment variable not set".into())
    })?;
    let (plugin, conf) = prepare(delegate, network_name)?;
    let binary = find_plugin(&plugin, search_path)?;
    debug!(%plugin, command, binary = %binary.display(), "invoking delegate");

    // CNI_CONTAINERID, CNI_NETNS, CNI_IFNAME, CNI_ARGS and CNI_PATH are
    // inherited from this process; only the command differs per operation.
    let mut child = Command::new(&binary)
        .env("CNI_COMMAND", command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&conf).await?;
    }

    let output = tokio::time::timeout(EXECUTION_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| Error::Delegation {
            plugin: plugin.clone(),
            message: format!("timed out after {EXECUTION_TIMEOUT:?}"),
        })??;

    if !output.status.success() {
        return Err(Error::Delegation {
            plugin,
            message: failure_message(&output),
        });
    }
    Ok(output.stdout)
}

/// The delegate's own error message, preserved verbatim. Failing plugins emit
/// a CNI error object on stdout; anything else falls back to stderr.
fn failure_message(output: &std::process::Output) -> String {
    if let Ok(err) = serde_json::from_slice::<CniErrorResponse>(&output.stdout) {
        if err.details.is_empty() {
            return err.msg;
        }
        return format!("{}: {}", err.msg, err.details);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}
