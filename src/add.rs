use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::config::{Args, NetConf, PodIdentity};
use crate::firewall::{IptablesExec, MarkRuleManager};
use crate::response::Response;
use crate::{CNI_VERSION, Result, delegate, kubernetes, result};

/// ADD: delegate interface creation, then map the pod's fwmark annotation to
/// a host mark rule. The delegate's result is the output either way; nothing
/// past address extraction may fail the pod.
pub fn add(args: &Args, conf: NetConf) -> Response {
    match run(args, conf) {
        Ok(resp) => resp,
        Err(e) => e.into_response(CNI_VERSION),
    }
}

fn run(args: &Args, conf: NetConf) -> Result<Response> {
    // A malformed invocation must never reach the delegate.
    let identity = PodIdentity::from_args(&args.args)?;

    let runtime = Runtime::new()?;
    let delegate_result = runtime.block_on(delegate::add(
        &conf.delegate,
        &conf.name,
        args.paths.as_deref(),
    ))?;
    let address = result::extract_pod_ip(Some(&delegate_result))?;

    match runtime.block_on(kubernetes::client_from_kubeconfig(&conf.kubeconfig)) {
        Err(e) => {
            // Pod startup must not depend on API server reachability.
            warn!(%e, "failed to create kubernetes client, skipping fwmark setup");
        }
        Ok(client) => {
            let allowed = conf.allowed_marks();
            match runtime.block_on(kubernetes::resolve_fwmark(
                client,
                &identity.name,
                &identity.namespace,
                &conf.annotation_key,
                &allowed,
            )) {
                Err(e) => {
                    warn!(
                        %e,
                        pod = %identity.name,
                        namespace = %identity.namespace,
                        "failed to resolve fwmark annotation, skipping fwmark setup"
                    );
                }
                Ok(None) => {}
                Ok(Some(mark)) => {
                    let firewall = MarkRuleManager::new(IptablesExec::default(), allowed);
                    match firewall.add_rule(&address.to_string(), &mark) {
                        Err(e) => {
                            warn!(
                                %e,
                                pod = %identity.name,
                                namespace = %identity.namespace,
                                %address,
                                %mark,
                                "failed to add mark rule"
                            );
                        }
                        Ok(()) => {
                            info!(
                                pod = %identity.name,
                                namespace = %identity.namespace,
                                %address,
                                %mark,
                                "added mark rule"
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(Response::Success(delegate_result))
}
