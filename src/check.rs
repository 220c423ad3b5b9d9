use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::config::{Args, NetConf, PodIdentity};
use crate::firewall::{IptablesExec, MarkRuleManager};
use crate::response::Response;
use crate::{CNI_VERSION, Error, Result, delegate, kubernetes, result};

/// CHECK: the delegate's own verification is authoritative and fatal; the
/// mark-rule verification only fails when it can positively show drift, that
/// is an annotation that says a rule should exist while the host disagrees.
pub fn check(args: &Args, conf: NetConf) -> Response {
    match run(args, conf) {
        Ok(resp) => resp,
        Err(e) => e.into_response(CNI_VERSION),
    }
}

fn run(args: &Args, conf: NetConf) -> Result<Response> {
    let runtime = Runtime::new()?;
    runtime.block_on(delegate::check(
        &conf.delegate,
        &conf.name,
        args.paths.as_deref(),
    ))?;

    let identity = match PodIdentity::from_args(&args.args) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%e, "cannot verify mark rule without pod identity");
            return Ok(Response::Check);
        }
    };

    let address = match result::extract_pod_ip(conf.previous_result.as_ref()) {
        Ok(address) => address,
        Err(e) => {
            warn!(%e, "cannot verify mark rule without a pod address");
            return Ok(Response::Check);
        }
    };

    let client = match runtime.block_on(kubernetes::client_from_kubeconfig(&conf.kubeconfig)) {
        Ok(client) => client,
        Err(e) => {
            warn!(%e, "cannot verify mark rule without a kubernetes client");
            return Ok(Response::Check);
        }
    };

    let allowed = conf.allowed_marks();
    let mark = match runtime.block_on(kubernetes::resolve_fwmark(
        client,
        &identity.name,
        &identity.namespace,
        &conf.annotation_key,
        &allowed,
    )) {
        Ok(Some(mark)) => mark,
        Ok(None) => return Ok(Response::Check),
        Err(e) => {
            // the pod may be terminating, which is not drift
            warn!(%e, "cannot verify mark rule, fwmark resolution failed");
            return Ok(Response::Check);
        }
    };

    let firewall = MarkRuleManager::new(IptablesExec::default(), allowed);
    match firewall.rule_exists(&address.to_string(), &mark) {
        Err(e) => {
            // cannot assert drift without a reliable read
            warn!(%e, "cannot verify mark rule existence");
            Ok(Response::Check)
        }
        Ok(true) => {
            info!(
                pod = %identity.name,
                namespace = %identity.namespace,
                %address,
                %mark,
                "mark rule verified"
            );
            Ok(Response::Check)
        }
        Ok(false) => Err(Error::Drift {
            fwmark: mark,
            pod: identity.name,
            namespace: identity.namespace,
            address,
        }),
    }
}
