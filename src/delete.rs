use std::net::Ipv4Addr;

use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::config::{Args, NetConf, PodIdentity};
use crate::firewall::{IptablesExec, MarkRuleManager, RuleTable};
use crate::response::Response;
use crate::{Error, delegate, kubernetes, result};

/// DEL: best-effort teardown. May run with stale or partial information, so
/// every sub-failure is logged and the remaining independent cleanup actions
/// still run. Never reports an error to the runtime.
pub fn delete(args: &Args, stdin: &[u8]) -> Response {
    let conf = match NetConf::parse(stdin) {
        Ok(conf) => conf,
        Err(e) => {
            warn!(%e, "failed to parse config, skipping cleanup");
            return Response::Delete;
        }
    };

    let identity = match PodIdentity::from_args(&args.args) {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!(%e, "pod identity unavailable, rule cleanup may fall back to a sweep");
            None
        }
    };

    let address = match result::extract_pod_ip(conf.previous_result.as_ref()) {
        Ok(address) => Some(address),
        // no prevResult supplied, nothing to clean up
        Err(Error::MissingResult) => None,
        Err(e) => {
            warn!(%e, "failed to extract pod address from prevResult");
            None
        }
    };

    let runtime = match Runtime::new() {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            error!(%e, "failed to create async runtime, delegate DEL and annotation lookup skipped");
            None
        }
    };

    // The delegate gets its DEL regardless of how much identity survived.
    if let Some(runtime) = &runtime {
        if let Err(e) = runtime.block_on(delegate::del(
            &conf.delegate,
            &conf.name,
            args.paths.as_deref(),
        )) {
            warn!(%e, "delegate DEL failed");
        }
    }

    let Some(address) = address else {
        return Response::Delete;
    };

    let allowed = conf.allowed_marks();
    let firewall = MarkRuleManager::new(IptablesExec::default(), allowed.clone());

    match (identity, &runtime) {
        (Some(identity), Some(runtime)) => {
            let client =
                match runtime.block_on(kubernetes::client_from_kubeconfig(&conf.kubeconfig)) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(%e, "failed to create kubernetes client for cleanup");
                        return Response::Delete;
                    }
                };
            match runtime.block_on(kubernetes::resolve_fwmark(
                client,
                &identity.name,
                &identity.namespace,
                &conf.annotation_key,
                &allowed,
            )) {
                Ok(Some(mark)) => {
                    if let Err(e) = firewall.delete_rule(&address.to_string(), &mark) {
                        warn!(
                            %e,
                            pod = %identity.name,
                            namespace = %identity.namespace,
                            %address,
                            %mark,
                            "failed to delete mark rule"
                        );
                    } else {
                        info!(
                            pod = %identity.name,
                            namespace = %identity.namespace,
                            %address,
                            %mark,
                            "deleted mark rule"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // The pod is usually gone by now, so the mark it carried
                    // at ADD time is unknowable. Deleting every allowed mark
                    // for this address is safe: delete is idempotent and
                    // scoped to the address.
                    info!(%e, %address, "could not resolve fwmark for cleanup, sweeping allowed marks");
                    sweep(&firewall, address, &allowed);
                }
            }
        }
        _ => {
            info!(%address, "pod identity unavailable, sweeping allowed marks");
            sweep(&firewall, address, &allowed);
        }
    }

    Response::Delete
}

fn sweep<T: RuleTable>(firewall: &MarkRuleManager<T>, address: Ipv4Addr, marks: &[String]) {
    for mark in marks {
        if let Err(e) = firewall.delete_rule(&address.to_string(), mark) {
            debug!(%e, %address, %mark, "sweep delete failed");
        }
    }
}
