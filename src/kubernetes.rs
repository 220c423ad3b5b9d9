use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, ResourceExt};

use crate::firewall::normalize_mark;
use crate::{Error, Result};

/// Bound on the whole annotation lookup. CNI invocations are on the pod
/// startup path and must not hang on a slow API server.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn client_from_kubeconfig(path: &Path) -> Result<kube::Client> {
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(kube::Client::try_from(config)?)
}

/// Where pod and namespace objects come from. A seam so the fallback logic
/// can be exercised without an API server.
trait ObjectSource {
    async fn pod(&self, namespace: &str, name: &str) -> Result<Pod>;
    async fn namespace(&self, name: &str) -> Result<Namespace>;
}

struct ApiSource {
    client: kube::Client,
}

impl ObjectSource for ApiSource {
    async fn pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get(name).await.map_err(|e| {
            not_found_as(e, || Error::PodNotFound {
                namespace: namespace.into(),
                name: name.into(),
            })
        })
    }

    async fn namespace(&self, name: &str) -> Result<Namespace> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces
            .get(name)
            .await
            .map_err(|e| not_found_as(e, || Error::NamespaceNotFound(name.into())))
    }
}

fn not_found_as(err: kube::Error, missing: impl FnOnce() -> Error) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => missing(),
        other => Error::Kube(other),
    }
}

/// Resolves the fwmark for a pod: the pod's own annotation wins, its
/// namespace's is the fallback, neither present is `Ok(None)`. A value
/// outside the allow-list is an error, not absence.
pub async fn resolve_fwmark(
    client: kube::Client,
    pod_name: &str,
    pod_namespace: &str,
    annotation_key: &str,
    allowed: &[String],
) -> Result<Option<String>> {
    let source = ApiSource { client };
    tokio::time::timeout(
        API_TIMEOUT,
        lookup(&source, pod_name, pod_namespace, annotation_key, allowed),
    )
    .await
    .map_err(|_| Error::ApiTimeout(API_TIMEOUT))?
}

async fn lookup<S: ObjectSource>(
    source: &S,
    pod_name: &str,
    pod_namespace: &str,
    annotation_key: &str,
    allowed: &[String],
) -> Result<Option<String>> {
    let pod = source.pod(pod_namespace, pod_name).await?;
    if let Some(mark) = annotated_mark(pod.annotations(), annotation_key, allowed)? {
        return Ok(Some(mark));
    }

    let namespace = source.namespace(pod_namespace).await?;
    annotated_mark(namespace.annotations(), annotation_key, allowed)
}

fn annotated_mark(
    annotations: &BTreeMap<String, String>,
    key: &str,
    allowed: &[String],
) -> Result<Option<String>> {
    let Some(value) = annotations.get(key) else {
        return Ok(None);
    };
    let mark = normalize_mark(value);
    if !allowed.iter().any(|m| *m == mark) {
        return Err(Error::MarkNotAllowed(mark));
    }
    Ok(Some(mark))
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use kube::api::ObjectMeta;

    use super::*;

    const KEY: &str = "tenant.routing/fwmark";

    struct FakeSource {
        pods: HashMap<(String, String), Pod>,
        namespaces: HashMap<String, Namespace>,
    }

    impl ObjectSource for FakeSource {
        async fn pod(&self, namespace: &str, name: &str) -> Result<Pod> {
            self.pods
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| Error::PodNotFound {
                    namespace: namespace.into(),
                    name: name.into(),
                })
        }

        async fn namespace(&self, name: &str) -> Result<Namespace> {
            self.namespaces
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NamespaceNotFound(name.into()))
        }
    }

    fn annotations(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        if pairs.is_empty() {
            return None;
        }
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn pod(annotations_pairs: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("production".into()),
                annotations: annotations(annotations_pairs),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn namespace(annotations_pairs: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some("production".into()),
                annotations: annotations(annotations_pairs),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn source(pod: Pod, ns: Namespace) -> FakeSource {
        let mut pods = HashMap::new();
        pods.insert(("production".to_string(), "web".to_string()), pod);
        let mut namespaces = HashMap::new();
        namespaces.insert("production".to_string(), ns);
        FakeSource { pods, namespaces }
    }

    fn allowed() -> Vec<String> {
        vec!["0x10".into(), "0x20".into()]
    }

    #[tokio::test]
    async fn test_pod_annotation_wins() {
        let src = source(pod(&[(KEY, "0x10")]), namespace(&[(KEY, "0x20")]));
        let mark = lookup(&src, "web", "production", KEY, &allowed())
            .await
            .unwrap();
        assert_eq!(mark.as_deref(), Some("0x10"));
    }

    #[tokio::test]
    async fn test_namespace_fallback() {
        let src = source(pod(&[]), namespace(&[(KEY, "0x20")]));
        let mark = lookup(&src, "web", "production", KEY, &allowed())
            .await
            .unwrap();
        assert_eq!(mark.as_deref(), Some("0x20"));
    }

    #[tokio::test]
    async fn test_neither_annotated_is_not_an_error() {
        let src = source(pod(&[]), namespace(&[]));
        let mark = lookup(&src, "web", "production", KEY, &allowed())
            .await
            .unwrap();
        assert_eq!(mark, None);
    }

    #[tokio::test]
    async fn test_invalid_mark_is_an_error_not_absence() {
        let src = source(pod(&[(KEY, "0x0e00")]), namespace(&[]));
        let err = lookup(&src, "web", "production", KEY, &allowed())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MarkNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_mark_value_normalized() {
        let src = source(pod(&[(KEY, " 0X10 ")]), namespace(&[]));
        let mark = lookup(&src, "web", "production", KEY, &allowed())
            .await
            .unwrap();
        assert_eq!(mark.as_deref(), Some("0x10"));
    }

    #[tokio::test]
    async fn test_pod_not_found_is_distinct_from_key_absent() {
        let src = source(pod(&[]), namespace(&[]));
        let err = lookup(&src, "gone", "production", KEY, &allowed())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_namespace_object_missing() {
        let mut src = source(pod(&[]), namespace(&[]));
        src.namespaces.clear();
        let err = lookup(&src, "web", "production", KEY, &allowed())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(_)));
    }

    #[test]
    fn test_custom_annotation_key() {
        let map = annotations(&[("custom.tenant/fwmark", "0x20")]).unwrap();
        let mark = annotated_mark(&map, "custom.tenant/fwmark", &allowed()).unwrap();
        assert_eq!(mark.as_deref(), Some("0x20"));
        let mark = annotated_mark(&map, KEY, &allowed()).unwrap();
        assert_eq!(mark, None);
    }
}
