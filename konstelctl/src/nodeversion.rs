use crate::config::Config;
use crate::errors::Error;
use crate::kubecmd::{self, KubeUpgrader};
use crate::versions::{self, InvalidUpgradeError, K8sTier};

use konstel_api::NodeVersionSpec;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeVersionOutcome {
    /* the NodeVersion object was written */
    pub updated: bool,

    /* requested changes that were skipped, to be shown as warnings */
    pub skipped: Vec<InvalidUpgradeError>,
}

/*
 * Moves the singleton NodeVersion object to the image and Kubernetes
 * version of the configuration. The node-operator in the cluster rolls
 * the nodes afterwards.
 */
pub struct NodeVersionReconciler<'a> {
    pub kube: &'a dyn KubeUpgrader,
}

fn unsupported_k8s(current: &str, target: &str) -> InvalidUpgradeError {
    InvalidUpgradeError{
	component: "Kubernetes".to_string(),
	from: current.to_string(),
	to: target.to_string(),
	reason: format!("unsupported Kubernetes version, supported versions are {}", versions::SUPPORTED_K8S_VERSIONS.join(", ")),
    }
}

/* Compares what was written with what the API server returned. */
fn check_applied(expected: &NodeVersionSpec, actual: &NodeVersionSpec) -> Result<(), Error> {
    let fields = [
	("imageReference", &expected.image_reference, &actual.image_reference),
	("imageVersion", &expected.image_version, &actual.image_version),
	("kubernetesClusterVersion", &expected.kubernetes_cluster_version, &actual.kubernetes_cluster_version),
    ];
    for (name, expected, actual) in fields {
	if expected != actual {
	    let errmsg = format!("NodeVersion {} was not applied: expected {:?}, got {:?}", name, expected, actual);
	    return Err(Error::Other(errmsg));
	}
    }
    Ok(())
}

impl<'a> NodeVersionReconciler<'a> {

    /*
     * Err(InProgress) if the operator is still busy with an earlier
     * upgrade, Err(Incompatible) if none of the requested changes is a
     * valid upgrade. With `force` the compatibility checks are skipped.
     */
    pub async fn upgrade(&self, config: &Config, force: bool, skip_image: bool, skip_k8s: bool) -> Result<NodeVersionOutcome, Error> {
	let current = self.kube.get_node_version().await?;

	if !force && current.upgrade_in_progress() {
	    return Err(Error::InProgress("another upgrade is in progress".to_string()));
	}

	let mut outcome = NodeVersionOutcome::default();
	let mut desired = current.spec.clone();
	let mut requested = 0;

	if !skip_image {
	    requested += 1;
	    let target = format!("v{}", config.image_version());
	    let valid = if force {
		Ok(true)
	    } else {
		versions::is_valid_upgrade("image", &current.spec.image_version, &target)
	    };
	    match valid {
		Ok(_) => {
		    log::debug!("updating image version from {} to {}", current.spec.image_version, target);
		    desired.image_reference = config.image.clone();
		    desired.image_version = target;
		},
		Err(err) => outcome.skipped.push(err),
	    }
	}

	if !skip_k8s {
	    requested += 1;
	    let target = &config.kubernetes_version;
	    let valid = if config.k8s_tier() == K8sTier::Unsupported {
		Err(unsupported_k8s(&current.spec.kubernetes_cluster_version, target))
	    } else if force {
		Ok(true)
	    } else {
		versions::is_valid_upgrade("Kubernetes", &current.spec.kubernetes_cluster_version, target)
	    };
	    match valid {
		Ok(_) => {
		    log::debug!("updating Kubernetes version from {} to {}", current.spec.kubernetes_cluster_version, target);
		    desired.kubernetes_cluster_version = target.clone();
		},
		Err(err) => outcome.skipped.push(err),
	    }
	}

	if requested > 0 && outcome.skipped.len() == requested {
	    for err in &outcome.skipped[1..] {
		log::warn!("{}", err);
	    }
	    return Err(Error::Incompatible(outcome.skipped.swap_remove(0)));
	}

	if desired == current.spec {
	    log::debug!("NodeVersion already at the requested versions");
	    return Ok(outcome);
	}

	let kube = self.kube;
	let desired = &desired;
	let updated = kubecmd::retry_on_conflict(|| async move {
	    let mut node_version = kube.get_node_version().await?;
	    node_version.spec.image_reference = desired.image_reference.clone();
	    node_version.spec.image_version = desired.image_version.clone();
	    node_version.spec.kubernetes_cluster_version = desired.kubernetes_cluster_version.clone();
	    kube.update_node_version(&node_version).await
	}).await?;

	check_applied(desired, &updated.spec)?;
	log::info!("NodeVersion updated to image {} and Kubernetes {}", desired.image_version, desired.kubernetes_cluster_version);
	outcome.updated = true;
	Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants;
    use crate::kubecmd::MockKubeUpgrader;
    use konstel_api::nodeversion;
    use konstel_api::{ConditionStatus, NodeVersion, NodeVersionCondition};
    use kube::error::ErrorResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(k8s: &str) -> Config {
	let raw = crate::config::tests::sample_yaml(constants::CLI_VERSION, k8s);
	serde_yaml::from_str(&raw).unwrap()
    }

    fn cluster(image: &str, k8s: &str) -> NodeVersion {
	let mut nv = nodeversion::new(NodeVersionSpec{
	    image_reference: format!("ref/stream/stable/{}", image),
	    image_version: image.to_string(),
	    kubernetes_cluster_version: k8s.to_string(),
	});
	nv.metadata.resource_version = Some("1".to_string());
	nv
    }

    fn cli_image() -> String {
	format!("v{}", constants::CLI_VERSION)
    }

    #[tokio::test]
    async fn in_progress_is_reported_without_writing() {
	let mut kube = MockKubeUpgrader::new();
	kube.expect_get_node_version().returning(|| {
	    let mut nv = cluster("v0.0.1", "v1.28.12");
	    nv.status.as_mut().unwrap().conditions.push(NodeVersionCondition::new(nodeversion::CONDITION_OUTDATED, ConditionStatus::TRUE));
	    Ok(nv)
	});
	kube.expect_update_node_version().times(0);

	let r = NodeVersionReconciler{ kube: &kube };
	let err = r.upgrade(&config("v1.29.7"), false, false, false).await.unwrap_err();
	assert!(matches!(err, Error::InProgress(_)));
    }

    #[tokio::test]
    async fn equal_versions_are_a_no_op() {
	let image = cli_image();
	let mut kube = MockKubeUpgrader::new();
	kube.expect_get_node_version().returning(move || {
	    let mut nv = cluster(&image, "v1.29.7");
	    nv.spec.image_reference = format!("ref/stream/stable/{}", image);
	    Ok(nv)
	});
	kube.expect_update_node_version().times(0);

	let r = NodeVersionReconciler{ kube: &kube };
	let outcome = r.upgrade(&config("v1.29.7"), false, false, false).await.unwrap();
	assert!(!outcome.updated);
	assert!(outcome.skipped.is_empty());
    }

    #[tokio::test]
    async fn k8s_step_is_written_after_a_conflict() {
	let image = cli_image();
	let mut kube = MockKubeUpgrader::new();
	kube.expect_get_node_version().returning(move || Ok(cluster(&image, "v1.28.12")));

	let attempts = Arc::new(AtomicUsize::new(0));
	let seen = attempts.clone();
	kube.expect_update_node_version().times(2).returning(move |nv| {
	    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
		return Err(Error::Kube(kube::Error::Api(ErrorResponse{
		    status: "Failure".to_string(),
		    message: "conflict".to_string(),
		    reason: "Conflict".to_string(),
		    code: 409,
		})));
	    }
	    Ok(nv.clone())
	});

	let r = NodeVersionReconciler{ kube: &kube };
	let outcome = r.upgrade(&config("v1.29.7"), false, false, false).await.unwrap();
	assert!(outcome.updated);
	assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn minor_skip_is_skipped_with_warning() {
	let image = cli_image();
	let mut kube = MockKubeUpgrader::new();
	// image already current, k8s would jump two minors
	kube.expect_get_node_version().returning(move || Ok(cluster(&image, "v1.28.12")));
	kube.expect_update_node_version().times(0);

	let r = NodeVersionReconciler{ kube: &kube };
	let outcome = r.upgrade(&config("v1.30.3"), false, true, false).await;
	match outcome {
	    Err(Error::Incompatible(err)) => assert_eq!(err.component, "Kubernetes"),
	    other => panic!("expected incompatible upgrade, got {:?}", other),
	}
    }

    #[tokio::test]
    async fn one_invalid_component_does_not_block_the_other() {
	let mut kube = MockKubeUpgrader::new();
	// cluster runs a newer image than configured: image downgrade
	kube.expect_get_node_version().returning(|| Ok(cluster("v99.0.0", "v1.28.12")));
	kube.expect_update_node_version().times(1).returning(|nv| Ok(nv.clone()));

	let r = NodeVersionReconciler{ kube: &kube };
	let outcome = r.upgrade(&config("v1.29.7"), false, false, false).await.unwrap();
	assert!(outcome.updated);
	assert_eq!(outcome.skipped.len(), 1);
	assert_eq!(outcome.skipped[0].component, "image");
    }

    #[tokio::test]
    async fn mismatching_write_is_an_error() {
	let image = cli_image();
	let mut kube = MockKubeUpgrader::new();
	kube.expect_get_node_version().returning(move || Ok(cluster(&image, "v1.28.12")));
	kube.expect_update_node_version().returning(|nv| {
	    let mut nv = nv.clone();
	    nv.spec.kubernetes_cluster_version = "v1.28.12".to_string();
	    Ok(nv)
	});

	let r = NodeVersionReconciler{ kube: &kube };
	let err = r.upgrade(&config("v1.29.7"), false, false, false).await.unwrap_err();
	assert!(err.to_string().contains("kubernetesClusterVersion"));
    }
}
