use crate::constants;
use crate::errors::Error;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition as KubeCrd;
use konstel_api::attestation::{ATTESTATION_CONFIG_BACKUP_KEY, ATTESTATION_CONFIG_KEY, JOIN_CONFIG_MAP, JOIN_CONFIG_NAMESPACE, MEASUREMENT_SALT_KEY};
use konstel_api::nodeversion::NODE_VERSION_NAME;
use konstel_api::{AttestationConfig, NodeVersion, Variant};
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::DynamicObject as KubeDynamicObject;
use kube::api::ListParams as KubeListParams;
use kube::api::ObjectMeta;
use kube::api::PostParams as KubePostParams;
use kube::discovery::ApiResource as KubeApiResource;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/*
 * Everything the apply pipeline does against the cluster API once the
 * admin kubeconfig exists.
 */
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeUpgrader: Send + Sync {

    /* The join policy stored in the cluster, None if not created yet. */
    async fn get_attestation_config(&self, variant: Variant) -> Result<Option<AttestationConfig>, Error>;

    /* Creates the join-config, or replaces it keeping the old policy as backup. */
    async fn apply_attestation_config(&self, config: &AttestationConfig, measurement_salt: &[u8]) -> Result<(), Error>;

    /* Adds the missing SANs to the kubeadm ClusterConfiguration, returning them. */
    async fn extend_cert_sans(&self, sans: &[String]) -> Result<Vec<String>, Error>;

    async fn get_node_version(&self) -> Result<NodeVersion, Error>;

    /* Compare-and-swap on the resourceVersion carried by `node_version`. */
    async fn update_node_version(&self, node_version: &NodeVersion) -> Result<NodeVersion, Error>;

    /* Writes every CRD below `dir`, returning what was saved. */
    async fn backup_crds(&self, dir: &Path) -> Result<Vec<KubeCrd>, Error>;

    /* Writes every custom resource of `crds` below `dir`. */
    async fn backup_crs(&self, crds: &[KubeCrd], dir: &Path) -> Result<(), Error>;
}

pub fn is_conflict(err: &Error) -> bool {
    match err.root() {
	Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
	_ => false,
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/*
 * Runs `op` again when the API server rejects a write with 409 Conflict,
 * up to CONFLICT_RETRIES attempts. `op` must re-read the object.
 */
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
	match op().await {
	    Err(err) if is_conflict(&err) && attempt < constants::CONFLICT_RETRIES => {
		log::debug!("write conflicted (attempt {}/{}), retrying", attempt, constants::CONFLICT_RETRIES);
		tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
		attempt += 1;
	    },
	    other => return other,
	}
    }
}

/* Drops what the API server fills in, so a backup can be re-applied. */
pub fn strip_server_metadata(meta: &mut ObjectMeta) {
    meta.resource_version = None;
    meta.uid = None;
    meta.managed_fields = None;
    meta.creation_timestamp = None;
    meta.generation = None;
}

/* Extends the certSANs of a kubeadm ClusterConfiguration document. */
pub fn add_cert_sans(cluster_config: &str, sans: &[String]) -> Result<(String, Vec<String>), Error> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(cluster_config)?;
    let root = doc.as_mapping_mut()
	.ok_or_else(|| Error::Other("ClusterConfiguration is not a mapping".to_string()))?;

    let api_server = root
	.entry(serde_yaml::Value::from("apiServer"))
	.or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    let api_server = api_server.as_mapping_mut()
	.ok_or_else(|| Error::Other("ClusterConfiguration.apiServer is not a mapping".to_string()))?;

    let mut existing: Vec<String> = match api_server.get("certSANs") {
	Some(value) => serde_yaml::from_value(value.clone())?,
	None => Vec::new(),
    };

    let mut missing = Vec::new();
    for san in sans {
	if san.is_empty() || existing.contains(san) || missing.contains(san) {
	    continue;
	}
	missing.push(san.clone());
    }
    if missing.is_empty() {
	return Ok((cluster_config.to_string(), missing));
    }

    existing.extend(missing.iter().cloned());
    existing.sort();
    api_server.insert(serde_yaml::Value::from("certSANs"), serde_yaml::to_value(&existing)?);

    Ok((serde_yaml::to_string(&doc)?, missing))
}

fn write_yaml<T: Serialize>(path: &Path, obj: &T) -> Result<(), Error> {
    if let Some(dir) = path.parent() {
	fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_yaml::to_string(obj)?)?;
    Ok(())
}

/* `<dir>/<group>/<version>/<plural>/<namespace>/<name>.yaml` */
pub fn cr_backup_path(dir: &Path, resource: &KubeApiResource, namespace: Option<&str>, name: &str) -> PathBuf {
    dir.join(&resource.group)
	.join(&resource.version)
	.join(&resource.plural)
	.join(namespace.unwrap_or("_cluster"))
	.join(format!("{}.yaml", name))
}

/*
 * KubeUpgrader talking to a real API server.
 */
pub struct KubeCmd {
    client: KubeClient,
}

impl KubeCmd {

    pub fn new(client: KubeClient) -> Self {
	Self{ client: client }
    }

    fn config_maps(&self) -> KubeApi<KubeConfigMap> {
	KubeApi::namespaced(self.client.clone(), JOIN_CONFIG_NAMESPACE)
    }

    fn node_versions(&self) -> KubeApi<NodeVersion> {
	KubeApi::all(self.client.clone())
    }
}

#[async_trait]
impl KubeUpgrader for KubeCmd {

    async fn get_attestation_config(&self, variant: Variant) -> Result<Option<AttestationConfig>, Error> {
	let join_config = match self.config_maps().get_opt(JOIN_CONFIG_MAP).await? {
	    Some(cm) => cm,
	    None => return Ok(None),
	};

	let raw = join_config.data
	    .as_ref()
	    .and_then(|data| data.get(ATTESTATION_CONFIG_KEY))
	    .ok_or_else(|| Error::Other("attestation config missing from join-config".to_string()))?;

	let current = AttestationConfig::from_yaml(raw)?;
	if current.variant != variant {
	    log::warn!("cluster join-config holds variant {}, configuration uses {}", current.variant, variant);
	}
	Ok(Some(current))
    }

    async fn apply_attestation_config(&self, config: &AttestationConfig, measurement_salt: &[u8]) -> Result<(), Error> {
	let api = self.config_maps();
	let encoded = config.to_yaml()?;

	if api.get_opt(JOIN_CONFIG_MAP).await?.is_none() {
	    let mut meta = ObjectMeta::default();
	    meta.name = Some(JOIN_CONFIG_MAP.to_string());
	    meta.namespace = Some(JOIN_CONFIG_NAMESPACE.to_string());

	    let join_config = KubeConfigMap{
		metadata: meta,
		data: Some(BTreeMap::from([(ATTESTATION_CONFIG_KEY.to_string(), encoded)])),
		binary_data: Some(BTreeMap::from([(MEASUREMENT_SALT_KEY.to_string(), ByteString(measurement_salt.to_vec()))])),
		..Default::default()
	    };
	    api.create(&KubePostParams::default(), &join_config).await?;
	    log::debug!("created {}/{}", JOIN_CONFIG_NAMESPACE, JOIN_CONFIG_MAP);
	    return Ok(());
	}

	let api = &api;
	let encoded = &encoded;
	retry_on_conflict(|| async move {
	    let mut join_config = api.get(JOIN_CONFIG_MAP).await?;
	    let data = join_config.data.get_or_insert_with(BTreeMap::new);
	    if let Some(previous) = data.get(ATTESTATION_CONFIG_KEY).cloned() {
		data.insert(ATTESTATION_CONFIG_BACKUP_KEY.to_string(), previous);
	    }
	    data.insert(ATTESTATION_CONFIG_KEY.to_string(), encoded.clone());
	    api.replace(JOIN_CONFIG_MAP, &KubePostParams::default(), &join_config).await?;
	    Ok(())
	}).await?;

	log::debug!("replaced {}/{}", JOIN_CONFIG_NAMESPACE, JOIN_CONFIG_MAP);
	Ok(())
    }

    async fn extend_cert_sans(&self, sans: &[String]) -> Result<Vec<String>, Error> {
	let api: KubeApi<KubeConfigMap> = KubeApi::namespaced(self.client.clone(), constants::KUBE_SYSTEM_NAMESPACE);
	let api = &api;

	retry_on_conflict(|| async move {
	    let mut kubeadm_config = api.get(constants::KUBEADM_CONFIG_MAP).await?;
	    let current = kubeadm_config.data
		.as_ref()
		.and_then(|data| data.get(constants::CLUSTER_CONFIGURATION_KEY))
		.cloned()
		.ok_or_else(|| Error::Other(format!("{} has no {}", constants::KUBEADM_CONFIG_MAP, constants::CLUSTER_CONFIGURATION_KEY)))?;

	    let (updated, added) = add_cert_sans(&current, sans)?;
	    if added.is_empty() {
		return Ok(added);
	    }

	    log::debug!("extending apiserver certSANs with {}", added.join(", "));
	    kubeadm_config.data
		.get_or_insert_with(BTreeMap::new)
		.insert(constants::CLUSTER_CONFIGURATION_KEY.to_string(), updated);
	    api.replace(constants::KUBEADM_CONFIG_MAP, &KubePostParams::default(), &kubeadm_config).await?;
	    Ok(added)
	}).await
    }

    async fn get_node_version(&self) -> Result<NodeVersion, Error> {
	match self.node_versions().get_opt(NODE_VERSION_NAME).await? {
	    Some(nv) => Ok(nv),
	    None => Err(Error::NotFound(format!("NodeVersion {}", NODE_VERSION_NAME))),
	}
    }

    async fn update_node_version(&self, node_version: &NodeVersion) -> Result<NodeVersion, Error> {
	let updated = self.node_versions()
	    .replace(NODE_VERSION_NAME, &KubePostParams::default(), node_version)
	    .await?;
	Ok(updated)
    }

    async fn backup_crds(&self, dir: &Path) -> Result<Vec<KubeCrd>, Error> {
	let api: KubeApi<KubeCrd> = KubeApi::all(self.client.clone());
	let crds = api.list(&KubeListParams::default()).await?;

	let mut saved = Vec::new();
	for mut crd in crds.items {
	    let name = crd.metadata.name.clone().unwrap_or_default();
	    strip_server_metadata(&mut crd.metadata);
	    crd.status = None;
	    write_yaml(&dir.join("crds").join(format!("{}.yaml", name)), &crd)?;
	    saved.push(crd);
	}

	log::info!("backed up {} CRDs to {}", saved.len(), dir.display());
	Ok(saved)
    }

    async fn backup_crs(&self, crds: &[KubeCrd], dir: &Path) -> Result<(), Error> {
	for crd in crds {
	    for version in &crd.spec.versions {
		let resource = KubeApiResource{
		    group: crd.spec.group.clone(),
		    version: version.name.clone(),
		    api_version: format!("{}/{}", crd.spec.group, version.name),
		    kind: crd.spec.names.kind.clone(),
		    plural: crd.spec.names.plural.clone(),
		};
		let api: KubeApi<KubeDynamicObject> = KubeApi::all_with(self.client.clone(), &resource);

		let objects = match api.list(&KubeListParams::default()).await {
		    Ok(objects) => objects,
		    Err(err) if is_not_found(&err) => {
			log::debug!("{} is not served, skipping", resource.api_version);
			continue;
		    },
		    Err(err) => return Err(Error::Kube(err)),
		};

		for mut obj in objects.items {
		    let name = obj.metadata.name.clone().unwrap_or_default();
		    let namespace = obj.metadata.namespace.clone();
		    strip_server_metadata(&mut obj.metadata);
		    write_yaml(&cr_backup_path(dir, &resource, namespace.as_deref(), &name), &obj)?;
		}
	    }
	}
	Ok(())
    }
}
