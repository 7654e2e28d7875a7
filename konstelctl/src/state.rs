use crate::constants;
use crate::errors::Error;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

/*
 * State of the cloud resources, as reported by the IaC backend after the
 * infrastructure was created or changed.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {

    // identifier every cloud resource of the cluster is tagged with
    #[serde(default)]
    pub uid: String,

    // endpoint used by the CLI to reach the cluster
    #[serde(default)]
    pub cluster_endpoint: String,

    #[serde(default)]
    pub in_cluster_endpoint: String,

    // hex encoded secret proving to the bootstrapper who created it
    #[serde(default)]
    pub init_secret: String,

    #[serde(default, rename = "apiServerCertSANs")]
    pub api_server_cert_sans: Vec<String>,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub ip_cidr_node: String,

    // provider specific identifiers (resource group, project, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider: BTreeMap<String, String>,
}

/* Values set once, when the cluster is initialized. */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterValues {

    #[serde(default, rename = "clusterID")]
    pub cluster_id: String,

    #[serde(default, rename = "ownerID")]
    pub owner_id: String,

    // hex encoded
    #[serde(default)]
    pub measurement_salt: String,
}

impl ClusterValues {

    pub fn is_empty(&self) -> bool {
	self.cluster_id.is_empty() && self.owner_id.is_empty() && self.measurement_salt.is_empty()
    }
}

/*
 * The state record, `konstel-state.yaml`: what is known to be true about
 * the cluster.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub version: String,

    #[serde(default)]
    pub infrastructure: Infrastructure,

    #[serde(default)]
    pub cluster_values: ClusterValues,
}

impl Default for State {
    fn default() -> Self {
	Self::new()
    }
}

fn override_str(dst: &mut String, src: &str) {
    if !src.is_empty() {
	*dst = src.to_string();
    }
}

fn valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
	return false;
    }
    name.trim_end_matches('.').split('.').all(|label| {
	!label.is_empty()
	    && label.len() <= 63
	    && !label.starts_with('-')
	    && !label.ends_with('-')
	    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn valid_endpoint(endpoint: &str) -> bool {
    endpoint.parse::<IpAddr>().is_ok() || valid_dns_name(endpoint)
}

impl State {

    pub fn new() -> Self {
	Self{
	    version: constants::STATE_VERSION.to_string(),
	    infrastructure: Infrastructure::default(),
	    cluster_values: ClusterValues::default(),
	}
    }

    /* Field-wise merge: every non-empty field of `other` wins. */
    pub fn merge(&mut self, other: &State) {
	let dst = &mut self.infrastructure;
	let src = &other.infrastructure;
	override_str(&mut dst.uid, &src.uid);
	override_str(&mut dst.cluster_endpoint, &src.cluster_endpoint);
	override_str(&mut dst.in_cluster_endpoint, &src.in_cluster_endpoint);
	override_str(&mut dst.init_secret, &src.init_secret);
	override_str(&mut dst.name, &src.name);
	override_str(&mut dst.ip_cidr_node, &src.ip_cidr_node);
	if !src.api_server_cert_sans.is_empty() {
	    dst.api_server_cert_sans = src.api_server_cert_sans.clone();
	}
	for (key, value) in &src.provider {
	    dst.provider.insert(key.clone(), value.clone());
	}

	let dst = &mut self.cluster_values;
	let src = &other.cluster_values;
	override_str(&mut dst.cluster_id, &src.cluster_id);
	override_str(&mut dst.owner_id, &src.owner_id);
	override_str(&mut dst.measurement_salt, &src.measurement_salt);
    }

    /* Merges a fresh infrastructure snapshot, cluster values stay untouched. */
    pub fn set_infrastructure(&mut self, infra: Infrastructure) {
	let mut update = State::new();
	update.infrastructure = infra;
	self.merge(&update);
    }

    pub fn set_cluster_values(&mut self, values: ClusterValues) {
	let mut update = State::new();
	update.cluster_values = values;
	self.merge(&update);
    }

    /*
     * Checks the constraints the bootstrapper relies on: a reachable
     * endpoint, identifiers from the IaC run, and no cluster values yet.
     */
    pub fn validate_pre_init(&self) -> Result<(), Error> {
	let mut problems = Vec::new();
	let infra = &self.infrastructure;

	if !valid_endpoint(&infra.cluster_endpoint) {
	    problems.push(format!("infrastructure.clusterEndpoint {:?} is neither an IP address nor a DNS name", infra.cluster_endpoint));
	}
	if !infra.in_cluster_endpoint.is_empty() && !valid_endpoint(&infra.in_cluster_endpoint) {
	    problems.push(format!("infrastructure.inClusterEndpoint {:?} is neither an IP address nor a DNS name", infra.in_cluster_endpoint));
	}
	if infra.uid.is_empty() {
	    problems.push("infrastructure.uid must not be empty".to_string());
	}
	if infra.name.is_empty() {
	    problems.push("infrastructure.name must not be empty".to_string());
	}
	if hex::decode(&infra.init_secret).is_err() {
	    problems.push("infrastructure.initSecret must be hex encoded".to_string());
	}
	if !self.cluster_values.is_empty() {
	    problems.push("clusterValues must be empty before the cluster is initialized".to_string());
	}

	if problems.is_empty() {
	    Ok(())
	} else {
	    let errmsg = format!("state file is not ready for initialization: {}", problems.join("; "));
	    Err(Error::Precondition(errmsg))
	}
    }

    /*
     * Writes the record atomically: a temp file in the same directory is
     * synced, renamed over the target, then the directory itself is synced.
     */
    pub fn write(&self, path: &Path) -> Result<(), Error> {
	let dir = match path.parent() {
	    Some(dir) if !dir.as_os_str().is_empty() => dir,
	    _ => Path::new("."),
	};
	let content = serde_yaml::to_string(self)?;

	let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
	tmp.write_all(content.as_bytes())?;
	tmp.as_file().sync_all()?;
	tmp.persist(path).map_err(|err| Error::Io(err.error))?;

	fs::File::open(dir)?.sync_all()?;
	log::debug!("wrote state file {}", path.display());
	Ok(())
    }
}

/*
 * Reads the state record. A missing file is Error::NotFound; a document
 * that cannot be parsed or carries an unknown schema version is fatal.
 */
pub fn load(path: &Path) -> Result<State, Error> {
    let raw = match fs::read_to_string(path) {
	Ok(raw) => raw,
	Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
	    return Err(Error::NotFound(format!("state file {}", path.display())));
	},
	Err(err) => return Err(Error::Io(err)),
    };

    let state: State = serde_yaml::from_str(&raw)
	.map_err(|err| Error::Fatal(format!("state file {} is corrupt: {}", path.display(), err)))?;
    if state.version != constants::STATE_VERSION {
	let errmsg = format!("state file {} has version {:?}, this CLI only understands {}", path.display(), state.version, constants::STATE_VERSION);
	return Err(Error::Fatal(errmsg));
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infra() -> Infrastructure {
	Infrastructure{
	    uid: "uid1".to_string(),
	    cluster_endpoint: "192.0.2.10".to_string(),
	    in_cluster_endpoint: "10.0.0.1".to_string(),
	    init_secret: "0011".to_string(),
	    api_server_cert_sans: vec!["192.0.2.10".to_string()],
	    name: "demo-uid1".to_string(),
	    ip_cidr_node: "192.168.178.0/24".to_string(),
	    provider: BTreeMap::new(),
	}
    }

    #[test]
    fn merge_is_field_wise() {
	let mut state = State::new();
	state.cluster_values.owner_id = "O1".to_string();
	state.set_infrastructure(infra());

	let mut update = Infrastructure::default();
	update.cluster_endpoint = "198.51.100.1".to_string();
	state.set_infrastructure(update);

	assert_eq!(state.infrastructure.cluster_endpoint, "198.51.100.1");
	assert_eq!(state.infrastructure.uid, "uid1");
	assert_eq!(state.cluster_values.owner_id, "O1");
    }

    #[test]
    fn write_then_load() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join(constants::STATE_FILENAME);

	assert!(matches!(load(&path), Err(Error::NotFound(_))));

	let mut state = State::new();
	state.set_infrastructure(infra());
	state.write(&path).unwrap();
	assert_eq!(load(&path).unwrap(), state);

	// no temp files are left behind
	let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
	assert_eq!(entries.len(), 1);
    }

    #[test]
    fn unknown_version_is_fatal() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join(constants::STATE_FILENAME);

	fs::write(&path, "version: v2\n").unwrap();
	assert!(matches!(load(&path), Err(Error::Fatal(_))));

	fs::write(&path, "version: [").unwrap();
	assert!(matches!(load(&path), Err(Error::Fatal(_))));
    }

    #[test]
    fn pre_init_constraints() {
	let mut state = State::new();
	state.set_infrastructure(infra());
	assert!(state.validate_pre_init().is_ok());

	state.infrastructure.cluster_endpoint = "not an endpoint".to_string();
	assert!(state.validate_pre_init().is_err());

	state.infrastructure.cluster_endpoint = "api.demo.example.com".to_string();
	state.cluster_values.cluster_id = "C1".to_string();
	match state.validate_pre_init() {
	    Err(Error::Precondition(msg)) => assert!(msg.contains("clusterValues")),
	    other => panic!("expected precondition, got {:?}", other),
	}
    }

    #[test]
    fn uses_camel_case_keys() {
	let mut state = State::new();
	state.cluster_values.owner_id = "O1".to_string();
	let yaml = serde_yaml::to_string(&state).unwrap();
	assert!(yaml.contains("clusterValues:"));
	assert!(yaml.contains("ownerID: O1"));
	assert!(yaml.contains("apiServerCertSANs:"));
    }
}
