use crate::constants;
use crate::errors::Error;
use crate::versions;
use crate::versions::K8sTier;
use crate::workspace::Workspace;

use konstel_api::AttestationConfig;
use konstel_api::Variant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    OpenStack,
    Qemu,
}

impl CloudProvider {

    pub fn as_str(&self) -> &'static str {
	match self {
	    CloudProvider::Aws => "aws",
	    CloudProvider::Azure => "azure",
	    CloudProvider::Gcp => "gcp",
	    CloudProvider::OpenStack => "openstack",
	    CloudProvider::Qemu => "qemu",
	}
    }

    /* Built-in capabilities, overridable from the config document. */
    pub fn default_capability(&self) -> Capability {
	match self {
	    CloudProvider::Aws | CloudProvider::Azure | CloudProvider::Gcp => Capability{ upgrades: true, deprecated: false },
	    CloudProvider::OpenStack | CloudProvider::Qemu => Capability{ upgrades: false, deprecated: false },
	}
    }

    fn accepts_variant(&self, variant: Variant) -> bool {
	match self {
	    CloudProvider::OpenStack => variant == Variant::QemuVtpm,
	    other => variant.provider() == other.as_str(),
	}
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	f.write_str(self.as_str())
    }
}

/* Provider specific IaC inputs, passed through to the templates untouched. */
pub type ProviderInputs = BTreeMap<String, serde_yaml::Value>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<ProviderInputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<ProviderInputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<ProviderInputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<ProviderInputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu: Option<ProviderInputs>,
}

impl ProviderConfig {

    fn configured(&self) -> Vec<(CloudProvider, &ProviderInputs)> {
	let mut configured = Vec::new();
	let all = [
	    (CloudProvider::Aws, &self.aws),
	    (CloudProvider::Azure, &self.azure),
	    (CloudProvider::Gcp, &self.gcp),
	    (CloudProvider::OpenStack, &self.openstack),
	    (CloudProvider::Qemu, &self.qemu),
	];
	for (provider, inputs) in all {
	    if let Some(inputs) = inputs {
		configured.push((provider, inputs));
	    }
	}
	configured
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeGroup {
    pub role: NodeRole,
    pub instance_type: String,
    #[serde(rename = "stateDiskSizeGB")]
    pub state_disk_size_gb: u32,
    pub initial_count: u32,
    #[serde(default)]
    pub zone: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelmConfig {
    pub repository: String,
}

impl Default for HelmConfig {
    fn default() -> Self {
	Self{ repository: constants::DEFAULT_CHART_REPOSITORY.to_string() }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    /* the provider supports re-applying to an initialized cluster */
    #[serde(default)]
    pub upgrades: bool,
    #[serde(default)]
    pub deprecated: bool,
}

/*
 * The cluster configuration document, `konstel-conf.yaml`.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub version: String,

    pub name: String,

    // node image reference; its last path element is the image version
    pub image: String,

    pub kubernetes_version: String,

    pub microservice_version: String,

    #[serde(rename = "serviceCIDR")]
    pub service_cidr: String,

    #[serde(default)]
    pub custom_endpoint: String,

    #[serde(default, rename = "apiServerCertSANs")]
    pub api_server_cert_sans: Vec<String>,

    pub provider: ProviderConfig,

    pub attestation: AttestationConfig,

    #[serde(default)]
    pub node_groups: BTreeMap<String, NodeGroup>,

    #[serde(default)]
    pub helm: HelmConfig,

    #[serde(default)]
    pub capabilities: BTreeMap<String, Capability>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {

    fn error(field: &str, message: impl Into<String>) -> Self {
	Self{ field: field.to_string(), message: message.into(), severity: Severity::Error }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
	Self{ field: field.to_string(), message: message.into(), severity: Severity::Warning }
    }

    /* Semantic issues are only fatal without --force. */
    fn semantic(field: &str, message: impl Into<String>, force: bool) -> Self {
	if force {
	    Self::warning(field, message)
	} else {
	    Self::error(field, message)
	}
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {

    /* Enumerates every offending field, ready to print verbatim. */
    pub fn long_message(&self) -> String {
	let mut msg = format!("{} problem(s) found in {}:", self.issues.len(), constants::CONFIG_FILENAME);
	for issue in &self.issues {
	    msg.push_str(&format!("\n  - {}", issue));
	}
	msg
    }
}

fn valid_cidr(raw: &str) -> bool {
    let (addr, prefix) = match raw.split_once('/') {
	Some(parts) => parts,
	None => return false,
    };
    let prefix: u8 = match prefix.parse() {
	Ok(prefix) => prefix,
	Err(_) => return false,
    };
    match addr.parse::<IpAddr>() {
	Ok(IpAddr::V4(_)) => prefix <= 32,
	Ok(IpAddr::V6(_)) => prefix <= 128,
	Err(_) => false,
    }
}

impl Config {

    /* The single configured cloud provider, if exactly one is set. */
    pub fn cloud_provider(&self) -> Option<CloudProvider> {
	let configured = self.provider.configured();
	match configured.as_slice() {
	    [(provider, _)] => Some(*provider),
	    _ => None,
	}
    }

    pub fn provider_inputs(&self) -> ProviderInputs {
	match self.provider.configured().first() {
	    Some((_, inputs)) => (*inputs).clone(),
	    None => ProviderInputs::new(),
	}
    }

    pub fn capability(&self, provider: CloudProvider) -> Capability {
	match self.capabilities.get(provider.as_str()) {
	    Some(capability) => *capability,
	    None => provider.default_capability(),
	}
    }

    /* Image version without the leading `v`. */
    pub fn image_version(&self) -> String {
	versions::image_version_from_reference(&self.image)
    }

    pub fn k8s_tier(&self) -> K8sTier {
	versions::classify_k8s_version(&self.kubernetes_version)
    }

    pub fn validate(&self, force: bool, cli_version: &str) -> Vec<ValidationIssue> {
	let mut issues = Vec::new();

	if self.version != constants::CONFIG_VERSION {
	    issues.push(ValidationIssue::error("version", format!("unsupported config version {:?}, expected {}", self.version, constants::CONFIG_VERSION)));
	}

	if self.name.is_empty() || self.name.len() > 15
	    || !self.name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
	{
	    issues.push(ValidationIssue::error("name", "must be 1-15 characters of lowercase letters, digits and '-'"));
	}

	if self.image.is_empty() {
	    issues.push(ValidationIssue::error("image", "must not be empty"));
	}

	match self.k8s_tier() {
	    K8sTier::Supported => {},
	    K8sTier::UnknownPatch => {
		issues.push(ValidationIssue::warning(
		    "kubernetesVersion",
		    format!("{} is not a known patch release, Kubernetes upgrades will be skipped", self.kubernetes_version),
		));
	    },
	    K8sTier::Unsupported => {
		issues.push(ValidationIssue::error(
		    "kubernetesVersion",
		    format!("unsupported version {:?}, supported versions are {}", self.kubernetes_version, versions::SUPPORTED_K8S_VERSIONS.join(", ")),
		));
	    },
	}
	if versions::is_preview_k8s_version(&self.kubernetes_version) {
	    issues.push(ValidationIssue::semantic(
		"kubernetesVersion",
		format!("{} is a preview release and not covered by support", self.kubernetes_version),
		force,
	    ));
	}

	if let Err(err) = versions::check_version_compatibility(cli_version, &self.image_version(), &self.microservice_version) {
	    let field = if err.component == "image" { "image" } else { "microserviceVersion" };
	    issues.push(ValidationIssue::semantic(field, err.to_string(), force));
	}

	if !valid_cidr(&self.service_cidr) {
	    issues.push(ValidationIssue::error("serviceCIDR", format!("{:?} is not a valid CIDR", self.service_cidr)));
	}

	if self.api_server_cert_sans.iter().any(|san| san.trim().is_empty()) {
	    issues.push(ValidationIssue::error("apiServerCertSANs", "entries must not be empty"));
	}

	match self.cloud_provider() {
	    None => {
		issues.push(ValidationIssue::error("provider", "exactly one provider section must be set"));
	    },
	    Some(provider) => {
		if self.capability(provider).deprecated {
		    issues.push(ValidationIssue::semantic(
			"provider",
			format!("provider {} is deprecated and will be removed in a future release", provider),
			force,
		    ));
		}
		if !provider.accepts_variant(self.attestation.variant) {
		    issues.push(ValidationIssue::error(
			"attestation.variant",
			format!("variant {} cannot be used on {}", self.attestation.variant, provider),
		    ));
		}
	    },
	}

	for (field, message) in self.attestation.validate() {
	    issues.push(ValidationIssue::error(&format!("attestation.{}", field), message));
	}

	if !self.node_groups.values().any(|g| g.role == NodeRole::ControlPlane) {
	    issues.push(ValidationIssue::error("nodeGroups", "at least one control-plane group is required"));
	}
	for (name, group) in &self.node_groups {
	    if group.instance_type.is_empty() {
		issues.push(ValidationIssue::error(&format!("nodeGroups.{}.instanceType", name), "must not be empty"));
	    }
	    if group.state_disk_size_gb == 0 {
		issues.push(ValidationIssue::error(&format!("nodeGroups.{}.stateDiskSizeGB", name), "must be greater than zero"));
	    }
	    if group.role == NodeRole::ControlPlane && group.initial_count == 0 {
		issues.push(ValidationIssue::error(&format!("nodeGroups.{}.initialCount", name), "control-plane groups need at least one node"));
	    }
	}

	if self.helm.repository.is_empty() {
	    issues.push(ValidationIssue::error("helm.repository", "must not be empty"));
	}

	issues
    }
}

/*
 * Reads and validates the configuration of the workspace. Returns the
 * non-fatal issues next to the config; any fatal issue fails the load with
 * a message listing all of them.
 */
pub fn load(workspace: &Workspace, force: bool) -> Result<(Config, Vec<ValidationIssue>), Error> {
    let path = workspace.config_path();
    let raw = match std::fs::read_to_string(&path) {
	Ok(raw) => raw,
	Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
	    let errmsg = format!("configuration file {} not found", path.display());
	    return Err(Error::Precondition(errmsg));
	},
	Err(err) => return Err(Error::Io(err)),
    };

    let mut config: Config = serde_yaml::from_str(&raw)
	.map_err(|err| Error::Validation(format!("{}: {}", constants::CONFIG_FILENAME, err)))?;
    config.kubernetes_version = versions::resolve_k8s_version(&config.kubernetes_version);

    let (errors, warnings): (Vec<ValidationIssue>, Vec<ValidationIssue>) = config
	.validate(force, constants::CLI_VERSION)
	.into_iter()
	.partition(|issue| issue.severity == Severity::Error);

    if !errors.is_empty() {
	let err = ValidationError{ issues: errors };
	return Err(Error::Validation(err.long_message()));
    }

    log::debug!("loaded configuration for {} cluster {}", config.cloud_provider().map(|p| p.as_str()).unwrap_or("?"), config.name);
    Ok((config, warnings))
}
