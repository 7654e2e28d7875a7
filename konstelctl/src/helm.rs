use crate::config::Config;
use crate::errors::Error;
use crate::init::MasterSecret;
use crate::state::State;
use crate::versions::{self, InvalidUpgradeError};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

pub const CILIUM_RELEASE: &str = "cilium";
pub const CERT_MANAGER_RELEASE: &str = "cert-manager";
pub const OPERATORS_RELEASE: &str = "konstel-operators";
pub const SERVICES_RELEASE: &str = "konstel-services";

const CILIUM_VERSION: &str = "1.15.8";
const CERT_MANAGER_VERSION: &str = "1.14.5";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitMode {
    /* return once helm accepted the release */
    None,
    /* wait for readiness, roll back on timeout */
    Atomic,
}

/* What to do with a release whose upgrade destroys custom resources. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DestructivePolicy {
    Deny,
    Allow,
    Skip,
}

#[derive(Debug, Clone)]
pub struct ChartOptions {
    pub force: bool,
    pub conformance: bool,
    pub wait_mode: WaitMode,
    pub timeout: Duration,
    pub destructive: DestructivePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseAction {
    Install,
    Upgrade { from: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub name: String,
    pub chart: String,
    pub namespace: String,
    pub version: String,
    pub values: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRelease {
    pub release: Release,
    pub action: ReleaseAction,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    pub releases: Vec<PlannedRelease>,
    pub includes_upgrades: bool,
}

impl Prepared {

    fn new(releases: Vec<PlannedRelease>) -> Self {
	let includes_upgrades = releases.iter().any(|r| matches!(r.action, ReleaseAction::Upgrade{..}));
	Self{
	    releases: releases,
	    includes_upgrades: includes_upgrades,
	}
    }

    pub fn is_empty(&self) -> bool {
	self.releases.is_empty()
    }
}

fn skipped_message(errors: &[InvalidUpgradeError]) -> String {
    let lines: Vec<String> = errors.iter()
	.map(|e| format!("skipping {} upgrade: {}", e.component, e))
	.collect();
    lines.join("\n")
}

#[derive(Error, Debug)]
pub enum ChartError {

    /* upgrading `release` destroys custom resources */
    #[error("upgrading {release} requires confirmation")]
    ConfirmationRequired { release: String },

    /*
     * Some upgrades violate the version policy. `prepared` holds the
     * installs that can go ahead regardless.
     */
    #[error("{}", skipped_message(.errors))]
    Incompatible {
	errors: Vec<InvalidUpgradeError>,
	prepared: Prepared,
    },

    #[error(transparent)]
    Other(#[from] Error),
}

/*
 * Installs and upgrades the in-cluster services. `prepare` decides what
 * has to change, `save_charts` materializes that plan for the record,
 * `apply` executes it.
 */
#[async_trait]
pub trait ChartApplier: Send + Sync {
    async fn prepare(&self, config: &Config, state: &State, secret: &MasterSecret, options: &ChartOptions) -> Result<Prepared, ChartError>;
    async fn save_charts(&self, prepared: &Prepared, dir: &Path) -> Result<(), Error>;
    async fn apply(&self, prepared: &Prepared, options: &ChartOptions) -> Result<(), Error>;
}

/* The releases this CLI version ships, in install order. */
pub fn desired_releases(config: &Config, state: &State, secret: &MasterSecret, options: &ChartOptions) -> Result<Vec<Release>, Error> {
    let infra = &state.infrastructure;
    let microservices = config.microservice_version.trim_start_matches('v').to_string();
    let provider = config.cloud_provider().map(|p| p.as_str()).unwrap_or_default();

    Ok(vec![
	Release{
	    name: CILIUM_RELEASE.to_string(),
	    chart: CILIUM_RELEASE.to_string(),
	    namespace: "kube-system".to_string(),
	    version: CILIUM_VERSION.to_string(),
	    values: serde_json::json!({
		"k8sServiceHost": infra.in_cluster_endpoint,
		"k8sServicePort": 6443,
		"ipv4NativeRoutingCIDR": infra.ip_cidr_node,
		"encryption": { "enabled": true, "type": "wireguard" },
	    }),
	},
	Release{
	    name: CERT_MANAGER_RELEASE.to_string(),
	    chart: CERT_MANAGER_RELEASE.to_string(),
	    namespace: "cert-manager".to_string(),
	    version: CERT_MANAGER_VERSION.to_string(),
	    values: serde_json::json!({ "installCRDs": true }),
	},
	Release{
	    name: OPERATORS_RELEASE.to_string(),
	    chart: OPERATORS_RELEASE.to_string(),
	    namespace: "kube-system".to_string(),
	    version: microservices.clone(),
	    values: serde_json::json!({
		"csp": provider,
		"uid": infra.uid,
	    }),
	},
	Release{
	    name: SERVICES_RELEASE.to_string(),
	    chart: SERVICES_RELEASE.to_string(),
	    namespace: "kube-system".to_string(),
	    version: microservices,
	    values: serde_json::json!({
		"csp": provider,
		"clusterName": infra.name,
		"conformance": options.conformance,
		"attestationVariant": config.attestation.variant.as_str(),
		"measurementSalt": state.cluster_values.measurement_salt,
		"masterSecret": BASE64.encode(secret.key()?),
		"masterSecretSalt": BASE64.encode(secret.salt()?),
	    }),
	},
    ])
}

/*
 * Compares the desired releases with the installed versions (release name
 * to chart version) and decides per release.
 */
pub fn plan_releases(desired: Vec<Release>, installed: &BTreeMap<String, String>, options: &ChartOptions) -> Result<Prepared, ChartError> {
    let mut planned = Vec::new();
    let mut invalid = Vec::new();

    for release in desired {
	let current = match installed.get(&release.name) {
	    Some(current) => current.clone(),
	    None => {
		log::debug!("release {} not installed, adding install", release.name);
		planned.push(PlannedRelease{ release: release, action: ReleaseAction::Install });
		continue;
	    },
	};

	if !options.force {
	    match versions::is_valid_upgrade(&release.name, &current, &release.version) {
		Ok(true) => {},
		Ok(false) => {
		    log::debug!("release {} already at {}", release.name, current);
		    continue;
		},
		Err(err) => {
		    invalid.push(err);
		    continue;
		},
	    }
	}

	if release.name == CERT_MANAGER_RELEASE {
	    match options.destructive {
		DestructivePolicy::Deny => {
		    return Err(ChartError::ConfirmationRequired{ release: release.name });
		},
		DestructivePolicy::Skip => {
		    log::info!("leaving {} at {}", release.name, current);
		    continue;
		},
		DestructivePolicy::Allow => {},
	    }
	}

	log::debug!("upgrading {} from {} to {}", release.name, current, release.version);
	planned.push(PlannedRelease{ release: release, action: ReleaseAction::Upgrade{ from: current } });
    }

    if !invalid.is_empty() {
	// upgrades wait until the version policy is satisfied, installs do not
	planned.retain(|r| r.action == ReleaseAction::Install);
	return Err(ChartError::Incompatible{ errors: invalid, prepared: Prepared::new(planned) });
    }

    Ok(Prepared::new(planned))
}

#[derive(Debug, Deserialize)]
struct ListedRelease {
    name: String,
    chart: String,
}

/* `helm list -o json` reports `<chart>-<version>` in the chart field. */
fn parse_release_list(raw: &[u8]) -> Result<BTreeMap<String, String>, Error> {
    let listed: Vec<ListedRelease> = serde_json::from_slice(raw)?;
    let mut installed = BTreeMap::new();
    for release in listed {
	let version = match release.chart.rsplit_once('-') {
	    Some((_, version)) => version.trim_start_matches('v').to_string(),
	    None => return Err(Error::Other(format!("cannot parse chart version of release {} from {:?}", release.name, release.chart))),
	};
	installed.insert(release.name, version);
    }
    Ok(installed)
}

fn upgrade_args(release: &Release, chart_ref: &str, values: &Path, kubeconfig: &Path, options: &ChartOptions) -> Vec<String> {
    let mut args = vec![
	"upgrade".to_string(), "--install".to_string(),
	release.name.clone(), chart_ref.to_string(),
	"--version".to_string(), release.version.clone(),
	"--namespace".to_string(), release.namespace.clone(), "--create-namespace".to_string(),
	"--values".to_string(), values.display().to_string(),
	"--kubeconfig".to_string(), kubeconfig.display().to_string(),
    ];
    if options.wait_mode == WaitMode::Atomic {
	args.push("--atomic".to_string());
	args.push("--wait".to_string());
	args.push("--timeout".to_string());
	args.push(format!("{}s", options.timeout.as_secs()));
    }
    args
}

/*
 * ChartApplier backed by the `helm` binary. Releases are tracked by
 * helm's own release registry, never touched directly.
 */
pub struct HelmCli {
    binary: String,
    kubeconfig: PathBuf,
    repository: String,
}

impl HelmCli {

    pub fn new(kubeconfig: PathBuf, repository: &str) -> Self {
	Self{
	    binary: "helm".to_string(),
	    kubeconfig: kubeconfig,
	    repository: repository.trim_end_matches('/').to_string(),
	}
    }

    fn chart_ref(&self, release: &Release) -> String {
	format!("{}/{}", self.repository, release.chart)
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, Error> {
	let command = format!("{} {}", self.binary, args.join(" "));
	log::debug!("running {}", command);

	let output = Command::new(&self.binary)
	    .args(args)
	    .kill_on_drop(true)
	    .output()
	    .await
	    .map_err(|e| Error::command(&command, e.to_string()))?;
	if !output.status.success() {
	    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
	    return Err(Error::command(command, stderr));
	}
	Ok(output.stdout)
    }

    async fn installed(&self) -> Result<BTreeMap<String, String>, Error> {
	let args = vec![
	    "list".to_string(), "--all-namespaces".to_string(), "--output".to_string(), "json".to_string(),
	    "--kubeconfig".to_string(), self.kubeconfig.display().to_string(),
	];
	parse_release_list(&self.run(&args).await?)
    }
}

#[async_trait]
impl ChartApplier for HelmCli {

    async fn prepare(&self, config: &Config, state: &State, secret: &MasterSecret, options: &ChartOptions) -> Result<Prepared, ChartError> {
	let installed = self.installed().await?;
	plan_releases(desired_releases(config, state, secret, options)?, &installed, options)
    }

    async fn save_charts(&self, prepared: &Prepared, dir: &Path) -> Result<(), Error> {
	for planned in &prepared.releases {
	    let release = &planned.release;
	    let target = dir.join(&release.name);
	    fs::create_dir_all(&target)?;

	    let args = vec![
		"pull".to_string(), self.chart_ref(release),
		"--version".to_string(), release.version.clone(),
		"--destination".to_string(), target.display().to_string(),
	    ];
	    self.run(&args).await?;
	    fs::write(target.join("values.yaml"), serde_yaml::to_string(&release.values)?)?;
	}
	Ok(())
    }

    async fn apply(&self, prepared: &Prepared, options: &ChartOptions) -> Result<(), Error> {
	for planned in &prepared.releases {
	    let release = &planned.release;
	    let mut values = tempfile::NamedTempFile::new()?;
	    values.write_all(serde_yaml::to_string(&release.values)?.as_bytes())?;
	    values.flush()?;

	    let args = upgrade_args(release, &self.chart_ref(release), values.path(), &self.kubeconfig, options);
	    self.run(&args).await?;
	    log::info!("release {} at {}", release.name, release.version);
	}
	Ok(())
    }
}
