use crate::config::Config;
use crate::constants;
use crate::errors::Error;
use crate::helm::{ChartApplier, HelmCli};
use crate::infra::{InfraApplier, TerraformApplier};
use crate::init::atls::{AtlsDialer, MeasurementValidator};
use crate::init::InitDialer;
use crate::kubecmd::{KubeCmd, KubeUpgrader};
use crate::workspace::Workspace;

use async_trait::async_trait;
use kube::Client as KubeClient;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/*
 * Builds the collaborators of an apply run. The kube and chart clients
 * can only exist once the admin kubeconfig was written, so they are asked
 * for after the init phase.
 */
#[async_trait]
pub trait ClientFactory: Send + Sync {
    fn infra_applier(&self, workspace: &Workspace, upgrade_dir: &Path) -> Result<Box<dyn InfraApplier>, Error>;
    fn dialer(&self, config: &Config) -> Result<Box<dyn InitDialer>, Error>;
    async fn kube_upgrader(&self, admin_conf: &Path) -> Result<Box<dyn KubeUpgrader>, Error>;
    fn chart_applier(&self, admin_conf: &Path, config: &Config) -> Result<Box<dyn ChartApplier>, Error>;
}

/* Kube client for the admin kubeconfig, with bounded API call timeouts. */
pub async fn kube_client(admin_conf: &Path) -> Result<KubeClient, Error> {
    let kubeconfig = Kubeconfig::read_from(admin_conf)
	.map_err(|e| Error::Precondition(format!("reading {}: {}", admin_conf.display(), e)))?;
    let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await
	.map_err(|e| Error::Precondition(format!("loading {}: {}", admin_conf.display(), e)))?;

    config.connect_timeout = Some(constants::KUBE_TIMEOUT);
    config.read_timeout = Some(constants::KUBE_TIMEOUT);
    config.write_timeout = Some(constants::KUBE_TIMEOUT);

    Ok(KubeClient::try_from(config)?)
}

/* Terraform, attested TLS, the API server and helm. */
pub struct ProductionFactory {
    templates: PathBuf,
}

impl ProductionFactory {

    pub fn new(templates: PathBuf) -> Self {
	Self{ templates: templates }
    }

    /* Templates from $KONSTEL_TERRAFORM_TEMPLATES, or the packaged location. */
    pub fn from_env() -> Self {
	let templates = match std::env::var_os(constants::TERRAFORM_TEMPLATES_ENV) {
	    Some(dir) if !dir.is_empty() => PathBuf::from(dir),
	    _ => PathBuf::from(constants::DEFAULT_TERRAFORM_TEMPLATES),
	};
	Self::new(templates)
    }
}

#[async_trait]
impl ClientFactory for ProductionFactory {

    fn infra_applier(&self, workspace: &Workspace, upgrade_dir: &Path) -> Result<Box<dyn InfraApplier>, Error> {
	Ok(Box::new(TerraformApplier::new(self.templates.clone(), workspace.terraform_dir(), upgrade_dir)))
    }

    fn dialer(&self, config: &Config) -> Result<Box<dyn InitDialer>, Error> {
	let validator = Arc::new(MeasurementValidator::new(config.attestation.clone()));
	Ok(Box::new(AtlsDialer::new(validator)?))
    }

    async fn kube_upgrader(&self, admin_conf: &Path) -> Result<Box<dyn KubeUpgrader>, Error> {
	let client = kube_client(admin_conf).await?;
	Ok(Box::new(KubeCmd::new(client)))
    }

    fn chart_applier(&self, admin_conf: &Path, config: &Config) -> Result<Box<dyn ChartApplier>, Error> {
	Ok(Box::new(HelmCli::new(admin_conf.to_path_buf(), &config.helm.repository)))
    }
}
