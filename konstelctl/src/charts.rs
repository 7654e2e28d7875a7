use crate::config::Config;
use crate::constants;
use crate::errors::{Error, Phase};
use crate::helm::{ChartApplier, ChartError, ChartOptions, DestructivePolicy, Prepared};
use crate::init::MasterSecret;
use crate::kubecmd::KubeUpgrader;
use crate::state::State;
use crate::terminal::{Prompter, Terminal};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartOutcome {
    /* releases installed or upgraded */
    pub applied: Vec<String>,
}

/*
 * Brings the helm releases of the cluster to the versions of this CLI.
 * Upgrades are preceded by a backup of every CRD and custom resource into
 * the upgrade workspace; nothing is applied if the backup fails.
 */
pub struct ChartReconciler<'a> {
    pub charts: &'a dyn ChartApplier,
    pub kube: &'a dyn KubeUpgrader,
    pub prompter: &'a dyn Prompter,
    pub terminal: &'a Terminal,
    pub upgrade_dir: &'a Path,
}

impl<'a> ChartReconciler<'a> {

    fn fail(&self, action: &str, consistent: bool) -> impl Fn(Error) -> Error + '_ {
	let action = action.to_string();
	move |err: Error| err.in_phase(Phase::Helm, &action, consistent, Some(self.upgrade_dir.to_path_buf()))
    }

    /*
     * Prepares the chart plan. A destructive cert-manager upgrade is
     * always put to the operator, `yes` does not cover it; declining
     * leaves cert-manager alone and plans the rest.
     */
    async fn prepare(&self, config: &Config, state: &State, secret: &MasterSecret, options: &mut ChartOptions) -> Result<Prepared, Error> {
	options.destructive = DestructivePolicy::Deny;
	let mut result = self.charts.prepare(config, state, secret, options).await;

	if let Err(ChartError::ConfirmationRequired{ release }) = &result {
	    log::debug!("{} upgrade needs confirmation", release);
	    self.terminal.warn("Upgrading cert-manager will destroy all custom resources you have manually created that are based on the current version of cert-manager.");
	    let ok = self.prompter.confirm("Do you want to upgrade cert-manager anyway?").await?;
	    if ok {
		options.destructive = DestructivePolicy::Allow;
	    } else {
		self.terminal.println("Skipping upgrade of cert-manager.");
		options.destructive = DestructivePolicy::Skip;
	    }
	    result = self.charts.prepare(config, state, secret, options).await;
	}

	match result {
	    Ok(prepared) => Ok(prepared),
	    Err(ChartError::Incompatible{ errors, prepared }) => {
		let err = ChartError::Incompatible{ errors: errors, prepared: Prepared::default() };
		self.terminal.eprintln(&err.to_string());
		Ok(prepared)
	    },
	    Err(ChartError::ConfirmationRequired{ release }) => {
		Err(Error::Other(format!("{} still requires confirmation after it was given", release)))
	    },
	    Err(ChartError::Other(err)) => Err(err),
	}
    }

    pub async fn apply(&self, config: &Config, state: &State, secret: &MasterSecret, mut options: ChartOptions, init_required: bool) -> Result<ChartOutcome, Error> {
	let prepared = self.prepare(config, state, secret, &mut options).await
	    .map_err(self.fail("prepare Helm charts", true))?;

	if prepared.is_empty() {
	    log::debug!("all helm releases are up to date");
	    return Ok(ChartOutcome::default());
	}

	let chart_dir = self.upgrade_dir.join(constants::HELM_CHARTS_DIR);
	self.charts.save_charts(&prepared, &chart_dir).await
	    .map_err(self.fail("save Helm charts", true))?;
	log::debug!("helm charts saved to {}", chart_dir.display());

	if prepared.includes_upgrades {
	    let backup_dir: PathBuf = self.upgrade_dir.join(constants::BACKUP_DIR);
	    log::debug!("creating backup of CRDs and CRs in {}", backup_dir.display());
	    let crds = self.kube.backup_crds(&backup_dir).await
		.map_err(self.fail("create CRD backup", true))?;
	    self.kube.backup_crs(&crds, &backup_dir).await
		.map_err(self.fail("create CR backup", true))?;
	}

	self.charts.apply(&prepared, &options).await
	    .map_err(self.fail("apply Helm charts", false))?;

	if !init_required {
	    self.terminal.println("Successfully upgraded konstel services.");
	}

	Ok(ChartOutcome{
	    applied: prepared.releases.iter().map(|r| r.release.name.clone()).collect(),
	})
    }
}
