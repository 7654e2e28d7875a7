use crate::diff;
use crate::errors::Error;
use crate::kubecmd::KubeUpgrader;
use crate::terminal::{Prompter, Terminal};

use konstel_api::AttestationConfig;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JoinConfigOutcome {
    Created,
    Unchanged,
    Replaced,
}

/*
 * Keeps the join-config of the cluster in line with the attestation
 * section of the configuration. A differing policy is shown as a diff and
 * only replaced after the operator agreed (or `yes` was given).
 */
pub struct JoinConfigReconciler<'a> {
    pub kube: &'a dyn KubeUpgrader,
    pub prompter: &'a dyn Prompter,
    pub terminal: &'a Terminal,
    pub yes: bool,
}

impl<'a> JoinConfigReconciler<'a> {

    pub async fn apply(&self, desired: &AttestationConfig, measurement_salt: &[u8]) -> Result<JoinConfigOutcome, Error> {
	let current = match self.kube.get_attestation_config(desired.variant).await? {
	    Some(current) => current,
	    None => {
		log::debug!("no join-config in the cluster, creating it");
		self.kube.apply_attestation_config(desired, measurement_salt).await?;
		return Ok(JoinConfigOutcome::Created);
	    },
	};

	// a variant change is a difference like any other
	let equal = current.equal_to(desired).unwrap_or(false);
	if equal {
	    log::debug!("cluster attestation config is up to date");
	    return Ok(JoinConfigOutcome::Unchanged);
	}

	self.terminal.println("The configured attestation config is different from the attestation config in the cluster.");
	let changes = diff::unified_diff(&current.to_yaml()?, &desired.to_yaml()?);
	self.terminal.println("The following changes will be applied to the attestation config:");
	self.terminal.println(&changes);

	if !self.yes {
	    let ok = self.prompter.confirm("Are you sure you want to change your cluster's attestation config?").await?;
	    if !ok {
		return Err(Error::Aborted);
	    }
	}

	self.kube.apply_attestation_config(desired, measurement_salt).await?;
	self.terminal.println("Successfully updated the cluster's attestation config");
	Ok(JoinConfigOutcome::Replaced)
    }
}

/* SANs the API server certificate must cover, in order, without blanks or repeats. */
pub fn cert_sans(cluster_endpoint: &str, custom_endpoint: &str, extra: &[String]) -> Vec<String> {
    let mut sans: Vec<String> = Vec::new();
    let candidates = [cluster_endpoint, custom_endpoint].into_iter().chain(extra.iter().map(|s| s.as_str()));
    for san in candidates {
	if !san.is_empty() && !sans.iter().any(|s| s == san) {
	    sans.push(san.to_string());
	}
    }
    sans
}
