use crate::config::{Config, NodeRole};
use crate::constants;
use crate::errors::Error;
use crate::state::Infrastructure;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InfraDiff {
    NoChanges,
    Changes,
}

/*
 * Drives the IaC backend. `plan` is always safe to call; `apply` runs the
 * last plan and returns the resulting outputs; `restore` puts back the
 * working directory saved before planning.
 */
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraApplier: Send + Sync {
    async fn working_dir_is_empty(&self) -> Result<bool, Error>;
    async fn plan(&self, config: &Config) -> Result<InfraDiff, Error>;
    async fn apply(&self, config: &Config) -> Result<Infrastructure, Error>;
    async fn restore(&self) -> Result<(), Error>;
}

const PLAN_FILE: &str = "plan.zip";
const VARS_FILE: &str = "terraform.tfvars.json";

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
	let entry = entry?;
	let target = dst.join(entry.file_name());
	if entry.file_type()?.is_dir() {
	    copy_dir(&entry.path(), &target)?;
	} else {
	    fs::copy(entry.path(), target)?;
	}
    }
    Ok(())
}

fn dir_is_empty(dir: &Path) -> std::io::Result<bool> {
    match fs::read_dir(dir) {
	Ok(mut entries) => Ok(entries.next().is_none()),
	Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
	Err(err) => Err(err),
    }
}

/* Input variables handed to the templates. */
pub fn template_variables(config: &Config) -> JsonValue {
    let node_groups: BTreeMap<&String, JsonValue> = config.node_groups.iter()
	.map(|(name, group)| {
	    let role = match group.role {
		NodeRole::ControlPlane => "control-plane",
		NodeRole::Worker => "worker",
	    };
	    (name, serde_json::json!({
		"role": role,
		"instance_type": group.instance_type,
		"disk_size": group.state_disk_size_gb,
		"initial_count": group.initial_count,
		"zone": group.zone,
	    }))
	})
	.collect();

    let mut vars = serde_json::json!({
	"name": config.name,
	"image_id": config.image,
	"node_groups": node_groups,
	"custom_endpoint": config.custom_endpoint,
	"debug": false,
    });

    if let JsonValue::Object(map) = &mut vars {
	for (key, value) in config.provider_inputs() {
	    if let Ok(value) = serde_json::to_value(value) {
		map.insert(key, value);
	    }
	}
    }
    vars
}

/* Maps `terraform output -json` onto the infrastructure block. */
pub fn parse_outputs(raw: &[u8]) -> Result<Infrastructure, Error> {
    let outputs: BTreeMap<String, JsonValue> = serde_json::from_slice(raw)?;
    let mut infra = Infrastructure::default();

    for (key, output) in outputs {
	let value = output.get("value").cloned().unwrap_or(JsonValue::Null);
	let text = match &value {
	    JsonValue::String(s) => s.clone(),
	    JsonValue::Null => String::new(),
	    other => other.to_string(),
	};
	match key.as_str() {
	    "uid" => infra.uid = text,
	    "name" => infra.name = text,
	    "out_of_cluster_endpoint" => infra.cluster_endpoint = text,
	    "in_cluster_endpoint" => infra.in_cluster_endpoint = text,
	    "init_secret" => infra.init_secret = hex::encode(text.as_bytes()),
	    "ip_cidr_node" => infra.ip_cidr_node = text,
	    "api_server_cert_sans" => {
		infra.api_server_cert_sans = serde_json::from_value(value)
		    .map_err(|e| Error::Other(format!("terraform output api_server_cert_sans: {}", e)))?;
	    },
	    _ => {
		infra.provider.insert(key, text);
	    },
	}
    }

    if infra.cluster_endpoint.is_empty() {
	return Err(Error::Other("terraform output is missing out_of_cluster_endpoint".to_string()));
    }
    if infra.in_cluster_endpoint.is_empty() {
	infra.in_cluster_endpoint = infra.cluster_endpoint.clone();
    }
    Ok(infra)
}

/*
 * InfraApplier backed by the `terraform` binary.
 */
pub struct TerraformApplier {
    binary: String,
    templates: PathBuf,
    working_dir: PathBuf,
    backup_dir: PathBuf,
}

impl TerraformApplier {

    pub fn new(templates: PathBuf, working_dir: PathBuf, upgrade_dir: &Path) -> Self {
	Self{
	    binary: "terraform".to_string(),
	    templates: templates,
	    working_dir: working_dir,
	    backup_dir: upgrade_dir.join(constants::TERRAFORM_BACKUP_DIR),
	}
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, Error> {
	let command = format!("{} {}", self.binary, args.join(" "));
	log::debug!("running {}", command);

	let output = Command::new(&self.binary)
	    .args(args)
	    .current_dir(&self.working_dir)
	    .env("TF_IN_AUTOMATION", "1")
	    .kill_on_drop(true)
	    .output()
	    .await
	    .map_err(|e| Error::command(&command, e.to_string()))?;
	Ok(output)
    }

    async fn run_ok(&self, args: &[&str]) -> Result<Vec<u8>, Error> {
	let output = self.run(args).await?;
	if !output.status.success() {
	    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
	    return Err(Error::command(format!("{} {}", self.binary, args.join(" ")), stderr));
	}
	Ok(output.stdout)
    }

    /*
     * Saves the current working directory (once per run) and lays the
     * templates of the configured provider over it.
     */
    fn prepare(&self, config: &Config) -> Result<(), Error> {
	let provider = match config.cloud_provider() {
	    Some(provider) => provider,
	    None => return Err(Error::Validation("no provider configured".to_string())),
	};

	if !dir_is_empty(&self.working_dir)? && !self.backup_dir.exists() {
	    copy_dir(&self.working_dir, &self.backup_dir)?;
	    log::debug!("backed up {} to {}", self.working_dir.display(), self.backup_dir.display());
	}

	let templates = self.templates.join(provider.as_str());
	copy_dir(&templates, &self.working_dir).map_err(|e| {
	    Error::Precondition(format!("copying terraform templates from {}: {}", templates.display(), e))
	})?;

	let vars = serde_json::to_vec_pretty(&template_variables(config))?;
	fs::write(self.working_dir.join(VARS_FILE), vars)?;
	Ok(())
    }
}

#[async_trait]
impl InfraApplier for TerraformApplier {

    async fn working_dir_is_empty(&self) -> Result<bool, Error> {
	Ok(dir_is_empty(&self.working_dir)?)
    }

    async fn plan(&self, config: &Config) -> Result<InfraDiff, Error> {
	self.prepare(config)?;
	self.run_ok(&["init", "-input=false"]).await?;

	let args = ["plan", "-input=false", "-detailed-exitcode", "-out", PLAN_FILE];
	let output = self.run(&args).await?;
	match output.status.code() {
	    Some(0) => Ok(InfraDiff::NoChanges),
	    Some(2) => Ok(InfraDiff::Changes),
	    _ => {
		let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
		Err(Error::command(format!("{} {}", self.binary, args.join(" ")), stderr))
	    },
	}
    }

    async fn apply(&self, _config: &Config) -> Result<Infrastructure, Error> {
	self.run_ok(&["apply", "-input=false", "-auto-approve", PLAN_FILE]).await?;
	let outputs = self.run_ok(&["output", "-json"]).await?;
	parse_outputs(&outputs)
    }

    async fn restore(&self) -> Result<(), Error> {
	if !self.backup_dir.exists() {
	    // nothing was there before this run
	    if self.working_dir.exists() {
		fs::remove_dir_all(&self.working_dir)?;
	    }
	    return Ok(());
	}

	if self.working_dir.exists() {
	    fs::remove_dir_all(&self.working_dir)?;
	}
	copy_dir(&self.backup_dir, &self.working_dir).map_err(|e| {
	    Error::Other(format!("restoring terraform workspace from {}: {}", self.backup_dir.display(), e))
	})?;
	Ok(())
    }
}

fn plural(count: u32) -> &'static str {
    if count == 1 { "" } else { "s" }
}

/* What a create run is about to bring up, shown before asking. */
pub fn create_summary(config: &Config) -> String {
    let mut out = String::from("The following cluster will be created:\n");
    for (name, group) in &config.node_groups {
	let role = match group.role {
	    NodeRole::ControlPlane => "control-plane",
	    NodeRole::Worker => "worker",
	};
	out.push_str(&format!(
	    "  {} {} node{} of type {} will be created ({}).\n",
	    group.initial_count, role, plural(group.initial_count), group.instance_type, name,
	));
    }
    out
}
