/*
 * One-shot attested bootstrap of the first control-plane node.
 */
pub mod atls;
pub mod logbuf;
pub mod rpc;
pub mod secret;

pub use logbuf::LogBuffer;
pub use rpc::{BoxedStream, DialError, InitDialer, RetryPolicy};
pub use secret::MasterSecret;

use crate::config::Config;
use crate::constants;
use crate::errors::Error;
use crate::kubeconfig;
use crate::state::{ClusterValues, State};
use crate::terminal::Terminal;
use crate::workspace::Workspace;

use konstel_api::InitRequest;
use konstel_api::initproto::INIT_PORT;
use rpc::CallError;
use std::fs;
use std::io::Write;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitError {

    /* transient: the operator can re-run apply */
    #[error("initializing the cluster failed, retry the operation: {0}")]
    Retriable(String),

    /* the cluster is in an irrecoverable state */
    #[error("initializing the cluster failed: {reason}")]
    NonRetriable {
	reason: String,
	log_collection_error: Option<String>,
    },

    /* the bootstrapper succeeded, the workspace holds no credentials for it */
    #[error("cluster {cluster_id} was initialized but its admin kubeconfig could not be stored: {reason}")]
    CredentialsLost {
	cluster_id: String,
	reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct InitOutput {
    pub owner_id: String,
    pub cluster_id: String,
    pub measurement_salt: Vec<u8>,
    pub admin_conf: PathBuf,
}

impl InitOutput {

    pub fn cluster_values(&self) -> ClusterValues {
	ClusterValues{
	    cluster_id: self.cluster_id.clone(),
	    owner_id: self.owner_id.clone(),
	    measurement_salt: hex::encode(&self.measurement_salt),
	}
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub conformance: bool,
    pub merge_kubeconfig: bool,
}

pub fn endpoint(host: &str) -> String {
    match host.parse::<Ipv6Addr>() {
	Ok(_) => format!("[{}]:{}", host, INIT_PORT),
	Err(_) => format!("{}:{}", host, INIT_PORT),
    }
}

/* Appends the bootstrapper logs to the error log of the workspace. */
fn persist_logs(workspace: &Workspace, logs: &LogBuffer) -> Result<(), std::io::Error> {
    let mut file = fs::OpenOptions::new()
	.create(true)
	.append(true)
	.open(workspace.error_log_path())?;
    file.write_all(logs.contents().as_bytes())?;
    file.sync_all()
}

/*
 * Coordinator runs the init RPC against the cluster endpoint of the state
 * record and writes the admin kubeconfig on success. It never writes the
 * state record itself: the caller merges `InitOutput::cluster_values`.
 *
 * The master secret is written before the first dial and reused on the
 * next run, so a create that fails or is abandoned leaves it in the
 * workspace for the operator to remove.
 */
pub struct Coordinator<'a> {
    pub workspace: &'a Workspace,
    pub dialer: &'a dyn InitDialer,
    pub retry: RetryPolicy,
    pub terminal: &'a Terminal,
}

impl<'a> Coordinator<'a> {

    pub async fn init(&self, config: &Config, state: &State, options: &InitOptions) -> Result<(InitOutput, LogBuffer), Error> {
	state.validate_pre_init()?;

	// the secret hits the disk before any network traffic
	let secret_path = self.workspace.master_secret_path();
	let (secret, created) = MasterSecret::load_or_generate(&secret_path)?;
	if created {
	    self.terminal.println(&format!("Your master secret was successfully written to {:?}", secret_path.display().to_string()));
	}

	let measurement_salt = secret::random_bytes(constants::SALT_LENGTH);
	let init_secret = hex::decode(&state.infrastructure.init_secret)
	    .map_err(|e| Error::Precondition(format!("infrastructure.initSecret: {}", e)))?;

	let req = InitRequest{
	    master_secret: secret.key()?,
	    master_secret_salt: secret.salt()?,
	    measurement_salt: measurement_salt.clone(),
	    kubernetes_version: config.kubernetes_version.clone(),
	    conformance_mode: options.conformance,
	    service_cidr: config.service_cidr.clone(),
	    init_secret: init_secret,
	    cluster_name: state.infrastructure.name.clone(),
	    api_server_cert_sans: state.infrastructure.api_server_cert_sans.clone(),
	};

	let endpoint = endpoint(&state.infrastructure.cluster_endpoint);
	log::info!("connecting to bootstrapper at {}", endpoint);
	let stream = rpc::dial_with_retry(self.dialer, &endpoint, &self.retry).await
	    .map_err(|e| InitError::Retriable(e.to_string()))?;

	let logs = Arc::new(Mutex::new(LogBuffer::default()));
	let result = rpc::call(stream, &req, logs.clone()).await;
	let logs = match logs.lock() {
	    Ok(logs) => logs.clone(),
	    Err(poisoned) => poisoned.into_inner().clone(),
	};

	let success = match result {
	    Ok(success) => success,
	    Err(CallError::Transport(msg)) => {
		log::debug!("init stream broke: {}", msg);
		return Err(InitError::Retriable(msg).into());
	    },
	    Err(err) => {
		let log_collection_error = persist_logs(self.workspace, &logs)
		    .err()
		    .map(|e| format!("writing {}: {}", self.workspace.error_log_path().display(), e));
		return Err(InitError::NonRetriable{
		    reason: err.to_string(),
		    log_collection_error: log_collection_error,
		}.into());
	    },
	};
	log::info!("initialization request successful");

	let admin_conf = self.write_admin_conf(&success.kubeconfig, &state.infrastructure.cluster_endpoint)
	    .map_err(|e| InitError::CredentialsLost{
		cluster_id: success.cluster_id.clone(),
		reason: e.to_string(),
	    })?;

	let output = InitOutput{
	    owner_id: success.owner_id,
	    cluster_id: success.cluster_id,
	    measurement_salt: measurement_salt,
	    admin_conf: admin_conf,
	};
	Ok((output, logs))
    }

    fn write_admin_conf(&self, raw: &[u8], cluster_endpoint: &str) -> Result<PathBuf, Error> {
	let kubeconfig = kubeconfig::rewrite_server(raw, cluster_endpoint)?;

	// written last: its presence marks the cluster as initialized
	let admin_conf = self.workspace.admin_conf_path();
	let mut tmp = tempfile::NamedTempFile::new_in(self.workspace.root())?;
	tmp.write_all(&kubeconfig)?;
	tmp.as_file().sync_all()?;
	tmp.persist_noclobber(&admin_conf).map_err(|e| Error::Io(e.error))?;
	log::debug!("kubeconfig written to {}", admin_conf.display());
	Ok(admin_conf)
    }
}

/*
 * Human readable report of a successful initialization. Merging into the
 * default kubeconfig is attempted here; its failure is reported, not
 * returned.
 */
pub fn report(output: &InitOutput, merge: bool) -> String {
    let mut out = String::from("Your cluster was successfully initialized.\n\n");
    let admin_conf = output.admin_conf.display().to_string();

    let mut rows = vec![
	("Cluster identifier".to_string(), output.cluster_id.clone()),
	("Kubernetes configuration".to_string(), admin_conf.clone()),
    ];

    let mut merged = false;
    if merge {
	let result = kubeconfig::default_kubeconfig_path()
	    .and_then(|target| kubeconfig::merge_into(&output.admin_conf, &target));
	match result {
	    Ok(()) => {
		rows.push(("Kubernetes configuration merged with default config".to_string(), String::new()));
		merged = true;
	    },
	    Err(err) => rows.push(("Failed to automatically merge kubeconfig".to_string(), err.to_string())),
	}
    }

    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0) + 2;
    for (key, value) in rows {
	out.push_str(&format!("{:width$}{}\n", key, value, width = width).trim_end());
	out.push('\n');
    }
    out.push('\n');

    if merged {
	out.push_str("Kubeconfig merged with default config.\n");
	if kubeconfig::kubeconfig_env_set() {
	    out.push_str("Warning: KUBECONFIG environment variable is set.\n");
	    out.push_str("You may need to unset it to use the default config and connect to your cluster.\n");
	} else {
	    out.push_str("You can now connect to your cluster.\n");
	}
    } else {
	let export = fs::canonicalize(&output.admin_conf).unwrap_or_else(|_| output.admin_conf.clone());
	out.push_str("You can now connect to your cluster by executing:\n");
	out.push_str(&format!("\texport KUBECONFIG={:?}\n", export.display().to_string()));
    }
    out
}
