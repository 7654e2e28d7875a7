#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition as KubeCrd;
use konstel_api::initproto;
use konstel_api::nodeversion;
use konstel_api::{AttestationConfig, InitResponse, NodeVersion, NodeVersionSpec, Variant};
use konstelctl::apply::{Applier, ApplyFlags};
use konstelctl::config::Config;
use konstelctl::constants;
use konstelctl::errors::Error;
use konstelctl::factory::ClientFactory;
use konstelctl::helm::{self, ChartApplier, ChartError, ChartOptions, Prepared};
use konstelctl::infra::{InfraApplier, InfraDiff};
use konstelctl::init::{BoxedStream, DialError, InitDialer, MasterSecret, RetryPolicy};
use konstelctl::state::{ClusterValues, Infrastructure, State};
use konstelctl::terminal::{Prompter, SharedBuffer, Terminal};
use konstelctl::workspace::Workspace;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::bytes::Bytes;

pub const K8S_VERSION: &str = "v1.29.7";

pub fn config_yaml() -> String {
    format!(r#"version: v1
name: demo
image: ref/stream/stable/v{cli}
kubernetesVersion: {k8s}
microserviceVersion: v{cli}
serviceCIDR: 10.96.0.0/12
provider:
  aws:
    region: eu-central-1
    zone: eu-central-1a
attestation:
  variant: aws-sev-snp
  measurements:
    4:
      expected: "{digest}"
nodeGroups:
  control_plane_default:
    role: control-plane
    instanceType: m6a.xlarge
    stateDiskSizeGB: 30
    initialCount: 3
  worker_default:
    role: worker
    instanceType: m6a.xlarge
    stateDiskSizeGB: 30
    initialCount: 2
"#, cli = constants::CLI_VERSION, k8s = K8S_VERSION, digest = "ab".repeat(48))
}

pub fn config() -> Config {
    serde_yaml::from_str(&config_yaml()).unwrap()
}

pub fn kubeconfig(server: &str) -> String {
    format!(r#"apiVersion: v1
kind: Config
clusters:
- name: demo
  cluster:
    server: {server}
contexts:
- name: admin@demo
  context:
    cluster: demo
    user: admin
current-context: admin@demo
users:
- name: admin
  user:
    token: secret
"#, server = server)
}

pub fn infrastructure() -> Infrastructure {
    Infrastructure{
	uid: "uid1".to_string(),
	cluster_endpoint: "192.0.2.10".to_string(),
	in_cluster_endpoint: "10.9.0.1".to_string(),
	init_secret: "00ff".to_string(),
	name: "demo-uid1".to_string(),
	ip_cidr_node: "10.9.0.0/16".to_string(),
	..Default::default()
    }
}

/* A workspace holding only the configuration. */
pub fn fresh_workspace() -> (tempfile::TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    std::fs::write(ws.config_path(), config_yaml()).unwrap();
    (dir, ws)
}

/* A workspace of an initialized cluster. */
pub fn initialized_workspace() -> (tempfile::TempDir, Workspace) {
    let (dir, ws) = fresh_workspace();
    let mut state = State::new();
    state.set_infrastructure(infrastructure());
    state.set_cluster_values(ClusterValues{
	cluster_id: "C1".to_string(),
	owner_id: "O1".to_string(),
	measurement_salt: "11".repeat(32),
    });
    state.write(&ws.state_path()).unwrap();
    MasterSecret::generate().persist(&ws.master_secret_path()).unwrap();
    std::fs::write(ws.admin_conf_path(), kubeconfig("https://192.0.2.10:6443")).unwrap();
    (dir, ws)
}

pub fn current_node_version() -> NodeVersion {
    let config = config();
    let mut nv = nodeversion::new(NodeVersionSpec{
	image_reference: config.image.clone(),
	image_version: format!("v{}", config.image_version()),
	kubernetes_cluster_version: K8S_VERSION.to_string(),
    });
    nv.metadata.resource_version = Some("7".to_string());
    nv
}

#[derive(Clone)]
pub struct FakeInfra {
    pub empty: bool,
    pub diff: InfraDiff,
    pub applied: Arc<Mutex<usize>>,
    pub restored: Arc<Mutex<usize>>,
}

impl FakeInfra {
    pub fn new(empty: bool, diff: InfraDiff) -> Self {
	Self{
	    empty: empty,
	    diff: diff,
	    applied: Arc::new(Mutex::new(0)),
	    restored: Arc::new(Mutex::new(0)),
	}
    }
}

#[async_trait]
impl InfraApplier for FakeInfra {
    async fn working_dir_is_empty(&self) -> Result<bool, Error> {
	Ok(self.empty)
    }

    async fn plan(&self, _config: &Config) -> Result<InfraDiff, Error> {
	Ok(self.diff)
    }

    async fn apply(&self, _config: &Config) -> Result<Infrastructure, Error> {
	*self.applied.lock().unwrap() += 1;
	Ok(infrastructure())
    }

    async fn restore(&self) -> Result<(), Error> {
	*self.restored.lock().unwrap() += 1;
	Ok(())
    }
}

/* Serves the given frames to the first connection. */
#[derive(Clone)]
pub struct ScriptedDialer {
    responses: Arc<Mutex<Option<Vec<InitResponse>>>>,
}

impl ScriptedDialer {
    pub fn new(responses: Vec<InitResponse>) -> Self {
	Self{ responses: Arc::new(Mutex::new(Some(responses))) }
    }
}

#[async_trait]
impl InitDialer for ScriptedDialer {
    async fn dial(&self, _endpoint: &str) -> Result<BoxedStream, DialError> {
	let responses = match self.responses.lock().unwrap().take() {
	    Some(responses) => responses,
	    None => return Err(DialError::Transport("connection refused".to_string())),
	};
	let (client, server) = tokio::io::duplex(64 * 1024);
	tokio::spawn(async move {
	    let mut transport = konstelctl::init::rpc::framed(Box::new(server));
	    let _ = transport.next().await;
	    for resp in responses {
		let _ = transport.send(Bytes::from(initproto::encode(&resp).unwrap())).await;
	    }
	    let _ = transport.get_mut().shutdown().await;
	});
	Ok(Box::new(client) as BoxedStream)
    }
}

#[derive(Clone, Default)]
pub struct FakeKube {
    pub join_config: Arc<Mutex<Option<AttestationConfig>>>,
    pub join_config_writes: Arc<Mutex<usize>>,
    pub sans: Arc<Mutex<Vec<String>>>,
    pub node_version: Arc<Mutex<Option<NodeVersion>>>,
    pub node_version_writes: Arc<Mutex<usize>>,
    pub crd_backups: Arc<Mutex<usize>>,
}

#[async_trait]
impl konstelctl::kubecmd::KubeUpgrader for FakeKube {
    async fn get_attestation_config(&self, _variant: Variant) -> Result<Option<AttestationConfig>, Error> {
	Ok(self.join_config.lock().unwrap().clone())
    }

    async fn apply_attestation_config(&self, config: &AttestationConfig, _measurement_salt: &[u8]) -> Result<(), Error> {
	*self.join_config.lock().unwrap() = Some(config.clone());
	*self.join_config_writes.lock().unwrap() += 1;
	Ok(())
    }

    async fn extend_cert_sans(&self, sans: &[String]) -> Result<Vec<String>, Error> {
	let mut current = self.sans.lock().unwrap();
	let added: Vec<String> = sans.iter().filter(|s| !current.contains(s)).cloned().collect();
	current.extend(added.iter().cloned());
	Ok(added)
    }

    async fn get_node_version(&self) -> Result<NodeVersion, Error> {
	match self.node_version.lock().unwrap().clone() {
	    Some(nv) => Ok(nv),
	    None => Err(Error::NotFound("nodeversion konstel-version".to_string())),
	}
    }

    async fn update_node_version(&self, node_version: &NodeVersion) -> Result<NodeVersion, Error> {
	*self.node_version.lock().unwrap() = Some(node_version.clone());
	*self.node_version_writes.lock().unwrap() += 1;
	Ok(node_version.clone())
    }

    async fn backup_crds(&self, dir: &Path) -> Result<Vec<KubeCrd>, Error> {
	std::fs::create_dir_all(dir)?;
	*self.crd_backups.lock().unwrap() += 1;
	Ok(Vec::new())
    }

    async fn backup_crs(&self, _crds: &[KubeCrd], _dir: &Path) -> Result<(), Error> {
	Ok(())
    }
}

/* Plans against a fixed set of installed releases, records what it applied. */
#[derive(Clone, Default)]
pub struct FakeCharts {
    pub installed: Arc<Mutex<BTreeMap<String, String>>>,
    pub applied: Arc<Mutex<Vec<String>>>,
}

impl FakeCharts {
    pub fn installed(releases: &[(&str, &str)]) -> Self {
	let charts = Self::default();
	*charts.installed.lock().unwrap() = releases.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect();
	charts
    }

    /* Everything this CLI ships, at the shipped versions. */
    pub fn current() -> Self {
	let micro = constants::CLI_VERSION;
	Self::installed(&[
	    (helm::CILIUM_RELEASE, "1.15.8"),
	    (helm::CERT_MANAGER_RELEASE, "1.14.5"),
	    (helm::OPERATORS_RELEASE, micro),
	    (helm::SERVICES_RELEASE, micro),
	])
    }

    pub fn applied(&self) -> Vec<String> {
	self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChartApplier for FakeCharts {
    async fn prepare(&self, config: &Config, state: &State, secret: &MasterSecret, options: &ChartOptions) -> Result<Prepared, ChartError> {
	let desired = helm::desired_releases(config, state, secret, options)?;
	let installed = self.installed.lock().unwrap().clone();
	helm::plan_releases(desired, &installed, options)
    }

    async fn save_charts(&self, _prepared: &Prepared, dir: &Path) -> Result<(), Error> {
	std::fs::create_dir_all(dir)?;
	Ok(())
    }

    async fn apply(&self, prepared: &Prepared, _options: &ChartOptions) -> Result<(), Error> {
	let mut installed = self.installed.lock().unwrap();
	let mut applied = self.applied.lock().unwrap();
	for planned in &prepared.releases {
	    installed.insert(planned.release.name.clone(), planned.release.version.clone());
	    applied.push(planned.release.name.clone());
	}
	Ok(())
    }
}

pub struct FakeFactory {
    pub infra: FakeInfra,
    pub dialer: ScriptedDialer,
    pub kube: FakeKube,
    pub charts: FakeCharts,
}

#[async_trait]
impl ClientFactory for FakeFactory {
    fn infra_applier(&self, _workspace: &Workspace, _upgrade_dir: &Path) -> Result<Box<dyn InfraApplier>, Error> {
	Ok(Box::new(self.infra.clone()))
    }

    fn dialer(&self, _config: &Config) -> Result<Box<dyn InitDialer>, Error> {
	Ok(Box::new(self.dialer.clone()))
    }

    async fn kube_upgrader(&self, _admin_conf: &Path) -> Result<Box<dyn konstelctl::kubecmd::KubeUpgrader>, Error> {
	Ok(Box::new(self.kube.clone()))
    }

    fn chart_applier(&self, _admin_conf: &Path, _config: &Config) -> Result<Box<dyn ChartApplier>, Error> {
	Ok(Box::new(self.charts.clone()))
    }
}

/* Answers prompts from a script and records the questions. */
#[derive(Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<bool>>,
    pub questions: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: &[bool]) -> Self {
	Self{
	    answers: Mutex::new(answers.iter().copied().collect()),
	    questions: Mutex::new(Vec::new()),
	}
    }

    pub fn questions(&self) -> Vec<String> {
	self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, question: &str) -> Result<bool, Error> {
	self.questions.lock().unwrap().push(question.to_string());
	match self.answers.lock().unwrap().pop_front() {
	    Some(answer) => Ok(answer),
	    None => Err(Error::Other(format!("unexpected question {:?}", question))),
	}
    }
}

pub struct Run {
    pub result: Result<(), Error>,
    pub out: SharedBuffer,
    pub err: SharedBuffer,
}

pub async fn run(ws: &Workspace, factory: &FakeFactory, prompter: &ScriptedPrompter, flags: ApplyFlags) -> Run {
    let (term, out, err) = Terminal::captured();
    let mut applier = Applier::new(ws, factory, prompter, &term, flags);
    applier.retry = RetryPolicy{
	attempts: 2,
	initial: Duration::from_millis(1),
	max: Duration::from_millis(1),
    };
    let result = applier.apply().await;
    Run{ result: result, out: out, err: err }
}

pub fn yes() -> ApplyFlags {
    ApplyFlags{ yes: true, ..Default::default() }
}
