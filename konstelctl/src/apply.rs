use crate::charts::ChartReconciler;
use crate::config::{self, Config, Severity};
use crate::errors::{Error, Phase};
use crate::factory::ClientFactory;
use crate::helm::{ChartOptions, DestructivePolicy, WaitMode};
use crate::infra::{self, InfraDiff};
use crate::init::{self, Coordinator, InitError, InitOptions, MasterSecret, RetryPolicy};
use crate::joinconfig::{self, JoinConfigOutcome, JoinConfigReconciler};
use crate::kubecmd::KubeUpgrader;
use crate::nodeversion::NodeVersionReconciler;
use crate::state::{self, State};
use crate::terminal::{Prompter, Terminal};
use crate::versions::K8sTier;
use crate::workspace::Workspace;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/* Phases the operator can ask to leave out. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipPhase {
    Infrastructure,
    Init,
    Helm,
    Image,
    K8s,
}

impl fmt::Display for SkipPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let name = match self {
	    SkipPhase::Infrastructure => "infrastructure",
	    SkipPhase::Init => "init",
	    SkipPhase::Helm => "helm",
	    SkipPhase::Image => "image",
	    SkipPhase::K8s => "k8s",
	};
	f.write_str(name)
    }
}

impl FromStr for SkipPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
	match s.trim().to_lowercase().as_str() {
	    "infrastructure" => Ok(SkipPhase::Infrastructure),
	    "init" => Ok(SkipPhase::Init),
	    "helm" => Ok(SkipPhase::Helm),
	    "image" => Ok(SkipPhase::Image),
	    "k8s" => Ok(SkipPhase::K8s),
	    other => Err(format!("invalid phase {:?}, expected one of infrastructure, init, helm, image, k8s", other)),
	}
    }
}

/*
 * Phases left out of a run. What the operator asked for and what the
 * controller derived are kept apart; only their union is acted upon.
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkipSet {
    user: BTreeSet<SkipPhase>,
    computed: BTreeSet<SkipPhase>,
}

impl SkipSet {

    pub fn new(user: BTreeSet<SkipPhase>) -> Self {
	Self{
	    user: user,
	    computed: BTreeSet::new(),
	}
    }

    pub fn add_computed(&mut self, phase: SkipPhase) {
	self.computed.insert(phase);
    }

    pub fn user(&self) -> &BTreeSet<SkipPhase> {
	&self.user
    }

    pub fn computed(&self) -> &BTreeSet<SkipPhase> {
	&self.computed
    }

    pub fn effective(&self) -> BTreeSet<SkipPhase> {
	self.user.union(&self.computed).copied().collect()
    }

    pub fn contains(&self, phase: SkipPhase) -> bool {
	self.user.contains(&phase) || self.computed.contains(&phase)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub phases: Vec<Phase>,
    pub init_required: bool,
    pub skips: SkipSet,
    /* the Kubernetes version is an unknown patch release */
    pub k8s_near_miss: bool,
}

impl Plan {

    pub fn runs(&self, phase: Phase) -> bool {
	self.phases.contains(&phase)
    }

    /* Any phase needing the admin kubeconfig. */
    pub fn needs_cluster(&self) -> bool {
	self.phases.iter().any(|p| *p > Phase::Init)
    }
}

const PHASE_ORDER: [Phase; 6] = [
    Phase::Infrastructure,
    Phase::Init,
    Phase::Attestation,
    Phase::Sans,
    Phase::Helm,
    Phase::NodeVersion,
];

/*
 * Decides which phases run. Init runs iff there is no admin kubeconfig
 * and the operator did not skip it; the NodeVersion phase never runs
 * right after init since the new cluster already is at the target.
 */
pub fn plan(config: &Config, user_skip: &BTreeSet<SkipPhase>, admin_conf_exists: bool) -> Result<Plan, Error> {
    let mut skips = SkipSet::new(user_skip.clone());
    let init_required = !admin_conf_exists && !skips.contains(SkipPhase::Init);

    let provider = match config.cloud_provider() {
	Some(provider) => provider,
	None => return Err(Error::Validation("exactly one provider section must be set".to_string())),
    };
    if !config.capability(provider).upgrades {
	if !init_required {
	    return Err(Error::Precondition(format!("upgrades are not supported for provider {}", provider)));
	}
	log::debug!("skipping infrastructure phase for provider {}", provider);
	skips.add_computed(SkipPhase::Infrastructure);
    }

    let mut k8s_near_miss = false;
    match config.k8s_tier() {
	K8sTier::Supported => {},
	K8sTier::UnknownPatch => {
	    if init_required {
		let errmsg = format!("kubernetesVersion: {} is not a supported release and cannot be used to create a cluster", config.kubernetes_version);
		return Err(Error::Validation(errmsg));
	    }
	    skips.add_computed(SkipPhase::K8s);
	    k8s_near_miss = true;
	},
	K8sTier::Unsupported => {
	    return Err(Error::Validation(format!("kubernetesVersion: unsupported version {:?}", config.kubernetes_version)));
	},
    }

    let phases = PHASE_ORDER.iter()
	.copied()
	.filter(|phase| match phase {
	    Phase::Infrastructure => !skips.contains(SkipPhase::Infrastructure),
	    Phase::Init => init_required,
	    Phase::Attestation | Phase::Sans => true,
	    Phase::Helm => !skips.contains(SkipPhase::Helm),
	    Phase::NodeVersion => {
		!init_required && !(skips.contains(SkipPhase::Image) && skips.contains(SkipPhase::K8s))
	    },
	})
	.collect();

    Ok(Plan{
	phases: phases,
	init_required: init_required,
	skips: skips,
	k8s_near_miss: k8s_near_miss,
    })
}

#[derive(Debug, Clone)]
pub struct ApplyFlags {
    pub yes: bool,
    pub force: bool,
    pub conformance: bool,
    pub skip_helm_wait: bool,
    pub skip_phases: BTreeSet<SkipPhase>,
    pub merge_kubeconfig: bool,
    pub helm_timeout: Duration,
}

impl Default for ApplyFlags {
    fn default() -> Self {
	Self{
	    yes: false,
	    force: false,
	    conformance: false,
	    skip_helm_wait: false,
	    skip_phases: BTreeSet::new(),
	    merge_kubeconfig: false,
	    helm_timeout: crate::constants::DEFAULT_APPLY_TIMEOUT,
	}
    }
}

/* Shared by both halves of a run. */
struct RunContext<'a> {
    workspace: &'a Workspace,
    factory: &'a dyn ClientFactory,
    prompter: &'a dyn Prompter,
    terminal: &'a Terminal,
    flags: &'a ApplyFlags,
    upgrade_dir: &'a Path,
}

impl<'a> RunContext<'a> {

    fn workspace_note(&self) -> Option<PathBuf> {
	Some(self.upgrade_dir.to_path_buf())
    }

    fn write_state(&self, state: &State, phase: Phase) -> Result<(), Error> {
	state.write(&self.workspace.state_path())
	    .map_err(|e| e.in_phase(phase, "write the state file", false, self.workspace_note()))
    }
}

/*
 * The phases that need no cluster access: infrastructure and init.
 */
struct PreInit<'a> {
    ctx: &'a RunContext<'a>,
    retry: RetryPolicy,
}

impl<'a> PreInit<'a> {

    async fn infrastructure(&self, config: &Config, state: &mut State) -> Result<bool, Error> {
	let ctx = self.ctx;
	let note = ctx.workspace_note();
	let applier = ctx.factory.infra_applier(ctx.workspace, ctx.upgrade_dir)?;

	let new_cluster = applier.working_dir_is_empty().await?;
	log::debug!("checking if infrastructure changes are required");
	let diff = applier.plan(config).await
	    .map_err(|e| e.in_phase(Phase::Infrastructure, "plan infrastructure changes", true, note.clone()))?;
	if diff == InfraDiff::NoChanges {
	    log::debug!("no changes to infrastructure required");
	    return Ok(false);
	}

	let question = if new_cluster {
	    ctx.terminal.print(&infra::create_summary(config));
	    "Do you want to create this cluster?"
	} else {
	    ctx.terminal.println("Changes of konstel cloud resources are required by applying an updated Terraform template.");
	    "Do you want to apply these infrastructure changes?"
	};

	if !ctx.flags.yes && !ctx.prompter.confirm(question).await? {
	    applier.restore().await.map_err(|e| {
		let backup = ctx.upgrade_dir.join(crate::constants::TERRAFORM_BACKUP_DIR);
		Error::Other(format!(
		    "restoring Terraform workspace: {}, clean up or restore {} manually from {}",
		    e, ctx.workspace.terraform_dir().display(), backup.display(),
		))
	    })?;
	    if new_cluster {
		ctx.terminal.println("The creation of the cluster was aborted.");
	    } else {
		ctx.terminal.println("Aborting upgrade.");
	    }
	    return Err(Error::Aborted);
	}

	log::debug!("applying infrastructure changes");
	let outputs = applier.apply(config).await
	    .map_err(|e| e.in_phase(Phase::Infrastructure, "apply infrastructure changes", false, note.clone()))?;

	state.set_infrastructure(outputs);
	ctx.write_state(state, Phase::Infrastructure)?;

	if new_cluster {
	    ctx.terminal.println("Cloud infrastructure created successfully.");
	}
	Ok(true)
    }

    /* Returns the success report, printed once the whole run finished. */
    async fn init(&self, config: &Config, state: &mut State) -> Result<String, Error> {
	let ctx = self.ctx;
	let note = ctx.workspace_note();
	let dialer = ctx.factory.dialer(config)?;

	let coordinator = Coordinator{
	    workspace: ctx.workspace,
	    dialer: dialer.as_ref(),
	    retry: self.retry.clone(),
	    terminal: ctx.terminal,
	};
	let options = InitOptions{
	    conformance: ctx.flags.conformance,
	    merge_kubeconfig: ctx.flags.merge_kubeconfig,
	};

	let (output, logs) = match coordinator.init(config, state, &options).await {
	    Ok(result) => result,
	    Err(Error::Init(InitError::NonRetriable{ reason, log_collection_error })) => {
		ctx.terminal.eprintln("Cluster initialization failed. This error is not recoverable.");
		ctx.terminal.eprintln("Terminate your cluster and try again.");
		match &log_collection_error {
		    Some(err) => ctx.terminal.eprintln(&format!("Failed to collect logs from bootstrapper: {}", err)),
		    None => ctx.terminal.eprintln(&format!("Fetched bootstrapper logs are stored in {:?}", ctx.workspace.error_log_path().display().to_string())),
		}
		let err = Error::Init(InitError::NonRetriable{ reason: reason, log_collection_error: log_collection_error });
		return Err(err.in_phase(Phase::Init, "initialize the cluster", false, note));
	    },
	    Err(err @ Error::Init(InitError::CredentialsLost{ .. })) => {
		return Err(err.in_phase(Phase::Init, "store the admin kubeconfig", false, note));
	    },
	    Err(err) => return Err(err.in_phase(Phase::Init, "initialize the cluster", true, note)),
	};
	log::debug!("bootstrapper sent {} bytes of logs", logs.contents().len());

	state.set_cluster_values(output.cluster_values());
	ctx.write_state(state, Phase::Init)?;

	Ok(init::report(&output, options.merge_kubeconfig))
    }
}

/*
 * The phases talking to the cluster API. Only constructed once the admin
 * kubeconfig exists.
 */
struct PostInit<'a> {
    ctx: &'a RunContext<'a>,
    kube: Box<dyn KubeUpgrader>,
    admin_conf: PathBuf,
}

impl<'a> PostInit<'a> {

    async fn connect(ctx: &'a RunContext<'a>) -> Result<Self, Error> {
	let admin_conf = ctx.workspace.admin_conf_path();
	if !ctx.workspace.admin_conf_exists() {
	    let errmsg = format!("admin kubeconfig {} not found, the cluster has to be initialized first", admin_conf.display());
	    return Err(Error::Precondition(errmsg));
	}
	log::debug!("creating Kubernetes client using {}", admin_conf.display());
	let kube = ctx.factory.kube_upgrader(&admin_conf).await?;
	Ok(Self{
	    ctx: ctx,
	    kube: kube,
	    admin_conf: admin_conf,
	})
    }

    async fn attestation(&self, config: &Config, state: &State) -> Result<bool, Error> {
	let salt = hex::decode(&state.cluster_values.measurement_salt)
	    .map_err(|e| Error::Fatal(format!("clusterValues.measurementSalt in state file: {}", e)))?;

	let reconciler = JoinConfigReconciler{
	    kube: self.kube.as_ref(),
	    prompter: self.ctx.prompter,
	    terminal: self.ctx.terminal,
	    yes: self.ctx.flags.yes,
	};
	let outcome = reconciler.apply(&config.attestation, &salt).await
	    .map_err(|e| e.in_phase(Phase::Attestation, "apply the attestation config", true, self.ctx.workspace_note()))?;
	Ok(outcome != JoinConfigOutcome::Unchanged)
    }

    async fn sans(&self, config: &Config, state: &State) -> Result<bool, Error> {
	let mut extra = state.infrastructure.api_server_cert_sans.clone();
	extra.extend(config.api_server_cert_sans.iter().cloned());
	let sans = joinconfig::cert_sans(&state.infrastructure.cluster_endpoint, &config.custom_endpoint, &extra);

	let added = self.kube.extend_cert_sans(&sans).await
	    .map_err(|e| e.in_phase(Phase::Sans, "extend the apiserver cert SANs", true, self.ctx.workspace_note()))?;
	if added.is_empty() {
	    log::debug!("apiserver cert SANs are up to date");
	    return Ok(false);
	}
	self.ctx.terminal.println("Successfully extended the cluster's apiserver SAN field");
	Ok(true)
    }

    async fn helm(&self, config: &Config, state: &State, init_required: bool) -> Result<bool, Error> {
	let ctx = self.ctx;
	let secret_path = ctx.workspace.master_secret_path();
	let secret = match MasterSecret::load(&secret_path)? {
	    Some(secret) => secret,
	    None => {
		let errmsg = format!("master secret {} not found", secret_path.display());
		return Err(Error::Precondition(errmsg).in_phase(Phase::Helm, "read the master secret", true, ctx.workspace_note()));
	    },
	};

	let charts = ctx.factory.chart_applier(&self.admin_conf, config)?;
	let reconciler = ChartReconciler{
	    charts: charts.as_ref(),
	    kube: self.kube.as_ref(),
	    prompter: ctx.prompter,
	    terminal: ctx.terminal,
	    upgrade_dir: ctx.upgrade_dir,
	};
	let options = ChartOptions{
	    force: ctx.flags.force,
	    conformance: ctx.flags.conformance,
	    wait_mode: if ctx.flags.skip_helm_wait { WaitMode::None } else { WaitMode::Atomic },
	    timeout: ctx.flags.helm_timeout,
	    destructive: DestructivePolicy::Deny,
	};

	let outcome = reconciler.apply(config, state, &secret, options, init_required).await?;
	Ok(!outcome.applied.is_empty())
    }

    async fn node_version(&self, config: &Config, skips: &SkipSet) -> Result<bool, Error> {
	let reconciler = NodeVersionReconciler{ kube: self.kube.as_ref() };
	let result = reconciler.upgrade(
	    config,
	    self.ctx.flags.force,
	    skips.contains(SkipPhase::Image),
	    skips.contains(SkipPhase::K8s),
	).await;

	match result {
	    Ok(outcome) => {
		for skipped in &outcome.skipped {
		    self.ctx.terminal.eprintln(&format!("skipping {} upgrade: {}", skipped.component, skipped));
		}
		Ok(outcome.updated)
	    },
	    Err(Error::InProgress(msg)) => {
		log::debug!("node-operator busy: {}", msg);
		self.ctx.terminal.eprintln("Skipping image and Kubernetes upgrades. Another upgrade is in progress.");
		Ok(false)
	    },
	    Err(Error::Incompatible(err)) => {
		self.ctx.terminal.eprintln(&format!("skipping {} upgrade: {}", err.component, err));
		Ok(false)
	    },
	    Err(err) => Err(err.in_phase(Phase::NodeVersion, "upgrade the NodeVersion", true, self.ctx.workspace_note())),
	}
    }
}

/*
 * Drives a workspace from its configuration to an initialized, up to date
 * cluster. Phases run strictly in order; a failing phase stops the run
 * and completed phases are never rolled back.
 */
pub struct Applier<'a> {
    pub workspace: &'a Workspace,
    pub factory: &'a dyn ClientFactory,
    pub prompter: &'a dyn Prompter,
    pub terminal: &'a Terminal,
    pub flags: ApplyFlags,
    pub retry: RetryPolicy,
}

impl<'a> Applier<'a> {

    pub fn new(workspace: &'a Workspace, factory: &'a dyn ClientFactory, prompter: &'a dyn Prompter, terminal: &'a Terminal, flags: ApplyFlags) -> Self {
	Self{
	    workspace: workspace,
	    factory: factory,
	    prompter: prompter,
	    terminal: terminal,
	    flags: flags,
	    retry: RetryPolicy::default(),
	}
    }

    fn load_state(&self, plan: &Plan) -> Result<State, Error> {
	match state::load(&self.workspace.state_path()) {
	    Ok(state) => Ok(state),
	    Err(Error::NotFound(what)) => {
		if plan.init_required || plan.runs(Phase::Infrastructure) {
		    log::debug!("{} not found, starting from an empty state", what);
		    Ok(State::new())
		} else {
		    Err(Error::Precondition(format!("{} not found", what)))
		}
	    },
	    Err(err) => Err(err),
	}
    }

    pub async fn apply(&self) -> Result<(), Error> {
	let _lock = self.workspace.lock()?;

	let (config, issues) = config::load(self.workspace, self.flags.force)?;
	for issue in issues.iter().filter(|i| i.severity == Severity::Warning) {
	    self.terminal.warn(&issue.to_string());
	}

	let plan = plan(&config, &self.flags.skip_phases, self.workspace.admin_conf_exists())?;
	log::debug!("phases: {:?}, skipped: {:?}", plan.phases, plan.skips.effective());

	// the config warning already named the version
	if plan.k8s_near_miss && !self.flags.yes {
	    if !self.prompter.confirm("Do you want to continue anyway?").await? {
		return Err(Error::Aborted);
	    }
	}

	let mut state = self.load_state(&plan)?;
	let upgrade_dir = self.workspace.create_upgrade_dir("apply")?;

	let ctx = RunContext{
	    workspace: self.workspace,
	    factory: self.factory,
	    prompter: self.prompter,
	    terminal: self.terminal,
	    flags: &self.flags,
	    upgrade_dir: &upgrade_dir,
	};

	let mut changed = false;
	let mut report = String::new();

	let pre = PreInit{ ctx: &ctx, retry: self.retry.clone() };
	if plan.runs(Phase::Infrastructure) {
	    changed |= pre.infrastructure(&config, &mut state).await?;
	}
	if plan.runs(Phase::Init) {
	    report = pre.init(&config, &mut state).await?;
	    changed = true;
	}

	if plan.needs_cluster() {
	    let post = PostInit::connect(&ctx).await?;
	    if plan.runs(Phase::Attestation) {
		changed |= post.attestation(&config, &state).await?;
	    }
	    if plan.runs(Phase::Sans) {
		changed |= post.sans(&config, &state).await?;
	    }
	    if plan.runs(Phase::Helm) {
		changed |= post.helm(&config, &state, plan.init_required).await?;
	    }
	    if plan.runs(Phase::NodeVersion) {
		changed |= post.node_version(&config, &plan.skips).await?;
	    }
	}

	self.terminal.print(&report);
	if !changed {
	    self.terminal.println("Apply finished: no changes were necessary.");
	}
	Ok(())
    }
}
