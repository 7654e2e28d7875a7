use crate::apply::{Applier, ApplyFlags, SkipPhase};
use crate::constants;
use crate::errors::Error;
use crate::factory::ProductionFactory;
use crate::terminal::{StdinPrompter, Terminal};
use crate::workspace::Workspace;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/* Accepts 90s, 30m, 1h or plain seconds. */
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration {:?}, expected e.g. 1h, 30m, 3600s", s);
    let (number, unit) = if let Some(hours) = s.strip_suffix('h') {
	(hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
	(minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
	(secs, 1)
    } else {
	(s, 1)
    };
    let n: u64 = number.parse().map_err(|_| invalid())?;
    if n == 0 {
	return Err(invalid());
    }
    Ok(Duration::from_secs(n.checked_mul(unit).ok_or_else(invalid)?))
}

/// Manage confidential Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "konstelctl", version, about, long_about = None)]
pub struct Cli {
    /// Directory holding the configuration, state and secrets of the cluster
    #[arg(long, global = true, env = constants::WORKSPACE_ENV, default_value = ".")]
    pub workspace: PathBuf,

    /// Print debug logs
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a cluster or bring an existing one to the configured state
    #[command(visible_aliases = ["create", "init"])]
    Apply(ApplyArgs),

    /// Upgrade an existing cluster
    Upgrade {
	#[command(subcommand)]
	command: UpgradeCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum UpgradeCommands {
    /// Same as `konstelctl apply`
    Apply(ApplyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Skip version compatibility checks
    #[arg(long)]
    pub force: bool,

    /// Enable Kubernetes conformance mode
    #[arg(long)]
    pub conformance: bool,

    /// Do not wait for helm releases to become ready
    #[arg(long)]
    pub skip_helm_wait: bool,

    /// Phases to skip: infrastructure, init, helm, image, k8s
    #[arg(long, value_delimiter = ',')]
    pub skip_phases: Vec<SkipPhase>,

    /// Merge the new cluster into the default kubeconfig
    #[arg(long)]
    pub merge_kubeconfig: bool,

    /// Upper bound for the whole run
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub timeout: Duration,
}

impl ApplyArgs {

    pub fn flags(&self) -> ApplyFlags {
	ApplyFlags{
	    yes: self.yes,
	    force: self.force,
	    conformance: self.conformance,
	    skip_helm_wait: self.skip_helm_wait,
	    skip_phases: self.skip_phases.iter().copied().collect(),
	    merge_kubeconfig: self.merge_kubeconfig,
	    helm_timeout: self.timeout,
	}
    }
}

impl Cli {

    pub async fn run(self) -> Result<(), Error> {
	let args = match self.command {
	    Commands::Apply(args) => args,
	    Commands::Upgrade{ command: UpgradeCommands::Apply(args) } => args,
	};
	run_apply(Workspace::new(self.workspace), args).await
    }
}

/*
 * Runs apply against the real backends. Interrupts and the timeout drop
 * the run; child processes are killed with it and the workspace lock is
 * released.
 */
pub async fn run_apply(workspace: Workspace, args: ApplyArgs) -> Result<(), Error> {
    let factory = ProductionFactory::from_env();
    let terminal = Terminal::stdio();
    let prompter = StdinPrompter;
    let applier = Applier::new(&workspace, &factory, &prompter, &terminal, args.flags());

    tokio::select! {
	result = tokio::time::timeout(args.timeout, applier.apply()) => match result {
	    Ok(result) => result,
	    Err(_) => Err(Error::Cancelled(format!("apply did not finish within {:?}", args.timeout))),
	},

	// handle CTRL^C as gracefully as we can.
	_ = tokio::signal::ctrl_c() => {
	    Err(Error::Cancelled("interrupted".to_string()))
	},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
	assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
	assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
	assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
	assert!(parse_duration("soon").is_err());
	assert!(parse_duration("0s").is_err());
	assert!(parse_duration("9999999999999999h").is_err());
    }

    #[test]
    fn apply_flags() {
	let cli = Cli::try_parse_from([
	    "konstelctl", "apply", "--yes", "--skip-phases", "helm,image", "--timeout", "20m",
	]).unwrap();
	let args = match cli.command {
	    Commands::Apply(args) => args,
	    other => panic!("unexpected command {:?}", other),
	};
	let flags = args.flags();
	assert!(flags.yes);
	assert!(flags.skip_phases.contains(&SkipPhase::Helm));
	assert!(flags.skip_phases.contains(&SkipPhase::Image));
	assert_eq!(flags.helm_timeout, Duration::from_secs(1200));
    }

    #[test]
    fn aliases_and_upgrade_apply() {
	let cli = Cli::try_parse_from(["konstelctl", "create", "--force"]).unwrap();
	assert!(matches!(cli.command, Commands::Apply(ref args) if args.force));

	let cli = Cli::try_parse_from(["konstelctl", "upgrade", "apply", "-y"]).unwrap();
	assert!(matches!(cli.command, Commands::Upgrade{ command: UpgradeCommands::Apply(ref args) } if args.yes));

	assert!(Cli::try_parse_from(["konstelctl", "apply", "--skip-phases", "sans"]).is_err());
    }
}
