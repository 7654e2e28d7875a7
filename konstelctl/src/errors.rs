use crate::init::InitError;
use crate::versions::InvalidUpgradeError;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/* The steps of an apply run, in the order they execute. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Infrastructure,
    Init,
    Attestation,
    Sans,
    Helm,
    NodeVersion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let name = match self {
	    Phase::Infrastructure => "infrastructure",
	    Phase::Init => "init",
	    Phase::Attestation => "attestation",
	    Phase::Sans => "sans",
	    Phase::Helm => "helm",
	    Phase::NodeVersion => "nodeVersion",
	};
	f.write_str(name)
    }
}

fn consistency(consistent: &bool) -> &'static str {
    if *consistent { "known-consistent" } else { "possibly inconsistent" }
}

fn workspace_note(workspace: &Option<PathBuf>) -> String {
    match workspace {
	Some(path) => format!("; upgrade workspace retained at {}", path.display()),
	None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum Error {

    /* configuration failed schema or cross-field checks */
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("aborted by user")]
    Aborted,

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Incompatible(#[from] InvalidUpgradeError),

    #[error("{0}")]
    InProgress(String),

    /* invariant violation: corrupt state, unknown schema version */
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{phase} phase: could not {action}: {source}; cluster state is {}{}", consistency(.consistent), workspace_note(.workspace))]
    Phase {
	phase: Phase,
	action: String,
	#[source]
	source: Box<Error>,
	consistent: bool,
	workspace: Option<PathBuf>,
    },

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

impl Error {

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
	Error::Command{
	    command: command.into(),
	    message: message.into(),
	}
    }

    /*
     * Attach the phase context to a failure. Operator refusals and
     * configuration errors are passed through untouched so their prefixes
     * stay at the start of the printed message.
     */
    pub fn in_phase(self, phase: Phase, action: &str, consistent: bool, workspace: Option<PathBuf>) -> Self {
	match self {
	    Error::Aborted | Error::Validation(_) | Error::Phase{..} => self,
	    other => Error::Phase{
		phase: phase,
		action: action.to_string(),
		source: Box::new(other),
		consistent: consistent,
		workspace: workspace,
	    },
	}
    }

    /* The innermost error, skipping phase wrappers. */
    pub fn root(&self) -> &Error {
	match self {
	    Error::Phase{ source, .. } => source.root(),
	    other => other,
	}
    }
}

impl From<konstel_api::AttestationError> for Error {
    fn from(err: konstel_api::AttestationError) -> Self {
	Error::Other(err.to_string())
    }
}
