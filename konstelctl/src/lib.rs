/*
 * Apply pipeline of the konstel CLI: reconciles a workspace configuration
 * into cloud infrastructure, an attested cluster and its in-cluster
 * components.
 */
pub mod apply;
pub mod charts;
pub mod cli;
pub mod config;
pub mod constants;
pub mod diff;
pub mod errors;
pub mod factory;
pub mod helm;
pub mod infra;
pub mod init;
pub mod joinconfig;
pub mod kubecmd;
pub mod kubeconfig;
pub mod nodeversion;
pub mod state;
pub mod terminal;
pub mod versions;
pub mod workspace;

pub use errors::{Error, Phase};
