use crate::errors::Error;

use kube::config::Kubeconfig;
use std::fs;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

fn parse(raw: &[u8]) -> Result<Kubeconfig, Error> {
    let text = std::str::from_utf8(raw)
	.map_err(|e| Error::Other(format!("kubeconfig is not utf-8: {}", e)))?;
    Kubeconfig::from_yaml(text).map_err(|e| Error::Other(format!("loading kubeconfig: {}", e)))
}

/*
 * Points the single cluster of a kubeconfig at `endpoint`, keeping scheme,
 * port and path of the original server URL.
 */
pub fn rewrite_server(raw: &[u8], endpoint: &str) -> Result<Vec<u8>, Error> {
    let mut kubeconfig = parse(raw)?;
    if kubeconfig.clusters.len() != 1 {
	let errmsg = format!("expected exactly one cluster in kubeconfig, got {}", kubeconfig.clusters.len());
	return Err(Error::Other(errmsg));
    }

    let host = match endpoint.parse::<Ipv6Addr>() {
	Ok(_) => format!("[{}]", endpoint),
	Err(_) => endpoint.to_string(),
    };

    for named in kubeconfig.clusters.iter_mut() {
	let cluster = match named.cluster.as_mut() {
	    Some(cluster) => cluster,
	    None => return Err(Error::Other(format!("cluster {} in kubeconfig has no settings", named.name))),
	};
	let server = cluster.server.clone().unwrap_or_default();
	let mut url = url::Url::parse(&server)
	    .map_err(|e| Error::Other(format!("parsing kubeconfig server URL {:?}: {}", server, e)))?;
	url.set_host(Some(&host))
	    .map_err(|e| Error::Other(format!("setting kubeconfig server host {}: {}", host, e)))?;

	let mut rewritten = url.to_string();
	if !server.ends_with('/') && rewritten.ends_with('/') {
	    rewritten.pop();
	}
	log::debug!("rewriting kubeconfig server {} to {}", server, rewritten);
	cluster.server = Some(rewritten);
    }

    Ok(serde_yaml::to_string(&kubeconfig)?.into_bytes())
}

/* First entry of $KUBECONFIG, or ~/.kube/config. */
pub fn default_kubeconfig_path() -> Result<PathBuf, Error> {
    if let Some(env) = std::env::var_os("KUBECONFIG") {
	if let Some(first) = std::env::split_paths(&env).next() {
	    if !first.as_os_str().is_empty() {
		return Ok(first);
	    }
	}
    }
    match dirs::home_dir() {
	Some(home) => Ok(home.join(".kube").join("config")),
	None => Err(Error::Precondition("unable to determine the home directory".to_string())),
    }
}

pub fn kubeconfig_env_set() -> bool {
    std::env::var_os("KUBECONFIG").map(|v| !v.is_empty()).unwrap_or(false)
}

/*
 * Merges the admin kubeconfig into `target`, switching its current
 * context to the new cluster. Entries of the admin config win on name
 * clashes.
 */
pub fn merge_into(admin_conf: &Path, target: &Path) -> Result<(), Error> {
    let admin = parse(&fs::read(admin_conf)?)?;

    let merged = if target.exists() {
	let existing = parse(&fs::read(target)?)?;
	admin.merge(existing).map_err(|e| Error::Other(format!("merging kubeconfigs: {}", e)))?
    } else {
	if let Some(dir) = target.parent() {
	    fs::create_dir_all(dir)?;
	}
	admin
    };

    fs::write(target, serde_yaml::to_string(&merged)?)?;
    log::debug!("merged {} into {}", admin_conf.display(), target.display());
    Ok(())
}
