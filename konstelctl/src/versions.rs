use semver::Version;
use thiserror::Error;

/* Kubernetes releases this CLI can install and upgrade to. */
pub const SUPPORTED_K8S_VERSIONS: &[&str] = &["v1.28.12", "v1.29.7", "v1.30.3"];

/* Minors shipped as preview: usable, but not yet covered by support. */
pub const PREVIEW_K8S_MINORS: &[&str] = &["v1.30"];

pub const DEFAULT_K8S_VERSION: &str = "v1.29.7";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum K8sTier {
    /*
     * A release from the supported list.
     */
    Supported,

    /*
     * A patch of a supported minor that this CLI does not know. Accepted
     * after confirmation, the k8s upgrade is skipped.
     */
    UnknownPatch,

    /*
     * Anything else.
     */
    Unsupported,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("upgrading {component} from {from} to {to} is not supported: {reason}")]
pub struct InvalidUpgradeError {
    pub component: String,
    pub from: String,
    pub to: String,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{component} version {actual} is incompatible with CLI version {cli}: {reason}")]
pub struct IncompatibleVersionError {
    pub component: String,
    pub actual: String,
    pub cli: String,
    pub reason: String,
}

/* Parses `v1.2.3` or `1.2.3`. */
pub fn parse(raw: &str) -> Result<Version, semver::Error> {
    Version::parse(raw.trim().trim_start_matches('v'))
}

fn major_minor(raw: &str) -> Option<(u64, u64)> {
    let trimmed = raw.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/*
 * Expands a `v1.29` short form to the supported patch release of that
 * minor. Full versions are returned unchanged.
 */
pub fn resolve_k8s_version(raw: &str) -> String {
    if parse(raw).is_ok() {
	return raw.to_string();
    }
    match major_minor(raw) {
	Some(mm) => {
	    for supported in SUPPORTED_K8S_VERSIONS {
		if major_minor(supported) == Some(mm) {
		    return supported.to_string();
		}
	    }
	    raw.to_string()
	},
	None => raw.to_string(),
    }
}

pub fn classify_k8s_version(raw: &str) -> K8sTier {
    let version = match parse(raw) {
	Ok(version) => version,
	Err(_) => return K8sTier::Unsupported,
    };

    let mut minor_known = false;
    for supported in SUPPORTED_K8S_VERSIONS {
	let supported = match parse(supported) {
	    Ok(v) => v,
	    Err(_) => continue,
	};
	if supported == version {
	    return K8sTier::Supported;
	}
	if supported.major == version.major && supported.minor == version.minor {
	    minor_known = true;
	}
    }

    if minor_known && version.pre.is_empty() {
	K8sTier::UnknownPatch
    } else {
	K8sTier::Unsupported
    }
}

pub fn is_preview_k8s_version(raw: &str) -> bool {
    let mm = major_minor(raw);
    PREVIEW_K8S_MINORS.iter().any(|preview| major_minor(preview) == mm && mm.is_some())
}

/*
 * The node image must share major.minor with the CLI, and the in-cluster
 * services must match the CLI exactly.
 */
pub fn check_version_compatibility(cli: &str, image: &str, microservice: &str) -> Result<(), IncompatibleVersionError> {
    let incompatible = |component: &str, actual: &str, reason: &str| IncompatibleVersionError{
	component: component.to_string(),
	actual: actual.to_string(),
	cli: cli.to_string(),
	reason: reason.to_string(),
    };

    let cli_version = parse(cli).map_err(|e| incompatible("cli", cli, &e.to_string()))?;

    let image_version = parse(image).map_err(|e| incompatible("image", image, &e.to_string()))?;
    if image_version.major != cli_version.major || image_version.minor != cli_version.minor {
	return Err(incompatible("image", image, "major.minor must match"));
    }

    let micro_version = parse(microservice).map_err(|e| incompatible("microservice", microservice, &e.to_string()))?;
    if micro_version != cli_version {
	return Err(incompatible("microservice", microservice, "versions must be equal"));
    }

    Ok(())
}

/*
 * Ok(false) when nothing changes, Ok(true) for a patch or a single minor
 * step forward; downgrades, major changes and minor skips are rejected.
 */
pub fn is_valid_upgrade(component: &str, current: &str, target: &str) -> Result<bool, InvalidUpgradeError> {
    let invalid = |reason: String| InvalidUpgradeError{
	component: component.to_string(),
	from: current.to_string(),
	to: target.to_string(),
	reason: reason,
    };

    let from = parse(current).map_err(|e| invalid(format!("invalid current version: {}", e)))?;
    let to = parse(target).map_err(|e| invalid(format!("invalid target version: {}", e)))?;

    if from == to {
	return Ok(false);
    }
    if to < from {
	return Err(invalid("downgrades are not allowed".to_string()));
    }
    if to.major != from.major {
	return Err(invalid("major version upgrades are not allowed".to_string()));
    }
    if to.minor > from.minor + 1 {
	return Err(invalid(format!("only one minor version at a time, next allowed is v{}.{}", from.major, from.minor + 1)));
    }

    Ok(true)
}

/* `ref/to/image/v2.14.0` -> `2.14.0` */
pub fn image_version_from_reference(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    last.trim_start_matches('v').to_string()
}
