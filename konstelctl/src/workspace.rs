use crate::constants;
use crate::errors::Error;

use rand::RngCore;
use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/*
 * Workspace is the directory holding everything that belongs to one
 * cluster: its configuration, the state record, credentials, secrets and
 * the scratch directories of previous runs.
 */
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {

    pub fn new(root: impl Into<PathBuf>) -> Self {
	Self{ root: root.into() }
    }

    pub fn root(&self) -> &Path {
	&self.root
    }

    pub fn config_path(&self) -> PathBuf {
	self.root.join(constants::CONFIG_FILENAME)
    }

    pub fn state_path(&self) -> PathBuf {
	self.root.join(constants::STATE_FILENAME)
    }

    pub fn master_secret_path(&self) -> PathBuf {
	self.root.join(constants::MASTER_SECRET_FILENAME)
    }

    pub fn admin_conf_path(&self) -> PathBuf {
	self.root.join(constants::ADMIN_CONF_FILENAME)
    }

    pub fn error_log_path(&self) -> PathBuf {
	self.root.join(constants::ERROR_LOG_FILENAME)
    }

    pub fn terraform_dir(&self) -> PathBuf {
	self.root.join(constants::TERRAFORM_WORKING_DIR)
    }

    /* Initialization has happened iff the admin kubeconfig exists. */
    pub fn admin_conf_exists(&self) -> bool {
	self.admin_conf_path().is_file()
    }

    /*
     * Takes the advisory workspace lock. The marker is created exclusively
     * and removed when the returned guard is dropped.
     */
    pub fn lock(&self) -> Result<WorkspaceLock, Error> {
	self.lock_with(|file| writeln!(file, "{}", std::process::id()))
    }

    fn lock_with<F>(&self, stamp: F) -> Result<WorkspaceLock, Error>
    where F: FnOnce(&mut fs::File) -> std::io::Result<()>
    {
	let path = self.root.join(constants::LOCK_FILENAME);
	let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
	    Ok(file) => file,
	    Err(err) if err.kind() == ErrorKind::AlreadyExists => {
		let errmsg = format!("workspace is locked by another run, remove {} if no other process is running", path.display());
		return Err(Error::Precondition(errmsg));
	    },
	    Err(err) => return Err(Error::Io(err)),
	};
	// guard first, a failed stamp must not leave the marker behind
	let lock = WorkspaceLock{ path: path };
	stamp(&mut file)?;

	log::debug!("acquired workspace lock {}", lock.path.display());
	Ok(lock)
    }

    /*
     * Creates `konstel-upgrade/<kind>-<unix seconds>-<6 hex>`, the scratch
     * directory of one mutating run. It is never removed by the CLI.
     */
    pub fn create_upgrade_dir(&self, kind: &str) -> Result<PathBuf, Error> {
	let secs = SystemTime::now()
	    .duration_since(UNIX_EPOCH)
	    .map(|d| d.as_secs())
	    .unwrap_or(0);
	let mut suffix = [0u8; 3];
	rand::rngs::OsRng.fill_bytes(&mut suffix);

	let id = format!("{}-{}-{}", kind, secs, hex::encode(suffix));
	let dir = self.root.join(constants::UPGRADE_DIR).join(id);
	fs::create_dir_all(&dir)?;

	log::info!("created upgrade workspace {}", dir.display());
	Ok(dir)
    }
}

#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
	if let Err(err) = fs::remove_file(&self.path) {
	    log::warn!("unable to release workspace lock {}: {}", self.path.display(), err);
	}
    }
}
