use crate::constants;
use crate::errors::Error;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/*
 * Root key material of the cluster. Generated once, on the first
 * initialization attempt, and never rotated afterwards.
 */
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterSecret {
    key: String,
    salt: String,
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
	f.write_str("MasterSecret{..}")
    }
}

impl MasterSecret {

    pub fn generate() -> Self {
	Self{
	    key: STANDARD.encode(random_bytes(constants::MASTER_SECRET_LENGTH)),
	    salt: STANDARD.encode(random_bytes(constants::SALT_LENGTH)),
	}
    }

    pub fn key(&self) -> Result<Vec<u8>, Error> {
	STANDARD.decode(&self.key).map_err(|e| Error::Fatal(format!("master secret key is not base64: {}", e)))
    }

    pub fn salt(&self) -> Result<Vec<u8>, Error> {
	STANDARD.decode(&self.salt).map_err(|e| Error::Fatal(format!("master secret salt is not base64: {}", e)))
    }

    /* Reads an existing secret, None when the file does not exist. */
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
	let raw = match fs::read(path) {
	    Ok(raw) => raw,
	    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
	    Err(err) => return Err(Error::Io(err)),
	};
	let secret: MasterSecret = serde_json::from_slice(&raw)
	    .map_err(|e| Error::Fatal(format!("master secret {} is corrupt: {}", path.display(), e)))?;

	if secret.key()?.len() != constants::MASTER_SECRET_LENGTH || secret.salt()?.len() != constants::SALT_LENGTH {
	    let errmsg = format!("master secret {} must hold a {} byte key and a {} byte salt", path.display(), constants::MASTER_SECRET_LENGTH, constants::SALT_LENGTH);
	    return Err(Error::Fatal(errmsg));
	}
	Ok(Some(secret))
    }

    /* Writes the secret, refusing to overwrite an existing file. */
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
	let mut options = fs::OpenOptions::new();
	options.write(true).create_new(true);
	#[cfg(unix)]
	{
	    use std::os::unix::fs::OpenOptionsExt;
	    options.mode(0o600);
	}

	let mut file = options.open(path)?;
	file.write_all(&serde_json::to_vec_pretty(self)?)?;
	file.sync_all()?;
	Ok(())
    }

    /*
     * Reuses the secret left behind by an earlier attempt, or generates and
     * persists a new one. The flag tells whether a new file was written.
     */
    pub fn load_or_generate(path: &Path) -> Result<(Self, bool), Error> {
	if let Some(secret) = Self::load(path)? {
	    log::info!("reusing master secret from {}", path.display());
	    return Ok((secret, false));
	}

	let secret = Self::generate();
	secret.persist(path)?;
	log::debug!("generated master secret key and salt");
	Ok((secret, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_then_reused() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join(constants::MASTER_SECRET_FILENAME);

	let (first, created) = MasterSecret::load_or_generate(&path).unwrap();
	assert!(created);
	assert_eq!(first.key().unwrap().len(), 32);
	assert_eq!(first.salt().unwrap().len(), 32);

	let (second, created) = MasterSecret::load_or_generate(&path).unwrap();
	assert!(!created);
	assert_eq!(first, second);
    }

    #[test]
    fn never_overwritten() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join(constants::MASTER_SECRET_FILENAME);
	MasterSecret::generate().persist(&path).unwrap();
	assert!(MasterSecret::generate().persist(&path).is_err());
    }

    #[test]
    fn short_key_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join(constants::MASTER_SECRET_FILENAME);
	fs::write(&path, r#"{"key":"AAAA","salt":"AAAA"}"#).unwrap();
	assert!(matches!(MasterSecret::load(&path), Err(Error::Fatal(_))));
    }
}
