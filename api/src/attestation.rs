use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/* Namespace and object holding the join policy inside the cluster. */
pub const JOIN_CONFIG_NAMESPACE: &str = "kube-system";
pub const JOIN_CONFIG_MAP: &str = "join-config";

/* Keys used inside the join-config ConfigMap. */
pub const ATTESTATION_CONFIG_KEY: &str = "attestationConfig";
pub const ATTESTATION_CONFIG_BACKUP_KEY: &str = "attestationConfig_backup";
pub const MEASUREMENT_SALT_KEY: &str = "measurementSalt";

#[derive(Error, Debug)]
pub enum AttestationError {

    #[error("attestation config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown attestation variant `{0}`")]
    UnknownVariant(String),

    #[error("attestation config for variant {expected} expected, got {actual}")]
    VariantMismatch { expected: Variant, actual: Variant },
}

/*
 * Hardware/firmware attestation flavours the cluster can be bootstrapped with.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variant {
    #[serde(rename = "aws-sev-snp")]
    AwsSevSnp,

    #[serde(rename = "aws-nitro-tpm")]
    AwsNitroTpm,

    #[serde(rename = "azure-sev-snp")]
    AzureSevSnp,

    #[serde(rename = "azure-tdx")]
    AzureTdx,

    #[serde(rename = "gcp-sev-es")]
    GcpSevEs,

    #[serde(rename = "qemu-vtpm")]
    QemuVtpm,
}

impl Variant {

    pub fn as_str(&self) -> &'static str {
	match self {
	    Variant::AwsSevSnp => "aws-sev-snp",
	    Variant::AwsNitroTpm => "aws-nitro-tpm",
	    Variant::AzureSevSnp => "azure-sev-snp",
	    Variant::AzureTdx => "azure-tdx",
	    Variant::GcpSevEs => "gcp-sev-es",
	    Variant::QemuVtpm => "qemu-vtpm",
	}
    }

    /* Cloud provider the variant runs on. */
    pub fn provider(&self) -> &'static str {
	match self {
	    Variant::AwsSevSnp | Variant::AwsNitroTpm => "aws",
	    Variant::AzureSevSnp | Variant::AzureTdx => "azure",
	    Variant::GcpSevEs => "gcp",
	    Variant::QemuVtpm => "qemu",
	}
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = AttestationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
	let variant = match s {
	    "aws-sev-snp" => Variant::AwsSevSnp,
	    "aws-nitro-tpm" => Variant::AwsNitroTpm,
	    "azure-sev-snp" => Variant::AzureSevSnp,
	    "azure-tdx" => Variant::AzureTdx,
	    "gcp-sev-es" => Variant::GcpSevEs,
	    "qemu-vtpm" => Variant::QemuVtpm,
	    other => return Err(AttestationError::UnknownVariant(other.to_string())),
	};
	Ok(variant)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {

    /* hex encoded digest the register must hold */
    pub expected: String,

    /* a mismatch is only logged by the verifier */
    #[serde(default)]
    pub warn_only: bool,
}

impl Measurement {

    pub fn new(expected: &str) -> Self {
	Self{
	    expected: expected.to_lowercase(),
	    warn_only: false,
	}
    }

    pub fn digest(&self) -> Result<Vec<u8>, hex::FromHexError> {
	hex::decode(&self.expected)
    }
}

/*
 * The join policy: which measurements a node must present, plus the
 * variant specific knobs (firmware versions, accepted signer digests,
 * trust roots) kept as an opaque map since only their textual form
 * matters to this side.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationConfig {

    pub variant: Variant,

    #[serde(default)]
    pub measurements: BTreeMap<u32, Measurement>,

    #[serde(flatten)]
    pub policy: BTreeMap<String, serde_yaml::Value>,
}

impl AttestationConfig {

    pub fn new(variant: Variant) -> Self {
	Self{
	    variant: variant,
	    measurements: BTreeMap::new(),
	    policy: BTreeMap::new(),
	}
    }

    pub fn from_yaml(raw: &str) -> Result<Self, AttestationError> {
	Ok(serde_yaml::from_str(raw)?)
    }

    /* Canonical YAML form: sorted keys, stable across runs. */
    pub fn to_yaml(&self) -> Result<String, AttestationError> {
	Ok(serde_yaml::to_string(self)?)
    }

    /*
     * Two configs are equal when they describe the same variant and their
     * canonical YAML forms match line by line.
     */
    pub fn equal_to(&self, other: &AttestationConfig) -> Result<bool, AttestationError> {
	if self.variant != other.variant {
	    return Err(AttestationError::VariantMismatch{
		expected: self.variant,
		actual: other.variant,
	    });
	}
	Ok(self.to_yaml()? == other.to_yaml()?)
    }

    /*
     * Returns a human readable message per broken field, using the dotted
     * path of the field inside the attestation section.
     */
    pub fn validate(&self) -> Vec<(String, String)> {
	let mut issues = Vec::new();

	if self.measurements.is_empty() {
	    issues.push((
		"measurements".to_string(),
		"at least one expected measurement is required".to_string(),
	    ));
	}

	for (index, m) in self.measurements.iter() {
	    let path = format!("measurements.{}.expected", index);
	    match m.digest() {
		Err(err) => issues.push((path, format!("not a hex digest: {}", err))),
		Ok(digest) => {
		    // sha256 for vTPM banks, sha384 for SEV/TDX registers
		    if digest.len() != 32 && digest.len() != 48 {
			issues.push((path, format!("digest must be 32 or 48 bytes, got {}", digest.len())));
		    }
		}
	    }
	}

	issues
    }
}
