/*
 * Messages exchanged with the bootstrapper during cluster initialization.
 *
 * The client sends exactly one InitRequest; the bootstrapper answers with
 * zero or more Log frames followed by exactly one terminal frame (Success
 * or Failure). Each message travels as a single JSON document inside a
 * length-delimited frame.
 */
use serde::{Deserialize, Serialize};

/* Port the bootstrapper listens on for the init RPC. */
pub const INIT_PORT: u16 = 9000;

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
	s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
	let raw = String::deserialize(d)?;
	STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {

    #[serde(with = "b64")]
    pub master_secret: Vec<u8>,

    #[serde(with = "b64")]
    pub master_secret_salt: Vec<u8>,

    #[serde(with = "b64")]
    pub measurement_salt: Vec<u8>,

    pub kubernetes_version: String,

    #[serde(default)]
    pub conformance_mode: bool,

    pub service_cidr: String,

    // proves to the bootstrapper that we created the infrastructure
    #[serde(with = "b64")]
    pub init_secret: Vec<u8>,

    pub cluster_name: String,

    #[serde(default)]
    pub api_server_cert_sans: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InitResponse {

    /* One line of bootstrapper progress output. */
    #[serde(rename_all = "camelCase")]
    Log { line: String },

    /* Terminal frame: the cluster is up. */
    #[serde(rename_all = "camelCase")]
    Success {
	owner_id: String,
	cluster_id: String,
	#[serde(with = "b64")]
	kubeconfig: Vec<u8>,
    },

    /* Terminal frame: the bootstrapper gave up, the cluster cannot recover. */
    #[serde(rename_all = "camelCase")]
    Failure { error: String },
}

impl InitResponse {

    pub fn is_terminal(&self) -> bool {
	!matches!(self, InitResponse::Log{..})
    }
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

pub fn decode<'a, T: Deserialize<'a>>(raw: &'a [u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bytes_are_base64() {
	let req = InitRequest{
	    master_secret: vec![1; 32],
	    kubernetes_version: "v1.29.7".to_string(),
	    ..Default::default()
	};
	let json: serde_json::Value = serde_json::from_slice(&encode(&req).unwrap()).unwrap();
	assert_eq!(json["masterSecret"], "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=");
	assert_eq!(json["kubernetesVersion"], "v1.29.7");
    }

    #[test]
    fn responses_are_tagged() {
	let raw = br#"{"kind":"success","ownerId":"O1","clusterId":"C1","kubeconfig":"YWJj"}"#;
	let resp: InitResponse = decode(raw).unwrap();
	assert_eq!(resp, InitResponse::Success{
	    owner_id: "O1".to_string(),
	    cluster_id: "C1".to_string(),
	    kubeconfig: b"abc".to_vec(),
	});
	assert!(resp.is_terminal());

	let log: InitResponse = decode(br#"{"kind":"log","line":"starting kubelet"}"#).unwrap();
	assert!(!log.is_terminal());
    }
}
