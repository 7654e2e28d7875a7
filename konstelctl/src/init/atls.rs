use crate::constants;
use crate::errors::Error;
use crate::init::rpc::{BoxedStream, DialError, InitDialer};

use async_trait::async_trait;
use konstel_api::{AttestationConfig, Variant};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/* Certificate extension carrying the bootstrapper's attestation document. */
pub const ATTESTATION_DOCUMENT_OID: &str = "1.3.9901.1.1";

const ATTESTATION_ERROR_PREFIX: &str = "attestation: ";

/*
 * Checks an attestation document against the expected policy. The public
 * key is the DER encoded SubjectPublicKeyInfo of the certificate the
 * document was presented with.
 */
pub trait AttestationValidator: Send + Sync + fmt::Debug {
    fn validate(&self, document: &[u8], public_key: &[u8]) -> Result<(), String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttestationDocument {
    variant: Variant,
    #[serde(default)]
    measurements: BTreeMap<u32, String>,
    // hex(sha256(public key)), binds the document to the TLS key
    report_data: String,
}

/* Validates measurements and key binding of the configured variant. */
#[derive(Debug, Clone)]
pub struct MeasurementValidator {
    expected: AttestationConfig,
}

impl MeasurementValidator {
    pub fn new(expected: AttestationConfig) -> Self {
	Self{ expected: expected }
    }
}

impl AttestationValidator for MeasurementValidator {
    fn validate(&self, document: &[u8], public_key: &[u8]) -> Result<(), String> {
	let doc: AttestationDocument = serde_json::from_slice(document)
	    .map_err(|e| format!("malformed attestation document: {}", e))?;

	if doc.variant != self.expected.variant {
	    return Err(format!("expected variant {}, peer attested as {}", self.expected.variant, doc.variant));
	}

	let binding = hex::encode(Sha256::digest(public_key));
	if !doc.report_data.eq_ignore_ascii_case(&binding) {
	    return Err("attestation document is not bound to the certificate key".to_string());
	}

	for (index, m) in &self.expected.measurements {
	    let matches = doc.measurements.get(index)
		.map(|actual| actual.eq_ignore_ascii_case(&m.expected))
		.unwrap_or(false);
	    if matches {
		continue;
	    }
	    if m.warn_only {
		log::warn!("measurement {} does not match the expected value, continuing (warnOnly)", index);
	    } else {
		return Err(format!("measurement {} does not match the expected value", index));
	    }
	}

	Ok(())
    }
}

#[derive(Debug)]
struct AttestedCertVerifier {
    validator: Arc<dyn AttestationValidator>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AttestedCertVerifier {
    fn verify_server_cert(
	&self,
	end_entity: &CertificateDer<'_>,
	_intermediates: &[CertificateDer<'_>],
	_server_name: &ServerName<'_>,
	_ocsp_response: &[u8],
	_now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
	let (_, cert) = x509_parser::parse_x509_certificate(end_entity.as_ref())
	    .map_err(|e| rustls::Error::General(format!("{}unparsable certificate: {}", ATTESTATION_ERROR_PREFIX, e)))?;

	let document = cert.extensions().iter()
	    .find(|ext| ext.oid.to_id_string() == ATTESTATION_DOCUMENT_OID)
	    .map(|ext| ext.value)
	    .ok_or_else(|| rustls::Error::General(format!("{}certificate carries no attestation document", ATTESTATION_ERROR_PREFIX)))?;

	self.validator.validate(document, cert.public_key().raw)
	    .map_err(|e| rustls::Error::General(format!("{}{}", ATTESTATION_ERROR_PREFIX, e)))?;

	Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
	&self,
	message: &[u8],
	cert: &CertificateDer<'_>,
	dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
	rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
	&self,
	message: &[u8],
	cert: &CertificateDer<'_>,
	dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
	rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
	self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/*
 * Dials the bootstrapper over TLS, where the server certificate is
 * trusted because of its attestation document rather than a CA chain.
 */
pub struct AtlsDialer {
    connector: TlsConnector,
    timeout: Duration,
}

impl AtlsDialer {

    pub fn new(validator: Arc<dyn AttestationValidator>) -> Result<Self, Error> {
	let provider = Arc::new(rustls::crypto::ring::default_provider());
	let verifier = Arc::new(AttestedCertVerifier{
	    validator: validator,
	    provider: provider.clone(),
	});

	let config = ClientConfig::builder_with_provider(provider)
	    .with_safe_default_protocol_versions()
	    .map_err(|e| Error::Other(format!("building TLS config: {}", e)))?
	    .dangerous()
	    .with_custom_certificate_verifier(verifier)
	    .with_no_client_auth();

	Ok(Self{
	    connector: TlsConnector::from(Arc::new(config)),
	    timeout: constants::DIAL_TIMEOUT,
	})
    }
}

fn host_of(endpoint: &str) -> &str {
    let host = match endpoint.rsplit_once(':') {
	Some((host, _port)) => host,
	None => endpoint,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn classify_handshake_error(err: std::io::Error) -> DialError {
    let msg = err.to_string();
    if let Some(inner) = err.get_ref() {
	if let Some(rustls::Error::General(general)) = inner.downcast_ref::<rustls::Error>() {
	    if let Some(reason) = general.strip_prefix(ATTESTATION_ERROR_PREFIX) {
		return DialError::Attestation(reason.to_string());
	    }
	}
    }
    DialError::Transport(msg)
}

#[async_trait]
impl InitDialer for AtlsDialer {
    async fn dial(&self, endpoint: &str) -> Result<BoxedStream, DialError> {
	let server_name = ServerName::try_from(host_of(endpoint).to_string())
	    .map_err(|e| DialError::Transport(format!("invalid endpoint {}: {}", endpoint, e)))?;

	let connect = async {
	    let tcp = TcpStream::connect(endpoint).await
		.map_err(|e| DialError::Transport(e.to_string()))?;
	    let tls = self.connector.connect(server_name, tcp).await
		.map_err(classify_handshake_error)?;
	    Ok::<BoxedStream, DialError>(Box::new(tls))
	};

	match tokio::time::timeout(self.timeout, connect).await {
	    Ok(result) => result,
	    Err(_) => Err(DialError::Transport(format!("dialing {} timed out after {:?}", endpoint, self.timeout))),
	}
    }
}
