/*
 * konstel/api - objects shared between the konstel command line and the
 * in-cluster components: the NodeVersion CRD, the join policy document and
 * the init RPC messages.
 */

pub mod nodeversion;
pub use nodeversion::NodeVersion;
pub use nodeversion::NodeVersionSpec;
pub use nodeversion::NodeVersionStatus;
pub use nodeversion::NodeVersionCondition;
pub use nodeversion::ConditionStatus;

pub mod attestation;
pub use attestation::AttestationConfig;
pub use attestation::AttestationError;
pub use attestation::Measurement;
pub use attestation::Variant;

pub mod initproto;
pub use initproto::InitRequest;
pub use initproto::InitResponse;
