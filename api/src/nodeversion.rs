use kube::api::ObjectMeta;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* Name of the singleton NodeVersion object driving cluster upgrades. */
pub const NODE_VERSION_NAME: &str = "konstel-version";

/* Condition type the node-operator sets while nodes still run an older version. */
pub const CONDITION_OUTDATED: &str = "Outdated";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConditionStatus {
    /*
     * The condition currently holds.
     */
    TRUE,

    /*
     * The condition does not hold.
     */
    FALSE,

    /*
     * The operator could not determine the condition.
     */
    UNKNOWN,
}

impl ToString for ConditionStatus {
    fn to_string(&self) -> String {
	match self {
	    ConditionStatus::TRUE => String::from("True"),
	    ConditionStatus::FALSE => String::from("False"),
	    ConditionStatus::UNKNOWN => String::from("Unknown"),
	}
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeVersionCondition {

    pub fn new(type_: &str, status: ConditionStatus) -> Self {
	Self{
	    type_: type_.to_string(),
	    status: status.to_string(),
	    reason: None,
	    message: None,
	}
    }

    pub fn is(&self, type_: &str, status: ConditionStatus) -> bool {
	self.type_ == type_ && self.status == status.to_string()
    }
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "update.konstel.dev", version = "v1alpha1", kind = "NodeVersion")]
#[kube(status = "NodeVersionStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionSpec {

    // provider specific reference of the node image to roll out
    #[serde(default)]
    pub image_reference: String,

    // semantic version of the node image, i.e. v2.14.0
    #[serde(default)]
    pub image_version: String,

    // kubernetes version every control-plane and worker should run
    #[serde(default)]
    pub kubernetes_cluster_version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersionStatus {

    // set by the node-operator while a control-plane version upgrade is rolling
    #[serde(default)]
    pub active_cluster_version_upgrade: bool,

    #[serde(default)]
    pub conditions: Vec<NodeVersionCondition>,
}

impl NodeVersion {

    /*
     * Returns true when the node-operator reports an upgrade that has not
     * converged yet, either through the active upgrade flag or an
     * `Outdated=True` condition.
     */
    pub fn upgrade_in_progress(&self) -> bool {
	match &self.status {
	    Some(status) => {
		status.active_cluster_version_upgrade
		    || status.conditions.iter().any(|c| c.is(CONDITION_OUTDATED, ConditionStatus::TRUE))
	    },
	    None => false,
	}
    }

    /*
     * The version fields only, used to verify a write landed as intended.
     */
    pub fn versions(&self) -> (&str, &str, &str) {
	(
	    self.spec.image_reference.as_str(),
	    self.spec.image_version.as_str(),
	    self.spec.kubernetes_cluster_version.as_str(),
	)
    }
}

pub fn new(spec: NodeVersionSpec) -> NodeVersion {
    let mut metadata = ObjectMeta::default();
    metadata.name = Some(NODE_VERSION_NAME.to_string());

    NodeVersion{
	metadata: metadata,
	spec: spec,
	status: Some(NodeVersionStatus::default()),
    }
}
