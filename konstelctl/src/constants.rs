use std::time::Duration;

pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

// workspace file names
pub const CONFIG_FILENAME: &str = "konstel-conf.yaml";
pub const STATE_FILENAME: &str = "konstel-state.yaml";
pub const MASTER_SECRET_FILENAME: &str = "konstel-mastersecret.json";
pub const ADMIN_CONF_FILENAME: &str = "konstel-admin.conf";
pub const ERROR_LOG_FILENAME: &str = "konstel-cluster.log";
pub const LOCK_FILENAME: &str = ".konstel.lock";
pub const TERRAFORM_WORKING_DIR: &str = "konstel-terraform";

// per-run scratch space
pub const UPGRADE_DIR: &str = "konstel-upgrade";
pub const TERRAFORM_BACKUP_DIR: &str = "terraform-backup";
pub const HELM_CHARTS_DIR: &str = "helm-charts";
pub const BACKUP_DIR: &str = "backups";

pub const CONFIG_VERSION: &str = "v1";
pub const STATE_VERSION: &str = "v1";

pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
pub const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";
pub const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";

pub const MASTER_SECRET_LENGTH: usize = 32;
pub const SALT_LENGTH: usize = 32;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const KUBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/* Writes to singleton cluster objects give up after this many conflicts. */
pub const CONFLICT_RETRIES: usize = 5;

pub const DEFAULT_CHART_REPOSITORY: &str = "oci://ghcr.io/konstel/charts";

// IaC templates, one directory per provider
pub const TERRAFORM_TEMPLATES_ENV: &str = "KONSTEL_TERRAFORM_TEMPLATES";
pub const DEFAULT_TERRAFORM_TEMPLATES: &str = "/usr/share/konstel/terraform";

pub const WORKSPACE_ENV: &str = "KONSTEL_WORKSPACE";
