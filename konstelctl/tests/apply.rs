mod common;

use common::*;
use konstel_api::nodeversion::CONDITION_OUTDATED;
use konstel_api::{ConditionStatus, InitResponse, Measurement, NodeVersionCondition};
use konstelctl::apply::ApplyFlags;
use konstelctl::errors::Error;
use konstelctl::helm;
use konstelctl::infra::InfraDiff;
use konstelctl::init::{InitError, MasterSecret};
use konstelctl::state;

/* An initialized cluster that already matches the configuration. */
fn converged() -> FakeFactory {
    let kube = FakeKube::default();
    *kube.join_config.lock().unwrap() = Some(config().attestation);
    *kube.sans.lock().unwrap() = vec!["192.0.2.10".to_string()];
    *kube.node_version.lock().unwrap() = Some(current_node_version());

    FakeFactory{
	infra: FakeInfra::new(false, InfraDiff::NoChanges),
	dialer: ScriptedDialer::new(Vec::new()),
	kube: kube,
	charts: FakeCharts::current(),
    }
}

#[tokio::test]
async fn fresh_create() {
    let (_dir, ws) = fresh_workspace();
    let factory = FakeFactory{
	infra: FakeInfra::new(true, InfraDiff::Changes),
	dialer: ScriptedDialer::new(vec![
	    InitResponse::Log{ line: "kubeadm init".to_string() },
	    InitResponse::Success{
		owner_id: "O1".to_string(),
		cluster_id: "C1".to_string(),
		kubeconfig: kubeconfig("https://10.0.0.5:6443").into_bytes(),
	    },
	]),
	kube: FakeKube::default(),
	charts: FakeCharts::default(),
    };
    let prompter = ScriptedPrompter::new(&[]);

    let run = run(&ws, &factory, &prompter, yes()).await;
    run.result.unwrap();

    let state = state::load(&ws.state_path()).unwrap();
    assert_eq!(state.infrastructure.cluster_endpoint, "192.0.2.10");
    assert_eq!(state.cluster_values.owner_id, "O1");
    assert_eq!(state.cluster_values.cluster_id, "C1");
    assert_eq!(state.cluster_values.measurement_salt.len(), 64);
    assert!(ws.admin_conf_exists());
    assert!(ws.master_secret_path().exists());

    assert_eq!(*factory.infra.applied.lock().unwrap(), 1);
    assert_eq!(*factory.kube.join_config_writes.lock().unwrap(), 1);
    assert_eq!(factory.charts.applied(), vec![
	helm::CILIUM_RELEASE, helm::CERT_MANAGER_RELEASE, helm::OPERATORS_RELEASE, helm::SERVICES_RELEASE,
    ]);
    // a fresh cluster already runs the target versions
    assert_eq!(*factory.kube.node_version_writes.lock().unwrap(), 0);

    let out = run.out.contents();
    assert!(out.contains("Cloud infrastructure created successfully."));
    assert!(out.contains("C1"));
    assert!(out.contains("export KUBECONFIG="));
    assert!(!out.contains("no changes were necessary"));
    assert!(prompter.questions().is_empty());
}

#[tokio::test]
async fn converged_cluster_needs_no_changes() {
    let (_dir, ws) = initialized_workspace();
    let before = std::fs::read(ws.state_path()).unwrap();
    let factory = converged();
    let prompter = ScriptedPrompter::new(&[]);

    let run = run(&ws, &factory, &prompter, ApplyFlags::default()).await;
    run.result.unwrap();

    assert!(run.out.contents().contains("Apply finished: no changes were necessary."));
    assert_eq!(std::fs::read(ws.state_path()).unwrap(), before);
    assert_eq!(*factory.infra.applied.lock().unwrap(), 0);
    assert_eq!(*factory.kube.join_config_writes.lock().unwrap(), 0);
    assert_eq!(*factory.kube.node_version_writes.lock().unwrap(), 0);
    assert!(factory.charts.applied().is_empty());
    assert!(prompter.questions().is_empty());
}

#[tokio::test]
async fn running_node_upgrade_is_left_alone() {
    let (_dir, ws) = initialized_workspace();
    let mut factory = converged();
    factory.charts = FakeCharts::installed(&[
	(helm::CILIUM_RELEASE, "1.15.7"),
	(helm::CERT_MANAGER_RELEASE, "1.14.5"),
	(helm::OPERATORS_RELEASE, konstelctl::constants::CLI_VERSION),
	(helm::SERVICES_RELEASE, konstelctl::constants::CLI_VERSION),
    ]);
    {
	let mut nv = current_node_version();
	nv.spec.kubernetes_cluster_version = "v1.28.12".to_string();
	if let Some(status) = nv.status.as_mut() {
	    status.conditions.push(NodeVersionCondition::new(CONDITION_OUTDATED, ConditionStatus::TRUE));
	}
	*factory.kube.node_version.lock().unwrap() = Some(nv);
    }
    let prompter = ScriptedPrompter::new(&[]);

    let run = run(&ws, &factory, &prompter, yes()).await;
    run.result.unwrap();

    assert!(run.err.contents().contains("Skipping image and Kubernetes upgrades. Another upgrade is in progress."));
    assert_eq!(*factory.kube.node_version_writes.lock().unwrap(), 0);
    assert_eq!(factory.charts.applied(), vec![helm::CILIUM_RELEASE.to_string()]);
    assert!(run.out.contents().contains("Successfully upgraded konstel services."));
}

#[tokio::test]
async fn failed_bootstrap_is_terminal() {
    let (_dir, ws) = fresh_workspace();
    let factory = FakeFactory{
	infra: FakeInfra::new(true, InfraDiff::Changes),
	dialer: ScriptedDialer::new(vec![
	    InitResponse::Log{ line: "starting etcd".to_string() },
	    InitResponse::Log{ line: "waiting for etcd".to_string() },
	    InitResponse::Log{ line: "etcd: context deadline exceeded".to_string() },
	    InitResponse::Failure{ error: "etcd did not come up".to_string() },
	]),
	kube: FakeKube::default(),
	charts: FakeCharts::default(),
    };
    let prompter = ScriptedPrompter::new(&[]);

    let run = run(&ws, &factory, &prompter, yes()).await;
    let err = run.result.unwrap_err();
    assert!(matches!(err.root(), Error::Init(InitError::NonRetriable{ .. })));
    assert!(err.to_string().starts_with("init phase:"));

    let stderr = run.err.contents();
    assert!(stderr.contains("Cluster initialization failed. This error is not recoverable."));
    assert!(stderr.contains("Terminate your cluster and try again."));
    assert!(stderr.contains("Fetched bootstrapper logs are stored in"));
    assert_eq!(
	std::fs::read_to_string(ws.error_log_path()).unwrap(),
	"starting etcd\nwaiting for etcd\netcd: context deadline exceeded\n",
    );

    // infrastructure outputs survive, the cluster never got values
    let state = state::load(&ws.state_path()).unwrap();
    assert_eq!(state.infrastructure.uid, "uid1");
    assert!(state.cluster_values.is_empty());
    let secret = MasterSecret::load(&ws.master_secret_path()).unwrap().unwrap();
    assert_eq!(secret.key().unwrap().len(), 32);
    assert_eq!(secret.salt().unwrap().len(), 32);
    assert!(!ws.admin_conf_exists());
    assert!(factory.charts.applied().is_empty());
}

#[tokio::test]
async fn unusable_kubeconfig_leaves_state_possibly_inconsistent() {
    let (_dir, ws) = fresh_workspace();
    let factory = FakeFactory{
	infra: FakeInfra::new(true, InfraDiff::Changes),
	dialer: ScriptedDialer::new(vec![
	    InitResponse::Success{
		owner_id: "O1".to_string(),
		cluster_id: "C1".to_string(),
		kubeconfig: b"apiVersion: v1\nkind: Config\nclusters: []\n".to_vec(),
	    },
	]),
	kube: FakeKube::default(),
	charts: FakeCharts::default(),
    };
    let prompter = ScriptedPrompter::new(&[]);

    let run = run(&ws, &factory, &prompter, yes()).await;
    let err = run.result.unwrap_err();
    assert!(matches!(err.root(), Error::Init(InitError::CredentialsLost{ .. })));
    let msg = err.to_string();
    assert!(msg.starts_with("init phase:"));
    assert!(msg.contains("C1"));
    assert!(msg.contains("possibly inconsistent"));

    assert!(!ws.admin_conf_exists());
    assert!(factory.charts.applied().is_empty());
}

#[tokio::test]
async fn declined_cert_manager_upgrade() {
    let (_dir, ws) = initialized_workspace();
    let mut factory = converged();
    factory.charts = FakeCharts::installed(&[
	(helm::CILIUM_RELEASE, "1.15.7"),
	(helm::CERT_MANAGER_RELEASE, "1.13.0"),
	(helm::OPERATORS_RELEASE, konstelctl::constants::CLI_VERSION),
	(helm::SERVICES_RELEASE, konstelctl::constants::CLI_VERSION),
    ]);
    // --yes does not cover destroying custom resources
    let prompter = ScriptedPrompter::new(&[false]);

    let run = run(&ws, &factory, &prompter, yes()).await;
    run.result.unwrap();

    assert_eq!(prompter.questions(), vec!["Do you want to upgrade cert-manager anyway?".to_string()]);
    assert_eq!(factory.charts.applied(), vec![helm::CILIUM_RELEASE.to_string()]);
    assert_eq!(*factory.kube.crd_backups.lock().unwrap(), 1);

    let out = run.out.contents();
    assert!(out.contains("Skipping upgrade of cert-manager."));
    assert!(out.contains("Successfully upgraded konstel services."));
}

#[tokio::test]
async fn attestation_change_is_confirmed_and_applied() {
    let (_dir, ws) = initialized_workspace();
    let factory = converged();
    {
	let mut in_cluster = config().attestation;
	in_cluster.measurements.insert(4, Measurement::new(&"cd".repeat(48)));
	*factory.kube.join_config.lock().unwrap() = Some(in_cluster);
    }
    let prompter = ScriptedPrompter::new(&[true]);

    let run = run(&ws, &factory, &prompter, ApplyFlags::default()).await;
    run.result.unwrap();

    assert_eq!(prompter.questions(), vec!["Are you sure you want to change your cluster's attestation config?".to_string()]);
    assert_eq!(*factory.kube.join_config_writes.lock().unwrap(), 1);
    assert_eq!(factory.kube.join_config.lock().unwrap().clone(), Some(config().attestation));

    let out = run.out.contents();
    assert!(out.contains("The following changes will be applied to the attestation config:"));
    assert!(out.contains("--- current\n+++ new\n"));
    assert!(out.contains(&format!("-    expected: {}", "cd".repeat(48))));
    assert!(out.contains("Successfully updated the cluster's attestation config"));
    assert!(!out.contains("no changes were necessary"));
}

#[tokio::test]
async fn declined_infrastructure_change_restores_workspace() {
    let (_dir, ws) = initialized_workspace();
    let mut factory = converged();
    factory.infra = FakeInfra::new(false, InfraDiff::Changes);
    let prompter = ScriptedPrompter::new(&[false]);

    let run = run(&ws, &factory, &prompter, ApplyFlags::default()).await;
    assert!(matches!(run.result, Err(Error::Aborted)));

    assert_eq!(prompter.questions(), vec!["Do you want to apply these infrastructure changes?".to_string()]);
    assert_eq!(*factory.infra.restored.lock().unwrap(), 1);
    assert_eq!(*factory.infra.applied.lock().unwrap(), 0);
    assert!(run.out.contents().contains("Aborting upgrade."));
    // later phases never ran
    assert_eq!(*factory.kube.join_config_writes.lock().unwrap(), 0);
}

#[tokio::test]
async fn reapply_without_admin_conf_and_init_skipped() {
    let (_dir, ws) = initialized_workspace();
    std::fs::remove_file(ws.admin_conf_path()).unwrap();
    let factory = converged();
    let prompter = ScriptedPrompter::new(&[]);
    let mut flags = yes();
    flags.skip_phases.insert(konstelctl::apply::SkipPhase::Init);

    let run = run(&ws, &factory, &prompter, flags).await;
    match run.result {
	Err(Error::Precondition(msg)) => assert!(msg.contains("admin kubeconfig")),
	other => panic!("expected precondition failure, got {:?}", other),
    }
}

#[tokio::test]
async fn version_mismatch_aborts_before_side_effects() {
    let (_dir, ws) = fresh_workspace();
    let raw = config_yaml().replace(
	&format!("microserviceVersion: v{}", konstelctl::constants::CLI_VERSION),
	"microserviceVersion: v1.0.0",
    );
    std::fs::write(ws.config_path(), raw).unwrap();
    let factory = FakeFactory{
	infra: FakeInfra::new(true, InfraDiff::Changes),
	dialer: ScriptedDialer::new(Vec::new()),
	kube: FakeKube::default(),
	charts: FakeCharts::default(),
    };
    let prompter = ScriptedPrompter::new(&[]);

    let run = run(&ws, &factory, &prompter, yes()).await;
    let err = run.result.unwrap_err();
    assert!(err.to_string().starts_with("invalid configuration"));
    assert!(err.to_string().contains("microserviceVersion"));

    assert_eq!(*factory.infra.applied.lock().unwrap(), 0);
    assert!(!ws.state_path().exists());
    assert!(!ws.master_secret_path().exists());
    assert!(!ws.root().join(konstelctl::constants::UPGRADE_DIR).exists());
}

#[tokio::test]
async fn second_run_after_create_skips_init() {
    let (_dir, ws) = fresh_workspace();
    let factory = FakeFactory{
	infra: FakeInfra::new(true, InfraDiff::Changes),
	dialer: ScriptedDialer::new(vec![
	    InitResponse::Success{
		owner_id: "O1".to_string(),
		cluster_id: "C1".to_string(),
		kubeconfig: kubeconfig("https://10.0.0.5:6443").into_bytes(),
	    },
	]),
	kube: FakeKube::default(),
	charts: FakeCharts::default(),
    };
    *factory.kube.node_version.lock().unwrap() = Some(current_node_version());
    let prompter = ScriptedPrompter::new(&[]);
    run(&ws, &factory, &prompter, yes()).await.result.unwrap();

    // the dialer only serves one connection, a second init would fail
    let mut factory = factory;
    factory.infra = FakeInfra::new(false, InfraDiff::NoChanges);
    let run = run(&ws, &factory, &prompter, yes()).await;
    run.result.unwrap();
    assert!(run.out.contents().contains("Apply finished: no changes were necessary."));
}
