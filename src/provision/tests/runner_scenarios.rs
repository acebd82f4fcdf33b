//! End-to-end runs of the canonical pipeline against fake adapters.

mod common;

use common::*;
use provision::error::{exit_codes, AdapterError, AdapterErrorKind, ErrorCategory};
use provision::progress::EventKind;
use provision::reconciler::{ClusterSnapshot, Reconciler, ReconcilerSettings};
use provision::resolver::{FlagResolver, FlagValues};
use provision::telemetry::TelemetryMetric;
use provision::{
    collect_root_credentials, reset, CloudProvider, ProvisionError, StageId, StageRegistry,
    INSTALL_COMPLETE_MARKER,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn canonical_ids() -> Vec<String> {
    StageRegistry::for_providers(CloudProvider::K3s, provision::GitProvider::Github, &config())
        .unwrap()
        .ids()
        .iter()
        .map(|id| id.to_string())
        .collect()
}

fn checkpoint_ids(harness: &Harness) -> Vec<String> {
    harness.store().checks().keys().cloned().collect()
}

#[tokio::test]
async fn test_happy_path_then_reconciler_walks_every_step() {
    let harness = Harness::new();
    let (mut runner, events, mut rx) = harness.runner();
    let cancel = CancellationToken::new();

    let state = runner.run(&request(), &cancel).await.unwrap();
    assert_eq!(state.completed.len(), 20);

    let run_events = drain(&mut rx);
    assert_eq!(stages_with(&run_events, EventKind::StageCompleted), canonical_ids());
    assert_eq!(stages_with(&run_events, EventKind::StageStarting), canonical_ids());
    assert!(stages_with(&run_events, EventKind::StageFailed).is_empty());
    assert!(run_events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(runner.store().has_marker(INSTALL_COMPLETE_MARKER));

    let mut script: Vec<_> = (1..=14).map(|n| Ok(ClusterSnapshot::first_checks(n))).collect();
    script.push(Ok(ClusterSnapshot::provisioned()));
    let settings = ReconcilerSettings {
        interval: Duration::from_millis(1),
        unreachable_ticks: 3,
    };
    let reconciler = Reconciler::new(CLUSTER, ScriptedControlPlane::new(script), events, settings);
    reconciler.run(&cancel).await.unwrap();

    let watch_events = drain(&mut rx);
    let steps: Vec<_> = watch_events
        .iter()
        .filter(|e| e.kind == EventKind::StepAdvanced)
        .collect();
    assert_eq!(steps.len(), 14);
    assert_eq!(steps[0].step.as_deref(), Some("install-tools"));
    assert_eq!(steps[13].step.as_deref(), Some("users-terraform-apply"));
    assert_eq!(watch_events.last().unwrap().kind, EventKind::ProvisioningComplete);
    assert!(watch_events[0].seq > run_events.last().unwrap().seq);
}

#[tokio::test]
async fn test_resume_after_crash_skips_checkpointed_stages() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .world
        .interrupt_during("terraform.apply:k3s", cancel.clone());
    {
        let (mut runner, _events, mut rx) = harness.runner();
        let err = runner.run(&request(), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Cancelled { stage: Some(StageId::CLOUD_TERRAFORM_APPLY) }
        ));
        let events = drain(&mut rx);
        assert!(!stages_with(&events, EventKind::StageCompleted)
            .contains(&"cloud-terraform-apply".to_string()));
    }
    assert_eq!(checkpoint_ids(&harness).len(), 10);

    let (mut runner, _events, mut rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();
    let events = drain(&mut rx);
    assert!(events[..10].iter().all(|e| e.kind == EventKind::StageSkipped));
    assert!(events[10].is_stage(EventKind::StageStarting, StageId::CLOUD_TERRAFORM_APPLY));
    assert_eq!(checkpoint_ids(&harness).len(), 20);
}

#[tokio::test]
async fn test_interrupted_and_uninterrupted_runs_agree() {
    let straight = Harness::new();
    let (mut runner, _events, _rx) = straight.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();

    let resumed = Harness::new();
    for call in ["git.verify_token", "template.prepare", "kube.apply:registry"] {
        let cancel = CancellationToken::new();
        resumed.world.interrupt_during(call, cancel.clone());
        let (mut runner, _events, _rx) = resumed.runner();
        assert!(runner.run(&request(), &cancel).await.is_err());
    }
    let (mut runner, _events, _rx) = resumed.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();

    assert_eq!(checkpoint_ids(&straight), checkpoint_ids(&resumed));
}

#[tokio::test]
async fn test_existing_repository_is_a_precondition_failure() {
    let harness = Harness::new();
    harness.world.existing_repository("gitops");
    let (mut runner, _events, mut rx) = harness.runner();

    let err = runner.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Precondition);
    assert_eq!(err.exit_code(), exit_codes::PROVISIONING);
    assert_eq!(err.stage(), Some(StageId::GIT_CREDENTIALS));

    let events = drain(&mut rx);
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::StageFailed)
        .unwrap();
    assert_eq!(failed.stage.as_deref(), Some("git-credentials"));
    let message = failed.error.as_deref().unwrap();
    assert!(message.starts_with("precondition: "));
    assert!(message.contains("acme/gitops"));
    assert!(!message.contains("acme/metaphor"));

    assert_eq!(
        checkpoint_ids(&harness),
        vec!["cloud-credentials", "domain-liveness", "state-store-create", "validate-flags"]
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried_once() {
    let harness = Harness::new();
    harness
        .world
        .fail("terraform.apply:k3s", AdapterError::transient("429 rate limited"));
    let (mut runner, _events, mut rx) = harness.runner();

    let started = std::time::Instant::now();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();
    assert!(started.elapsed() < harness.config.stage_timeout());

    assert_eq!(harness.world.count("terraform.apply:k3s"), 2);
    let events = drain(&mut rx);
    let completed = stages_with(&events, EventKind::StageCompleted);
    assert_eq!(
        completed.iter().filter(|s| *s == "cloud-terraform-apply").count(),
        1
    );
    assert!(stages_with(&events, EventKind::StageFailed).is_empty());
}

#[tokio::test]
async fn test_retries_exhausted_maps_to_transient_exit() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness
            .world
            .fail("cloud.create_state_store", AdapterError::transient("503"));
    }
    let (mut runner, _events, _rx) = harness.runner();

    let err = runner.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(err.exit_code(), exit_codes::TRANSIENT_EXHAUSTED);
    assert_eq!(harness.world.count("cloud.create_state_store"), 3);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let harness = Harness::new();
    harness.world.fail(
        "terraform.apply:github",
        AdapterError::command_failed("terraform apply", "Error: 403 Forbidden"),
    );
    let (mut runner, _events, _rx) = harness.runner();

    let err = runner.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage(), Some(StageId::GIT_TERRAFORM_APPLY));
    assert_eq!(harness.world.count("terraform.apply:github"), 1);
    assert!(!harness.store().is_checkpointed(StageId::GIT_TERRAFORM_APPLY));
}

#[tokio::test]
async fn test_reconciler_error_fails_provisioning() {
    let harness = Harness::new();
    let (mut runner, events, mut rx) = harness.runner();
    let cancel = CancellationToken::new();
    runner.run(&request(), &cancel).await.unwrap();
    drain(&mut rx);

    let control_plane =
        ScriptedControlPlane::new(vec![Ok(ClusterSnapshot::error("vault init timed out"))]);
    let settings = ReconcilerSettings::from_config(&harness.config);
    let err = Reconciler::new(CLUSTER, control_plane, events, settings)
        .run(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::ProvisioningFailed(ref c) if c == "vault init timed out"));
    assert_eq!(err.exit_code(), exit_codes::PROVISIONING);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ProvisioningFailed);
    assert_eq!(events[0].error.as_deref(), Some("vault init timed out"));
}

#[tokio::test]
async fn test_cancel_during_vault_wait_then_resume() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .world
        .interrupt_during("kube.wait_ready:vault/statefulset/vault", cancel.clone());
    let (mut runner, _events, mut rx) = harness.runner();

    let err = runner.run(&request(), &cancel).await.unwrap_err();
    assert_eq!(err.exit_code(), exit_codes::CANCELLED);
    let events = drain(&mut rx);
    let last = events.last().unwrap();
    assert!(last.is_stage(EventKind::Cancelled, StageId::VAULT_READY));
    assert!(!stages_with(&events, EventKind::StageCompleted).contains(&"vault-ready".to_string()));
    drop(runner);

    let store = harness.store();
    assert!(!store.is_checkpointed(StageId::VAULT_READY));
    assert!(store.is_checkpointed(StageId::ARGOCD_CREATE_REGISTRY));

    let (mut runner, _events, mut rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();
    let events = drain(&mut rx);
    let first_started = events
        .iter()
        .find(|e| e.kind == EventKind::StageStarting)
        .unwrap();
    assert_eq!(first_started.stage.as_deref(), Some("vault-ready"));
}

#[tokio::test]
async fn test_validation_error_starts_no_stage() {
    let harness = Harness::new();
    let (_runner, _events, mut rx) = harness.runner();

    let env = env();
    let result = FlagResolver::new(CloudProvider::K3s, &env).resolve(&FlagValues::default());
    let err = ProvisionError::from(result.unwrap_err());
    assert_eq!(err.exit_code(), exit_codes::VALIDATION);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_completed_install_refuses_until_reset() {
    let harness = Harness::new();
    let (mut runner, _events, _rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();
    let first = checkpoint_ids(&harness);

    let (mut again, _events, mut rx) = harness.runner();
    let err = again.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::AlreadyComplete(_)));
    assert_eq!(err.exit_code(), exit_codes::PROVISIONING);
    assert!(drain(&mut rx).is_empty());

    let mut store = harness.store();
    reset(&mut store, &harness.workdir()).unwrap();
    assert!(!harness.workdir().state_file().exists());
    assert!(!harness.workdir().gitops_dir().exists());
    let calls_before = harness.world.calls().len();

    let (mut fresh, _events, _rx) = harness.runner();
    fresh.run(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(checkpoint_ids(&harness), first);
    // reset never touches remote resources
    assert!(harness.world.calls()[calls_before..]
        .iter()
        .all(|c| !c.contains("destroy") && !c.contains("delete")));
}

#[tokio::test]
async fn test_lock_held_by_live_process_blocks_run() {
    let harness = Harness::new();
    let _held = harness.workdir().lock().unwrap();
    let (mut runner, _events, _rx) = harness.runner();

    let err = runner.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Locked(_)));
    assert!(harness.world.calls().is_empty());
}

#[tokio::test]
async fn test_destroy_reverts_in_reverse_order() {
    let harness = Harness::new();
    let (mut runner, _events, _rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();
    let before = harness.world.calls().len();

    let (mut runner, _events, mut rx) = harness.runner();
    runner.destroy(&request(), &CancellationToken::new()).await.unwrap();

    let reverts: Vec<String> = harness.world.calls()[before..]
        .iter()
        .filter(|c| c.contains("destroy") || c.contains("delete"))
        .cloned()
        .collect();
    assert_eq!(
        reverts,
        vec![
            "terraform.destroy:users",
            "terraform.destroy:vault",
            "terraform.destroy:k3s",
            "terraform.destroy:github",
            "git.delete_ssh_key:kbot-ssh-key",
            "cloud.delete_state_store:k1-state-store-kfirst",
        ]
    );
    let events = drain(&mut rx);
    assert_eq!(stages_with(&events, EventKind::StageCompleted).len(), 6);
    assert_eq!(stages_with(&events, EventKind::StageSkipped).len(), 14);
    assert!(!harness.workdir().state_file().exists());

    for module in ["users", "vault", "k3s", "github"] {
        let applied = harness.world.terraform_vars("apply", module).unwrap();
        let destroyed = harness.world.terraform_vars("destroy", module).unwrap();
        assert_eq!(applied, destroyed, "{} destroy env differs from apply", module);
    }
    let users = harness.world.terraform_vars("destroy", "users").unwrap();
    assert!(users.contains(&"TF_VAR_admin_team".to_string()));
    assert!(users.contains(&"TF_VAR_developer_team".to_string()));

    let metrics: Vec<_> = harness.world.telemetry().iter().map(|e| e.metric).collect();
    assert_eq!(metrics.last(), Some(&TelemetryMetric::DestroyCompleted));
}

#[tokio::test]
async fn test_failed_destroy_resumes_where_it_stopped() {
    let harness = Harness::new();
    let (mut runner, _events, _rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();

    harness.world.fail(
        "terraform.destroy:k3s",
        AdapterError::command_failed("terraform destroy", "Error: dependency violation"),
    );
    let (mut runner, _events, _rx) = harness.runner();
    let err = runner
        .destroy(&request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(StageId::CLOUD_TERRAFORM_APPLY));
    assert_eq!(harness.world.count("git.delete_ssh_key:kbot-ssh-key"), 0);

    let store = harness.store();
    assert_eq!(store.checks().len(), 18);
    assert!(!store.is_checkpointed(StageId::USERS_TERRAFORM_APPLY));
    assert!(!store.is_checkpointed(StageId::VAULT_TERRAFORM_APPLY));
    assert!(store.is_checkpointed(StageId::CLOUD_TERRAFORM_APPLY));
    drop(store);

    let (mut runner, _events, mut rx) = harness.runner();
    runner.destroy(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(harness.world.count("terraform.destroy:users"), 1);
    assert_eq!(harness.world.count("terraform.destroy:vault"), 1);
    assert_eq!(harness.world.count("terraform.destroy:k3s"), 2);
    assert_eq!(harness.world.count("git.delete_ssh_key:kbot-ssh-key"), 1);
    let events = drain(&mut rx);
    assert_eq!(
        stages_with(&events, EventKind::StageCompleted),
        vec![
            "cloud-terraform-apply",
            "git-terraform-apply",
            "kbot-setup",
            "state-store-create"
        ]
    );
    assert!(!harness.workdir().state_file().exists());
}

#[tokio::test]
async fn test_unrecorded_checkpoint_fails_the_stage_and_reruns_it() {
    let harness = Harness::new();
    let tmp = harness.workdir().state_file().with_extension("toml.tmp");
    harness
        .world
        .block_path_during("cloud.create_state_store", tmp.clone());
    let (mut runner, _events, mut rx) = harness.runner();

    let err = runner.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Checkpoint(_)));
    assert_eq!(err.category(), ErrorCategory::Internal);
    assert_eq!(err.exit_code(), exit_codes::INTERNAL);

    let events = drain(&mut rx);
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::StageFailed)
        .unwrap();
    assert_eq!(failed.stage.as_deref(), Some("state-store-create"));
    assert!(failed.error.as_deref().unwrap().starts_with("internal: "));
    assert!(!stages_with(&events, EventKind::StageCompleted)
        .contains(&"state-store-create".to_string()));
    drop(runner);

    let store = harness.store();
    assert!(store.is_checkpointed(StageId::DOMAIN_LIVENESS));
    assert!(!store.is_checkpointed(StageId::STATE_STORE_CREATE));
    drop(store);

    std::fs::remove_dir(&tmp).unwrap();
    let (mut runner, _events, mut rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();
    let events = drain(&mut rx);
    let first_started = events
        .iter()
        .find(|e| e.kind == EventKind::StageStarting)
        .unwrap();
    assert_eq!(first_started.stage.as_deref(), Some("state-store-create"));
    assert_eq!(harness.world.count("cloud.create_state_store"), 2);
}

#[tokio::test]
async fn test_resume_with_changed_domain_is_rejected() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    harness
        .world
        .interrupt_during("terraform.apply:k3s", cancel.clone());
    let (mut runner, _events, _rx) = harness.runner();
    assert!(runner.run(&request(), &cancel).await.is_err());
    drop(runner);
    let calls_before = harness.world.calls().len();

    let mut moved = request();
    moved.domain_name = "other.com".into();
    let (mut runner, _events, mut rx) = harness.runner();
    let err = runner.run(&moved, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.exit_code(), exit_codes::VALIDATION);
    match &err {
        ProvisionError::Validation(v) => {
            assert!(v.mentions("domain-name"));
            assert_eq!(v.issues.len(), 1);
            assert!(v.issues[0].problem.contains("'example.com'"));
            assert!(v.issues[0].problem.contains("reset"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(drain(&mut rx).is_empty());
    assert_eq!(harness.world.calls().len(), calls_before);
    assert_eq!(harness.store().flags(), Some(&request()));

    // fields that do not name resources may change between attempts
    let mut quieter = request();
    quieter.use_telemetry = false;
    let (mut runner, _events, _rx) = harness.runner();
    runner.run(&quieter, &CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_root_credentials_after_install() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    let kubeconfig = harness.workdir().kubeconfig();

    let err = collect_root_credentials(&harness.store(), harness.world.as_ref(), &kubeconfig, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::NotInstalled(_)));

    let (mut runner, _events, _rx) = harness.runner();
    runner.run(&request(), &cancel).await.unwrap();

    let creds = collect_root_credentials(&harness.store(), harness.world.as_ref(), &kubeconfig, &cancel)
        .await
        .unwrap();
    assert_eq!(creds.vault_root_token.value.as_ref().unwrap().expose(), "hvs.root");
    assert_eq!(
        creds.argocd_admin_password.value.as_ref().unwrap().expose(),
        "argo-pass"
    );
    assert_eq!(creds.vault_root_token.location(), "vault/vault-unseal-secret:root-token");
}

#[tokio::test]
async fn test_vault_unseal_is_idempotent() {
    let harness = Harness::new();
    harness
        .world
        .put_secret("vault", "vault-unseal-secret", "root-token", "hvs.existing");
    let (mut runner, _events, _rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();

    assert!(harness
        .world
        .calls()
        .iter()
        .all(|c| !c.starts_with("vault.initialize")));
    assert_eq!(
        harness.world.secret("vault", "vault-unseal-secret", "root-token").as_deref(),
        Some("hvs.existing")
    );
}

#[tokio::test]
async fn test_initialized_vault_without_stored_keys_needs_repair() {
    let harness = Harness::new();
    harness.world.vault_initialized_elsewhere();
    let (mut runner, _events, _rx) = harness.runner();

    let err = runner.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage(), Some(StageId::VAULT_UNSEAL));
    assert_eq!(err.category(), ErrorCategory::Permanent);
    assert_eq!(err.exit_code(), exit_codes::PROVISIONING);
    match &err {
        ProvisionError::Stage { source, .. } => {
            assert_eq!(source.kind, AdapterErrorKind::InconsistentState)
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("Delete the vault namespace"));
    assert_eq!(
        harness
            .world
            .calls()
            .iter()
            .filter(|c| c.starts_with("vault.initialize"))
            .count(),
        1
    );

    let store = harness.store();
    assert!(store.is_checkpointed(StageId::VAULT_READY));
    assert!(!store.is_checkpointed(StageId::VAULT_UNSEAL));
}

#[tokio::test]
async fn test_checkpoint_metadata_and_telemetry() {
    let harness = Harness::new();
    let (mut runner, _events, _rx) = harness.runner();
    runner.run(&request(), &CancellationToken::new()).await.unwrap();

    let store = harness.store();
    let kbot = store.checkpoint(StageId::KBOT_SETUP).unwrap();
    assert!(kbot.metadata["kbot-public-key"].starts_with("ssh-ed25519 "));
    assert_eq!(kbot.metadata["atlantis-webhook-secret"].len(), 40);
    let bucket = store.checkpoint(StageId::STATE_STORE_CREATE).unwrap();
    assert_eq!(bucket.metadata["bucket"], "k1-state-store-kfirst");
    assert_eq!(bucket.metadata["cluster-id"].len(), 6);
    assert_eq!(store.flags(), Some(&request()));

    let gitops = std::fs::read_to_string(harness.workdir().gitops_dir().join("cluster.txt")).unwrap();
    assert_eq!(gitops, "kfirst");

    let telemetry = harness.world.telemetry();
    let metrics: Vec<_> = telemetry.iter().map(|e| e.metric).collect();
    assert_eq!(
        metrics,
        vec![TelemetryMetric::InstallStarted, TelemetryMetric::InstallCompleted]
    );
    assert!(telemetry.iter().all(|e| e.team.as_deref() == Some("platform")));
}

#[tokio::test]
async fn test_telemetry_disabled_by_request() {
    let harness = Harness::new();
    let mut request = request();
    request.use_telemetry = false;
    harness.world.existing_repository("metaphor");
    let (mut runner, _events, _rx) = harness.runner();

    assert!(runner.run(&request, &CancellationToken::new()).await.is_err());
    assert!(harness.world.telemetry().is_empty());
}

#[tokio::test]
async fn test_catalog_apps_need_their_settings() {
    let harness = Harness::new();
    harness.world.catalog_app("datadog", &["DD_API_KEY"]);
    let mut request = request();
    request.catalog_apps = vec!["datadog".into()];
    let (mut runner, _events, mut rx) = harness.runner();

    let err = runner.run(&request, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.exit_code(), exit_codes::VALIDATION);
    match &err {
        ProvisionError::Validation(v) => assert!(v.mentions("DD_API_KEY")),
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("required by catalog app 'datadog'"));
    assert!(stages_with(&drain(&mut rx), EventKind::StageStarting).is_empty());
    assert!(checkpoint_ids(&harness).is_empty());
    assert!(!harness.workdir().state_file().exists());

    let mut unknown = request.clone();
    unknown.catalog_apps = vec!["nonexistent".into()];
    let (mut runner, _events, mut rx) = harness.runner();
    let err = runner.run(&unknown, &CancellationToken::new()).await.unwrap_err();
    match &err {
        ProvisionError::Validation(v) => {
            assert!(v.mentions("install-catalog-apps"));
            assert!(!v.mentions("DD_API_KEY"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_missing_credentials_fail_before_any_stage() {
    let harness = Harness::new();
    let mut caps = harness.world.capabilities();
    let mut env = env();
    env.remove("CF_API_TOKEN");
    caps.env = std::sync::Arc::new(env);
    let (events, mut rx) = provision::progress::EventEmitter::channel(16);
    let registry = StageRegistry::for_providers(
        CloudProvider::K3s,
        provision::GitProvider::Github,
        &harness.config,
    )
    .unwrap();
    let mut runner = provision::Runner::new(
        registry,
        caps,
        harness.store(),
        harness.workdir(),
        harness.config.clone(),
        events,
    );

    let err = runner.run(&request(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.exit_code(), exit_codes::VALIDATION);
    match &err {
        ProvisionError::Validation(v) => assert!(v.mentions("CF_API_TOKEN")),
        other => panic!("unexpected error: {}", other),
    }
    assert!(drain(&mut rx).is_empty());
    assert!(harness.world.calls().is_empty());
}
