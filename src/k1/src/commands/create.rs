use super::{Context, Reporter};
use crate::adapters::{self, control_plane::HttpControlPlane};
use crate::cli::CreateArgs;
use provision::request::CloudProvider;
use provision::resolver::{flag_env_name, FlagResolver, DEFAULT_CLUSTER_NAME};
use provision::{
    EventEmitter, InstallRequest, ProvisionError, Reconciler, ReconcilerSettings, Runner, StageRegistry,
};
use std::sync::Arc;

/// Provision (or resume provisioning) a cluster, then follow the control
/// plane until it reports the cluster provisioned.
pub async fn run(ctx: &Context, cloud: CloudProvider, args: &CreateArgs) -> Result<(), ProvisionError> {
    let flags = args.flag_values();
    let cluster_name = flags
        .cluster_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| ctx.env.var(&flag_env_name("cluster-name")))
        .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string());
    let workdir = ctx.workdir(&cluster_name);
    let store = ctx.open_store(&workdir, &cluster_name)?;

    let request = FlagResolver::new(cloud, ctx.env.as_ref())
        .with_previous(store.flags())
        .with_version(env!("CARGO_PKG_VERSION"))
        .resolve(&flags)?;
    tracing::info!(
        "[Create] {} on {} with {} ({} stages checkpointed)",
        request.cluster_name,
        request.cloud_provider,
        request.git_provider,
        store.checks().len()
    );

    let caps = adapters::build_capabilities(&request, &workdir, ctx.env.clone())?;
    let registry = StageRegistry::for_providers(request.cloud_provider, request.git_provider, &ctx.config)?;
    let (events, receiver) = EventEmitter::channel(ctx.config.event_capacity);
    let reporter = Reporter::choose(&ctx.config, args.ci).spawn(receiver);

    let mut runner = Runner::new(registry, caps, store, workdir, ctx.config.clone(), events.clone());
    let result = provision_and_watch(ctx, &mut runner, &request, events).await;
    drop(runner);
    if let Err(e) = reporter.await {
        tracing::warn!("[Create] Progress reporter stopped: {}", e);
    }
    result?;

    print_summary(&request);
    Ok(())
}

async fn provision_and_watch(
    ctx: &Context,
    runner: &mut Runner,
    request: &InstallRequest,
    events: EventEmitter,
) -> Result<(), ProvisionError> {
    runner.run(request, &ctx.cancel).await?;
    let control_plane = Arc::new(HttpControlPlane::new(&ctx.config.control_plane_url)?);
    Reconciler::new(
        request.cluster_name.clone(),
        control_plane,
        events,
        ReconcilerSettings::from_config(&ctx.config),
    )
    .run(&ctx.cancel)
    .await
}

fn print_summary(request: &InstallRequest) {
    println!();
    println!("Cluster {} is ready.", request.cluster_name);
    println!("  Argo CD:   https://{}", request.service_host("argocd"));
    println!("  Vault:     https://{}", request.service_host("vault"));
    println!("  Console:   https://{}", request.service_host("kubefirst"));
    println!("  Gitops:    {}", request.gitops_repo_url());
    println!();
    println!(
        "Run `k1 {} root-credentials --cluster-name {}` for the admin credentials.",
        request.cloud_provider, request.cluster_name
    );
}
