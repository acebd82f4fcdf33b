use super::{checkpointed_request, Context, Reporter};
use crate::adapters;
use crate::cli::ClusterArgs;
use provision::request::CloudProvider;
use provision::{EventEmitter, ProvisionError, Runner, StageRegistry};

/// Undo what the checkpointed create provisioned, newest stage first.
pub async fn run(ctx: &Context, cloud: CloudProvider, args: &ClusterArgs) -> Result<(), ProvisionError> {
    let workdir = ctx.workdir(&args.cluster_name);
    let store = ctx.open_store(&workdir, &args.cluster_name)?;
    let request = checkpointed_request(&store, cloud)?;

    let caps = adapters::build_capabilities(&request, &workdir, ctx.env.clone())?;
    let registry = StageRegistry::for_providers(request.cloud_provider, request.git_provider, &ctx.config)?;
    let (events, receiver) = EventEmitter::channel(ctx.config.event_capacity);
    let reporter = Reporter::choose(&ctx.config, args.ci).spawn(receiver);

    let mut runner = Runner::new(registry, caps, store, workdir, ctx.config.clone(), events);
    let result = runner.destroy(&request, &ctx.cancel).await;
    drop(runner);
    if let Err(e) = reporter.await {
        tracing::warn!("[Destroy] Progress reporter stopped: {}", e);
    }
    result?;

    println!();
    println!("Cluster {} destroyed and local state removed.", request.cluster_name);
    Ok(())
}
