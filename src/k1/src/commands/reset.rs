use super::Context;
use crate::cli::ClusterArgs;
use provision::request::CloudProvider;
use provision::ProvisionError;

/// Forget checkpoints and local working copies. Cloud resources stay.
pub fn run(ctx: &Context, cloud: CloudProvider, args: &ClusterArgs) -> Result<(), ProvisionError> {
    let workdir = ctx.workdir(&args.cluster_name);
    let mut store = ctx.open_store(&workdir, &args.cluster_name)?;
    if let Some(previous) = store.flags() {
        if previous.cloud_provider != cloud {
            tracing::warn!(
                "[Reset] {} was created on {}, resetting anyway",
                args.cluster_name,
                previous.cloud_provider
            );
        }
    }
    provision::reset(&mut store, &workdir)?;
    println!("Local state of {} removed. Remote resources were not touched.", args.cluster_name);
    Ok(())
}
