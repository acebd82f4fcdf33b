use super::{checkpointed_request, Context};
use crate::adapters::exec::Exec;
use crate::adapters::kube::KubectlCli;
use crate::cli::RootCredentialsArgs;
use provision::error::{AdapterError, AdapterErrorKind};
use provision::request::CloudProvider;
use provision::{collect_root_credentials, EnvSource, ProvisionError, RootCredential};
use tokio_util::sync::CancellationToken;

/// Clipboard program for this desktop: `pbcopy` on macOS, `wl-copy` under
/// Wayland, `xclip` elsewhere.
pub fn clipboard_command(os: &str, env: &dyn EnvSource) -> Vec<&'static str> {
    if os == "macos" {
        vec!["pbcopy"]
    } else if env.is_set("WAYLAND_DISPLAY") {
        vec!["wl-copy"]
    } else {
        vec!["xclip", "-selection", "clipboard"]
    }
}

async fn copy_to_clipboard(
    value: &str,
    env: &dyn EnvSource,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let command = clipboard_command(std::env::consts::OS, env);
    Exec::new(command[0])
        .args(command[1..].iter().copied())
        .stdin(value)
        .output(cancel)
        .await
        .map(drop)
}

fn print_credential(credential: &RootCredential) {
    match &credential.value {
        Some(value) => println!("{}: {}", credential.label, value.expose()),
        None => println!("{}: not found ({})", credential.label, credential.location()),
    }
}

pub async fn run(ctx: &Context, cloud: CloudProvider, args: &RootCredentialsArgs) -> Result<(), ProvisionError> {
    let workdir = ctx.workdir(&args.cluster_name);
    let store = ctx.open_store(&workdir, &args.cluster_name)?;
    checkpointed_request(&store, cloud)?;

    let kube = KubectlCli::new(workdir.tools_dir().join("kubectl"));
    let credentials = collect_root_credentials(&store, &kube, &workdir.kubeconfig(), &ctx.cancel).await?;
    for credential in credentials.all() {
        print_credential(credential);
    }

    let selected = if args.argocd {
        Some(&credentials.argocd_admin_password)
    } else if args.vault {
        Some(&credentials.vault_root_token)
    } else {
        None
    };
    if let Some(credential) = selected {
        let value = credential.value.as_ref().ok_or_else(|| {
            AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("{} is not available to copy", credential.label),
            )
        })?;
        copy_to_clipboard(value.expose(), ctx.env.as_ref(), &ctx.cancel).await?;
        println!("{} copied to the clipboard.", credential.label);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_clipboard_command_per_desktop() {
        let none = BTreeMap::<String, String>::new();
        assert_eq!(clipboard_command("macos", &none), vec!["pbcopy"]);
        assert_eq!(clipboard_command("linux", &none), vec!["xclip", "-selection", "clipboard"]);
        let wayland: BTreeMap<String, String> =
            [("WAYLAND_DISPLAY".to_string(), "wayland-0".to_string())].into_iter().collect();
        assert_eq!(clipboard_command("linux", &wayland), vec!["wl-copy"]);
    }
}
