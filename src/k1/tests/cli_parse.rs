use clap::Parser;
use k1::cli::{Action, Cli};
use provision::request::CloudProvider;

fn parse(args: &[&str]) -> (CloudProvider, Action) {
    let mut argv = vec!["k1"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap().provider.into_parts()
}

#[test]
fn test_create_flags_reach_flag_values() {
    let (cloud, action) = parse(&[
        "k3s",
        "create",
        "--cluster-name",
        "kfirst",
        "--domain-name",
        "example.com",
        "--github-org",
        "acme",
        "--servers-private-ips",
        "10.0.0.10,10.0.0.11",
        "--servers-public-ips",
        "203.0.113.10",
        "--ssh-privatekey",
        "/home/ops/.ssh/id_ed25519",
        "--use-telemetry",
        "false",
        "--ci",
    ]);
    assert_eq!(cloud, CloudProvider::K3s);
    let Action::Create(args) = action else {
        panic!("expected create");
    };
    assert!(args.ci);
    let flags = args.flag_values();
    assert_eq!(flags.cluster_name.as_deref(), Some("kfirst"));
    assert_eq!(flags.domain_name.as_deref(), Some("example.com"));
    assert_eq!(flags.github_org.as_deref(), Some("acme"));
    assert_eq!(flags.servers_private_ips, vec!["10.0.0.10,10.0.0.11".to_string()]);
    assert_eq!(flags.use_telemetry, Some(false));
    assert_eq!(flags.gitlab_group, None);
}

#[test]
fn test_google_is_an_alias_of_gcp() {
    let (cloud, _) = parse(&["google", "reset", "--cluster-name", "kfirst"]);
    assert_eq!(cloud, CloudProvider::Gcp);
    let (cloud, _) = parse(&["gcp", "reset"]);
    assert_eq!(cloud, CloudProvider::Gcp);
}

#[test]
fn test_every_provider_has_the_lifecycle_commands() {
    let providers = [
        ("aws", CloudProvider::Aws),
        ("azure", CloudProvider::Azure),
        ("gcp", CloudProvider::Gcp),
        ("digitalocean", CloudProvider::DigitalOcean),
        ("vultr", CloudProvider::Vultr),
        ("akamai", CloudProvider::Akamai),
        ("k3s", CloudProvider::K3s),
    ];
    for (name, expected) in providers {
        for command in ["create", "destroy", "root-credentials", "reset"] {
            let (cloud, _) = parse(&[name, command]);
            assert_eq!(cloud, expected, "{} {}", name, command);
        }
    }
}

#[test]
fn test_destroy_defaults_cluster_name() {
    let (_, action) = parse(&["aws", "destroy"]);
    let Action::Destroy(args) = action else {
        panic!("expected destroy");
    };
    assert_eq!(args.cluster_name, "kubefirst");
    assert!(!args.ci);
}

#[test]
fn test_root_credentials_copies_one_secret() {
    let (_, action) = parse(&["vultr", "root-credentials", "--vault"]);
    let Action::RootCredentials(args) = action else {
        panic!("expected root-credentials");
    };
    assert!(args.vault);
    assert!(!args.argocd);

    let both = Cli::try_parse_from(["k1", "vultr", "root-credentials", "--vault", "--argocd"]);
    assert!(both.is_err());
}

#[test]
fn test_unknown_provider_is_rejected() {
    assert!(Cli::try_parse_from(["k1", "openstack", "create"]).is_err());
}
