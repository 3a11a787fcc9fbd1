#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use std::env;
use std::process;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use skipper::component::ROLLOUT_TIMEOUT;
use skipper::run::Shell;
use skipper::{release, secrets, template, Config, Error, Result};

fn print_error_debug(e: &Error) {
    // unwind the error chain for the user
    for cause in e.iter().skip(1) {
        warn!("caused by: {}", cause);
    }
}

fn main() {
    let app = App::new("skipper")
        .version(crate_version!())
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .global_settings(&[AppSettings::ColoredHelp])
        .about("Componentized Kubernetes release tool")
        .arg(Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("Increase verbosity"))
        .arg(Arg::with_name("debug")
            .short("d")
            .long("debug")
            .help("Adds line numbers to log statements"))

        .subcommand(SubCommand::with_name("build-images")
            .about("Build component docker images")
            .arg(Arg::with_name("component")
                .long("component")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Components to build, defaults to project.yaml components"))
            .arg(Arg::with_name("docker-arg")
                .long("docker-arg")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Extra build args, --docker-arg <K>=<V>"))
            .arg(Arg::with_name("dry-run")
                .long("dry-run")
                .help("Only log what would be done")))

        .subcommand(SubCommand::with_name("release")
            .about("Release components to an environment")
            .arg(Arg::with_name("env")
                .long("env")
                .takes_value(true)
                .required(true)
                .help("Environment to release"))
            .arg(Arg::with_name("component")
                .long("component")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Components to release, defaults to the environment settings"))
            .arg(Arg::with_name("image")
                .long("image")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Override component docker image, --image <component>=<image>"))
            .arg(Arg::with_name("tag")
                .long("tag")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Override component docker tag, --tag <component>=<tag>"))
            .arg(Arg::with_name("replicas")
                .long("replicas")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Override replicas in Kubernetes configs, --replicas <component>=<num>"))
            .arg(Arg::with_name("docker-arg")
                .long("docker-arg")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Extra build args for --build, --docker-arg <K>=<V>"))
            .arg(Arg::with_name("build")
                .long("build")
                .help("Also build the components first"))
            .arg(Arg::with_name("dry-run")
                .long("dry-run")
                .help("Do not perform any changes, just generate configs and log"))
            .arg(Arg::with_name("keep-configs")
                .long("keep-configs")
                .help("Do not delete generated configs after release"))
            .arg(Arg::with_name("no-rollout-wait")
                .long("no-rollout-wait")
                .help("Do not pause to wait for rollout completion"))
            .arg(Arg::with_name("rollout-timeout")
                .long("rollout-timeout")
                .takes_value(true)
                .help("Seconds to wait per resource for rollout completion (default 300)")))

        .subcommand(SubCommand::with_name("validate-release-configs")
            .about("Validate the kube configs of every environment"))

        .subcommand(SubCommand::with_name("init-kubernetes")
            .about("Initialize a Kubernetes cluster for an environment")
            .arg(Arg::with_name("env")
                .long("env")
                .takes_value(true)
                .required(true)
                .help("Environment to initialize")))

        .subcommand(SubCommand::with_name("init")
            .about("Initialize a local development environment"))

        .subcommand(SubCommand::with_name("kubeval")
            .about("Check that all Kubernetes configs look valid"))

        .subcommand(SubCommand::with_name("update-from-templates")
            .about("Regenerate env merge and override files from templates"))

        .subcommand(SubCommand::with_name("get-master-key")
            .about("Fetch and cache the Sealed Secrets master key of an environment")
            .arg(Arg::with_name("env")
                .long("env")
                .takes_value(true)
                .required(true)
                .help("Environment to fetch the key for"))
            .arg(Arg::with_name("force")
                .long("force")
                .help("Refetch even if a cached key exists")))

        .subcommand(SubCommand::with_name("seal-secrets")
            .about("Seal every *.unsealed.yaml secret of an environment")
            .arg(Arg::with_name("env")
                .long("env")
                .takes_value(true)
                .required(true)
                .help("Environment whose secrets to seal"))
            .arg(Arg::with_name("only-changed")
                .long("only-changed")
                .help("Keep previous ciphertext for unchanged values")))

        .subcommand(SubCommand::with_name("unseal-secrets")
            .about("Unseal an environment's secrets for editing")
            .arg(Arg::with_name("env")
                .long("env")
                .takes_value(true)
                .required(true)
                .help("Environment whose secrets to unseal")))

        .subcommand(SubCommand::with_name("cleanup-acr-registry")
            .about("Delete old image tags from an Azure Container Registry")
            .arg(Arg::with_name("registry")
                .required(true)
                .help("Name of the ACR, i.e. <name>.azurecr.io")));

    let args = app.get_matches();
    let name = args.subcommand_name().unwrap();
    let _ = run(&args).map_err(|e| {
        error!("{} error: {}", name, e);
        print_error_debug(&e);
        process::exit(1);
    });
    process::exit(0);
}

fn run(args: &ArgMatches) -> Result<()> {
    // always show INFO messages (+1); LOG_FORMAT=long adds module paths
    let long_format = env::var("LOG_FORMAT").map(|f| f == "long").unwrap_or(false);
    loggerv::Logger::new()
        .verbosity(args.occurrences_of("verbose") + 1)
        .module_path(long_format)
        .line_numbers(args.is_present("debug"))
        .init()
        .unwrap();
    skipper::init()?;

    // Ignore SIGPIPE errors to avoid having to use let _ = write! everywhere
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    dispatch_commands(args)
}

fn values(args: &ArgMatches, name: &str) -> Vec<String> {
    args.values_of(name)
        .map(|vs| vs.map(String::from).collect())
        .unwrap_or_default()
}

/// Dispatch clap arguments to the library handlers
fn dispatch_commands(args: &ArgMatches) -> Result<()> {
    let runner = Shell;

    if let Some(a) = args.subcommand_matches("build-images") {
        let mut components = values(a, "component");
        if components.is_empty() {
            components = Config::read()?.components;
        }
        return release::build_images(
            &runner,
            &components,
            a.is_present("dry-run"),
            &values(a, "docker-arg"),
        );
    }
    if let Some(a) = args.subcommand_matches("release") {
        let env = a.value_of("env").unwrap().to_string();
        let components = values(a, "component");
        let dry_run = a.is_present("dry-run");
        if a.is_present("build") {
            let buildable = if components.is_empty() {
                Config::read()?.components
            } else {
                components.clone()
            };
            release::build_images(&runner, &buildable, dry_run, &values(a, "docker-arg"))?;
        }
        let rollout_timeout = a
            .value_of("rollout-timeout")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(ROLLOUT_TIMEOUT);
        return release::release(&runner, release::ReleaseRequest {
            env,
            components,
            images: release::parse_overrides(&values(a, "image"))?,
            tags: release::parse_overrides(&values(a, "tag"))?,
            replicas: release::parse_replica_overrides(&values(a, "replicas"))?,
            dry_run,
            keep_configs: a.is_present("keep-configs"),
            no_rollout_wait: a.is_present("no-rollout-wait"),
            rollout_timeout,
        });
    }
    if args.subcommand_matches("validate-release-configs").is_some() {
        return release::validate_release_configs(&runner);
    }
    if let Some(a) = args.subcommand_matches("init-kubernetes") {
        return release::init_kubernetes(&runner, a.value_of("env").unwrap());
    }
    if args.subcommand_matches("init").is_some() {
        return release::init(&runner);
    }
    if args.subcommand_matches("kubeval").is_some() {
        return release::kubeval(&runner);
    }
    if args.subcommand_matches("update-from-templates").is_some() {
        let generated = template::update_from_templates()?;
        info!("Generated {} files from templates", generated.len());
        return Ok(());
    }
    if let Some(a) = args.subcommand_matches("get-master-key") {
        let env = a.value_of("env").unwrap();
        let key = secrets::get_master_key(&runner, env, !a.is_present("force"))?;
        info!("Master key for {} is in {}", env, key.display());
        return Ok(());
    }
    if let Some(a) = args.subcommand_matches("seal-secrets") {
        return secrets::seal_secrets(
            &runner,
            a.value_of("env").unwrap(),
            a.is_present("only-changed"),
        );
    }
    if let Some(a) = args.subcommand_matches("unseal-secrets") {
        return secrets::unseal_secrets(&runner, a.value_of("env").unwrap());
    }
    if let Some(a) = args.subcommand_matches("cleanup-acr-registry") {
        return release::cleanup_acr_registry(&runner, a.value_of("registry").unwrap());
    }

    unreachable!("Subcommand valid, but not implemented");
}
