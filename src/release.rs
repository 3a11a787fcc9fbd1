use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use regex::Regex;
use uuid::Uuid;
use walkdir::WalkDir;

use super::component::{Component, ROLLOUT_TIMEOUT};
use super::config::{self, yaml_files, Config, Settings};
use super::run::{big_label, label, Opts, Runner};
use super::secrets;
use super::Result;

/// Root of the per release scratch directories
pub const RELEASE_TMP: &str = "temp";

/// The environment running on a developer machine, which gets special
/// treatment during cluster init (locally stored sealing keys).
pub const LOCAL_ENV: &str = "minikube";

/// Docker tags to keep per repository when cleaning a registry
const MAX_TAGS: usize = 50;

/// One batch release of an environment
pub struct ReleaseRequest {
    pub env: String,
    /// Components to release; the environment settings when empty
    pub components: Vec<String>,
    pub images: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub replicas: BTreeMap<String, u32>,
    pub dry_run: bool,
    pub keep_configs: bool,
    pub no_rollout_wait: bool,
    pub rollout_timeout: u64,
}

impl Default for ReleaseRequest {
    fn default() -> Self {
        ReleaseRequest {
            env: "".into(),
            components: vec![],
            images: BTreeMap::new(),
            tags: BTreeMap::new(),
            replicas: BTreeMap::new(),
            dry_run: false,
            keep_configs: false,
            no_rollout_wait: false,
            rollout_timeout: ROLLOUT_TIMEOUT,
        }
    }
}

/// Short id naming one release's scratch directory
pub fn generate_release_id() -> String {
    Uuid::new_v4().to_simple().to_string()[..5].to_string()
}

/// Parse repeated `component=value` CLI overrides
pub fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((k, v)) => {
                map.insert(k.to_string(), v.to_string());
            }
            None => bail!("expected <component>=<value>, got '{}'", pair),
        }
    }
    Ok(map)
}

/// Parse repeated `component=count` CLI overrides
pub fn parse_replica_overrides(pairs: &[String]) -> Result<BTreeMap<String, u32>> {
    let mut map = BTreeMap::new();
    for (k, v) in parse_overrides(pairs)? {
        map.insert(k, v.parse()?);
    }
    Ok(map)
}

pub fn ensure_context(r: &dyn Runner, context: &str) -> Result<()> {
    r.run(&[
        "kubectl".into(),
        "config".into(),
        "use-context".into(),
        context.into(),
    ])?;
    Ok(())
}

/// Idempotent namespace creation; an existing namespace is not an error
pub fn ensure_namespace(r: &dyn Runner, namespace: &str) -> Result<()> {
    r.run_opts(
        &[
            "kubectl".into(),
            "create".into(),
            "namespace".into(),
            namespace.into(),
        ],
        Opts {
            check: false,
            ..Default::default()
        },
    )?;
    Ok(())
}

/// Release a batch of components to one environment
pub fn release(r: &dyn Runner, req: ReleaseRequest) -> Result<()> {
    let conf = Config::read()?;
    let rel_id = generate_release_id();
    big_label(&format!(
        "Release {} to {} environment starting",
        rel_id, req.env
    ));
    let mut settings = Settings::load(&req.env)?;
    for (k, v) in &req.replicas {
        settings.replicas.insert(k.clone(), *v);
    }
    let components = if req.components.is_empty() {
        settings.components.clone()
    } else {
        req.components.clone()
    };
    let rel_path = Path::new(RELEASE_TMP).join(&rel_id);

    info!("Releasing components:");
    for component in &components {
        info!(" - {}", component);
    }
    info!("Setting images and tags:");
    for path in &components {
        let image = req.images.get(path).map(String::as_str).unwrap_or("(default)");
        let tag = req.tags.get(path).map(String::as_str).unwrap_or("(default)");
        info!(" - {} = {}:{}", path, image, tag);
    }

    ensure_context(r, &settings.context)?;
    ensure_namespace(r, &settings.namespace)?;
    secrets::release_env(r, &req.env, req.dry_run)?;

    let mut images = req.images.clone();
    let mut tags = req.tags.clone();
    let mut replicas = req.replicas.clone();
    for path in &components {
        label(&format!("Releasing component {}", path));
        let mut component = Component::new(path)?;
        if let Some(image) = images.remove(path) {
            component.image = Some(image);
        }
        if let Some(tag) = tags.remove(path) {
            component.tag = tag;
        }
        replicas.remove(path);
        if let Some(n) = settings.replicas.get(path) {
            component.replicas = Some(*n);
        }
        component.image_prefix = conf.imagePrefix.clone();
        component.namespace = Some(settings.namespace.clone());
        component.kube_context = Some(settings.context.clone());
        component.image_pull_secrets = settings.imagePullSecrets.clone();
        component.rollout_timeout = req.rollout_timeout;

        component.patch_from_env(&req.env)?;
        component.validate(r, &conf.kubevalSkipKinds)?;
        component.release(r, &rel_path, req.dry_run, req.no_rollout_wait)?;
    }

    // leftover override keys are loud but not fatal
    if !images.is_empty() {
        error!("Unprocessed image configurations:");
        for (path, image) in &images {
            error!(" - {}={}", path, image);
        }
    }
    if !tags.is_empty() {
        error!("Unprocessed tag configurations:");
        for (path, tag) in &tags {
            error!(" - {}={}", path, tag);
        }
    }
    if !replicas.is_empty() {
        error!("Unprocessed replica configurations:");
        for (path, count) in &replicas {
            error!(" - {}={}", path, count);
        }
    }

    if !req.keep_configs {
        info!(
            "Removing temporary configurations from {}",
            rel_path.display()
        );
        if rel_path.exists() {
            fs::remove_dir_all(&rel_path)?;
        }
    }
    Ok(())
}

/// Build the docker images of the given components
pub fn build_images(
    r: &dyn Runner,
    components: &[String],
    dry_run: bool,
    build_args: &[String],
) -> Result<()> {
    if env::var_os("DOCKER_HOST").is_none() {
        warn!("DOCKER_HOST not set, if you get an error you might be missing something like \"minikube start\"");
    }
    let conf = Config::read()?;
    big_label("Building images");
    for path in components {
        let mut component = Component::new(path)?;
        component.image_prefix = conf.imagePrefix.clone();
        component.build(r, dry_run, build_args)?;
    }
    Ok(())
}

/// Validate every env's component manifests before and after env patches
pub fn validate_release_configs(r: &dyn Runner) -> Result<()> {
    let conf = Config::read()?;
    for env in config::list_envs()? {
        info!("Validating configs for {} environment", env);
        let settings = Settings::load(&env)?;
        for path in &settings.components {
            let mut component = Component::new(path)?;
            component.validate(r, &conf.kubevalSkipKinds)?;
            component.patch_from_env(&env)?;
            component.validate(r, &conf.kubevalSkipKinds)?;
        }
    }
    Ok(())
}

/// Prime a cluster: context, cluster configs, sealing controller and cert
pub fn init_kubernetes(r: &dyn Runner, env: &str) -> Result<()> {
    label(&format!("Initializing Kubernetes for {}", env));
    let settings = Settings::load(env)?;
    ensure_context(r, &settings.context)?;

    let env_path = Path::new("envs").join(env);
    if env == LOCAL_ENV {
        // reuse the locally stored sealing key so old sealed secrets survive
        // cluster recreation
        let master_key = env_path.join("master.key");
        if master_key.exists() {
            info!(
                "Applying Sealed Secrets master key from {}",
                master_key.display()
            );
            r.run_opts(
                &[
                    "kubectl".into(),
                    "apply".into(),
                    "-f".into(),
                    master_key.display().to_string(),
                ],
                Opts {
                    check: false,
                    ..Default::default()
                },
            )?;
        }
    }

    for config in yaml_files(Path::new("kube"))? {
        r.run(&[
            "kubectl".into(),
            "apply".into(),
            "-f".into(),
            config.display().to_string(),
        ])?;
    }

    r.run(&[
        "kubectl".into(),
        "rollout".into(),
        "status".into(),
        "--namespace".into(),
        "kube-system".into(),
        "deploy/sealed-secrets-controller".into(),
    ])?;

    info!("Trying to fetch Sealed Secrets signing cert");
    let mut attempts = 5;
    let cert = loop {
        match r.run(&["kubeseal".into(), "--fetch-cert".into()]) {
            Ok(res) => break res.stdout,
            Err(e) => {
                attempts -= 1;
                if attempts <= 0 {
                    return Err(e);
                }
                debug!("Controller not answering yet: {}", e);
                thread::sleep(Duration::from_secs(2));
            }
        }
    };
    fs::write(env_path.join("secrets.pem"), cert)?;

    if env == LOCAL_ENV && !env_path.join("master.key").exists() {
        info!("Trying to store Sealed Secrets master key");
        secrets::get_master_key(r, env, false)?;
    }
    Ok(())
}

/// Bootstrap a development environment end to end
pub fn init(r: &dyn Runner) -> Result<()> {
    init_kubernetes(r, LOCAL_ENV)?;
    let conf = Config::read()?;
    build_images(r, &conf.components, false, &[])?;
    release(
        r,
        ReleaseRequest {
            env: LOCAL_ENV.into(),
            ..Default::default()
        },
    )
}

/// Check every kube config in the repository against its schema
pub fn kubeval(r: &dyn Runner) -> Result<()> {
    let conf = Config::read()?;
    label("Checking Kubernetes configs");

    let mut files = vec![];
    for entry in WalkDir::new(".").into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().map(|e| e != "yaml").unwrap_or(true) {
            continue;
        }
        if path.parent().and_then(|p| p.file_name()).map(|n| n != "kube").unwrap_or(true) {
            continue;
        }
        if path.strip_prefix(".").unwrap_or(path).starts_with(RELEASE_TMP) {
            continue;
        }
        // SealedSecrets have no usable schema
        if fs::read_to_string(path)?.contains("apiVersion: bitnami.com/v1alpha1") {
            continue;
        }
        files.push(path.display().to_string());
    }
    files.sort();

    let mut args = vec!["kubeval".to_string(), "--strict".to_string()];
    if !conf.kubevalSkipKinds.is_empty() {
        args.push("--skip-kinds".into());
        args.push(conf.kubevalSkipKinds.join(","));
    }
    args.extend(files);
    r.run(&args)?;
    Ok(())
}

/// Delete all but the newest tags from every repository of an Azure registry
pub fn cleanup_acr_registry(r: &dyn Runner, registry: &str) -> Result<()> {
    big_label(&format!("Cleaning up ACR registry {}", registry));
    let res = r.run(&[
        "az".into(),
        "acr".into(),
        "repository".into(),
        "list".into(),
        "--name".into(),
        registry.into(),
    ])?;
    let repositories: Vec<String> = serde_json::from_slice(&res.stdout)?;
    for repository in repositories {
        cleanup_acr_repository(r, registry, &repository)?;
    }
    Ok(())
}

pub fn cleanup_acr_repository(r: &dyn Runner, registry: &str, repository: &str) -> Result<()> {
    label(&format!(
        "Cleaning up ACR {}/{} repository",
        registry, repository
    ));
    let res = r.run(&[
        "az".into(),
        "acr".into(),
        "repository".into(),
        "show-tags".into(),
        "--name".into(),
        registry.into(),
        "--repository".into(),
        repository.into(),
    ])?;
    let mut tags: Vec<String> = serde_json::from_slice(&res.stdout)?;

    // <branch>-<hash>-<YYYYMMDD>-<HHMMSS>, sorted as <datetime>-<branch>-<hash>
    let tag_match = Regex::new(r"^([^-]+)-([A-Za-z0-9]{7})-([0-9]+)-([0-9]+)$").unwrap();
    tags.sort_by_key(|t| tag_match.replace(t, "$3-$4-$1-$2").to_string());

    for tag in tags.iter().skip(MAX_TAGS) {
        info!("Deleting old tag {}", tag);
        r.run(&[
            "az".into(),
            "acr".into(),
            "repository".into(),
            "delete".into(),
            "--yes".into(),
            "--name".into(),
            registry.into(),
            "--image".into(),
            format!("{}:{}", repository, tag),
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::super::run::double::Recorder;
    use super::super::testutil;
    use super::{
        generate_release_id, parse_overrides, parse_replica_overrides, release, ReleaseRequest,
    };

    #[test]
    fn release_ids_are_short_and_lowercase() {
        for _ in 0..20 {
            let id = generate_release_id();
            assert_eq!(id.len(), 5);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn override_parsing() {
        let parsed =
            parse_overrides(&["service/app=img".to_string(), "other=x".to_string()]).unwrap();
        assert_eq!(parsed["service/app"], "img");
        assert_eq!(parsed["other"], "x");
        assert!(parse_overrides(&["nope".to_string()]).is_err());

        let counts = parse_replica_overrides(&["service/app=3".to_string()]).unwrap();
        assert_eq!(counts["service/app"], 3);
        assert!(parse_replica_overrides(&["service/app=lots".to_string()]).is_err());
    }

    const DEPLOYMENT: &str = "
apiVersion: apps/v1
kind: Deployment
metadata:
  name: app
spec:
  replicas: 1
  template:
    metadata:
      labels:
        app: app
    spec:
      containers:
        - name: app
          image: imagined.registry.tld/myproj-app:latest
";

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        fs::create_dir_all("envs/test").unwrap();
        fs::write(
            "envs/test/settings.yaml",
            "components:\n  - app\ncontext: test-ctx\nnamespace: test-ns\n",
        )
        .unwrap();
        fs::create_dir_all("app/kube").unwrap();
        fs::write("app/kube/01-app.yaml", DEPLOYMENT).unwrap();
        dir
    }

    #[test]
    fn release_prepares_cluster_then_components() {
        let _guard = testutil::lock_cwd();
        let _dir = workspace();

        let r = Recorder::default();
        release(&r, ReleaseRequest {
            env: "test".into(),
            ..Default::default()
        })
        .unwrap();

        // kubeval validation only happens when the tool is installed
        let calls: Vec<String> = r
            .cmdlines()
            .into_iter()
            .filter(|c| !c.starts_with("kubeval"))
            .collect();
        assert_eq!(calls[0], "kubectl config use-context test-ctx");
        assert_eq!(calls[1], "kubectl create namespace test-ns");
        assert!(calls[2].starts_with("kubectl apply -f temp/"));
        assert!(calls[2].ends_with("/app/kube/01-app.yaml"));
        assert_eq!(calls[3], "kubectl -n test-ns rollout restart deployment/app");
        assert_eq!(calls[4], "kubectl -n test-ns rollout status deployment/app");
        assert_eq!(calls.len(), 5);

        // scratch directory is removed afterwards
        assert!(fs::read_dir("temp").map(|mut d| d.next().is_none()).unwrap_or(true));
    }

    #[test]
    fn unconsumed_overrides_do_not_fail_the_run() {
        let _guard = testutil::lock_cwd();
        let _dir = workspace();

        let r = Recorder::default();
        let mut req = ReleaseRequest {
            env: "test".into(),
            no_rollout_wait: true,
            ..Default::default()
        };
        req.images.insert("service/unknown".into(), "img".into());
        req.tags.insert("service/unknown".into(), "v1".into());
        release(&r, req).unwrap();
    }

    #[test]
    fn settings_replicas_flow_into_components() {
        let _guard = testutil::lock_cwd();
        let _dir = workspace();
        fs::write(
            "envs/test/settings.yaml",
            "components:\n  - app\ncontext: test-ctx\nnamespace: test-ns\nreplicas:\n  app: 4\n",
        )
        .unwrap();

        let r = Recorder::default();
        let mut req = ReleaseRequest {
            env: "test".into(),
            keep_configs: true,
            no_rollout_wait: true,
            ..Default::default()
        };
        // CLI override beats the settings value
        req.replicas.insert("app".into(), 9);
        release(&r, req).unwrap();

        let released = fs::read_dir("temp").unwrap().next().unwrap().unwrap();
        let manifest =
            fs::read_to_string(released.path().join("app/kube/01-app.yaml")).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&manifest).unwrap();
        assert_eq!(
            doc["spec"].get("replicas").unwrap(),
            &serde_yaml::Value::Number(9.into())
        );
    }

    #[test]
    fn dry_run_only_sets_context() {
        let _guard = testutil::lock_cwd();
        let _dir = workspace();

        let r = Recorder::default();
        release(&r, ReleaseRequest {
            env: "test".into(),
            dry_run: true,
            ..Default::default()
        })
        .unwrap();

        let calls: Vec<String> = r
            .cmdlines()
            .into_iter()
            .filter(|c| !c.starts_with("kubeval"))
            .collect();
        // context and namespace are still ensured, nothing else runs
        assert_eq!(calls[0], "kubectl config use-context test-ctx");
        assert_eq!(calls[1], "kubectl create namespace test-ns");
        assert_eq!(calls.len(), 2);
    }
}
