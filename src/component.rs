use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_yaml::{Mapping, Value};

use super::config::{yaml_files, Settings};
use super::merge;
use super::run::{label, Opts, Runner};
use super::template::{self, TemplateKind};
use super::{ErrorKind, Result};

/// Kinds that are never patched
const SKIP_PATCH_KINDS: &[&str] = &[
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "ServiceAccount",
];

/// Kinds that get the workload patches
const WORKLOAD_KINDS: &[&str] = &["Deployment", "DaemonSet", "StatefulSet", "CronJob"];

/// Kinds that are restarted and waited on after an apply
/// https://kubernetes.io/docs/reference/generated/kubectl/kubectl-commands#rollout
const RESTART_KINDS: &[&str] = &["Deployment", "DaemonSet", "StatefulSet"];

/// Default seconds to wait for a rollout to complete before failing
pub const ROLLOUT_TIMEOUT: u64 = 300;

/// One workload resource found in the materialized manifests
#[derive(Clone, Debug)]
pub struct Resource {
    pub kind: String,
    pub name: String,
    /// First pod template label as `key=value`, used to find live pods
    pub selector: Option<String>,
}

/// One deployable unit: a directory with a Dockerfile and kube manifests
///
/// Constructed from its repository path, bound to an environment by the
/// orchestrator, and released phase by phase. After `release` the `path`
/// points into the temporary release directory holding the patched manifests.
pub struct Component {
    /// Component path with slashes flattened, e.g. `service-foo`
    pub name: String,
    /// Image reference override; the first container's reference otherwise
    pub image: Option<String>,
    pub tag: String,
    /// Registry/org prefix prepended to `name` for the full image
    pub image_prefix: String,
    pub replicas: Option<u32>,
    pub namespace: Option<String>,
    pub kube_context: Option<String>,
    /// Registry host to pull secret name
    pub image_pull_secrets: BTreeMap<String, String>,
    /// Seconds to wait per resource for `kubectl rollout status`
    pub rollout_timeout: u64,
    /// Where the component sources live
    pub orig_path: PathBuf,
    /// Current config root; rewritten once manifests are materialized
    pub path: PathBuf,
    /// Manifest file name to its current location (base, override or patched)
    pub kube_configs: BTreeMap<String, PathBuf>,
    /// Manifest file name to the env merge file applied on top of it
    pub kube_merges: BTreeMap<String, PathBuf>,
    /// Manifests to delete from the cluster instead of applying
    pub obsolete_kube_configs: BTreeMap<String, PathBuf>,
    /// Template name to template path, per template kind
    pub kube_templates: BTreeMap<TemplateKind, BTreeMap<String, PathBuf>>,
    resources: Option<BTreeMap<String, Resource>>,
}

impl Component {
    pub fn new(path: &str) -> Result<Component> {
        let orig_path = PathBuf::from(path);
        let mut c = Component {
            name: path.replace('/', "-"),
            image: None,
            tag: "latest".into(),
            image_prefix: "".into(),
            replicas: None,
            namespace: None,
            kube_context: None,
            image_pull_secrets: BTreeMap::new(),
            rollout_timeout: ROLLOUT_TIMEOUT,
            path: orig_path.clone(),
            orig_path,
            kube_configs: BTreeMap::new(),
            kube_merges: BTreeMap::new(),
            obsolete_kube_configs: BTreeMap::new(),
            kube_templates: BTreeMap::new(),
            resources: None,
        };
        c.kube_configs = c.scan_configs(&c.path.join("kube"))?;
        c.obsolete_kube_configs = c.scan_configs(&c.path.join("kube").join("obsolete"))?;
        for kind in TemplateKind::ALL.iter() {
            let dir = c.path.join("kube").join(kind.template_dir());
            let templates = c.scan_configs(&dir)?;
            c.kube_templates.insert(*kind, templates);
        }
        Ok(c)
    }

    fn scan_configs(&self, dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
        let mut configs = BTreeMap::new();
        for path in yaml_files(dir)? {
            let fname = path.file_name().unwrap().to_string_lossy().to_string();
            debug!("Found kube config {} for {}", fname, self.name);
            configs.insert(fname, path);
        }
        Ok(configs)
    }

    /// The fully qualified image built and expected in pods
    pub fn full_docker_name(&self) -> String {
        format!("{}{}:{}", self.image_prefix, self.name, self.tag)
    }

    /// Check the component has manifests and that they pass kubeval
    ///
    /// Schema validation is skipped quietly when kubeval is not installed.
    pub fn validate(&self, r: &dyn Runner, skip_kinds: &[String]) -> Result<()> {
        if self.kube_configs.is_empty() {
            bail!(ErrorKind::NoManifests(self.name.clone()));
        }
        if which::which("kubeval").is_err() {
            debug!("kubeval not found, skipping schema validation");
            return Ok(());
        }
        for path in self.kube_configs.values() {
            let mut args = vec!["kubeval".to_string(), "--strict".to_string()];
            if !skip_kinds.is_empty() {
                args.push("--skip-kinds".into());
                args.push(skip_kinds.join(","));
            }
            args.push(path.display().to_string());
            let res = r.run_opts(
                &args,
                Opts {
                    check: false,
                    ..Default::default()
                },
            )?;
            if res.code != 0 {
                bail!(ErrorKind::ValidationError(path.display().to_string()));
            }
        }
        Ok(())
    }

    /// Build the component image if it has a Dockerfile
    pub fn build(&self, r: &dyn Runner, dry_run: bool, build_args: &[String]) -> Result<()> {
        label(&format!("Building {}", self.path.display()));
        if !self.path.join("Dockerfile").exists() {
            info!("No Dockerfile for {} component", self.name);
            return Ok(());
        }
        if dry_run {
            info!("[DRY RUN] Building {} Docker image", self.name);
            return Ok(());
        }
        info!("Building {} Docker image", self.name);
        let mut args = vec!["docker".to_string(), "build".to_string()];
        for build_arg in build_args {
            args.push("--build-arg".into());
            args.push(build_arg.clone());
        }
        args.push(self.path.display().to_string());
        args.push("-t".into());
        args.push(self.full_docker_name());
        r.run_opts(
            &args,
            Opts {
                stream: true,
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Pick up environment specific overrides and merges
    ///
    /// Overrides replace a same-named base manifest wholesale; merges are
    /// structurally folded in during `release`.
    pub fn patch_from_env(&mut self, env: &str) -> Result<()> {
        let over_dir = Path::new("envs")
            .join(env)
            .join("overrides")
            .join(&self.orig_path)
            .join("kube");
        for path in yaml_files(&over_dir)? {
            let fname = path.file_name().unwrap().to_string_lossy().to_string();
            info!("Found kube override {} for {} in {}", fname, self.name, env);
            self.kube_configs.insert(fname, path);
        }
        let merge_dir = Path::new("envs")
            .join(env)
            .join("merges")
            .join(&self.orig_path)
            .join("kube");
        for path in yaml_files(&merge_dir)? {
            let fname = path.file_name().unwrap().to_string_lossy().to_string();
            info!("Found kube merge {} for {} in {}", fname, self.name, env);
            self.kube_merges.insert(fname, path);
        }
        Ok(())
    }

    /// Render this component's merge and override templates for an env
    pub fn render_templates(&self, env: &str, settings: &Settings) -> Result<Vec<PathBuf>> {
        template::render_component(self, env, settings)
    }

    /// Materialize, apply, restart and follow up one component release
    pub fn release(
        &mut self,
        r: &dyn Runner,
        rel_path: &Path,
        dry_run: bool,
        no_rollout_wait: bool,
    ) -> Result<()> {
        self.prepare_configs(rel_path)?;
        self.apply_configs(r, dry_run)?;
        self.restart_resources(r, dry_run, no_rollout_wait)?;
        self.post_release(r, dry_run)
    }

    // Patch + merge every manifest into the release directory and point
    // kube_configs at the materialized copies.
    fn prepare_configs(&mut self, rel_path: &Path) -> Result<()> {
        let dst = rel_path.join(&self.path);
        let kube_dst = dst.join("kube");
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&kube_dst)?;
        info!("Writing configs to {}", dst.display());

        let dockerfile = self.path.join("Dockerfile");
        if dockerfile.exists() {
            info!("Copying Dockerfile");
            fs::copy(&dockerfile, dst.join("Dockerfile"))?;
        }

        for (name, src) in self.kube_configs.clone() {
            info!("Patching {}", self.path.join("kube").join(&name).display());
            let data = fs::read_to_string(&src)?;
            let mut docs = merge::load_all(&data)?;
            for doc in &mut docs {
                self.patch_doc(doc);
            }
            if let Some(merge_path) = self.kube_merges.get(&name) {
                let merge_data = fs::read_to_string(merge_path)?;
                let overrides = merge::load_all(&merge_data)?;
                let raw = merge::load_all_raw(&merge_data)?;
                docs = merge::merge_docs(docs, &overrides, &raw)?;
            }
            let dst_path = kube_dst.join(&name);
            fs::write(&dst_path, merge::dump_all(&docs)?)?;
            self.kube_configs.insert(name, dst_path);
        }

        self.path = dst;
        // the index is a projection of the materialized manifests
        self.resources = None;
        Ok(())
    }

    fn apply_configs(&self, r: &dyn Runner, dry_run: bool) -> Result<()> {
        for path in self.kube_configs.values() {
            if dry_run {
                info!("[DRY RUN] Applying {}", path.display());
                continue;
            }
            info!("Applying {}", path.display());
            r.run(&[
                "kubectl".into(),
                "apply".into(),
                "-f".into(),
                path.display().to_string(),
            ])?;
        }
        for path in self.obsolete_kube_configs.values() {
            if dry_run {
                info!("[DRY RUN] Deleting {}", path.display());
                continue;
            }
            info!("Deleting {}", path.display());
            r.run(&[
                "kubectl".into(),
                "delete".into(),
                "-f".into(),
                path.display().to_string(),
            ])?;
        }
        Ok(())
    }

    fn restart_resources(
        &mut self,
        r: &dyn Runner,
        dry_run: bool,
        no_rollout_wait: bool,
    ) -> Result<()> {
        let rollout_timeout = self.rollout_timeout;
        let namespace = self.namespace.clone();
        for res in self.resources()?.clone().values() {
            if !RESTART_KINDS.contains(&res.kind.as_str()) {
                continue;
            }
            let target = format!("{}/{}", res.kind.to_lowercase(), res.name);
            if dry_run {
                info!("[DRY RUN] Restarting resource {}", target);
                continue;
            }
            info!("Restarting resource {}", target);
            let mut args = vec!["kubectl".to_string()];
            if let Some(ref ns) = namespace {
                args.push("-n".into());
                args.push(ns.clone());
            }
            let mut restart = args.clone();
            restart.extend(vec!["rollout".into(), "restart".into(), target.clone()]);
            r.run(&restart)?;

            if !no_rollout_wait {
                let mut status = args;
                status.extend(vec!["rollout".into(), "status".into(), target]);
                r.run_opts(
                    &status,
                    Opts {
                        timeout: Some(Duration::from_secs(rollout_timeout)),
                        ..Default::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    fn post_release(&mut self, r: &dyn Runner, dry_run: bool) -> Result<()> {
        if !self.orig_path.join("post-release.sh").exists() {
            return Ok(());
        }
        for (handle, res) in self.resources()?.clone() {
            if !RESTART_KINDS.contains(&res.kind.as_str()) {
                continue;
            }
            if dry_run {
                info!("[DRY RUN] Running post-release.sh for {}", handle);
                continue;
            }
            self.try_post_release(r, &handle, &res)?;
        }
        Ok(())
    }

    // Warm one representative pod by running post-release.sh in it. The pod
    // is picked uniformly at random from those running the expected image.
    fn try_post_release(&self, r: &dyn Runner, handle: &str, res: &Resource) -> Result<()> {
        let namespace = self.namespace.clone().unwrap_or_default();
        let selector = match res.selector {
            Some(ref s) => s.clone(),
            None => {
                warn!("{} has no pod selector, skipping post-release", handle);
                return Ok(());
            }
        };
        let out = r.run(&[
            "kubectl".into(),
            "-n".into(),
            namespace.clone(),
            "get".into(),
            "pods".into(),
            "-l".into(),
            selector,
            "-o".into(),
            "json".into(),
        ])?;

        let data: serde_json::Value = serde_json::from_slice(&out.stdout)?;
        let image = self.full_docker_name();
        let mut pods = vec![];
        if let Some(items) = data["items"].as_array() {
            for pod in items {
                if let Some(containers) = pod["spec"]["containers"].as_array() {
                    if containers.iter().any(|c| c["image"] == image.as_str()) {
                        if let Some(name) = pod["metadata"]["name"].as_str() {
                            pods.push(name.to_string());
                        }
                    }
                }
            }
        }
        if pods.is_empty() {
            bail!(ErrorKind::NoPodsForPostRelease(handle.to_string()));
        }

        let pod = pods.choose(&mut rand::thread_rng()).unwrap();
        info!("Running post-release.sh in {}", pod);
        r.run_opts(
            &[
                "kubectl".into(),
                "-n".into(),
                namespace,
                "exec".into(),
                "-it".into(),
                pod.clone(),
                "sh".into(),
                "post-release.sh".into(),
            ],
            Opts {
                check: false,
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Index of `Kind/name` to resource facts in the materialized manifests
    ///
    /// Memoized; invalidated whenever the manifests are rewritten.
    pub fn resources(&mut self) -> Result<&BTreeMap<String, Resource>> {
        if self.resources.is_none() {
            let mut map = BTreeMap::new();
            for path in self.kube_configs.values() {
                for doc in merge::load_all(&fs::read_to_string(path)?)? {
                    let kind = match doc.get("kind").and_then(Value::as_str) {
                        Some(k) => k.to_string(),
                        None => continue,
                    };
                    let name = match doc
                        .get("metadata")
                        .and_then(|m| m.get("name"))
                        .and_then(Value::as_str)
                    {
                        Some(n) => n.to_string(),
                        None => continue,
                    };
                    let handle = format!("{}/{}", kind, name);
                    let selector = pod_selector(&doc);
                    map.insert(handle, Resource { kind, name, selector });
                }
            }
            self.resources = Some(map);
        }
        Ok(self.resources.as_ref().unwrap())
    }

    fn patch_doc(&self, doc: &mut Value) {
        let kind = match doc.get("kind").and_then(Value::as_str) {
            Some(k) => k.to_string(),
            None => return,
        };
        if SKIP_PATCH_KINDS.contains(&kind.as_str()) {
            info!("Skipping {} patching", kind);
            return;
        }
        self.patch_generic(doc);
        if WORKLOAD_KINDS.contains(&kind.as_str()) {
            info!("Patching found {}", kind);
            self.patch_containers(doc, &kind);
            self.patch_image_pull_secrets(doc, &kind);
            self.patch_replicas(doc, &kind);
        }
    }

    fn patch_generic(&self, doc: &mut Value) {
        if let Some(ref ns) = self.namespace {
            if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_mapping_mut) {
                debug!("Updating namespace to {}", ns);
                meta.insert(
                    Value::String("namespace".into()),
                    Value::String(ns.clone()),
                );
            }
        }
    }

    fn patch_containers(&self, doc: &mut Value, kind: &str) {
        let containers = match pod_spec_mut(doc, kind)
            .and_then(|s| s.get_mut("containers"))
            .and_then(Value::as_sequence_mut)
        {
            Some(c) => c,
            None => return,
        };
        for container in containers {
            let image = match container.get("image").and_then(Value::as_str) {
                Some(i) => i.to_string(),
                None => continue,
            };
            let (mut image_ref, mut tag) = split_image(&image);
            if let Some(ref i) = self.image {
                debug!("Patching image from {} to {}", image_ref, i);
                image_ref = i.clone();
            }
            if !self.tag.is_empty() {
                debug!("Patching tag from {} to {}", tag, self.tag);
                tag = self.tag.clone();
            }
            if let Some(m) = container.as_mapping_mut() {
                m.insert(
                    Value::String("image".into()),
                    Value::String(format!("{}:{}", image_ref, tag)),
                );
            }
        }
    }

    fn patch_image_pull_secrets(&self, doc: &mut Value, kind: &str) {
        let pod_spec = match pod_spec_mut(doc, kind) {
            Some(s) => s,
            None => return,
        };
        let image = match self.image {
            Some(ref i) => i.clone(),
            None => pod_spec
                .get("containers")
                .and_then(Value::as_sequence)
                .and_then(|cs| cs.first())
                .and_then(|c| c.get("image"))
                .and_then(Value::as_str)
                .map(|i| split_image(i).0)
                .unwrap_or_default(),
        };
        if !image.contains('/') {
            return;
        }
        let host = image.split('/').next().unwrap();
        if let Some(secret) = self.image_pull_secrets.get(host) {
            info!("Patching imagePullSecrets to {}", secret);
            let mut entry = Mapping::new();
            entry.insert(Value::String("name".into()), Value::String(secret.clone()));
            if let Some(m) = pod_spec.as_mapping_mut() {
                m.insert(
                    Value::String("imagePullSecrets".into()),
                    Value::Sequence(vec![Value::Mapping(entry)]),
                );
            }
        }
    }

    fn patch_replicas(&self, doc: &mut Value, kind: &str) {
        if let Some(n) = self.replicas {
            if let Some(spec) = workload_spec_mut(doc, kind).and_then(Value::as_mapping_mut) {
                debug!("Patching replicas to {}", n);
                spec.insert(Value::String("replicas".into()), Value::Number(n.into()));
            }
        }
    }
}

// The pod template spec; CronJobs nest theirs inside the job template.
fn pod_spec_mut<'a>(doc: &'a mut Value, kind: &str) -> Option<&'a mut Value> {
    if kind == "CronJob" {
        doc.get_mut("spec")?
            .get_mut("jobTemplate")?
            .get_mut("spec")?
            .get_mut("template")?
            .get_mut("spec")
    } else {
        doc.get_mut("spec")?.get_mut("template")?.get_mut("spec")
    }
}

// Where the replica count lives for a workload kind.
fn workload_spec_mut<'a>(doc: &'a mut Value, kind: &str) -> Option<&'a mut Value> {
    if kind == "CronJob" {
        doc.get_mut("spec")?.get_mut("jobTemplate")?.get_mut("spec")
    } else {
        doc.get_mut("spec")
    }
}

fn split_image(image: &str) -> (String, String) {
    match image.find(':') {
        Some(idx) => (image[..idx].to_string(), image[idx + 1..].to_string()),
        None => (image.to_string(), "latest".into()),
    }
}

fn pod_selector(doc: &Value) -> Option<String> {
    let labels = doc
        .get("spec")?
        .get("template")?
        .get("metadata")?
        .get("labels")?
        .as_mapping()?;
    let (k, v) = labels.iter().next()?;
    Some(format!("{}={}", k.as_str()?, v.as_str()?))
}
