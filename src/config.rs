#![allow(non_snake_case)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::Result;

/// Repository wide configuration, serializable from project.yaml
///
/// Everything in here has a sane default so the file is optional.
#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Prefix for all docker images built in this project, e.g. `myproj-`
    #[serde(default)]
    pub imagePrefix: String,

    /// Every buildable component path in the repository
    #[serde(default)]
    pub components: Vec<String>,

    /// Kinds kubeval cannot validate and must skip
    #[serde(default)]
    pub kubevalSkipKinds: Vec<String>,
}

impl Config {
    pub fn read() -> Result<Config> {
        let pth = Path::new("project.yaml");
        if !pth.exists() {
            debug!("No project.yaml found, using defaults");
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(&fs::read_to_string(pth)?)?)
    }
}

/// Environment settings, serializable from envs/<env>/settings.yaml
#[derive(Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Component paths released to this environment, in release order
    pub components: Vec<String>,

    /// Kube context the environment lives in
    pub context: String,

    /// Namespace all components are released into
    pub namespace: String,

    /// Registry host to pull secret name
    #[serde(default)]
    pub imagePullSecrets: BTreeMap<String, String>,

    /// Replica count overrides per component path
    #[serde(default)]
    pub replicas: BTreeMap<String, u32>,

    /// Variable bag consumed by merge and override templates
    #[serde(default)]
    pub templateVariables: BTreeMap<String, serde_yaml::Value>,
}

impl Settings {
    pub fn load(env: &str) -> Result<Settings> {
        let pth = Path::new("envs").join(env).join("settings.yaml");
        if !pth.exists() {
            bail!("Environment settings {} do not exist", pth.display());
        }
        debug!("Loading settings from {}", pth.display());
        Ok(serde_yaml::from_str(&fs::read_to_string(&pth)?)?)
    }
}

/// Environment names available under envs/
pub fn list_envs() -> Result<Vec<String>> {
    let mut envs = vec![];
    for entry in fs::read_dir("envs")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_dir() && !name.starts_with("__") && !name.starts_with('.') {
            envs.push(name);
        }
    }
    envs.sort();
    Ok(envs)
}

/// Sorted *.yaml files directly under a directory
///
/// Missing directories are treated as empty rather than as errors.
pub fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "yaml").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
