#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error);
        Int(::std::num::ParseIntError);
        Utf8(::std::string::FromUtf8Error);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        Tmpl(tera::Error);
        B64(base64::DecodeError);
        Scan(::yaml_rust::scanner::ScanError);
        Walk(walkdir::Error);
    }
    errors {
        NoManifests(component: String) {
            description("component has no kube configs")
            display("no kube configs found for component {}", &component)
        }
        ValidationError(file: String) {
            description("manifest failed validation")
            display("validation failed for {}", &file)
        }
        ProcessFailure(cmd: String, code: i32) {
            description("subprocess returned non-zero")
            display("subprocess failure from {}: {}", &cmd, &code)
        }
        ProcessTimeout(cmd: String, secs: u64) {
            description("subprocess timed out")
            display("{} timed out after {}s", &cmd, &secs)
        }
        UnsupportedMerge(node: String) {
            description("merge reached an unsupported node")
            display("don't know how to merge {}", &node)
        }
        NoPodsForPostRelease(resource: String) {
            description("no matching pods for post-release")
            display("no running pods with correct image found for {}", &resource)
        }
    }
}

/// Uniform wrapper around external executables
pub mod run;

/// Typed project and environment configuration
pub mod config;

/// Structural merging of YAML document streams
pub mod merge;

/// The in-memory model of one deployable unit
pub mod component;

/// Batch releases and the other repository level tasks
pub mod release;

/// Sealed Secrets transforms
pub mod secrets;

/// Rendering of env specific merge and override files
pub mod template;

pub use crate::component::Component;
pub use crate::config::{Config, Settings};

/// Smart initialiser with safety
///
/// Allows the tool to run from anywhere if we know where the repository is.
pub fn init() -> Result<()> {
    use std::env;
    use std::path::Path;

    if let Ok(root) = env::var("SKIPPER_ROOT_DIR") {
        let pth = Path::new(&root);
        if !pth.is_dir() {
            bail!("SKIPPER_ROOT_DIR must exist");
        }
        env::set_current_dir(pth)?;
    }

    Ok(())
}
