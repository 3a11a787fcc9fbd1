use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{ErrorKind, Result};

/// Options for one external process invocation
#[derive(Debug, Clone)]
pub struct Opts {
    /// Working directory for the child
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the child
    pub env: BTreeMap<String, String>,
    /// Fail with `ProcessFailure` on non-zero exit status
    pub check: bool,
    /// Inherit stdio rather than capturing it
    pub stream: bool,
    /// Kill the child and fail with `ProcessTimeout` after this long
    pub timeout: Option<Duration>,
    /// Bytes written to the child's stdin before waiting
    pub input: Option<Vec<u8>>,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            cwd: None,
            env: BTreeMap::new(),
            check: true,
            stream: false,
            timeout: None,
            input: None,
        }
    }
}

/// Captured result of a completed process
///
/// The buffers are empty when the invocation streamed.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Anything that can run an external command for us
///
/// The release pipeline only talks to the cluster through this, so tests can
/// swap in a recorder and assert on argv sequences.
pub trait Runner {
    fn run_opts(&self, args: &[String], opts: Opts) -> Result<Output>;

    fn run(&self, args: &[String]) -> Result<Output> {
        self.run_opts(args, Opts::default())
    }
}

/// The real subprocess invoker
pub struct Shell;

impl Runner for Shell {
    fn run_opts(&self, args: &[String], opts: Opts) -> Result<Output> {
        let cmdline = args.join(" ");
        info!("  {}", cmdline);

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        if let Some(ref cwd) = opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }
        if opts.stream {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        if opts.input.is_some() {
            cmd.stdin(Stdio::piped());
        } else if !opts.stream {
            cmd.stdin(Stdio::null());
        }

        let start = Instant::now();
        let mut child = cmd.spawn()?;

        if let Some(ref input) = opts.input {
            // dropping the handle closes the pipe so the child sees EOF
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input)?;
            }
        }

        // drain pipes on the side so a chatty child can't deadlock on a full pipe
        let stdout_reader = child.stdout.take().map(|mut s| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = s.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut s| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = s.read_to_end(&mut buf);
                buf
            })
        });

        let status = match opts.timeout {
            None => child.wait()?,
            Some(limit) => {
                let deadline = start + limit;
                loop {
                    if let Some(st) = child.try_wait()? {
                        break st;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        error!("{} timed out after {}s", cmdline, limit.as_secs());
                        bail!(ErrorKind::ProcessTimeout(cmdline, limit.as_secs()));
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        };

        let stdout = stdout_reader
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr_reader
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        let code = status.code().unwrap_or(1001);
        info!("  done in {:.3}s", start.elapsed().as_secs_f64());

        if opts.check && !status.success() {
            error!("Failed to run {}", cmdline);
            if !stdout.is_empty() {
                error!("stdout: {}", String::from_utf8_lossy(&stdout).trim());
            }
            if !stderr.is_empty() {
                error!("stderr: {}", String::from_utf8_lossy(&stderr).trim());
            }
            bail!(ErrorKind::ProcessFailure(cmdline, code));
        }

        Ok(Output { code, stdout, stderr })
    }
}

pub fn label(text: &str) {
    let fill = "-".repeat(text.len());
    info!("/-{}-\\", fill);
    info!("| {} |", text);
    info!("\\-{}-/", fill);
}

pub fn big_label(text: &str) {
    let fill = "-".repeat(text.len());
    let padd = " ".repeat(text.len());
    info!("");
    info!("/---{}---\\", fill);
    info!("|   {}   |", padd);
    info!("|   {}   |", text);
    info!("|   {}   |", padd);
    info!("\\---{}---/", fill);
    info!("");
}

#[cfg(test)]
pub mod double {
    use std::sync::Mutex;

    use super::{Opts, Output, Runner};
    use crate::{ErrorKind, Result};

    /// Runner double recording argv sequences and replaying canned stdout
    #[derive(Default)]
    pub struct Recorder {
        pub calls: Mutex<Vec<Vec<String>>>,
        responses: Mutex<Vec<(String, i32, String)>>,
    }

    impl Recorder {
        pub fn respond(&self, prefix: &str, code: i32, stdout: &str) {
            self.responses
                .lock()
                .unwrap()
                .push((prefix.into(), code, stdout.into()));
        }

        /// Every recorded invocation as a joined command line
        pub fn cmdlines(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.join(" "))
                .collect()
        }
    }

    impl Runner for Recorder {
        fn run_opts(&self, args: &[String], opts: Opts) -> Result<Output> {
            let cmdline = args.join(" ");
            self.calls.lock().unwrap().push(args.to_vec());
            for (prefix, code, stdout) in self.responses.lock().unwrap().iter() {
                if cmdline.starts_with(prefix.as_str()) {
                    if opts.check && *code != 0 {
                        bail!(ErrorKind::ProcessFailure(cmdline, *code));
                    }
                    return Ok(Output {
                        code: *code,
                        stdout: stdout.clone().into_bytes(),
                        stderr: vec![],
                    });
                }
            }
            Ok(Output::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Opts, Runner, Shell};
    use crate::{Error, ErrorKind};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_stdout() {
        let res = Shell.run(&argv(&["echo", "hello"])).unwrap();
        assert_eq!(res.code, 0);
        assert_eq!(res.stdout_string().trim(), "hello");
        assert!(res.stderr.is_empty());
    }

    #[test]
    fn check_false_tolerates_failure() {
        let opts = Opts {
            check: false,
            ..Default::default()
        };
        let res = Shell.run_opts(&argv(&["false"]), opts).unwrap();
        assert_ne!(res.code, 0);
    }

    #[test]
    fn check_true_fails() {
        let res = Shell.run(&argv(&["false"]));
        match res.unwrap_err() {
            Error(ErrorKind::ProcessFailure(cmd, code), _) => {
                assert_eq!(cmd, "false");
                assert_ne!(code, 0);
            }
            e => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let opts = Opts {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let res = Shell.run_opts(&argv(&["sleep", "5"]), opts);
        match res.unwrap_err() {
            Error(ErrorKind::ProcessTimeout(cmd, _), _) => assert_eq!(cmd, "sleep 5"),
            e => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn input_reaches_stdin() {
        let opts = Opts {
            input: Some(b"ping".to_vec()),
            ..Default::default()
        };
        let res = Shell.run_opts(&argv(&["cat"]), opts).unwrap();
        assert_eq!(res.stdout_string(), "ping");
    }
}
