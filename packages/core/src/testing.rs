//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::executor::{CommandOutput, CommandRunner, RunOptions};
use crate::probe::DeviceProbe;

type Handler = dyn Fn(&str, &[&str]) -> Result<CommandOutput> + Send + Sync;

/// Runner that answers from a closure and records every command line.
pub(crate) struct ScriptedRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub(crate) fn new(
        handler: impl Fn(&str, &[&str]) -> Result<CommandOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Runner where every command succeeds with empty output.
    pub(crate) fn succeeding() -> Self {
        Self::new(|_, _| Ok(ok("")))
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next() == Some(program))
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str], options: RunOptions) -> Result<CommandOutput> {
        let mut line = vec![program];
        line.extend_from_slice(args);
        self.calls.lock().unwrap().push(line.join(" "));

        let mut output = (self.handler)(program, args)?;
        output.success = output.exit_code == 0 || options.ignore_failure;
        Ok(output)
    }

    fn append_file(&self, path: &Path, content: &str) -> io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("append {}", path.display()));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        // Two writes, so unserialized appends would interleave.
        let (head, tail) = content.split_at(content.find(' ').unwrap_or(content.len()));
        file.write_all(head.as_bytes())?;
        std::thread::yield_now();
        file.write_all(tail.as_bytes())
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("cp {} {}", src.display(), dst.display()));
        std::fs::copy(src, dst).map(|_| ())
    }
}

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        success: true,
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn failed(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        success: false,
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Probe that never touches the OS.
#[derive(Default)]
pub(crate) struct FakeProbe {
    pub system_devices: HashSet<PathBuf>,
    pub fail_mount: bool,
    pub fail_unmount: bool,
    pub panic_on_marker: bool,
    pub events: Mutex<Vec<String>>,
    pub mounted: Mutex<Option<PathBuf>>,
}

impl FakeProbe {
    pub(crate) fn with_system(devices: &[&str]) -> Self {
        Self {
            system_devices: devices.iter().map(PathBuf::from).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl DeviceProbe for FakeProbe {
    fn mount_readonly(&self, device: &Path, _target: &Path) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("mount {}", device.display()));
        if self.fail_mount {
            return Err(Error::Mount {
                device: device.display().to_string(),
                message: "wrong fs type".to_string(),
            });
        }
        *self.mounted.lock().unwrap() = Some(device.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.events.lock().unwrap().push("unmount".to_string());
        *self.mounted.lock().unwrap() = None;
        if self.fail_unmount {
            return Err(Error::Unmount {
                path: target.to_path_buf(),
                message: "target is busy".to_string(),
            });
        }
        Ok(())
    }

    fn has_marker(&self, root: &Path, marker: &str) -> bool {
        if self.panic_on_marker {
            panic!("marker check exploded");
        }
        match self.mounted.lock().unwrap().as_ref() {
            Some(device) => self.system_devices.contains(device) && marker == "etc",
            // Not a scratch mount: look at the real directory.
            None => root.join(marker).is_dir(),
        }
    }
}
