//! File-probe executor: spawn the PUT, enforce a timeout, read back the
//! probe's output file.

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use libafl::executors::ExitKind;
use libafl_bolts::Error;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::executor::{ExitStatus, PutExecutor, PutFeedback};

/// Marker in the PUT argv that is replaced with the scratch input path.
pub const INPUT_PLACEHOLDER: &str = "@@";

pub struct CommandExecutor {
    argv: Vec<String>,
    input_file: PathBuf,
    feedback_file: PathBuf,
    taint_file: Option<PathBuf>,
    timeout: Duration,
    kill_signal: Signal,
    debug_child: bool,
}

impl CommandExecutor {
    pub fn new(
        argv: Vec<String>,
        work_dir: &Path,
        feedback_file: PathBuf,
        taint_file: Option<PathBuf>,
        timeout: Duration,
        debug_child: bool,
    ) -> Result<Self, Error> {
        if argv.is_empty() {
            return Err(Error::illegal_argument("empty PUT command line"));
        }
        Ok(Self {
            argv,
            input_file: work_dir.join(".cur_input"),
            feedback_file,
            taint_file,
            timeout,
            kill_signal: Signal::SIGKILL,
            debug_child,
        })
    }

    fn spawn_and_wait(&self, exit: &mut ExitStatus) -> Result<(), Error> {
        let input_path = self.input_file.to_string_lossy().into_owned();
        let mut args = self.argv.iter().map(|a| {
            if a == INPUT_PLACEHOLDER {
                input_path.clone()
            } else {
                a.clone()
            }
        });

        let program = args.next().expect("checked in new");
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        if !self.debug_child {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        let deadline = started + self.timeout;

        let status = loop {
            match child.try_wait()? {
                Some(status) => break Some(status),
                None if Instant::now() >= deadline => {
                    let _ = kill(Pid::from_raw(child.id() as i32), self.kill_signal);
                    let _ = child.wait();
                    break None;
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        };
        exit.time = started.elapsed();

        match status {
            None => {
                exit.exit_kind = ExitKind::Timeout;
                exit.signal = None;
            }
            Some(status) => match status.signal() {
                Some(signal) => {
                    exit.exit_kind = ExitKind::Crash;
                    exit.signal = Some(signal);
                }
                None => {
                    exit.exit_kind = ExitKind::Ok;
                    exit.signal = None;
                }
            },
        }
        Ok(())
    }

    fn run_with_probe(
        &mut self,
        buf: &[u8],
        exit: &mut ExitStatus,
        probe_out: &Path,
    ) -> Result<PutFeedback, Error> {
        fs::write(&self.input_file, buf)?;
        let _ = fs::remove_file(probe_out);

        self.spawn_and_wait(exit)?;

        let data = fs::read(probe_out).unwrap_or_else(|_| {
            log::debug!("no probe output at {}", probe_out.display());
            Vec::new()
        });
        Ok(PutFeedback::new(data))
    }
}

impl PutExecutor for CommandExecutor {
    fn run(&mut self, buf: &[u8], exit: &mut ExitStatus) -> Result<PutFeedback, Error> {
        let probe = self.feedback_file.clone();
        self.run_with_probe(buf, exit, &probe)
    }

    fn run_taint(&mut self, buf: &[u8], exit: &mut ExitStatus) -> Result<PutFeedback, Error> {
        let Some(probe) = self.taint_file.clone() else {
            return Err(Error::unsupported("no taint probe configured"));
        };
        self.run_with_probe(buf, exit, &probe)
    }
}
