//! Command hand-off.
//!
//! The engine never mounts anything itself. Resolved commands and hook
//! scripts are handed to a [`TaskRunner`]; the default [`ShellRunner`] starts
//! them detached through `sh -c`, optionally inside a terminal emulator.

use std::cell::RefCell;
use std::process::{Child, Command, Stdio};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{IoResultExt, Result};
use crate::handler::ResolvedCommand;

/// Why a task was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPurpose {
    Mount,
    Unmount,
    Properties,
    /// An exec hook (`insert`, `mount`, `unmount`, `remove`).
    Hook,
}

/// A shell command ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub command: String,
    pub in_terminal: bool,
    pub purpose: TaskPurpose,
}

impl Task {
    pub fn new(command: impl Into<String>, in_terminal: bool, purpose: TaskPurpose) -> Self {
        Self {
            command: command.into(),
            in_terminal,
            purpose,
        }
    }

    pub fn from_resolved(resolved: ResolvedCommand, purpose: TaskPurpose) -> Self {
        Self::new(resolved.command, resolved.in_terminal, purpose)
    }
}

/// Runs tasks without waiting for them to finish.
pub trait TaskRunner {
    fn run(&mut self, task: &Task) -> Result<()>;
}

/// Starts tasks with `sh -c`.
///
/// Children are kept until they exit and are reaped on the next call to
/// [`TaskRunner::run`] or [`ShellRunner::reap`].
#[derive(Debug)]
pub struct ShellRunner {
    terminal: String,
    children: Vec<Child>,
}

impl ShellRunner {
    /// `terminal` is the prefix used for tasks that need a terminal,
    /// e.g. `xterm -e`.
    pub fn new(terminal: impl Into<String>) -> Self {
        Self {
            terminal: terminal.into(),
            children: Vec::new(),
        }
    }

    /// Builds the `sh -c` argument for a task.
    pub fn shell_line(&self, task: &Task) -> String {
        if task.in_terminal && !self.terminal.trim().is_empty() {
            format!(
                "{} sh -c {}",
                self.terminal.trim(),
                crate::handler::shell_quote(&task.command)
            )
        } else {
            task.command.clone()
        }
    }

    /// Drops children that have exited.
    pub fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("task {} exited with {}", child.id(), status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("failed to check task {}: {}", child.id(), e);
                false
            }
        });
    }

    /// Number of tasks still running.
    pub fn running(&self) -> usize {
        self.children.len()
    }
}

impl TaskRunner for ShellRunner {
    fn run(&mut self, task: &Task) -> Result<()> {
        self.reap();

        let line = self.shell_line(task);
        debug!("running {:?} task: {}", task.purpose, line);
        let child = Command::new("sh")
            .args(["-c", &line])
            .stdin(Stdio::null())
            .spawn()
            .command_context(&line)?;
        self.children.push(child);
        Ok(())
    }
}

/// Records tasks instead of running them.
///
/// Clones share one log, so a clone can be handed to the registry while the
/// caller keeps another to inspect.
///
/// # Example
///
/// ```
/// use volmon_core::executor::{RecordingRunner, Task, TaskPurpose, TaskRunner};
///
/// let log = RecordingRunner::new();
/// let mut runner = log.clone();
/// runner.run(&Task::new("true", false, TaskPurpose::Hook)).unwrap();
/// assert_eq!(log.tasks().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    tasks: Rc<RefCell<Vec<Task>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.borrow().clone()
    }

    pub fn clear(&self) {
        self.tasks.borrow_mut().clear();
    }
}

impl TaskRunner for RecordingRunner {
    fn run(&mut self, task: &Task) -> Result<()> {
        self.tasks.borrow_mut().push(task.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_line_terminal_prefix() {
        let runner = ShellRunner::new("xterm -e");
        let task = Task::new("udevil info /dev/sdb1", true, TaskPurpose::Properties);
        assert_eq!(
            runner.shell_line(&task),
            "xterm -e sh -c 'udevil info /dev/sdb1'"
        );

        let task = Task::new("udevil mount /dev/sdb1", false, TaskPurpose::Mount);
        assert_eq!(runner.shell_line(&task), "udevil mount /dev/sdb1");
    }

    #[test]
    fn test_shell_line_without_terminal_configured() {
        let runner = ShellRunner::new("  ");
        let task = Task::new("echo hi", true, TaskPurpose::Hook);
        assert_eq!(runner.shell_line(&task), "echo hi");
    }

    #[test]
    fn test_shell_runner_spawns_and_reaps() {
        let mut runner = ShellRunner::new("");
        runner
            .run(&Task::new("exit 0", false, TaskPurpose::Hook))
            .unwrap();
        for child in runner.children.iter_mut() {
            child.wait().unwrap();
        }
        runner.reap();
        assert_eq!(runner.running(), 0);
    }

    #[test]
    fn test_recording_runner_shares_log() {
        let log = RecordingRunner::new();
        let mut runner = log.clone();
        runner
            .run(&Task::new("a", false, TaskPurpose::Mount))
            .unwrap();
        runner
            .run(&Task::new("b", true, TaskPurpose::Unmount))
            .unwrap();

        let tasks = log.tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].purpose, TaskPurpose::Unmount);

        log.clear();
        assert!(runner.tasks().is_empty());
    }
}
