//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io::Write;
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::directory::{
    DirectoryError, DirectoryFuture, Instance, InstanceDirectory, InstancePage,
};
use crate::exec::{CommandOutput, CommandRunner, ExecError, OutputSink};
use crate::fleet::FleetNode;
use crate::session::{Connection, Connector, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Streaming calls write the scripted stdout and stderr into the sink.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn next_response(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| ExecError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        self.next_response(program, args)
    }

    fn run_streaming(
        &self,
        program: &str,
        args: &[OsString],
        sink: &mut OutputSink,
    ) -> Result<Option<i32>, ExecError> {
        let output = self.next_response(program, args)?;
        sink.write_all(output.stdout.as_bytes())
            .and_then(|()| sink.write_all(output.stderr.as_bytes()))
            .map_err(|err| ExecError::Sink {
                path: sink.path().to_string(),
                message: err.to_string(),
            })?;
        Ok(output.code)
    }

    fn run_detached(&self, program: &str, args: &[OsString]) -> Result<Option<i32>, ExecError> {
        self.next_response(program, args).map(|output| output.code)
    }
}

/// Observable action performed through a [`FakeConnector`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FakeEvent {
    /// A connection was opened.
    Connected {
        /// Node name.
        node: String,
    },
    /// A payload was delivered.
    Delivered {
        /// Node name.
        node: String,
        /// Payload path.
        payload: String,
    },
    /// A command started.
    Started {
        /// Node name.
        node: String,
        /// Command text.
        command: String,
    },
    /// A command finished, successfully or not.
    Finished {
        /// Node name.
        node: String,
        /// Command text.
        command: String,
    },
    /// A connection was closed.
    Closed {
        /// Node name.
        node: String,
    },
}

impl FakeEvent {
    /// Node the event belongs to.
    #[must_use]
    pub fn node(&self) -> &str {
        match self {
            Self::Connected { node }
            | Self::Delivered { node, .. }
            | Self::Started { node, .. }
            | Self::Finished { node, .. }
            | Self::Closed { node } => node,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    events: Vec<FakeEvent>,
    fail_connect: BTreeSet<String>,
    fail_delivery: BTreeSet<String>,
    fail_close: BTreeSet<String>,
    fail_commands: BTreeSet<(String, String)>,
    panic_commands: BTreeSet<(String, String)>,
    rendezvous: Option<RendezvousPoint>,
}

#[derive(Clone, Debug)]
struct RendezvousPoint {
    command: String,
    parties: usize,
    timeout: Duration,
}

/// Meeting point shared by every connection of one connector.
#[derive(Debug, Default)]
struct Gate {
    arrived: Mutex<usize>,
    all_arrived: Condvar,
}

impl Gate {
    /// Blocks until `parties` callers have arrived or `timeout` elapses.
    /// Returns `false` on timeout.
    fn arrive_and_wait(&self, parties: usize, timeout: Duration) -> bool {
        let mut count = lock(&self.arrived);
        *count += 1;
        self.all_arrived.notify_all();
        let (guard, _timeout) = self
            .all_arrived
            .wait_timeout_while(count, timeout, |arrived| *arrived < parties)
            .unwrap_or_else(PoisonError::into_inner);
        *guard >= parties
    }
}

/// In-memory connector whose connections record every action.
///
/// Clones share state, so a clone kept by the test observes everything the
/// connector under test does.
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
    gate: Arc<Gate>,
}

impl FakeConnector {
    /// Creates a connector where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes connecting to `node` fail.
    #[must_use]
    pub fn fail_connect_for(self, node: &str) -> Self {
        lock(&self.state).fail_connect.insert(node.to_owned());
        self
    }

    /// Makes payload delivery to `node` fail.
    #[must_use]
    pub fn fail_delivery_for(self, node: &str) -> Self {
        lock(&self.state).fail_delivery.insert(node.to_owned());
        self
    }

    /// Makes closing the connection to `node` fail.
    #[must_use]
    pub fn fail_close_for(self, node: &str) -> Self {
        lock(&self.state).fail_close.insert(node.to_owned());
        self
    }

    /// Makes `command` exit non-zero on `node`.
    #[must_use]
    pub fn fail_command(self, node: &str, command: &str) -> Self {
        lock(&self.state)
            .fail_commands
            .insert((node.to_owned(), command.to_owned()));
        self
    }

    /// Makes the worker running `command` on `node` panic.
    #[must_use]
    pub fn panic_on_command(self, node: &str, command: &str) -> Self {
        lock(&self.state)
            .panic_commands
            .insert((node.to_owned(), command.to_owned()));
        self
    }

    /// Makes every host running `command` wait inside it until `parties`
    /// hosts have reached it. A host still waiting after `timeout` fails the
    /// command.
    #[must_use]
    pub fn rendezvous_on(self, command: &str, parties: usize, timeout: Duration) -> Self {
        lock(&self.state).rendezvous = Some(RendezvousPoint {
            command: command.to_owned(),
            parties,
            timeout,
        });
        self
    }

    /// Snapshot of every recorded event, in order.
    #[must_use]
    pub fn events(&self) -> Vec<FakeEvent> {
        lock(&self.state).events.clone()
    }

    /// Snapshot of the events recorded for `node`, in order.
    #[must_use]
    pub fn events_for(&self, node: &str) -> Vec<FakeEvent> {
        lock(&self.state)
            .events
            .iter()
            .filter(|event| event.node() == node)
            .cloned()
            .collect()
    }

    /// Nodes with a connection opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> BTreeSet<String> {
        let state = lock(&self.state);
        let mut open = BTreeSet::new();
        for event in &state.events {
            match event {
                FakeEvent::Connected { node } => {
                    open.insert(node.clone());
                }
                FakeEvent::Closed { node } => {
                    open.remove(node);
                }
                _ => {}
            }
        }
        open
    }

    /// Number of close calls that reached the transport for `node`.
    #[must_use]
    pub fn close_count(&self, node: &str) -> usize {
        lock(&self.state)
            .events
            .iter()
            .filter(|event| matches!(event, FakeEvent::Closed { node: closed } if closed == node))
            .count()
    }
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    fn connect(
        &self,
        node: &FleetNode,
        _address: IpAddr,
    ) -> Result<Self::Connection, TransportError> {
        let mut state = lock(&self.state);
        if state.fail_connect.contains(&node.name) {
            return Err(TransportError::new("connection refused"));
        }
        state.events.push(FakeEvent::Connected {
            node: node.name.clone(),
        });
        Ok(FakeConnection {
            node: node.name.clone(),
            state: Arc::clone(&self.state),
            gate: Arc::clone(&self.gate),
            closed: false,
        })
    }
}

/// Connection produced by [`FakeConnector`].
#[derive(Debug)]
pub struct FakeConnection {
    node: String,
    state: Arc<Mutex<FakeState>>,
    gate: Arc<Gate>,
    closed: bool,
}

impl FakeConnection {
    fn record(&self, event: FakeEvent) {
        lock(&self.state).events.push(event);
    }
}

impl Connection for FakeConnection {
    fn deliver(&mut self, payload: &Utf8Path) -> Result<(), TransportError> {
        let failing = lock(&self.state).fail_delivery.contains(&self.node);
        if failing {
            return Err(TransportError::new("scp exited with status 1"));
        }
        self.record(FakeEvent::Delivered {
            node: self.node.clone(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn execute(&mut self, command: &str, sink: &mut OutputSink) -> Result<(), TransportError> {
        let key = (self.node.clone(), command.to_owned());
        let (failing, panicking, rendezvous) = {
            let state = lock(&self.state);
            (
                state.fail_commands.contains(&key),
                state.panic_commands.contains(&key),
                state
                    .rendezvous
                    .clone()
                    .filter(|point| point.command == command),
            )
        };
        self.record(FakeEvent::Started {
            node: self.node.clone(),
            command: command.to_owned(),
        });
        if panicking {
            let message = format!("scripted panic while running {command}");
            std::panic::resume_unwind(Box::new(message));
        }
        if let Some(point) = rendezvous
            && !self.gate.arrive_and_wait(point.parties, point.timeout)
        {
            self.record(FakeEvent::Finished {
                node: self.node.clone(),
                command: command.to_owned(),
            });
            return Err(TransportError::new(format!(
                "gave up waiting for {} hosts at `{command}`",
                point.parties
            )));
        }
        let written = writeln!(sink, "{}: {command}", self.node);
        self.record(FakeEvent::Finished {
            node: self.node.clone(),
            command: command.to_owned(),
        });
        written.map_err(|err| TransportError::new(err.to_string()))?;
        if failing {
            return Err(TransportError::new("exited with status 1"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.record(FakeEvent::Closed {
            node: self.node.clone(),
        });
        if lock(&self.state).fail_close.contains(&self.node) {
            return Err(TransportError::new("control socket vanished"));
        }
        Ok(())
    }
}

/// In-memory directory serving fixed pages.
#[derive(Clone, Debug, Default)]
pub struct PagedDirectory {
    pages: Vec<Vec<Instance>>,
    failure: Option<(u32, String)>,
    requested: Arc<Mutex<Vec<u32>>>,
}

impl PagedDirectory {
    /// Serves `pages` as pages 1..=N.
    #[must_use]
    pub fn new(pages: Vec<Vec<Instance>>) -> Self {
        Self {
            pages,
            failure: None,
            requested: Arc::default(),
        }
    }

    /// Makes `page` fail with a provider error carrying `message`.
    #[must_use]
    pub fn failing_on_page(mut self, page: u32, message: &str) -> Self {
        self.failure = Some((page, message.to_owned()));
        self
    }

    /// Pages requested so far, in order.
    #[must_use]
    pub fn requested_pages(&self) -> Vec<u32> {
        lock(&self.requested).clone()
    }

    fn page(&self, page: u32) -> Result<InstancePage, DirectoryError> {
        lock(&self.requested).push(page);
        if let Some((failing, message)) = &self.failure
            && *failing == page
        {
            return Err(DirectoryError::Provider {
                message: message.clone(),
            });
        }
        let index = usize::try_from(page.saturating_sub(1)).unwrap_or(usize::MAX);
        let instances = self.pages.get(index).cloned().unwrap_or_default();
        let next_page = (index + 1 < self.pages.len()).then(|| page + 1);
        Ok(InstancePage {
            instances,
            next_page,
        })
    }
}

impl InstanceDirectory for PagedDirectory {
    fn list_page(&self, page: u32) -> DirectoryFuture<'_, InstancePage> {
        let result = self.page(page);
        Box::pin(async move { result })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    ///
    /// `None` values remove the variable for the lifetime of the guard.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(new_value) => env::set_var(key, new_value),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
