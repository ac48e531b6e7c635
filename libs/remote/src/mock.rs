//! In-memory machines for tests.
//!
//! A [`MockMachine`] keeps a file map and a journal of executed commands.
//! Commands are answered by a handler closure; without one every command
//! succeeds with empty output. Faults are injected explicitly:
//! [`MockMachine::drop_next_exec`] loses the session before the command runs,
//! [`MockMachine::sever_sessions`] invalidates every open session and
//! [`MockMachine::set_unreachable`] refuses new connections.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::options::{CommandOutput, Target};
use crate::transport::{Connector, Session, TransportError};

/// Answers a command run on a mock machine.
pub type CommandHandler = Arc<dyn Fn(&MockMachine, &str) -> CommandOutput + Send + Sync>;

#[derive(Debug, Default)]
struct MachineState {
    files: BTreeMap<String, String>,
    commands: Vec<String>,
    connects: u32,
    pending_drops: u32,
    generation: u64,
    unreachable: bool,
}

/// A fake host.
#[derive(Default)]
pub struct MockMachine {
    state: Mutex<MachineState>,
    handler: Mutex<Option<CommandHandler>>,
}

impl std::fmt::Debug for MockMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMachine")
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl MockMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a machine answering commands with `handler`.
    pub fn with_handler<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&MockMachine, &str) -> CommandOutput + Send + Sync + 'static,
    {
        let machine = Self::new();
        machine.set_handler(handler);
        machine
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&MockMachine, &str) -> CommandOutput + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn write_file(&self, path: &str, contents: impl Into<String>) {
        self.lock().files.insert(path.to_string(), contents.into());
    }

    /// Remove a file, returning true if it existed.
    pub fn remove_file(&self, path: &str) -> bool {
        self.lock().files.remove(path).is_some()
    }

    /// Paths of every file on the machine.
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Commands that actually ran, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of successful connects.
    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    /// Lose the session on the next command, before it runs.
    pub fn drop_next_exec(&self) {
        self.lock().pending_drops += 1;
    }

    /// Invalidate every open session.
    pub fn sever_sessions(&self) {
        self.lock().generation += 1;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    fn execute(&self, command: &str) -> CommandOutput {
        self.lock().commands.push(command.to_string());
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(self, command),
            None => CommandOutput::default(),
        }
    }
}

/// Connects targets to mock machines by address.
#[derive(Default)]
pub struct MockConnector {
    machines: Mutex<HashMap<String, Arc<MockMachine>>>,
    default_handler: Option<CommandHandler>,
}

impl MockConnector {
    /// A connector that only knows machines added with [`add_machine`](Self::add_machine).
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that creates a machine on first connect to an unknown
    /// address, answering commands with `handler`.
    pub fn auto_provision<F>(handler: F) -> Self
    where
        F: Fn(&MockMachine, &str) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            machines: Mutex::default(),
            default_handler: Some(Arc::new(handler)),
        }
    }

    pub fn add_machine(&self, address: &str, machine: Arc<MockMachine>) {
        self.lock().insert(address.to_string(), machine);
    }

    pub fn machine(&self, address: &str) -> Option<Arc<MockMachine>> {
        self.lock().get(address).cloned()
    }

    /// Every known machine, by address.
    pub fn machines(&self) -> BTreeMap<String, Arc<MockMachine>> {
        self.lock()
            .iter()
            .map(|(address, machine)| (address.clone(), machine.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MockMachine>>> {
        self.machines.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, address: &str) -> Option<Arc<MockMachine>> {
        let mut machines = self.lock();
        if let Some(machine) = machines.get(address) {
            return Some(machine.clone());
        }
        let handler = self.default_handler.clone()?;
        let machine = Arc::new(MockMachine {
            state: Mutex::default(),
            handler: Mutex::new(Some(handler)),
        });
        machines.insert(address.to_string(), machine.clone());
        Some(machine)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, TransportError> {
        let machine = self
            .resolve(&target.address)
            .ok_or_else(|| TransportError::Connect(format!("{target}: no route to host")))?;

        let generation = {
            let mut state = machine.lock();
            if state.unreachable {
                return Err(TransportError::Connect(format!("{target}: connection refused")));
            }
            state.connects += 1;
            state.generation
        };

        debug!(target = %target, "[MOCK] Connected");
        Ok(Box::new(MockSession {
            machine,
            generation,
            closed: false,
        }))
    }
}

struct MockSession {
    machine: Arc<MockMachine>,
    generation: u64,
    closed: bool,
}

impl MockSession {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.closed || self.machine.lock().generation != self.generation {
            return Err(TransportError::Disconnected("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MockSession {
    async fn probe(&mut self) -> Result<(), TransportError> {
        self.check_alive()
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        self.check_alive()?;
        {
            let mut state = self.machine.lock();
            if state.pending_drops > 0 {
                state.pending_drops -= 1;
                state.generation += 1;
                return Err(TransportError::Disconnected(
                    "connection reset during command".to_string(),
                ));
            }
        }
        Ok(self.machine.execute(command))
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.check_alive()?;
        let contents = tokio::fs::read_to_string(local).await?;
        self.machine.write_file(remote, contents);
        Ok(())
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.check_alive()?;
        let contents = self
            .machine
            .file(remote)
            .ok_or_else(|| TransportError::Transfer(format!("{remote}: no such file")))?;
        tokio::fs::write(local, contents).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
