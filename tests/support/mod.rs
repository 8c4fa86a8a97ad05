//! Scripted command runner and topology helpers shared by the
//! integration tests. No SSH or OVS is involved: every command the
//! controller would issue is answered from a canned table and recorded
//! for assertions.
#![allow(dead_code)]

use async_trait::async_trait;
use recira::executor::{CommandOutput, CommandRunner, Credential, ExecTarget};
use recira::{DhcpManager, HostRegistry, NetworkManager, TunnelManager};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct ScriptedRunner {
    responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    log: Mutex<Vec<(String, String)>>,
    inputs: Mutex<Vec<(String, String, String)>>,
}

impl ScriptedRunner {
    /// Unscripted commands succeed with empty output, so tests only spell
    /// out the answers they care about.
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedRunner {
            responses: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
        })
    }

    fn key(addr: &str, command: &str) -> String {
        format!("{}|{}", addr, command)
    }

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    pub fn respond(&self, addr: &str, command: &str, stdout: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(Self::key(addr, command), [Self::output(0, stdout, "")].into());
    }

    pub fn respond_err(&self, addr: &str, command: &str, stderr: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(Self::key(addr, command), [Self::output(1, "", stderr)].into());
    }

    /// Answer successive invocations of one command with different
    /// results; the last entry repeats once the sequence is exhausted.
    pub fn respond_seq(&self, addr: &str, command: &str, outputs: &[(i32, &str)]) {
        let queue: VecDeque<CommandOutput> = outputs
            .iter()
            .map(|(code, stdout)| Self::output(*code, stdout, if *code == 0 { "" } else { "error" }))
            .collect();
        self.responses
            .lock()
            .unwrap()
            .insert(Self::key(addr, command), queue);
    }

    fn next_response(&self, addr: &str, command: &str) -> CommandOutput {
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(&Self::key(addr, command)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Self::output(0, "", "")),
            None => Self::output(0, "", ""),
        }
    }

    /// Every command issued to `addr`, in order.
    pub fn commands_for(&self, addr: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == addr)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Every command issued to any target, in order.
    pub fn all_commands(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|(a, c)| format!("{}|{}", a, c))
            .collect()
    }

    pub fn issued(&self, addr: &str, command: &str) -> bool {
        self.commands_for(addr).iter().any(|c| c == command)
    }

    /// Stdin payloads shipped with `execute_with_input`, as
    /// (addr, command, content) triples.
    pub fn inputs(&self) -> Vec<(String, String, String)> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, target: &ExecTarget, command: &str, _: Duration) -> CommandOutput {
        let addr = target.label().to_string();
        self.log
            .lock()
            .unwrap()
            .push((addr.clone(), command.to_string()));
        self.next_response(&addr, command)
    }

    async fn execute_with_input(
        &self,
        target: &ExecTarget,
        command: &str,
        input: &[u8],
        _: Duration,
    ) -> CommandOutput {
        let addr = target.label().to_string();
        self.log
            .lock()
            .unwrap()
            .push((addr.clone(), command.to_string()));
        self.inputs.lock().unwrap().push((
            addr.clone(),
            command.to_string(),
            String::from_utf8_lossy(input).into_owned(),
        ));
        self.next_response(&addr, command)
    }
}

/// One registry plus managers, backed by a scripted runner and a scratch
/// directory for the state files.
pub struct Harness {
    pub runner: Arc<ScriptedRunner>,
    pub registry: HostRegistry,
    pub tunnels: TunnelManager,
    pub networks: NetworkManager,
    pub dhcp: DhcpManager,
    pub dir: TempDir,
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

impl Harness {
    pub fn new() -> Self {
        let runner = ScriptedRunner::new();
        let dir = TempDir::new().expect("temp dir");
        let registry = HostRegistry::new(
            dir.path().join("hosts.json"),
            runner.clone(),
            TIMEOUT,
        );
        let tunnels = TunnelManager::new(runner.clone(), TIMEOUT);
        let networks = NetworkManager::new(dir.path().join("networks.json"));
        let dhcp = DhcpManager::new(
            dir.path().join("dhcp.json"),
            runner.clone(),
            TIMEOUT,
            TIMEOUT,
        );
        Harness {
            runner,
            registry,
            tunnels,
            networks,
            dhcp,
            dir,
        }
    }

    /// Script the registration probes for a host and register it. Bridges
    /// get sequential datapath ids.
    pub async fn register(&mut self, addr: &str, hostname: &str, bridges: &[&str]) -> u32 {
        script_host(&self.runner, addr, hostname, bridges);
        self.registry
            .register_remote(addr, "root", Credential::Password("secret".to_string()), None)
            .await
            .unwrap_or_else(|err| panic!("registering {} failed: {}", addr, err))
            .id
    }
}

/// Canned answers for the probes registration issues against a host.
pub fn script_host(runner: &ScriptedRunner, addr: &str, hostname: &str, bridges: &[&str]) {
    runner.respond(addr, "hostname", hostname);
    runner.respond(
        addr,
        "ovs-vsctl --version",
        "ovs-vsctl (Open vSwitch) 2.17.9\nDB Schema 8.3.0",
    );
    runner.respond(addr, "ovs-vsctl list-br", &bridges.join("\n"));
    for (i, bridge) in bridges.iter().enumerate() {
        runner.respond(
            addr,
            &format!("ovs-vsctl get bridge {} datapath-id", bridge),
            &format!("\"{:016x}\"", i + 1),
        );
        runner.respond(addr, &format!("ovs-vsctl get-fail-mode {}", bridge), "standalone");
    }
}
