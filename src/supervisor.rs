//! The orchestrator. Owns the process-global state (pod registry, network
//! plane, port forwarder, multiplexer) and runs the single event loop that
//! serializes command dispatch, lifecycle handling and container launches.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{self, Pid};
use std::convert::TryFrom;
use tabwriter::TabWriter;

use crate::console::{commands, frame, Command, Multiplexer};
use crate::container::registry::PidRole;
use crate::container::{
    member_id, pod_letter_from, split_container_id, Container, ContainerSpec, ContainerStatus,
    ExecutionMode, NamespaceType, Registry,
};
use crate::logger::{self, GREEN, RED, RESET};
use crate::network::{NetworkPlane, PortForwarder, Subnet};
use crate::process::launcher;
use crate::reaper::{self, Event};
use crate::seccomp::Profile;
use crate::syscall::linux::LinuxSyscall;
use crate::{cgroups, signal};

pub enum Flow {
    Continue,
    Exit,
}

pub struct Supervisor {
    pub registry: Registry,
    pub network: NetworkPlane,
    pub forwarder: PortForwarder,
    pub mux: Arc<Multiplexer>,
    pub events_tx: Sender<Event>,
    pub launch_lock: Mutex<()>,
    pub syscall: LinuxSyscall,
    rootfs: PathBuf,
}

impl Supervisor {
    /// One-time startup: subreaper flag, cgroup v2 checks, the global
    /// network plane and the background reaper/signal threads. Failures
    /// here abort the program.
    pub fn setup(bridge: &str, subnet: Subnet, rootfs: PathBuf) -> Result<(Arc<Self>, Receiver<Event>)> {
        // orphaned workloads reparent to us instead of to pid 1, so the
        // reaper sees their exits
        prctl::set_child_subreaper(true)
            .map_err(|e| anyhow!("failed to set child subreaper: {}", e))?;

        cgroups::ensure_v2().context("cgroup v2 is required")?;
        if let Err(e) = cgroups::enable_controllers(Path::new(cgroups::DEFAULT_CGROUP_ROOT)) {
            log::warn!("could not enable cgroup controllers: {:#}", e);
        }

        let network = NetworkPlane::setup(bridge, subnet).context("host network setup failed")?;

        let (events_tx, events_rx) = unbounded();
        let mux = Multiplexer::new(events_tx.clone());
        reaper::start(events_tx.clone())?;
        signal::start_forwarder(events_tx.clone())?;

        let sup = Arc::new(Self {
            registry: Registry::new(),
            network,
            forwarder: PortForwarder::new(),
            mux,
            events_tx,
            launch_lock: Mutex::new(()),
            syscall: LinuxSyscall,
            rootfs,
        });
        Ok((sup, events_rx))
    }

    /// The supervisor's main loop. Every command and every lifecycle event
    /// funnels through here, one at a time.
    pub fn run(&self, rx: &Receiver<Event>) {
        while let Ok(event) = rx.recv() {
            match event {
                Event::Command(line) => {
                    if let Flow::Exit = self.dispatch(&line, rx) {
                        return;
                    }
                }
                Event::Exited { pid, status } => self.handle_exit(pid, status),
                Event::Signal(sig) => self.forward_signal(sig),
                Event::OutputClosed(id) => self.handle_workload_gone(&id),
            }
        }
    }

    fn dispatch(&self, line: &str, rx: &Receiver<Event>) -> Flow {
        match commands::parse(line) {
            Err(usage) => {
                if !usage.is_empty() {
                    self.mux.println_above_prompt(&usage);
                }
            }
            Ok(Command::Exit) => {
                self.shutdown(rx);
                return Flow::Exit;
            }
            Ok(command) => self.run_command(command),
        }
        self.mux.refresh_prompt();
        Flow::Continue
    }

    fn run_command(&self, command: Command) {
        match command {
            Command::NewPod => {
                let lines = match self.start_new_pod(ExecutionMode::Interactive, None) {
                    Ok(letter) => vec![format!("[+] Created Pod [{}]", letter)],
                    Err(e) => vec![format!("[-] Start NetRoot failed: {:#}", e)],
                };
                self.print_box("POD MANAGEMENT", &lines);
            }
            Command::NewJoiners { letter, count } => {
                let lines = self.start_joiners(letter, count, None);
                self.print_box("POD MANAGEMENT", &lines);
            }
            Command::List => self.cmd_list(),
            Command::ListPod(letter) => self.cmd_list_pod(letter),
            Command::Attach(id) => self.cmd_attach(&id),
            Command::ExecOne { id, cmd } => self.cmd_exec(&[id], &cmd),
            Command::ExecAll { cmd } => {
                let ids = self.mux.known_ids();
                self.cmd_exec(&ids, &cmd);
            }
            Command::ExecExcept { id, cmd } => {
                let ids: Vec<String> = self
                    .mux
                    .known_ids()
                    .into_iter()
                    .filter(|known| *known != id)
                    .collect();
                self.cmd_exec(&ids, &cmd);
            }
            Command::Run { letter, cmd } => {
                let lines = match letter {
                    None => match self.start_new_pod(ExecutionMode::Batch, Some(&cmd)) {
                        Ok(letter) => vec![format!("[+] Batch Pod [{}] running: {}", letter, cmd)],
                        Err(e) => vec![format!("[-] Batch start failed: {:#}", e)],
                    },
                    Some(letter) => self.start_joiners(letter, 1, Some(&cmd)),
                };
                self.print_box("POD MANAGEMENT", &lines);
            }
            Command::Kill { letter, index } => {
                let lines = self.cmd_kill(letter, index);
                self.print_box("POD MANAGEMENT", &lines);
            }
            Command::Forward { target, port } => {
                let lines = self.cmd_forward(&target, port);
                self.print_box("PORT FORWARD", &lines);
            }
            Command::Clear => self.mux.print_block("\x1b[2J\x1b[H"),
            Command::Help => self.mux.print_block(&commands::help_text()),
            Command::Exit => unreachable!("handled in dispatch"),
        }
    }

    /// Allocates the next pod letter and launches its NetRoot.
    fn start_new_pod(&self, mode: ExecutionMode, batch_cmd: Option<&str>) -> Result<char> {
        let letter = self.registry.next_pod_letter()?;
        let id = member_id(letter, 1);

        let mut spec = ContainerSpec::creator(&id, mode, Profile::DebugShell);
        spec.fs.rootfs = self.rootfs.clone();
        if let Some(cmd) = batch_cmd {
            spec = spec.with_batch_command(cmd);
        }

        log::info!("container {} = NetRoot of pod [{}]", id, letter);
        self.launch(spec)?;
        Ok(letter)
    }

    fn start_joiners(&self, letter: char, count: u32, batch_cmd: Option<&str>) -> Vec<String> {
        let root_id = member_id(letter, 1);
        if !self.registry.contains(&root_id) {
            return vec![format!("[-] Error: Pod {} does not exist", letter)];
        }

        let mut lines = Vec::new();
        for _ in 0..count {
            let index = self.registry.next_member_index(letter);
            let id = member_id(letter, index);

            let mut spec =
                ContainerSpec::joiner(&id, &root_id, ExecutionMode::Interactive, Profile::DebugShell);
            spec.fs.rootfs = self.rootfs.clone();
            if let Some(cmd) = batch_cmd {
                spec = spec.with_batch_command(cmd);
            }

            log::info!("container {} = joiner of {}", id, root_id);
            match self.launch(spec) {
                Ok(()) => lines.push(format!("[+] Container [{}] joined Pod [{}]", id, letter)),
                Err(e) => lines.push(format!("[-] Joiner {} failed: {:#}", id, e)),
            }
        }
        lines
    }

    /// Claims the id in the registry and runs the launch dance. A claim
    /// whose init never came to life is rolled back here; anything later
    /// is torn down by the reaper.
    fn launch(&self, spec: ContainerSpec) -> Result<()> {
        let id = spec.id.clone();
        self.registry.insert(Container::new(spec.clone()));

        let result = launcher::launch(self, &spec);
        if result.is_err() {
            let fork_failed = self
                .registry
                .with_container(&id, |c| c.init_pid.is_none())
                .unwrap_or(false);
            if fork_failed {
                self.registry.remove(&id);
            }
        }
        result
    }

    fn cmd_list(&self) {
        let summaries = self.registry.summaries();
        let mut lines = Vec::new();

        let mut pods: Vec<char> = summaries
            .iter()
            .filter_map(|s| split_container_id(&s.id).map(|(letter, _)| letter))
            .collect();
        pods.sort_unstable();
        pods.dedup();

        if pods.is_empty() {
            lines.push("No running pods".to_string());
        }
        for letter in pods {
            let members: Vec<_> = summaries
                .iter()
                .filter(|s| split_container_id(&s.id).map(|(l, _)| l) == Some(letter))
                .collect();
            let total = members.len();
            let alive = members
                .iter()
                .filter(|s| s.status == ContainerStatus::Running)
                .count();
            let dead = total - alive;

            let mut line = format!(
                "Pod [{}] {} Total:{} Alive:{} Dead:{}",
                letter,
                health_bar(alive, total),
                total,
                alive,
                dead
            );
            let ports = self.forwarder.ports(letter);
            if !ports.is_empty() {
                let rendered: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                line.push_str(&format!(" ports:{}", rendered.join(",")));
            }
            lines.push(line);
        }
        self.print_box("POD STATUS", &lines);
    }

    fn cmd_list_pod(&self, letter: char) {
        let rows: Vec<_> = self
            .registry
            .summaries()
            .into_iter()
            .filter(|s| split_container_id(&s.id).map(|(l, _)| l) == Some(letter))
            .collect();
        if rows.is_empty() {
            self.print_box(
                &format!("POD [{}] STATUS", letter),
                &[format!("[-] Error: Pod {} does not exist", letter)],
            );
            return;
        }

        let mut tw = TabWriter::new(Vec::new());
        let _ = writeln!(tw, "ID\tSTATUS\tINIT\tWORKLOAD\tIP\tHEALTH");
        for row in rows {
            let health = if row.workload_pid.map(process_alive).unwrap_or(false) {
                format!("{}ALIVE{}", GREEN, RESET)
            } else {
                format!("{}DEAD{}", RED, RESET)
            };
            let _ = writeln!(
                tw,
                "{}\t{}\t{}\t{}\t{}\t{}",
                row.id,
                row.status,
                row.init_pid.map(|p| p.to_string()).unwrap_or_default(),
                row.workload_pid.map(|p| p.to_string()).unwrap_or_default(),
                row.ip.unwrap_or_default(),
                health,
            );
        }
        let _ = tw.flush();
        let lines: Vec<String> = tw
            .into_inner()
            .ok()
            .map(|buf| String::from_utf8_lossy(&buf).lines().map(String::from).collect())
            .unwrap_or_default();
        self.print_box(&format!("POD [{}] STATUS", letter), &lines);
    }

    fn cmd_attach(&self, id: &str) {
        if self.mux.attach(id) {
            self.mux
                .println_above_prompt(&format!("[!] Attached to {}. (Ctrl+X to detach)", id));
            // nudge the shell so its prompt shows up right away
            self.mux.write_to(id, b"\r");
        } else {
            self.mux
                .println_above_prompt(&format!("[-] Unknown container: {}", id));
        }
    }

    fn cmd_exec(&self, ids: &[String], cmd: &str) {
        if ids.is_empty() {
            self.mux.println_above_prompt("[-] No target containers");
            return;
        }
        for id in ids {
            match self.mux.workload_pid(id) {
                Some(pid) => self.mux.print_block(&commands::exec_in_container(id, pid, cmd)),
                None => self
                    .mux
                    .println_above_prompt(&format!("[-] Unknown container: {}", id)),
            }
        }
    }

    fn cmd_kill(&self, letter: char, index: Option<u32>) -> Vec<String> {
        let targets = match index {
            Some(index) => {
                let id = member_id(letter, index);
                if self.registry.contains(&id) {
                    vec![id]
                } else {
                    return vec![format!("[-] Unknown container: {}", id)];
                }
            }
            None => {
                let members = self.registry.pod_members(letter);
                if members.is_empty() {
                    return vec![format!("[-] Error: Pod {} does not exist", letter)];
                }
                members
            }
        };

        let mut lines = Vec::new();
        for id in &targets {
            let pid = self
                .registry
                .with_container(id, |c| if c.can_kill() { c.workload_pid } else { None })
                .flatten();
            match pid {
                Some(pid) => {
                    let _ = kill(pid, Signal::SIGKILL);
                    lines.push(format!("[+] Killed {} (PID {})", id, pid));
                }
                None => lines.push(format!("[-] {} has no running workload", id)),
            }
        }

        // killing the whole pod releases the NetRoot immediately instead
        // of waiting for the last joiner to be reaped
        if index.is_none() {
            self.release_keep_alive(letter);
        }
        lines
    }

    fn cmd_forward(&self, target: &str, port: u16) -> Vec<String> {
        let letter = match pod_letter_from(target) {
            Some(letter) => letter,
            None => return vec![format!("[-] Invalid pod or container id: {}", target)],
        };
        let root_id = member_id(letter, 1);

        let netns_fd = match self.registry.dup_handle(&root_id, NamespaceType::Net) {
            Ok(fd) => fd,
            Err(e) => return vec![format!("[-] Pod {} has no network: {:#}", letter, e)],
        };
        match self.forwarder.add_session(letter, port, netns_fd) {
            Ok(()) => vec![format!(
                "[+] Forwarding host :{} into pod [{}] (127.0.0.1:{})",
                port, letter, port
            )],
            Err(e) => vec![format!("[-] Forward failed: {:#}", e)],
        }
    }

    /// A workload is gone (its output stream hung up, or it was reaped as
    /// an orphan). Marks the container Stopped and releases the pod's
    /// NetRoot when nothing else keeps the pod alive.
    fn handle_workload_gone(&self, id: &str) {
        let info = self
            .registry
            .with_container(id, |c| {
                let was_running = c.status == ContainerStatus::Running;
                c.set_stopped();
                (was_running, c.is_net_root(), c.pod_letter())
            });

        if let Some((was_running, is_net_root, Some(letter))) = info {
            if was_running {
                log::info!("workload of {} exited", id);
            }
            if is_net_root {
                let members = self.registry.pod_members(letter);
                if members.len() == 1 && members[0] == id {
                    self.release_keep_alive(letter);
                }
            }
        }
    }

    /// A reaped PID. Workload orphans flow into the Stopped path; init
    /// exits drive the full container teardown. Nothing else ever removes
    /// a container from the registry.
    fn handle_exit(&self, pid: Pid, status: WaitStatus) {
        let (id, role) = match self.registry.find_by_pid(pid) {
            Some(hit) => hit,
            None => {
                log::debug!("reaped unknown pid {}", pid);
                return;
            }
        };

        log_exit_status(&id, status);
        match role {
            PidRole::Workload => self.handle_workload_gone(&id),
            PidRole::Init => self.teardown_container(&id),
        }
    }

    fn teardown_container(&self, id: &str) {
        // the init is gone: Stopped becomes Exited before the entry leaves
        // the registry, so concurrent pod-membership reads no longer count
        // this container
        self.registry.with_container(id, |c| c.set_exited());
        let container = match self.registry.remove(id) {
            Some(c) => c,
            None => return,
        };

        self.mux.unregister(id);
        if let Some(net) = &container.net {
            self.network.teardown_pod(net);
        }
        self.registry.release_handles(id, &container.spec.shares);
        if let Some(fd) = container.keep_alive_fd {
            let _ = unistd::close(fd);
        }

        if let Some(letter) = container.pod_letter() {
            let members = self.registry.pod_members(letter);
            if members.is_empty() {
                self.forwarder.cancel_pod(letter);
                logger::success(&format!("pod [{}] removed", letter));
            } else if members.len() == 1 {
                // only the NetRoot remains; release it once its own
                // workload is done
                let root = members[0].clone();
                let root_stopped = self
                    .registry
                    .with_container(&root, |c| {
                        c.is_net_root() && c.status == ContainerStatus::Stopped
                    })
                    .unwrap_or(false);
                if root_stopped {
                    self.release_keep_alive(letter);
                }
            }
        }
    }

    fn release_keep_alive(&self, letter: char) {
        let root_id = member_id(letter, 1);
        let fd = self
            .registry
            .with_container(&root_id, |c| c.keep_alive_fd.take())
            .flatten();
        if let Some(fd) = fd {
            log::debug!("releasing keep-alive of {}", root_id);
            let _ = unistd::close(fd);
        }
    }

    fn forward_signal(&self, sig: i32) {
        let signal = match Signal::try_from(sig) {
            Ok(signal) => signal,
            Err(_) => return,
        };
        log::info!("forwarding {:?} to all pods", signal);
        for pid in self.registry.all_init_pids() {
            let _ = kill(pid, signal);
        }
    }

    /// Synchronous shutdown: SIGKILL every workload, release every
    /// keep-alive, drain the reaper until the registry empties, then tear
    /// down the global network.
    fn shutdown(&self, rx: &Receiver<Event>) {
        log::info!("shutting down all pods");

        for summary in self.registry.summaries() {
            if let Some(pid) = summary.workload_pid {
                let _ = kill(pid, Signal::SIGKILL);
            }
            if let Some((letter, _)) = split_container_id(&summary.id) {
                self.release_keep_alive(letter);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.registry.is_empty() && Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Event::Exited { pid, status }) => self.handle_exit(pid, status),
                Ok(Event::OutputClosed(id)) => self.handle_workload_gone(&id),
                Ok(_) => {}
                Err(_) => {}
            }
        }
        if !self.registry.is_empty() {
            log::warn!("shutdown timed out with containers still registered");
        }

        self.forwarder.cancel_all();
        self.network.teardown();
        logger::success("bctor shut down");
    }

    fn print_box(&self, title: &str, lines: &[String]) {
        self.mux.print_block(&frame::draw_box(title, lines));
    }
}

fn health_bar(alive: usize, total: usize) -> String {
    const CELLS: usize = 10;
    let filled = if total == 0 { 0 } else { alive * CELLS / total };
    format!(
        "{}{}{}{}{}",
        GREEN,
        "█".repeat(filled),
        RED,
        "░".repeat(CELLS - filled),
        RESET
    )
}

fn process_alive(pid: Pid) -> bool {
    use procfs::process::ProcState;
    match procfs::process::Process::new(pid.as_raw()) {
        Ok(process) => !matches!(
            process.stat.state(),
            Ok(ProcState::Zombie) | Ok(ProcState::Dead)
        ),
        Err(_) => false,
    }
}

fn log_exit_status(id: &str, status: WaitStatus) {
    match status {
        WaitStatus::Exited(_, code) => log::info!("{}: exit status {}", id, code),
        WaitStatus::Signaled(_, signal, _) => {
            log::info!("{}: killed by {:?} (status {})", id, signal, 128 + signal as i32)
        }
        _ => {}
    }
}
