//! In-memory stand-ins for the SSH layer, shared by unit tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SessionError};
use crate::exec::RawOutput;
use crate::ssh::connector::CredentialSource;
use crate::ssh::sftp::{RemoteFileEntry, RemoteFs, RemoteReader};
use crate::ssh::{Connector, Credential, ShellChannel, ShellChunk, SshTarget, Transport};
use crate::transfer::rsync::{SyncOutcome, SyncProgram};
use crate::workdir;

/// A remote machine: a filesystem tree and a home directory.
#[derive(Debug)]
pub struct FakeHost {
    pub home: String,
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
}

impl FakeHost {
    pub fn new(home: &str) -> Arc<Mutex<Self>> {
        let mut host = FakeHost {
            home: home.to_string(),
            dirs: BTreeSet::new(),
            files: BTreeMap::new(),
        };
        host.mkdir_all(home);
        Arc::new(Mutex::new(host))
    }

    pub fn mkdir_all(&mut self, path: &str) {
        let mut current = String::new();
        self.dirs.insert("/".to_string());
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    pub fn add_file(&mut self, path: &str, contents: &[u8]) {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.mkdir_all(parent);
        }
        self.files.insert(path.to_string(), contents.to_vec());
    }

    /// Run a command line in a fresh shell starting at home.
    pub fn run(&mut self, line: &str) -> RawOutput {
        let home = self.home.clone();
        let (lines, _) = self.interpret(&home, line);
        let mut stdout = String::new();
        let mut stderr = String::new();
        for line in lines {
            match line {
                ShellLine::Out(text) => stdout.push_str(&format!("{}\n", text)),
                ShellLine::Err(text) => stderr.push_str(&format!("{}\n", text)),
            }
        }
        let status = if stderr.is_empty() { 0 } else { 1 };
        RawOutput {
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            exit_status: Some(status),
        }
    }

    /// Interpret `line` starting in `cwd`. Understands `;` and `&&` lists,
    /// `cd` and `echo` with `$HOME`/`$PWD` expansion. Returns the output in
    /// the order it was produced and the final directory.
    pub fn interpret(&self, cwd: &str, line: &str) -> (Vec<ShellLine>, String) {
        let mut cwd = cwd.to_string();
        let mut lines = Vec::new();
        for list in line.split("; ").map(str::trim) {
            for segment in list.split("&&").map(str::trim) {
                let ok = if let Some(arg) = segment
                    .strip_prefix("cd")
                    .filter(|rest| rest.is_empty() || rest.starts_with(' '))
                {
                    let arg = workdir::unquote(arg.trim());
                    let target = if arg.is_empty() {
                        self.home.clone()
                    } else {
                        normalize(&cwd, arg)
                    };
                    if self.dirs.contains(&target) {
                        cwd = target;
                        true
                    } else {
                        lines.push(ShellLine::Err(format!(
                            "bash: cd: {}: No such file or directory",
                            arg
                        )));
                        false
                    }
                } else if let Some(arg) = segment.strip_prefix("echo ") {
                    let text = workdir::unquote(arg.trim())
                        .replace("$HOME", &self.home)
                        .replace("$PWD", &cwd);
                    lines.push(ShellLine::Out(text));
                    true
                } else {
                    true
                };
                if !ok {
                    break;
                }
            }
        }
        (lines, cwd)
    }
}

/// One line of shell output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellLine {
    Out(String),
    Err(String),
}

/// Resolve `path` against `cwd`, folding `.` and `..`.
pub fn normalize(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        workdir::join(cwd, path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Shared record of what the mocks saw.
#[derive(Clone, Default)]
pub struct Recorder {
    pub commands: Arc<Mutex<Vec<String>>>,
    pub credentials: Arc<Mutex<Vec<Option<String>>>>,
    pub timeouts: Arc<Mutex<Vec<Duration>>>,
    pub closed: Arc<Mutex<usize>>,
}

impl Recorder {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// Scripted result of one connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Ok,
    Timeout,
    AuthFailure,
}

pub struct MockConnector {
    pub host: Arc<Mutex<FakeHost>>,
    pub recorder: Recorder,
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    faults: Faults,
    /// Greeting for interactive shells; `None` for exec-only hosts.
    pub shell_prompt: Option<String>,
    /// Split every shell response into chunks of this many bytes.
    pub shell_chunk: Option<usize>,
}

/// Failures injected into transports, shared across reconnects.
#[derive(Clone, Default)]
struct Faults {
    /// Exec calls that time out before any output.
    exec_timeouts: Arc<Mutex<usize>>,
    /// Exec calls that fail as if the connection dropped.
    exec_errors: Arc<Mutex<usize>>,
    /// Shell writes that fail as if the connection dropped.
    send_errors: Arc<Mutex<usize>>,
}

fn take_one(counter: &Mutex<usize>) -> bool {
    let mut remaining = counter.lock().unwrap();
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

fn connection_reset() -> SessionError {
    SessionError::Protocol("connection reset".to_string())
}

impl MockConnector {
    pub fn new(host: Arc<Mutex<FakeHost>>) -> Self {
        Self {
            host,
            recorder: Recorder::default(),
            outcomes: Mutex::new(VecDeque::new()),
            faults: Faults::default(),
            shell_prompt: None,
            shell_chunk: None,
        }
    }

    /// Outcomes consumed in order; once exhausted every attempt succeeds.
    pub fn script(self, outcomes: &[ConnectOutcome]) -> Self {
        *self.outcomes.lock().unwrap() = outcomes.iter().copied().collect();
        self
    }

    pub fn with_shell(mut self, prompt: &str) -> Self {
        self.shell_prompt = Some(prompt.to_string());
        self
    }

    pub fn with_shell_chunks(mut self, size: usize) -> Self {
        self.shell_chunk = Some(size);
        self
    }

    pub fn fail_next_execs(&self, count: usize) {
        *self.faults.exec_timeouts.lock().unwrap() = count;
    }

    pub fn drop_next_execs(&self, count: usize) {
        *self.faults.exec_errors.lock().unwrap() = count;
    }

    pub fn drop_next_sends(&self, count: usize) {
        *self.faults.send_errors.lock().unwrap() = count;
    }

    pub fn connect_count(&self) -> usize {
        self.recorder.timeouts.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        credential: Option<&Credential>,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        self.recorder.timeouts.lock().unwrap().push(timeout);
        self.recorder.credentials.lock().unwrap().push(match credential {
            Some(Credential::Password(p)) => Some(p.clone()),
            Some(Credential::KeyFile { path, .. }) => Some(path.display().to_string()),
            None => None,
        });
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectOutcome::Ok);
        match outcome {
            ConnectOutcome::Ok => Ok(Box::new(MockTransport {
                host: Arc::clone(&self.host),
                recorder: self.recorder.clone(),
                faults: self.faults.clone(),
                shell_prompt: self.shell_prompt.clone(),
                shell_chunk: self.shell_chunk,
            })),
            ConnectOutcome::Timeout => Err(SessionError::ConnectTimeout {
                host: target.host.clone(),
                port: target.port,
                timeout,
            }),
            ConnectOutcome::AuthFailure => Err(SessionError::Authentication {
                user: target.user.clone(),
                host: target.host.clone(),
            }),
        }
    }
}

pub struct MockTransport {
    host: Arc<Mutex<FakeHost>>,
    recorder: Recorder,
    faults: Faults,
    shell_prompt: Option<String>,
    shell_chunk: Option<usize>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<RawOutput> {
        self.recorder.commands.lock().unwrap().push(command.to_string());
        if take_one(&self.faults.exec_errors) {
            return Err(connection_reset());
        }
        if take_one(&self.faults.exec_timeouts) {
            return Err(SessionError::Timeout {
                timeout,
                partial: RawOutput::default(),
            });
        }
        Ok(self.host.lock().unwrap().run(command))
    }

    async fn open_shell(&mut self) -> Result<Box<dyn ShellChannel>> {
        let prompt = self
            .shell_prompt
            .clone()
            .ok_or_else(|| SessionError::Protocol("shell not supported".to_string()))?;
        let mut shell = MockShell::new(&prompt).with_host(Arc::clone(&self.host));
        if let Some(size) = self.shell_chunk {
            shell = shell.chunked(size);
        }
        shell.sent = Arc::clone(&self.recorder.commands);
        shell.send_errors = Arc::clone(&self.faults.send_errors);
        Ok(Box::new(shell))
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn RemoteFs>> {
        Ok(Box::new(MockFs::new(Arc::clone(&self.host))))
    }

    async fn close(&mut self) -> Result<()> {
        *self.recorder.closed.lock().unwrap() += 1;
        Ok(())
    }
}

/// A PTY shell: echoes input, answers each framed command with stdout and
/// error text interleaved on one stream, then prints the prompt.
pub struct MockShell {
    prompt: String,
    pending: VecDeque<ShellChunk>,
    sent: Arc<Mutex<Vec<String>>>,
    pub send_errors: Arc<Mutex<usize>>,
    hang_on: Option<String>,
    host: Option<Arc<Mutex<FakeHost>>>,
    cwd: String,
    echo: bool,
    chunk: Option<usize>,
}

impl MockShell {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            pending: VecDeque::from([ShellChunk::Stdout(prompt.as_bytes().to_vec())]),
            sent: Arc::default(),
            send_errors: Arc::default(),
            hang_on: None,
            host: None,
            cwd: String::new(),
            echo: true,
            chunk: None,
        }
    }

    /// A shell that never prints anything.
    pub fn silent() -> Self {
        let mut shell = Self::new("");
        shell.pending.clear();
        shell
    }

    /// Echo `command` but never finish it.
    pub fn hang_on(mut self, command: &str) -> Self {
        self.hang_on = Some(command.to_string());
        self
    }

    /// Do not echo submitted input.
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Deliver responses in pieces of `size` bytes.
    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk = Some(size.max(1));
        self
    }

    /// Interpret commands against `host`, keeping the directory between commands.
    pub fn with_host(mut self, host: Arc<Mutex<FakeHost>>) -> Self {
        self.cwd = host.lock().unwrap().home.clone();
        self.host = Some(host);
        self
    }

    pub fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }

    fn answer(&mut self, command: &str) -> String {
        match &self.host {
            Some(host) => {
                let (lines, cwd) = host.lock().unwrap().interpret(&self.cwd, command);
                self.cwd = cwd;
                lines
                    .into_iter()
                    .map(|line| match line {
                        ShellLine::Out(text) | ShellLine::Err(text) => text,
                    })
                    .collect::<Vec<_>>()
                    .join("\r\n")
            }
            None => command
                .strip_prefix("echo ")
                .map(str::to_string)
                .unwrap_or_default(),
        }
    }

    fn deliver(&mut self, text: String) {
        let bytes = text.into_bytes();
        match self.chunk {
            Some(size) => {
                for piece in bytes.chunks(size) {
                    self.pending.push_back(ShellChunk::Stdout(piece.to_vec()));
                }
            }
            None => self.pending.push_back(ShellChunk::Stdout(bytes)),
        }
    }
}

#[async_trait]
impl ShellChannel for MockShell {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if take_one(&self.send_errors) {
            return Err(connection_reset());
        }
        let text = String::from_utf8_lossy(data).into_owned();
        self.sent.lock().unwrap().push(text.clone());

        let (command, sentinel) = text
            .split_once("; \\\necho ")
            .map(|(c, s)| (c.to_string(), s.trim_end().to_string()))
            .unwrap_or_else(|| (text.trim_end().to_string(), String::new()));
        let echo = if self.echo {
            format!("{}; \\\r\n> echo {}\r\n", command, sentinel)
        } else {
            String::new()
        };

        if self.hang_on.as_deref() == Some(command.as_str()) {
            self.deliver(echo);
            return Ok(());
        }

        let output = self.answer(&command);
        let mut response = echo;
        if !output.is_empty() {
            response.push_str(&output);
            response.push_str("\r\n");
        }
        response.push_str(&format!("{}\r\n{}", sentinel, self.prompt));
        self.deliver(response);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ShellChunk>> {
        match self.pending.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// SFTP over a [`FakeHost`].
pub struct MockFs {
    host: Arc<Mutex<FakeHost>>,
    cwd: Option<String>,
}

impl MockFs {
    pub fn new(host: Arc<Mutex<FakeHost>>) -> Self {
        Self { host, cwd: None }
    }

    fn absolute(&self, path: &str) -> String {
        normalize(self.cwd.as_deref().unwrap_or("/"), path)
    }
}

fn not_found(path: &str) -> SessionError {
    SessionError::Io(io::Error::new(io::ErrorKind::NotFound, path.to_string()))
}

#[async_trait]
impl RemoteFs for MockFs {
    fn chdir(&mut self, dir: &str) {
        self.cwd = Some(workdir::unquote(dir).to_string());
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        let path = self.absolute(path);
        let host = self.host.lock().unwrap();
        if host.dirs.contains(&path) {
            Ok(true)
        } else if host.files.contains_key(&path) {
            Ok(false)
        } else {
            Err(not_found(&path))
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteFileEntry>> {
        let path = self.absolute(path);
        let host = self.host.lock().unwrap();
        if !host.dirs.contains(&path) {
            return Err(not_found(&path));
        }
        let child = |candidate: &String| {
            candidate
                .rsplit_once('/')
                .filter(|(parent, name)| {
                    !name.is_empty() && (*parent == path || (parent.is_empty() && path == "/"))
                })
                .map(|(_, name)| name.to_string())
        };
        let mut entries = Vec::new();
        for dir in &host.dirs {
            if let Some(name) = child(dir) {
                entries.push(entry(&path, name, true, 0));
            }
        }
        for (file, contents) in &host.files {
            if let Some(name) = child(file) {
                entries.push(entry(&path, name, false, contents.len() as u64));
            }
        }
        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let path = self.absolute(path);
        let mut host = self.host.lock().unwrap();
        if host.dirs.contains(&path) || host.files.contains_key(&path) {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                path,
            )));
        }
        host.dirs.insert(path);
        Ok(())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let path = self.absolute(remote_path);
        let contents = self
            .host
            .lock()
            .unwrap()
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| not_found(&path))?;
        tokio::fs::write(local_path, contents).await?;
        Ok(())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let path = self.absolute(remote_path);
        let contents = tokio::fs::read(local_path).await?;
        let mut host = self.host.lock().unwrap();
        let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("/");
        let parent = if parent.is_empty() { "/" } else { parent };
        if !host.dirs.contains(parent) {
            return Err(not_found(parent));
        }
        host.files.insert(path, contents);
        Ok(())
    }

    async fn open(&self, path: &str) -> Result<RemoteReader> {
        let path = self.absolute(path);
        let contents = self
            .host
            .lock()
            .unwrap()
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| not_found(&path))?;
        Ok(Box::pin(io::Cursor::new(contents)))
    }
}

fn entry(dir: &str, name: String, is_dir: bool, size: u64) -> RemoteFileEntry {
    RemoteFileEntry {
        path: workdir::join(dir, &name),
        name,
        is_dir,
        size,
        modified: None,
        permissions: None,
    }
}

/// Records rsync invocations and replays scripted exit statuses.
#[derive(Default)]
pub struct MockSync {
    pub calls: Mutex<Vec<Vec<String>>>,
    statuses: Mutex<VecDeque<i32>>,
}

impl MockSync {
    pub fn with_statuses(statuses: &[i32]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            statuses: Mutex::new(statuses.iter().copied().collect()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncProgram for MockSync {
    fn name(&self) -> &str {
        "rsync"
    }

    async fn run(&self, args: &[String]) -> Result<SyncOutcome> {
        self.calls.lock().unwrap().push(args.to_vec());
        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(0);
        Ok(SyncOutcome {
            status: Some(status),
            stderr: if status == 0 {
                String::new()
            } else {
                "rsync error".to_string()
            },
        })
    }
}

/// Supplies a fixed password and counts how often it was asked.
#[derive(Default)]
pub struct CountingPrompt {
    pub password: Option<String>,
    pub target: Option<(String, String)>,
    pub asked: Mutex<usize>,
}

impl CredentialSource for CountingPrompt {
    fn connection_target(&self, _missing: &[&'static str]) -> Option<(String, String)> {
        self.target.clone()
    }

    fn password(&self, _user: &str, _host: &str) -> Option<String> {
        *self.asked.lock().unwrap() += 1;
        self.password.clone()
    }
}
