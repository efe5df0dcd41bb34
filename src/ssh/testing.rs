//! Scripted in-memory [`Transport`] and [`Network`] for unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::fingerprint::HashKind;
use super::transport::{
    DirRecord, Endpoint, FileAttributes, LinkMode, Network, OpenFlags, OpenKind, Transport,
    TransportError, TransportResult,
};

const NO_SUCH_FILE: i32 = -31;

/// What the scripted host does.
pub(crate) struct Script {
    pub handshake_blocks: usize,
    pub handshake_error: Option<TransportError>,
    pub null_session: bool,
    pub md5: Vec<u8>,
    pub sha1: Vec<u8>,
    pub banner: Option<Vec<u8>>,
    pub auth_list: Option<Vec<u8>>,
    pub username: String,
    pub password: String,
    pub auth_blocks: usize,
    pub sftp_error: Option<TransportError>,
    pub mkdir_blocks: usize,
    pub readdir_blocks: usize,
    pub links: HashMap<String, String>,
    pub channel_output: Vec<u8>,
    pub exit_status: i32,
    pub channel_close_error: Option<TransportError>,
    pub null_channel: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            handshake_blocks: 0,
            handshake_error: None,
            null_session: false,
            md5: (0x01..=0x10).collect(),
            sha1: (0x01..=0x14).collect(),
            banner: Some(b"SSH-2.0-OpenSSH_9.6\r\n".to_vec()),
            auth_list: Some(b"publickey,password,keyboard-interactive".to_vec()),
            username: "u".to_string(),
            password: "p".to_string(),
            auth_blocks: 0,
            sftp_error: None,
            mkdir_blocks: 0,
            readdir_blocks: 0,
            links: HashMap::new(),
            channel_output: b"Linux\n".to_vec(),
            exit_status: 0,
            channel_close_error: None,
            null_channel: false,
        }
    }
}

/// Call counts and recorded arguments.
#[derive(Clone, Debug, Default)]
pub(crate) struct Counters {
    pub handshake: usize,
    pub set_blocking: usize,
    pub timeout: Option<Duration>,
    pub userauth_list: usize,
    pub userauth_password: usize,
    pub session_free: usize,
    pub sftp_shutdown: usize,
    pub mkdir: usize,
    pub mkdir_modes: Vec<(String, u32)>,
    pub readdir: usize,
    pub handle_close: usize,
    pub handle_free: usize,
    pub symlink_sizes: Vec<usize>,
    pub channel_close: usize,
    pub channel_wait_closed: usize,
    pub channel_free: usize,
}

struct RemoteFs {
    dirs: BTreeSet<String>,
    listings: BTreeMap<String, Vec<(String, u32)>>,
    files: HashMap<String, (Vec<u8>, u32)>,
}

impl Default for RemoteFs {
    fn default() -> Self {
        let dirs = ["/", "/home", "/tmp"].iter().map(|d| d.to_string()).collect();
        let mut listings = BTreeMap::new();
        listings.insert(
            "/home".to_string(),
            vec![
                (".".to_string(), 0o040755),
                ("..".to_string(), 0o040755),
                ("file.txt".to_string(), 0o100644),
                ("sub".to_string(), 0o040755),
            ],
        );
        Self {
            dirs,
            listings,
            files: HashMap::new(),
        }
    }
}

struct State {
    script: Script,
    fs: RemoteFs,
    counters: Counters,
    events: Vec<&'static str>,
}

pub(crate) struct StubSession {
    md5: Vec<u8>,
    sha1: Vec<u8>,
    banner: Option<Vec<u8>>,
}

pub(crate) struct StubSftp;

pub(crate) struct StubHandle {
    path: String,
    records: VecDeque<(String, FileAttributes)>,
    data: Vec<u8>,
    pos: usize,
    mode: u32,
    writable: bool,
}

pub(crate) struct StubChannel {
    output: Vec<u8>,
    pos: usize,
    exit_status: i32,
    started: bool,
}

pub(crate) struct StubTransport {
    state: Mutex<State>,
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new(Script::default())
    }
}

impl StubTransport {
    pub fn new(script: Script) -> Self {
        Self {
            state: Mutex::new(State {
                script,
                fs: RemoteFs::default(),
                counters: Counters::default(),
                events: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters.clone()
    }

    /// Release calls in the order they happened.
    pub fn events(&self) -> Vec<&'static str> {
        self.lock().events.clone()
    }
}

fn take_block(remaining: &mut usize) -> bool {
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

fn no_such_file() -> TransportError {
    TransportError::failed(NO_SUCH_FILE, "No such file")
}

fn attrs_for(mode: u32, size: u64) -> FileAttributes {
    FileAttributes {
        size: Some(size),
        uid: Some(1000),
        gid: Some(1000),
        permissions: Some(mode),
        atime: Some(1_700_000_000),
        mtime: Some(1_700_000_000),
    }
}

#[async_trait]
impl Transport for StubTransport {
    type Socket = u32;
    type Session = StubSession;
    type Sftp = StubSftp;
    type Handle = StubHandle;
    type Channel = StubChannel;

    fn session_init(&self, _socket: u32) -> Option<StubSession> {
        let state = self.lock();
        if state.script.null_session {
            return None;
        }
        Some(StubSession {
            md5: state.script.md5.clone(),
            sha1: state.script.sha1.clone(),
            banner: state.script.banner.clone(),
        })
    }

    fn set_blocking(&self, _session: &StubSession, _blocking: bool) {
        self.lock().counters.set_blocking += 1;
    }

    fn set_timeout(&self, _session: &StubSession, timeout: Duration) {
        self.lock().counters.timeout = Some(timeout);
    }

    async fn handshake(&self, _session: &StubSession) -> TransportResult<()> {
        let mut state = self.lock();
        state.counters.handshake += 1;
        if take_block(&mut state.script.handshake_blocks) {
            return Err(TransportError::WouldBlock);
        }
        match &state.script.handshake_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn hostkey_hash<'a>(&'a self, session: &'a StubSession, kind: HashKind) -> Option<&'a [u8]> {
        let digest = match kind {
            HashKind::Md5 => &session.md5,
            HashKind::Sha1 => &session.sha1,
        };
        (!digest.is_empty()).then_some(digest.as_slice())
    }

    fn banner<'a>(&'a self, session: &'a StubSession) -> Option<&'a [u8]> {
        session.banner.as_deref()
    }

    async fn userauth_list(
        &self,
        _session: &StubSession,
        _username: &str,
    ) -> TransportResult<Option<Vec<u8>>> {
        let mut state = self.lock();
        state.counters.userauth_list += 1;
        Ok(state.script.auth_list.clone())
    }

    async fn userauth_password(
        &self,
        _session: &StubSession,
        username: &str,
        password: &str,
    ) -> TransportResult<()> {
        let mut state = self.lock();
        state.counters.userauth_password += 1;
        if take_block(&mut state.script.auth_blocks) {
            return Err(TransportError::WouldBlock);
        }
        if username == state.script.username && password == state.script.password {
            Ok(())
        } else {
            Err(TransportError::failed(-18, "Authentication failed (username/password)"))
        }
    }

    fn session_free(&self, _session: StubSession) {
        let mut state = self.lock();
        state.counters.session_free += 1;
        state.events.push("session_free");
    }

    async fn sftp_init(&self, _session: &StubSession) -> TransportResult<StubSftp> {
        match &self.lock().script.sftp_error {
            Some(e) => Err(e.clone()),
            None => Ok(StubSftp),
        }
    }

    fn sftp_shutdown(&self, _sftp: StubSftp) {
        let mut state = self.lock();
        state.counters.sftp_shutdown += 1;
        state.events.push("sftp_shutdown");
    }

    async fn sftp_mkdir(&self, _sftp: &StubSftp, path: &str, mode: u32) -> TransportResult<()> {
        let mut state = self.lock();
        state.counters.mkdir += 1;
        if take_block(&mut state.script.mkdir_blocks) {
            return Err(TransportError::WouldBlock);
        }
        state.counters.mkdir_modes.push((path.to_string(), mode));
        if state.fs.dirs.contains(path) || state.fs.files.contains_key(path) {
            return Err(TransportError::failed(NO_SUCH_FILE, "File already exists"));
        }
        state.fs.dirs.insert(path.to_string());
        Ok(())
    }

    async fn sftp_rmdir(&self, _sftp: &StubSftp, path: &str) -> TransportResult<()> {
        let mut state = self.lock();
        if state.fs.dirs.remove(path) {
            state.fs.listings.remove(path);
            Ok(())
        } else {
            Err(no_such_file())
        }
    }

    async fn sftp_unlink(&self, _sftp: &StubSftp, path: &str) -> TransportResult<()> {
        self.lock().fs.files.remove(path).map(|_| ()).ok_or_else(no_such_file)
    }

    async fn sftp_stat(&self, _sftp: &StubSftp, path: &str) -> TransportResult<FileAttributes> {
        let state = self.lock();
        if state.fs.dirs.contains(path) {
            return Ok(attrs_for(0o040755, 4096));
        }
        state
            .fs
            .files
            .get(path)
            .map(|(data, mode)| attrs_for(0o100000 | mode, data.len() as u64))
            .ok_or_else(no_such_file)
    }

    async fn sftp_setstat(
        &self,
        _sftp: &StubSftp,
        path: &str,
        attrs: &FileAttributes,
    ) -> TransportResult<()> {
        let mut state = self.lock();
        if let Some((_, mode)) = state.fs.files.get_mut(path) {
            if let Some(permissions) = attrs.permissions {
                *mode = permissions & 0o7777;
            }
            return Ok(());
        }
        if state.fs.dirs.contains(path) {
            return Ok(());
        }
        Err(no_such_file())
    }

    async fn sftp_open(
        &self,
        _sftp: &StubSftp,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        kind: OpenKind,
    ) -> TransportResult<StubHandle> {
        let state = self.lock();
        let mut handle = StubHandle {
            path: path.to_string(),
            records: VecDeque::new(),
            data: Vec::new(),
            pos: 0,
            mode,
            writable: flags.contains(OpenFlags::WRITE),
        };
        match kind {
            OpenKind::Directory => {
                if let Some(listing) = state.fs.listings.get(path) {
                    handle.records = listing
                        .iter()
                        .map(|(name, mode)| (name.clone(), attrs_for(*mode, 0)))
                        .collect();
                } else if !state.fs.dirs.contains(path) {
                    return Err(no_such_file());
                }
            }
            OpenKind::File => match state.fs.files.get(path) {
                Some((data, existing)) => {
                    handle.mode = *existing;
                    if !flags.contains(OpenFlags::TRUNCATE) {
                        handle.data = data.clone();
                    }
                }
                None if flags.contains(OpenFlags::CREATE) => {}
                None => return Err(no_such_file()),
            },
        }
        Ok(handle)
    }

    async fn sftp_readdir(
        &self,
        handle: &mut StubHandle,
        name: &mut [u8],
        longentry: &mut [u8],
    ) -> TransportResult<Option<DirRecord>> {
        {
            let mut state = self.lock();
            state.counters.readdir += 1;
            if take_block(&mut state.script.readdir_blocks) {
                return Err(TransportError::WouldBlock);
            }
        }
        let Some((entry, attrs)) = handle.records.pop_front() else {
            return Ok(None);
        };
        if entry.len() > name.len() {
            handle.records.push_front((entry, attrs));
            return Err(TransportError::BufferTooSmall);
        }
        name[..entry.len()].copy_from_slice(entry.as_bytes());

        let long = format!("{:o} 1 u g {} {}", attrs.permissions.unwrap_or(0), attrs.size.unwrap_or(0), entry);
        let long_len = long.len().min(longentry.len());
        longentry[..long_len].copy_from_slice(&long.as_bytes()[..long_len]);

        Ok(Some(DirRecord {
            name_len: entry.len(),
            longentry_len: long_len,
            attrs,
        }))
    }

    async fn sftp_read(&self, handle: &mut StubHandle, buf: &mut [u8]) -> TransportResult<usize> {
        let remaining = &handle.data[handle.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        handle.pos += n;
        Ok(n)
    }

    async fn sftp_write(&self, handle: &mut StubHandle, data: &[u8]) -> TransportResult<usize> {
        if !handle.writable {
            return Err(TransportError::failed(-3, "Permission denied"));
        }
        handle.data.extend_from_slice(data);
        Ok(data.len())
    }

    async fn sftp_close(&self, handle: &mut StubHandle) -> TransportResult<()> {
        let mut state = self.lock();
        state.counters.handle_close += 1;
        if handle.writable {
            state
                .fs
                .files
                .insert(handle.path.clone(), (std::mem::take(&mut handle.data), handle.mode & 0o7777));
        }
        Ok(())
    }

    fn sftp_handle_free(&self, _handle: StubHandle) {
        let mut state = self.lock();
        state.counters.handle_free += 1;
        state.events.push("handle_free");
    }

    async fn sftp_symlink(
        &self,
        _sftp: &StubSftp,
        path: &str,
        target: &mut [u8],
        mode: LinkMode,
    ) -> TransportResult<usize> {
        let mut state = self.lock();
        state.counters.symlink_sizes.push(target.len());
        let resolved = match (state.script.links.get(path), mode) {
            (Some(link), _) => link.clone(),
            (None, LinkMode::RealPath)
                if state.fs.dirs.contains(path) || state.fs.files.contains_key(path) =>
            {
                path.to_string()
            }
            (None, _) => return Err(no_such_file()),
        };
        if resolved.len() > target.len() {
            return Err(TransportError::BufferTooSmall);
        }
        target[..resolved.len()].copy_from_slice(resolved.as_bytes());
        Ok(resolved.len())
    }

    async fn channel_open_session(
        &self,
        _session: &StubSession,
        _window_size: u32,
        _packet_size: u32,
    ) -> TransportResult<Option<StubChannel>> {
        let state = self.lock();
        if state.script.null_channel {
            return Ok(None);
        }
        Ok(Some(StubChannel {
            output: state.script.channel_output.clone(),
            pos: 0,
            exit_status: state.script.exit_status,
            started: false,
        }))
    }

    async fn channel_exec(&self, channel: &mut StubChannel, _command: &str) -> TransportResult<()> {
        channel.started = true;
        Ok(())
    }

    async fn channel_read(&self, channel: &mut StubChannel, buf: &mut [u8]) -> TransportResult<usize> {
        if !channel.started {
            return Ok(0);
        }
        let remaining = &channel.output[channel.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        channel.pos += n;
        Ok(n)
    }

    fn channel_exit_status(&self, channel: &StubChannel) -> i32 {
        channel.exit_status
    }

    async fn channel_close(&self, _channel: &mut StubChannel) -> TransportResult<()> {
        let mut state = self.lock();
        state.counters.channel_close += 1;
        match &state.script.channel_close_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn channel_wait_closed(&self, _channel: &mut StubChannel) -> TransportResult<()> {
        self.lock().counters.channel_wait_closed += 1;
        Ok(())
    }

    fn channel_free(&self, _channel: StubChannel) {
        let mut state = self.lock();
        state.counters.channel_free += 1;
        state.events.push("channel_free");
    }
}

/// Fixed candidate list; the socket is the index of the endpoint it reached.
pub(crate) struct StubNetwork {
    endpoints: Vec<Endpoint>,
    failing: HashSet<usize>,
    resolve_calls: AtomicUsize,
    connect_calls: AtomicUsize,
}

impl StubNetwork {
    fn from_addrs(addrs: Vec<SocketAddr>) -> Self {
        Self {
            endpoints: addrs.into_iter().map(Endpoint::new).collect(),
            failing: HashSet::new(),
            resolve_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
        }
    }

    /// `n` IPv4 candidates, 10.0.0.1 upward, port 22.
    pub fn with_endpoints(n: usize) -> Self {
        let addrs = (0..n)
            .map(|i| SocketAddr::from(([10, 0, 0, (i + 1) as u8], 22)))
            .collect();
        Self::from_addrs(addrs)
    }

    /// Alternating IPv4 and IPv6 candidates.
    pub fn mixed_families() -> Self {
        let addrs = ["10.0.0.1:22", "[2001:db8::1]:22", "10.0.0.2:22", "[2001:db8::2]:22"]
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        Self::from_addrs(addrs)
    }

    /// Refuse connects to the candidates at these indices.
    pub fn failing(mut self, indices: &[usize]) -> Self {
        self.failing.extend(indices.iter().copied());
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for StubNetwork {
    type Socket = u32;

    async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<Endpoint>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.endpoints.clone())
    }

    async fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> io::Result<u32> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let index = self
            .endpoints
            .iter()
            .position(|ep| ep == endpoint)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown endpoint"))?;
        if self.failing.contains(&index) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        Ok(index as u32)
    }
}
