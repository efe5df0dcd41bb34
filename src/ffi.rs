//! C FFI interface for Swift integration.
//!
//! All functions exported here are callable from Swift via the C bridge.
//! Naming convention: sshkit_<module>_<action>

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::OnceLock;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::ssh::client::RemoteClient;
use crate::ssh::{ClientConfig, FilePermission, HashKind};

/// Global tokio runtime for blocking SSH calls.
fn ssh_runtime() -> Option<&'static tokio::runtime::Runtime> {
    static RUNTIME: OnceLock<Option<tokio::runtime::Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(|e| log::error!("Failed to create SSH tokio runtime: {}", e))
                .ok()
        })
        .as_ref()
}

fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok() }
}

fn into_c_string(value: String) -> *mut c_char {
    match CString::new(value) {
        Ok(cs) => cs.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn into_json<T: Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => into_c_string(json),
        Err(e) => {
            log::error!("Failed to serialize FFI result: {}", e);
            std::ptr::null_mut()
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Client FFI
// ═══════════════════════════════════════════════════════════

/// A client plus a token that can cancel it from any thread.
pub struct SshkitClient {
    client: tokio::sync::Mutex<RemoteClient>,
    cancel: CancellationToken,
}

/// Opaque pointer to an SshkitClient.
pub type SshkitClientHandle = *mut SshkitClient;

fn client_ref<'a>(handle: SshkitClientHandle) -> Option<&'a SshkitClient> {
    if handle.is_null() {
        None
    } else {
        Some(unsafe { &*handle })
    }
}

/// Create an unconnected client. No network traffic happens here.
/// hash_kind: 0 = MD5, 1 = SHA1
/// Returns null on invalid arguments. Free with sshkit_client_disconnect.
#[no_mangle]
pub extern "C" fn sshkit_client_new(
    host: *const c_char,
    port: u16,
    username: *const c_char,
    password: *const c_char,
    hash_kind: i32,
) -> SshkitClientHandle {
    let (Some(host), Some(username), Some(password)) = (c_str(host), c_str(username), c_str(password))
    else {
        return std::ptr::null_mut();
    };
    let kind = match hash_kind {
        0 => HashKind::Md5,
        1 => HashKind::Sha1,
        other => {
            log::error!("Unknown host key hash kind: {}", other);
            return std::ptr::null_mut();
        }
    };
    let config = match ClientConfig::new(host) {
        Ok(config) => config
            .with_port(port)
            .with_username(username)
            .with_password(password)
            .with_hash_kind(kind),
        Err(e) => {
            log::error!("Invalid SSH config: {}", e);
            return std::ptr::null_mut();
        }
    };
    let client = RemoteClient::with_russh(config);
    let cancel = client.cancellation_token();
    Box::into_raw(Box::new(SshkitClient {
        client: tokio::sync::Mutex::new(client),
        cancel,
    }))
}

/// Connect, handshake, authenticate with a password and start SFTP.
/// Blocks until done; sshkit_client_cancel from another thread aborts it.
/// Returns 0 on success, -1 on failure.
#[no_mangle]
pub extern "C" fn sshkit_client_connect(handle: SshkitClientHandle) -> i32 {
    let (Some(ffi), Some(runtime)) = (client_ref(handle), ssh_runtime()) else {
        return -1;
    };
    match runtime.block_on(async { ffi.client.lock().await.connect_and_authenticate().await }) {
        Ok(fingerprint) => {
            log::info!("SSH connected ({})", fingerprint);
            0
        }
        Err(e) => {
            log::error!("SSH connect failed: {}", e);
            -1
        }
    }
}

/// Host key fingerprint as colon separated hex.
/// Caller must free with sshkit_string_free.
#[no_mangle]
pub extern "C" fn sshkit_client_fingerprint(handle: SshkitClientHandle) -> *mut c_char {
    let (Some(ffi), Some(runtime)) = (client_ref(handle), ssh_runtime()) else {
        return std::ptr::null_mut();
    };
    let client = runtime.block_on(ffi.client.lock());
    match client.fingerprint() {
        Some(fingerprint) => into_c_string(fingerprint.render()),
        None => std::ptr::null_mut(),
    }
}

/// Banner sent by the host. Returns null when there is none.
/// Caller must free with sshkit_string_free.
#[no_mangle]
pub extern "C" fn sshkit_client_banner(handle: SshkitClientHandle) -> *mut c_char {
    let (Some(ffi), Some(runtime)) = (client_ref(handle), ssh_runtime()) else {
        return std::ptr::null_mut();
    };
    let client = runtime.block_on(ffi.client.lock());
    match client.banner() {
        Ok(banner) => into_c_string(banner),
        Err(e) => {
            log::error!("SSH banner unavailable: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Authentication methods offered by the host, as a JSON array.
/// Caller must free with sshkit_string_free.
#[no_mangle]
pub extern "C" fn sshkit_client_auth_methods(handle: SshkitClientHandle) -> *mut c_char {
    let (Some(ffi), Some(runtime)) = (client_ref(handle), ssh_runtime()) else {
        return std::ptr::null_mut();
    };
    match runtime.block_on(async { ffi.client.lock().await.auth_methods().await }) {
        Ok(methods) => into_json(&methods),
        Err(e) => {
            log::error!("SSH auth method discovery failed: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Cancel in-flight and future calls on this client. Safe to call from any
/// thread while another call is blocked.
/// Returns 0 on success, -1 on invalid handle.
#[no_mangle]
pub extern "C" fn sshkit_client_cancel(handle: SshkitClientHandle) -> i32 {
    match client_ref(handle) {
        Some(ffi) => {
            ffi.cancel.cancel();
            0
        }
        None => -1,
    }
}

/// Disconnect and free the handle.
#[no_mangle]
pub extern "C" fn sshkit_client_disconnect(handle: SshkitClientHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let ffi = unsafe { Box::from_raw(handle) };
    let mut client = ffi.client.into_inner();
    // Release runs inside the runtime so the transport can say goodbye.
    match ssh_runtime() {
        Some(runtime) => runtime.block_on(async move { client.disconnect() }),
        None => client.disconnect(),
    }
    log::info!("SSH disconnected");
    0
}

// ═══════════════════════════════════════════════════════════
// SFTP FFI
// ═══════════════════════════════════════════════════════════

/// List a remote directory as a JSON array of entries, `.` and `..` excluded.
/// Caller must free with sshkit_string_free.
#[no_mangle]
pub extern "C" fn sshkit_sftp_list_dir(handle: SshkitClientHandle, path: *const c_char) -> *mut c_char {
    let (Some(ffi), Some(path), Some(runtime)) = (client_ref(handle), c_str(path), ssh_runtime()) else {
        return std::ptr::null_mut();
    };
    match runtime.block_on(async { ffi.client.lock().await.list_directory(path).await }) {
        Ok(entries) => into_json(&entries),
        Err(e) => {
            log::error!("SFTP list {} failed: {}", path, e);
            std::ptr::null_mut()
        }
    }
}

/// Create a remote directory.
/// permission: three octal digits such as "755"; null means 755.
/// Returns 0 on success, -1 on failure.
#[no_mangle]
pub extern "C" fn sshkit_sftp_mkdir(
    handle: SshkitClientHandle,
    path: *const c_char,
    permission: *const c_char,
    intermediate: bool,
) -> i32 {
    let (Some(ffi), Some(path), Some(runtime)) = (client_ref(handle), c_str(path), ssh_runtime()) else {
        return -1;
    };
    let permission = match c_str(permission) {
        None => FilePermission::DIRECTORY,
        Some(text) => match text.parse::<FilePermission>() {
            Ok(permission) => permission,
            Err(e) => {
                log::error!("Invalid permission {:?}: {}", text, e);
                return -1;
            }
        },
    };
    match runtime.block_on(async {
        ffi.client
            .lock()
            .await
            .create_directory(path, permission, intermediate)
            .await
    }) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("SFTP mkdir {} failed: {}", path, e);
            -1
        }
    }
}

/// Remove an empty remote directory.
/// Returns 0 on success, -1 on failure.
#[no_mangle]
pub extern "C" fn sshkit_sftp_rmdir(handle: SshkitClientHandle, path: *const c_char) -> i32 {
    let (Some(ffi), Some(path), Some(runtime)) = (client_ref(handle), c_str(path), ssh_runtime()) else {
        return -1;
    };
    match runtime.block_on(async { ffi.client.lock().await.remove_directory(path).await }) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("SFTP rmdir {} failed: {}", path, e);
            -1
        }
    }
}

/// Resolve a link. complex = true returns the canonical path, false the raw
/// link target.
/// Caller must free with sshkit_string_free.
#[no_mangle]
pub extern "C" fn sshkit_sftp_realpath(
    handle: SshkitClientHandle,
    path: *const c_char,
    complex: bool,
) -> *mut c_char {
    let (Some(ffi), Some(path), Some(runtime)) = (client_ref(handle), c_str(path), ssh_runtime()) else {
        return std::ptr::null_mut();
    };
    match runtime.block_on(async { ffi.client.lock().await.resolve_symlink(path, complex).await }) {
        Ok(target) => into_c_string(target),
        Err(e) => {
            log::error!("SFTP resolve {} failed: {}", path, e);
            std::ptr::null_mut()
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Exec FFI
// ═══════════════════════════════════════════════════════════

/// Execute a command on the remote server.
/// Returns JSON: {"exit_code": N, "stdout": "..."}
/// Caller must free with sshkit_string_free.
#[no_mangle]
pub extern "C" fn sshkit_ssh_exec(handle: SshkitClientHandle, command: *const c_char) -> *mut c_char {
    let (Some(ffi), Some(command), Some(runtime)) = (client_ref(handle), c_str(command), ssh_runtime())
    else {
        return std::ptr::null_mut();
    };
    match runtime.block_on(async { ffi.client.lock().await.exec(command).await }) {
        Ok(output) => into_json(&output),
        Err(e) => {
            log::error!("SSH exec failed: {}", e);
            let err = serde_json::json!({
                "exit_code": -1,
                "stdout": format!("Error: {}", e),
            });
            into_c_string(err.to_string())
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Memory / init
// ═══════════════════════════════════════════════════════════

/// Free a string returned by any sshkit function.
#[no_mangle]
pub extern "C" fn sshkit_string_free(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            drop(CString::from_raw(s));
        }
    }
}

/// Initialize the Rust logger.
#[no_mangle]
pub extern "C" fn sshkit_init() {
    let _ = env_logger::try_init();
    log::info!("SSHKit core initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cstring(text: &str) -> CString {
        CString::new(text).unwrap()
    }

    fn new_client(port: u16, hash_kind: i32) -> SshkitClientHandle {
        let (host, user, pass) = (cstring("127.0.0.1"), cstring("u"), cstring("p"));
        sshkit_client_new(host.as_ptr(), port, user.as_ptr(), pass.as_ptr(), hash_kind)
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        assert!(sshkit_client_new(
            std::ptr::null(),
            22,
            std::ptr::null(),
            std::ptr::null(),
            0
        )
        .is_null());
        assert_eq!(sshkit_client_connect(std::ptr::null_mut()), -1);
        assert!(sshkit_client_fingerprint(std::ptr::null_mut()).is_null());
        assert!(sshkit_client_banner(std::ptr::null_mut()).is_null());
        assert!(sshkit_sftp_list_dir(std::ptr::null_mut(), std::ptr::null()).is_null());
        assert_eq!(sshkit_sftp_rmdir(std::ptr::null_mut(), std::ptr::null()), -1);
        assert_eq!(sshkit_client_cancel(std::ptr::null_mut()), -1);
        assert_eq!(sshkit_client_disconnect(std::ptr::null_mut()), -1);
        sshkit_string_free(std::ptr::null_mut());
    }

    #[test]
    fn test_unknown_hash_kind() {
        assert!(new_client(22, 7).is_null());
    }

    #[test]
    fn test_connect_refused_returns_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = new_client(port, 0);
        assert!(!handle.is_null());
        assert_eq!(sshkit_client_connect(handle), -1);
        assert!(sshkit_client_fingerprint(handle).is_null());
        assert_eq!(sshkit_client_disconnect(handle), 0);
    }

    #[test]
    fn test_cancel_aborts_stalled_connect() {
        // Accepts the TCP connection but never speaks SSH.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = new_client(port, 0);
        assert!(!handle.is_null());
        let address = handle as usize;
        let started = std::time::Instant::now();
        let connecting = std::thread::spawn(move || sshkit_client_connect(address as SshkitClientHandle));

        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(sshkit_client_cancel(handle), 0);
        assert_eq!(connecting.join().unwrap(), -1);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        assert_eq!(sshkit_client_disconnect(handle), 0);
        drop(listener);
    }

    #[test]
    fn test_json_strings_round_trip_through_free() {
        let raw = into_json(&vec!["password", "publickey"]);
        assert!(!raw.is_null());
        let text = unsafe { CStr::from_ptr(raw) }.to_str().unwrap().to_string();
        sshkit_string_free(raw);
        assert_eq!(text, r#"["password","publickey"]"#);
    }

    #[test]
    fn test_interior_nul_yields_null() {
        assert!(into_c_string("a\0b".to_string()).is_null());
    }
}
