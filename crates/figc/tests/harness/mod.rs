//! Test harness for figc integration tests
//!
//! Provides isolated cache roots, a canned in-test HTTP registry, and
//! helpers to run the real binary against them.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::*;
use sha2::{Digest, Sha512};
use tempfile::TempDir;

/// An isolated cache root. Socket files are routed into the same temp dir
/// via XDG_RUNTIME_DIR so tests never collide.
pub struct TestEnv {
    pub root: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("failed to create cache root"),
        }
    }

    pub fn root_path(&self) -> &std::path::Path {
        self.root.path()
    }

    /// Base command with this env's root and the given registry list.
    pub fn command_with_registries(&self, registries: &str) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_figc"));
        cmd.arg("--root")
            .arg(self.root.path())
            .arg("--pipe")
            .arg("figc-test")
            .arg("--registries")
            .arg(registries)
            .arg("--retry-delay")
            .arg("0.05")
            .env("XDG_RUNTIME_DIR", self.root.path());
        cmd
    }

    pub fn command(&self, registry: &Registry) -> Command {
        self.command_with_registries(&registry.base_url())
    }

    pub fn ensure(&self, registry: &Registry, id: &str, version: &str) -> Output {
        self.command(registry)
            .args(["ensure", id, version])
            .output()
            .expect("failed to run figc")
    }

    pub fn package_dir(&self, key: &str) -> PathBuf {
        self.root.path().join("packages").join(key)
    }

    /// Names of `*.tmp-*` staging leftovers under `packages/`.
    pub fn staging_leftovers(&self) -> Vec<String> {
        let packages = self.root.path().join("packages");
        let Ok(entries) = std::fs::read_dir(&packages) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| name.contains(".tmp-"))
            .collect()
    }

    /// Names of all entries under `packages/`.
    pub fn package_entries(&self) -> Vec<String> {
        let packages = self.root.path().join("packages");
        let Ok(entries) = std::fs::read_dir(&packages) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect()
    }
}

pub fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

/// `type` fields of the streamed event lines, in order.
pub fn event_types(output: &Output) -> Vec<String> {
    stdout_lines(output)
        .iter()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .collect()
}

/// The `path` from the final output line.
pub fn final_path(output: &Output) -> Option<PathBuf> {
    let lines = stdout_lines(output);
    let last = lines.last()?;
    let value: serde_json::Value = serde_json::from_str(last).ok()?;
    value
        .get("path")
        .and_then(|p| p.as_str())
        .map(PathBuf::from)
}

pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ---------------------------------------------------------------------------
// Canned HTTP registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl CannedResponse {
    pub fn json(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body: body.into_bytes(),
            delay: Duration::ZERO,
        }
    }

    pub fn gzip(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/gzip".to_string(),
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: b"not found".to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A minimal HTTP/1.1 server serving canned responses and counting hits
/// per path. One thread per connection so delayed responses overlap.
pub struct Registry {
    addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, CannedResponse>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Registry {
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind registry");
        let addr = listener.local_addr().expect("no local addr");
        let routes: Arc<Mutex<HashMap<String, CannedResponse>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

        let thread_routes = routes.clone();
        let thread_hits = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let routes = thread_routes.clone();
                let hits = thread_hits.clone();
                std::thread::spawn(move || serve_connection(stream, routes, hits));
            }
        });

        Registry { addr, routes, hits }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn route(&self, path: &str, response: CannedResponse) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

fn serve_connection(
    mut stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, CannedResponse>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
) {
    // Read the request head; the body (none for GET) is ignored.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return,
        }
        if head.len() > 64 * 1024 {
            return;
        }
    }
    let head = String::from_utf8_lossy(&head);
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    *hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    let response = routes
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or_else(CannedResponse::not_found);
    if !response.delay.is_zero() {
        std::thread::sleep(response.delay);
    }

    let reason = match response.status {
        200 => "OK",
        404 => "Not Found",
        _ => "Status",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason,
        response.content_type,
        response.body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&response.body);
    let _ = stream.flush();
}

// ---------------------------------------------------------------------------
// Package fixtures
// ---------------------------------------------------------------------------

/// Build a minimal IG package tarball: `package/package.json` plus one
/// payload file.
pub fn package_tarball(id: &str, version: &str) -> Vec<u8> {
    let manifest = format!("{{\"name\":\"{id}\",\"version\":\"{version}\"}}");
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        append_file(&mut builder, "package/package.json", manifest.as_bytes());
        append_file(&mut builder, "package/other.json", b"{}");
        builder.finish().unwrap();
    }
    gzip_bytes(&tar_bytes)
}

/// A tarball with an entry that tries to escape the extraction root.
pub fn hostile_tarball() -> Vec<u8> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        append_file(&mut builder, "package/package.json", b"{}");
        let mut header = tar::Header::new_gnu();
        let name = b"../evil.txt";
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"boom"[..]).unwrap();
        builder.finish().unwrap();
    }
    gzip_bytes(&tar_bytes)
}

fn append_file(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

fn gzip_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// SRI string for a tarball.
pub fn sri(tarball: &[u8]) -> String {
    format!("sha512-{}", BASE64_STANDARD.encode(Sha512::digest(tarball)))
}

/// Serve `id@version` from the registry: a manifest route plus a tarball
/// route, with correct SRI integrity unless overridden.
pub fn register_package(registry: &Registry, id: &str, version: &str) {
    register_package_with(registry, id, version, None, Duration::ZERO);
}

pub fn register_package_with(
    registry: &Registry,
    id: &str,
    version: &str,
    integrity_override: Option<String>,
    tarball_delay: Duration,
) {
    let tarball = package_tarball(id, version);
    let integrity = integrity_override.unwrap_or_else(|| sri(&tarball));
    let tarball_path = format!("/tarballs/{id}-{version}.tgz");
    let manifest = format!(
        "{{\"dist\":{{\"tarball\":\"{}\",\"integrity\":\"{}\"}}}}",
        registry.url(&tarball_path),
        integrity
    );
    registry.route(&format!("/{id}/{version}"), CannedResponse::json(manifest));
    registry.route(
        &tarball_path,
        CannedResponse::gzip(tarball).with_delay(tarball_delay),
    );
}

/// Path to the tarball route used by [`register_package`], for hit counts.
pub fn tarball_route(id: &str, version: &str) -> String {
    format!("/tarballs/{id}-{version}.tgz")
}
