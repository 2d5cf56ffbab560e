#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Shared fixtures: a host request double, an in-process IMAP server and
//! scripted transports.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use auth_backend_sdk::{AuthRequest, CertAttribute, CredentialField, Diagnostic};
use imap_authn_plugin::config::{ImapAuthNPluginConfig, InstanceConfig, TlsConfig};
use imap_authn_plugin::domain::attempt::{CompletedAttempt, LoginAttempt};
use imap_authn_plugin::domain::builder::LoginAttemptBuilder;
use imap_authn_plugin::domain::credential::Credential;
use imap_authn_plugin::domain::transport::Transport;
use imap_authn_plugin::infra::TransportEngine;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

// ---------------------------------------------------------------------------
// Host request double
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MockRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub claimed_by: Option<String>,
    pub attributes: Vec<CertAttribute>,
    pub diagnostics: Vec<Diagnostic>,
}

impl MockRequest {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_owned()),
            password: Some(password.to_owned()),
            ..Self::default()
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name && attr.depth == 0)
            .map(|attr| attr.value.as_str())
    }

    pub fn messages(&self) -> Vec<&str> {
        self.diagnostics.iter().map(|d| d.message.as_str()).collect()
    }
}

impl AuthRequest for MockRequest {
    fn credential(&self, field: CredentialField) -> Option<&str> {
        match field {
            CredentialField::UserName => self.username.as_deref(),
            CredentialField::UserPassword => self.password.as_deref(),
        }
    }

    fn claim_auth_type(&mut self, auth_type: &str) -> bool {
        match &self.claimed_by {
            Some(owner) => owner == auth_type,
            None => {
                self.claimed_by = Some(auth_type.to_owned());
                true
            }
        }
    }

    fn attach_attributes(&mut self, attributes: Vec<CertAttribute>) {
        self.attributes.extend(attributes);
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }
}

// ---------------------------------------------------------------------------
// Test PKI
// ---------------------------------------------------------------------------

/// A CA and a `localhost` server certificate signed by it.
pub struct TestPki {
    pub ca_file: tempfile::NamedTempFile,
    pub server_config: Arc<ServerConfig>,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "IMAP Test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec!["localhost".to_owned()]).unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        let mut ca_file = tempfile::NamedTempFile::new().unwrap();
        ca_file.write_all(ca.pem().as_bytes()).unwrap();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone(), ca.der().clone()], key)
            .unwrap();

        Self {
            ca_file,
            server_config: Arc::new(server_config),
        }
    }

    pub fn tls_config(&self) -> TlsConfig {
        TlsConfig {
            ca_file: Some(self.ca_file.path().to_path_buf()),
            ..TlsConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// In-process IMAP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plaintext, STARTTLS answered with `BAD`.
    Plain,
    /// Plaintext, STARTTLS upgrades the connection.
    StartTls,
    /// TLS from the first byte.
    ImplicitTls,
    /// Accept the connection and never say anything.
    Silent,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub mode: Mode,
    pub greeting: String,
    pub accounts: Vec<(String, String)>,
}

impl Script {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            greeting: "* OK [CAPABILITY IMAP4rev1 STARTTLS] test server ready".to_owned(),
            accounts: vec![("alice".to_owned(), "correct horse".to_owned())],
        }
    }
}

/// Listens on an ephemeral loopback port until dropped.
pub struct FakeImap {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub commands: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeImap {
    pub async fn start(script: Script, pki: Option<&TestPki>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let acceptor = pki.map(|pki| TlsAcceptor::from(Arc::clone(&pki.server_config)));
        let script = Arc::new(script);

        let task = tokio::spawn({
            let connections = Arc::clone(&connections);
            let commands = Arc::clone(&commands);
            async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        tcp,
                        Arc::clone(&script),
                        acceptor.clone(),
                        Arc::clone(&commands),
                    ));
                }
            }
        });

        Self {
            addr,
            connections,
            commands,
            task,
        }
    }

    pub fn uri(&self, scheme: &str) -> String {
        format!("{scheme}://localhost:{}", self.addr.port())
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn saw(&self, verb: &str) -> bool {
        self.commands.lock().iter().any(|c| c == verb)
    }
}

impl Drop for FakeImap {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Next {
    Upgrade,
    Done,
}

async fn serve(
    tcp: TcpStream,
    script: Arc<Script>,
    acceptor: Option<TlsAcceptor>,
    commands: Arc<Mutex<Vec<String>>>,
) {
    match script.mode {
        Mode::Silent => tokio::time::sleep(Duration::from_secs(60)).await,
        Mode::ImplicitTls => {
            let Ok(tls) = acceptor.unwrap().accept(tcp).await else {
                return;
            };
            let mut conn = BufReader::new(tls);
            if send(&mut conn, &script.greeting).await {
                converse(&mut conn, &script, false, &commands).await;
            }
        }
        Mode::Plain | Mode::StartTls => {
            let mut conn = BufReader::new(tcp);
            if !send(&mut conn, &script.greeting).await {
                return;
            }
            let upgrade = script.mode == Mode::StartTls;
            if let Next::Upgrade = converse(&mut conn, &script, upgrade, &commands).await {
                let Ok(tls) = acceptor.unwrap().accept(conn.into_inner()).await else {
                    return;
                };
                converse(&mut BufReader::new(tls), &script, false, &commands).await;
            }
        }
    }
}

async fn send<S>(conn: &mut BufReader<S>, line: &str) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.get_mut()
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .is_ok()
}

async fn converse<S>(
    conn: &mut BufReader<S>,
    script: &Script,
    starttls: bool,
    commands: &Mutex<Vec<String>>,
) -> Next
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match conn.read_line(&mut line).await {
            Ok(0) | Err(_) => return Next::Done,
            Ok(_) => {}
        }
        let line = line.trim_end();
        let (tag, rest) = line.split_once(' ').unwrap_or((line, ""));
        let (verb, args) = rest.split_once(' ').unwrap_or((rest, ""));
        let verb = verb.to_ascii_uppercase();
        commands.lock().push(verb.clone());

        let reply = match verb.as_str() {
            "STARTTLS" if starttls => {
                send(conn, &format!("{tag} OK Begin TLS negotiation now")).await;
                return Next::Upgrade;
            }
            "LOGIN" => {
                let fields = unquote_all(args);
                let known = fields.len() == 2
                    && script
                        .accounts
                        .iter()
                        .any(|(u, p)| *u == fields[0] && *p == fields[1]);
                if known {
                    format!("{tag} OK LOGIN completed")
                } else {
                    format!("{tag} NO [AUTHENTICATIONFAILED] Authentication failed.")
                }
            }
            "LOGOUT" => {
                send(conn, "* BYE logging out").await;
                send(conn, &format!("{tag} OK LOGOUT completed")).await;
                return Next::Done;
            }
            _ => format!("{tag} BAD unsupported command"),
        };
        if !send(conn, &reply).await {
            return Next::Done;
        }
    }
}

/// Parse a sequence of IMAP quoted strings.
fn unquote_all(mut input: &str) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        input = input.trim_start();
        let Some(rest) = input.strip_prefix('"') else {
            return out;
        };
        let mut value = String::new();
        let mut chars = rest.char_indices();
        let mut end = None;
        while let Some((i, ch)) = chars.next() {
            match ch {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    end = Some(i + 1);
                    break;
                }
                other => value.push(other),
            }
        }
        let Some(end) = end else {
            return out;
        };
        out.push(value);
        input = &rest[end..];
    }
}

// ---------------------------------------------------------------------------
// Configuration helpers
// ---------------------------------------------------------------------------

/// TLS settings for plaintext targets that must not depend on the host's
/// trust store.
pub fn no_verify() -> TlsConfig {
    TlsConfig {
        check_cert: false,
        ..TlsConfig::default()
    }
}

pub fn plugin_config(uri: &str, tls: TlsConfig) -> ImapAuthNPluginConfig {
    ImapAuthNPluginConfig {
        imap_uri: uri.to_owned(),
        timeout: Duration::from_secs(5),
        tls,
        ..ImapAuthNPluginConfig::default()
    }
}

/// Build a real attempt against an unroutable target, for transports that
/// never look at it.
pub fn attempt(total_timeout: Duration) -> LoginAttempt {
    let cfg = ImapAuthNPluginConfig {
        imap_uri: "imap://127.0.0.1:1".to_owned(),
        timeout: total_timeout,
        tls: no_verify(),
        ..ImapAuthNPluginConfig::default()
    };
    let config = InstanceConfig::from_config(&cfg).unwrap();
    let builder = LoginAttemptBuilder::new(Arc::new(config), &TransportEngine::acquire());
    let credential = Credential::new("alice", SecretString::from("pw".to_owned())).unwrap();
    builder.build(credential).unwrap()
}

// ---------------------------------------------------------------------------
// Scripted transports
// ---------------------------------------------------------------------------

/// Completes every attempt with a fixed result after `delay`.
pub struct Scripted {
    pub result: CompletedAttempt,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl Scripted {
    pub fn new(result: CompletedAttempt, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            result,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn login(&self, _attempt: &LoginAttempt) -> CompletedAttempt {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

/// Never completes on its own.
#[derive(Default)]
pub struct Hanging {
    pub started: AtomicUsize,
}

#[async_trait]
impl Transport for Hanging {
    async fn login(&self, _attempt: &LoginAttempt) -> CompletedAttempt {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Panics inside the attempt.
pub struct Panicking;

#[async_trait]
impl Transport for Panicking {
    async fn login(&self, _attempt: &LoginAttempt) -> CompletedAttempt {
        panic!("transport exploded");
    }
}
