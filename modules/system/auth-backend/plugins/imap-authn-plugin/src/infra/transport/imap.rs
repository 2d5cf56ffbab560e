//! IMAP login exchange over TCP, with implicit TLS or STARTTLS.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use super::protocol::{MAX_LINE, Response, Status, Tagger, quote};
use crate::config::{Security, StartTlsMode};
use crate::domain::attempt::{
    AttemptStatus, CompletedAttempt, LoginAttempt, TlsPolicy, TlsSessionInfo, TransportFailure,
};
use crate::domain::transport::Transport;

const LOGOUT_GRACE: Duration = Duration::from_secs(1);

/// Production transport: one TCP connection per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImapTransport;

#[async_trait]
impl Transport for ImapTransport {
    async fn login(&self, attempt: &LoginAttempt) -> CompletedAttempt {
        let mut tls = None;
        let status = match exchange(attempt, &mut tls).await {
            Ok(()) => AttemptStatus::Success,
            Err(abort) => abort.into(),
        };
        CompletedAttempt { status, tls }
    }
}

/// Why an exchange stopped before a successful login.
#[derive(Debug)]
enum Abort {
    Transport(TransportFailure),
    Protocol(String),
}

impl From<TransportFailure> for Abort {
    fn from(failure: TransportFailure) -> Self {
        Self::Transport(failure)
    }
}

impl From<Abort> for AttemptStatus {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Transport(failure) => Self::TransportFailure(failure),
            Abort::Protocol(reason) => Self::ProtocolFailure { reason },
        }
    }
}

fn io_failure(e: &std::io::Error) -> TransportFailure {
    TransportFailure::Io(e.to_string())
}

/// Reply to a tagged command.
#[derive(Debug)]
struct Reply {
    status: Option<Status>,
    text: String,
}

impl Reply {
    fn is_ok(&self) -> bool {
        self.status == Some(Status::Ok)
    }

    fn describe(&self) -> String {
        match self.status {
            Some(status) => format!("{status} {}", self.text).trim_end().to_owned(),
            None => self.text.clone(),
        }
    }
}

/// Run `phase` against the connection deadline.
async fn within<T, F>(deadline: Instant, budget: Duration, phase: F) -> Result<T, Abort>
where
    F: Future<Output = Result<T, Abort>>,
{
    timeout_at(deadline, phase)
        .await
        .map_err(|_| TransportFailure::Timeout {
            phase: "connect",
            after: budget,
        })?
}

async fn exchange(attempt: &LoginAttempt, tls: &mut Option<TlsSessionInfo>) -> Result<(), Abort> {
    let budget = attempt.connect_timeout;
    let deadline = Instant::now() + budget;
    let authority = attempt.target.authority();

    let tcp = within(deadline, budget, async {
        TcpStream::connect(&authority).await.map_err(|e| {
            Abort::from(TransportFailure::Connect {
                target: authority.clone(),
                reason: e.to_string(),
            })
        })
    })
    .await?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    debug!(target = %authority, "connected");

    match attempt.target.security {
        Security::ImplicitTls => {
            let stream = within(deadline, budget, handshake(tcp, &attempt.tls, tls)).await?;
            let mut conn = Connection::new(stream, Tagger::default(), attempt.verbose);
            within(deadline, budget, conn.greeting()).await?;
            conn.finish(attempt).await
        }
        Security::StartTls(StartTlsMode::Off) => {
            let mut conn = Connection::new(tcp, Tagger::default(), attempt.verbose);
            within(deadline, budget, conn.greeting()).await?;
            conn.finish(attempt).await
        }
        Security::StartTls(mode) => {
            let mut conn = Connection::new(tcp, Tagger::default(), attempt.verbose);
            within(deadline, budget, conn.greeting()).await?;

            if within(deadline, budget, conn.starttls()).await? {
                let (tcp, tagger) = conn.into_parts()?;
                let stream = within(deadline, budget, handshake(tcp, &attempt.tls, tls)).await?;
                Connection::new(stream, tagger, attempt.verbose)
                    .finish(attempt)
                    .await
            } else if mode == StartTlsMode::Required {
                Err(TransportFailure::Tls("server refused STARTTLS".to_owned()).into())
            } else {
                warn!(target = %authority, "server refused STARTTLS, continuing in plaintext");
                conn.finish(attempt).await
            }
        }
    }
}

/// Perform the TLS handshake, recording what was learned about the peer
/// even when the handshake fails.
async fn handshake(
    tcp: TcpStream,
    policy: &TlsPolicy,
    tls: &mut Option<TlsSessionInfo>,
) -> Result<TlsStream<TcpStream>, Abort> {
    let connector = TlsConnector::from(Arc::clone(&policy.client_config));
    match connector.connect(policy.server_name.clone(), tcp).await {
        Ok(stream) => {
            let peer_certificates = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|chain| chain.iter().cloned().map(CertificateDer::into_owned).collect())
                .unwrap_or_default();
            *tls = Some(TlsSessionInfo {
                verified: policy.verification.outcome(),
                peer_certificates,
            });
            debug!(verified = ?policy.verification.outcome(), "TLS established");
            Ok(stream)
        }
        Err(e) => {
            *tls = Some(TlsSessionInfo {
                verified: policy.verification.outcome(),
                peer_certificates: Vec::new(),
            });
            Err(TransportFailure::Tls(e.to_string()).into())
        }
    }
}

/// Line-oriented IMAP connection.
struct Connection<S> {
    reader: BufReader<S>,
    tagger: Tagger,
    verbose: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, tagger: Tagger, verbose: bool) -> Self {
        Self {
            reader: BufReader::new(stream),
            tagger,
            verbose,
        }
    }

    /// Hand the raw stream back for a TLS upgrade.
    fn into_parts(self) -> Result<(S, Tagger), TransportFailure> {
        if !self.reader.buffer().is_empty() {
            return Err(TransportFailure::Tls(
                "server sent data before the TLS handshake".to_owned(),
            ));
        }
        Ok((self.reader.into_inner(), self.tagger))
    }

    async fn read_line(&mut self) -> Result<String, TransportFailure> {
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| io_failure(&e))?;

        if read == 0 {
            return Err(TransportFailure::Closed);
        }
        if !buf.ends_with(b"\n") {
            if read >= MAX_LINE {
                return Err(TransportFailure::Io(format!(
                    "response line exceeds {MAX_LINE} bytes"
                )));
            }
            return Err(TransportFailure::Closed);
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_owned();
        if self.verbose {
            debug!(direction = "S", line = %line, "imap");
        }
        Ok(line)
    }

    async fn write(&mut self, bytes: &[u8], shown: &str) -> Result<(), TransportFailure> {
        if self.verbose {
            debug!(direction = "C", line = %shown, "imap");
        }
        let stream = self.reader.get_mut();
        stream.write_all(bytes).await.map_err(|e| io_failure(&e))?;
        stream.flush().await.map_err(|e| io_failure(&e))
    }

    async fn command(&mut self, verb: &str) -> Result<Reply, TransportFailure> {
        let tag = self.tagger.next_tag();
        let line = format!("{tag} {verb}");
        self.write(format!("{line}\r\n").as_bytes(), &line).await?;
        self.await_tagged(&tag).await
    }

    async fn await_tagged(&mut self, tag: &str) -> Result<Reply, TransportFailure> {
        loop {
            let line = self.read_line().await?;
            match Response::parse(&line) {
                Response::Tagged {
                    tag: seen,
                    status,
                    text,
                } if seen.eq_ignore_ascii_case(tag) => {
                    return Ok(Reply {
                        status,
                        text: text.to_owned(),
                    });
                }
                Response::Untagged {
                    status: Some(Status::Bye),
                    text,
                } => {
                    return Ok(Reply {
                        status: Some(Status::Bye),
                        text: text.to_owned(),
                    });
                }
                _ => {}
            }
        }
    }

    async fn greeting(&mut self) -> Result<(), Abort> {
        let line = self.read_line().await?;
        match Response::parse(&line) {
            Response::Untagged {
                status: Some(Status::Ok),
                ..
            } => Ok(()),
            Response::Untagged {
                status: Some(Status::Preauth),
                ..
            } => Err(Abort::Protocol(
                "server pre-authenticated the connection".to_owned(),
            )),
            _ => Err(Abort::Protocol(format!("unexpected greeting: {line}"))),
        }
    }

    /// Ask for a TLS upgrade. `false` means the server declined.
    async fn starttls(&mut self) -> Result<bool, Abort> {
        let reply = self.command("STARTTLS").await?;
        if reply.status == Some(Status::Bye) {
            return Err(Abort::Protocol(reply.describe()));
        }
        Ok(reply.is_ok())
    }

    async fn login(&mut self, attempt: &LoginAttempt) -> Result<(), Abort> {
        let tag = self.tagger.next_tag();
        let command = SecretString::from(format!(
            "{tag} LOGIN {} {}\r\n",
            quote(&attempt.username),
            quote(attempt.password.expose_secret())
        ));
        self.write(
            command.expose_secret().as_bytes(),
            &format!("{tag} LOGIN <redacted>"),
        )
        .await?;

        let reply = self.await_tagged(&tag).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(Abort::Protocol(reply.describe()))
        }
    }

    async fn logout(&mut self) -> Result<(), TransportFailure> {
        self.command("LOGOUT").await?;
        self.reader.get_mut().shutdown().await.map_err(|e| io_failure(&e))
    }

    /// Log in, then leave politely without letting LOGOUT affect the result.
    async fn finish(mut self, attempt: &LoginAttempt) -> Result<(), Abort> {
        let outcome = self.login(attempt).await;
        if outcome.is_ok() {
            match timeout(LOGOUT_GRACE, self.logout()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "LOGOUT failed"),
                Err(_) => debug!("LOGOUT timed out"),
            }
        }
        outcome
    }
}
