//! Operator probe: run one credential through the IMAP auth backend.
//!
//! ```text
//! echo 'secret' | imap-authn-probe --config imap.yaml --username alice
//! ```
//!
//! Exit status is 0 on accept, 1 on reject and 2 for anything else.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use auth_backend_sdk::{
    AuthRequest, CertAttribute, CredentialField, Diagnostic, DiagnosticLevel, Verdict,
};
use clap::Parser;
use imap_authn_plugin::ImapAuthNPlugin;
use imap_authn_plugin::config::ImapAuthNPluginConfig;
use imap_authn_plugin::infra::DetachMode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Check a username/password pair by logging in to the configured IMAP server.
///
/// The password is read from the first line of standard input.
#[derive(Parser)]
#[command(name = "imap-authn-probe", version, about)]
struct Cli {
    /// Plugin configuration file (YAML, overridable with `IMAP_AUTHN_*`)
    #[arg(short, long)]
    config: PathBuf,

    /// User name to authenticate
    #[arg(short, long)]
    username: String,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    /// How long in-flight attempts may finish when the probe shuts down
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    drain: Duration,
}

/// Request built from the command line.
struct ProbeRequest {
    username: String,
    password: SecretString,
    claimed_by: Option<String>,
    attributes: Vec<CertAttribute>,
    diagnostics: Vec<Diagnostic>,
}

impl AuthRequest for ProbeRequest {
    fn credential(&self, field: CredentialField) -> Option<&str> {
        match field {
            CredentialField::UserName => Some(&self.username),
            CredentialField::UserPassword => Some(self.password.expose_secret()),
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

#[derive(Serialize)]
struct Outcome<'a> {
    verdict: Verdict,
    attributes: &'a [CertAttribute],
    diagnostics: &'a [Diagnostic],
}

fn read_password() -> anyhow::Result<SecretString> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_owned();
    Ok(SecretString::from(password))
}

async fn run(cli: Cli) -> anyhow::Result<Verdict> {
    anyhow::ensure!(
        cli.config.is_file(),
        "configuration file {} not found",
        cli.config.display()
    );
    let cfg = ImapAuthNPluginConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let plugin = ImapAuthNPlugin::load(&cfg)?;
    let password = read_password()?;

    let worker = plugin.instantiate_worker()?;
    let mut request = ProbeRequest {
        username: cli.username,
        password,
        claimed_by: None,
        attributes: Vec::new(),
        diagnostics: Vec::new(),
    };

    let verdict = match worker.authorize(&mut request) {
        Verdict::Proceed => worker.authenticate(&mut request).await,
        other => other,
    };
    let report = worker.detach(DetachMode::Drain { grace: cli.drain }).await;
    info!(
        completed = report.completed,
        cancelled = report.cancelled,
        "worker detached"
    );
    plugin.unload().map_err(|(_, e)| e)?;

    if cli.json {
        let outcome = Outcome {
            verdict,
            attributes: &request.attributes,
            diagnostics: &request.diagnostics,
        };
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{verdict}");
        for diagnostic in &request.diagnostics {
            let level = match diagnostic.level {
                DiagnosticLevel::Debug => "debug",
                DiagnosticLevel::Info => "info",
                DiagnosticLevel::Warn => "warn",
                DiagnosticLevel::Error => "error",
            };
            println!("  {level}: {}", diagnostic.message);
        }
        for attr in &request.attributes {
            println!("  {}[{}] = {}", attr.name, attr.depth, attr.value);
        }
    }

    Ok(verdict)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(Verdict::Accept) => ExitCode::SUCCESS,
        Ok(Verdict::Reject) => ExitCode::from(1),
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
