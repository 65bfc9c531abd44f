use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod auth;
mod blocklist;
mod config;
mod netmon;
mod pac;
mod proxy;

use auth::{AuthMethod, BasicAuthenticator, MultiAuthenticator, NtlmAuthenticator};
use blocklist::Blocklist;
use config::{BasicCredentials, NtlmCredentials};
use pac::ProxyFinder;
use proxy::ProxyState;

#[derive(Parser)]
#[command(name = "alpaca")]
#[command(version)]
#[command(about = "Local HTTP proxy that authenticates to the upstream proxy chosen by a PAC script", long_about = None)]
struct Cli {
    /// Address to listen on (repeatable, defaults to localhost)
    #[arg(short = 'l', value_name = "HOST")]
    listen: Vec<String>,

    /// Port number to listen on
    #[arg(short = 'p', default_value_t = 3128)]
    port: u16,

    /// URL of the proxy auto-config (PAC) file
    #[arg(short = 'C', value_name = "URL")]
    pac_url: Option<String>,

    /// Domain of the proxy account (for NTLM auth)
    #[arg(short = 'd', value_name = "DOMAIN")]
    domain: Option<String>,

    /// Username for NTLM proxy auth (defaults to the current user)
    #[arg(short = 'u', value_name = "USER")]
    username: Option<String>,

    /// login:password for Basic proxy auth
    #[arg(short = 'b', value_name = "LOGIN:PASSWORD")]
    basic: Option<String>,

    /// Enable Kerberos/Negotiate proxy authentication
    #[arg(short = 'k')]
    kerberos: bool,

    /// Seconds to wait for a Kerberos ticket at startup
    #[arg(short = 'w', default_value_t = 30, value_name = "SECONDS")]
    kerberos_wait: u64,

    /// Quiet mode, suppress all log output
    #[arg(short = 'q')]
    quiet: bool,

    /// Emit JSON log lines on stdout
    #[arg(long = "json-logs")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let basic = cli
        .basic
        .as_deref()
        .map(BasicCredentials::parse)
        .transpose()?;
    if basic.is_some() {
        info!("Basic proxy authentication configured");
    }
    let ntlm = ntlm_credentials(&cli)?;

    // Chain order: Negotiate, then Basic, then NTLM. The multi-authenticator
    // tries each method on 407 and caches which one works per proxy host.
    let mut methods = Vec::new();
    if cli.kerberos {
        #[cfg(all(unix, feature = "negotiate"))]
        {
            let wait = std::time::Duration::from_secs(cli.kerberos_wait);
            if let Some(negotiate) = auth::NegotiateAuthenticator::new(wait).await {
                info!("Kerberos/Negotiate authentication available");
                methods.push(AuthMethod::Negotiate(negotiate));
            }
        }
        #[cfg(not(all(unix, feature = "negotiate")))]
        warn!("this build has no Negotiate support, ignoring -k");
    }
    if let Some(basic) = basic {
        methods.push(AuthMethod::Basic(BasicAuthenticator::new(basic)));
    }
    if let Some(ntlm) = ntlm {
        methods.push(AuthMethod::Ntlm(NtlmAuthenticator::new(ntlm)));
    }
    let auth = if methods.is_empty() {
        None
    } else {
        Some(MultiAuthenticator::new(methods))
    };

    let blocklist = Arc::new(Blocklist::new());
    let finder = ProxyFinder::new(cli.pac_url.clone(), blocklist.clone());
    netmon::spawn(blocklist);
    let state = Arc::new(ProxyState::new(finder, auth));

    let hosts = if cli.listen.is_empty() {
        vec!["localhost".to_string()]
    } else {
        cli.listen.clone()
    };

    let mut servers = JoinSet::new();
    for host in &hosts {
        let addrs = tokio::net::lookup_host((host.as_str(), cli.port))
            .await
            .with_context(|| format!("cannot resolve listen address {host}"))?;
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot listen on {addr}"))?;
            info!("listening on {addr}");
            servers.spawn(proxy::serve(listener, state.clone()));
        }
    }
    anyhow::ensure!(!servers.is_empty(), "no usable listen addresses");

    while let Some(finished) = servers.join_next().await {
        finished??;
    }
    Ok(())
}

fn init_logging(cli: &Cli) {
    if cli.quiet {
        // No subscriber installed: every log statement is a no-op.
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// NTLM credential sources, in order: `-d`/`-u` with the password taken
/// from `NTLM_PASSWORD`, then the pre-hashed `NTLM_CREDENTIALS` variable.
/// The terminal prompt and platform keyring sources live outside the core.
/// Missing credentials disable NTLM; malformed ones are a startup error.
fn ntlm_credentials(cli: &Cli) -> anyhow::Result<Option<NtlmCredentials>> {
    if let Some(domain) = &cli.domain {
        let username = match cli.username.clone().or_else(current_username) {
            Some(username) => username,
            None => {
                warn!("no username given (-u) and none in the environment, disabling NTLM auth");
                return Ok(None);
            }
        };
        match std::env::var("NTLM_PASSWORD") {
            Ok(password) if !password.is_empty() => {
                return Ok(Some(NtlmCredentials::from_password(
                    domain, &username, &password,
                )));
            }
            _ => {
                warn!("NTLM_PASSWORD not set, disabling NTLM auth");
                return Ok(None);
            }
        }
    }
    if let Ok(value) = std::env::var("NTLM_CREDENTIALS") {
        if !value.is_empty() {
            return Ok(Some(NtlmCredentials::from_env_value(&value)?));
        }
    }
    Ok(None)
}

fn current_username() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
}
