mod bootstrap;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use vaultfs_client::VaultClient;
use vaultfs_core::config::Config;
use vaultfs_core::{EngineRegistry, LoggedStore, SecretStore};
use vaultfs_fuse::MountOptions;

const USAGE: &str = "\
Usage: vaultfsd [OPTIONS] [MOUNTPOINT]

Mount the secret engines of a Vault server as a read-only filesystem.

Options:
  -c, --config <path>  Path to config file (default: $XDG_CONFIG_HOME/vaultfs/config.toml)
      --debug          Log every store request and raise vaultfs logging to debug
      --debug-fuse     Log FUSE protocol traffic
  -h, --help           Show this help message

Environment:
  VAULT_ADDR, VAULT_TOKEN, VAULT_NAMESPACE, VAULT_CACERT, VAULT_CAPATH,
  VAULT_SKIP_VERIFY, VAULT_TLS_SERVER_NAME and VAULT_CLIENT_TIMEOUT
  override the config file.
  RUST_LOG sets the base log filter.";

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    debug: bool,
    debug_fuse: bool,
    mountpoint: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Invocation {
    Run(Args),
    Help,
}

fn parse_args<I>(args: I) -> Result<Invocation, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-c" | "--config" => match args.next() {
                Some(path) => parsed.config = Some(PathBuf::from(path)),
                None => return Err(format!("{arg} requires a path argument")),
            },
            "--debug" => parsed.debug = true,
            "--debug-fuse" => parsed.debug_fuse = true,
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    parsed.config = Some(PathBuf::from(path));
                } else if other.starts_with('-') {
                    return Err(format!("unknown option: {other}"));
                } else if parsed.mountpoint.is_some() {
                    return Err(format!("unexpected argument: {other}"));
                } else {
                    parsed.mountpoint = Some(PathBuf::from(other));
                }
            }
        }
    }
    Ok(Invocation::Run(parsed))
}

/// `base` (from `RUST_LOG`, else `info`) raised by the debug flags.
fn filter_directives(base: Option<String>, debug: bool, debug_fuse: bool) -> String {
    let mut directives = base
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    if debug {
        for krate in ["vaultfs_core", "vaultfs_client", "vaultfs_fuse", "vaultfsd"] {
            directives.push_str(&format!(",{krate}=debug"));
        }
    }
    if debug_fuse {
        directives.push_str(",fuser=debug");
    }
    directives
}

fn init_logging(args: &Args) {
    let directives = filter_directives(
        std::env::var("RUST_LOG").ok(),
        args.debug,
        args.debug_fuse,
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("warning: invalid log filter {directives:?}: {e}");
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Invocation::Run(args)) => args,
        Ok(Invocation::Help) => {
            println!("{USAGE}");
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    init_logging(&args);

    // Before any token or secret is loaded into memory.
    bootstrap::harden_process();

    let config_path = args.config.clone().or_else(|| {
        config_path_in(std::env::var_os("XDG_CONFIG_HOME"), std::env::var_os("HOME"))
    });
    let mut config = match &config_path {
        Some(path) => load_config(path)?,
        None => {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME is set, using default config");
            Config::default()
        }
    };
    config.vault.apply_env(|key| std::env::var(key).ok());

    let Some(mountpoint) = args
        .mountpoint
        .clone()
        .or_else(|| config.mount.mountpoint.clone())
    else {
        eprintln!("error: no mountpoint given\n\n{USAGE}");
        std::process::exit(2);
    };

    let client = VaultClient::new(&config.vault).context("build Vault client")?;
    tracing::info!(address = client.address(), "using Vault server");

    let store: Arc<dyn SecretStore> = if args.debug || config.service.log_requests {
        Arc::new(LoggedStore::new(client))
    } else {
        Arc::new(client)
    };

    let options = MountOptions {
        fsname: config.mount.fsname.clone(),
        allow_other: config.mount.allow_other,
    };
    let handle = vaultfs_fuse::mount(
        &mountpoint,
        store,
        Arc::new(EngineRegistry::default()),
        &options,
    )
    .await?;
    tracing::info!("vaultfsd ready at {}", handle.mountpoint().display());

    let signal = wait_for_termination().await;
    tracing::info!(signal, "unmounting");
    drop(handle);
    Ok(())
}

/// Resolves with the name of the first termination signal received.
async fn wait_for_termination() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                tracing::warn!("cannot watch SIGTERM ({e}); stop vaultfsd with Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

/// `vaultfs/config.toml` under `$XDG_CONFIG_HOME`, else under `~/.config`.
fn config_path_in(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    let base = match xdg_config_home.filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(home.filter(|dir| !dir.is_empty())?).join(".config"),
    };
    Some(base.join("vaultfs").join("config.toml"))
}

/// Permission bits of `path` when group or others may access it.
#[cfg(unix)]
fn shared_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path).ok()?.permissions().mode() & 0o777;
    (mode & 0o077 != 0).then_some(mode)
}

fn load_config(path: &Path) -> Result<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(e) => return Err(e).with_context(|| format!("read config {}", path.display())),
    };

    #[cfg(unix)]
    {
        if let Some(mode) = shared_mode(path) {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "config file is accessible to other users and may hold the [vault] token; chmod 600 it"
            );
        }
    }

    let config = Config::from_toml(&content)
        .with_context(|| format!("parse config {}", path.display()))?;
    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}
