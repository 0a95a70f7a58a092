//! Presence broadcaster binary.
//!
//! Keeps a presence session open against the local peer and feeds it context
//! snapshots read from stdin, one JSON object per line:
//!
//! ```text
//! {"display_name":"main.rs","line_number":12,"line_count":300,"category_icon":"rust","category_text":"Rust","detailed_display":true}
//! ```

use clap::Parser;
use presence_session::{
    ClientId, ConfigWarning, ConnectionState, LocalConnector, PresenceContext, PresenceEventHandler,
    Session,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::PresenceConfig;
use logging::PresenceLogFormatter;

/// Broadcast editor presence to a local peer over IPC
#[derive(Parser, Debug)]
#[command(name = "presence-ipc", version, about = "Broadcast presence over a local IPC socket")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "presence.yaml")]
    config: PathBuf,

    /// Client id; when absent it is re-read from the config file on every handshake
    #[arg(long)]
    client_id: Option<String>,

    /// Explicit endpoint path, e.g. /run/user/1000/discord-ipc-0
    #[arg(long)]
    endpoint: Option<PathBuf>,

    /// Host application name shown on the large image
    #[arg(long)]
    app_name: Option<String>,

    /// Connect retry interval, e.g. 15s
    #[arg(long)]
    reconnect_interval: Option<humantime::Duration>,

    /// Presence refresh interval, e.g. 15s
    #[arg(long)]
    update_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Logs session changes
#[derive(Debug)]
struct LogEventHandler;

impl PresenceEventHandler for LogEventHandler {
    fn notify_state_changed(&self, state: ConnectionState) {
        component_info!("session", "Presence session {}", state);
    }

    fn notify_warning(&self, warning: ConfigWarning) {
        // Already logged by the session; surface it on stderr for the user too.
        eprintln!("presence-ipc: {}", warning);
    }
}

impl Args {
    /// Layer flags over `config` and validate the result
    fn apply_to(&self, config: &mut PresenceConfig) -> anyhow::Result<()> {
        if let Some(client_id) = &self.client_id {
            config.client_id = Some(client_id.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint_path = Some(endpoint.display().to_string());
        }
        if let Some(name) = &self.app_name {
            config.application_name = name.clone();
        }
        if let Some(interval) = self.reconnect_interval {
            config.reconnect_interval = interval.into();
        }
        if let Some(interval) = self.update_interval {
            config.update_interval = interval.into();
        }
        config.validate()
    }

    /// Static id from the command line, otherwise a resolver over the config we loaded
    /// and the config file as it is at handshake time
    fn client_id(&self, config: &PresenceConfig) -> ClientId {
        if let Some(client_id) = &self.client_id {
            return ClientId::from(client_id.clone());
        }
        let path = self.config.clone();
        let loaded = config.client_id.clone();
        ClientId::from_fn(move || PresenceConfig::read_client_id(&path).or_else(|| loaded.clone()))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("presence_ipc={}", args.log_level).parse()?)
        .add_directive(format!("presence_session={}", args.log_level).parse()?)
        .add_directive(format!("presence_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(PresenceLogFormatter::new("presence".to_string()))
        .init();

    info!("Starting presence-ipc v{}", env!("CARGO_PKG_VERSION"));

    let mut config = PresenceConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config)?;

    let endpoint = config.endpoint();
    info!("Peer endpoint: {:?}", endpoint.path());

    let (context_tx, context_rx) = watch::channel(PresenceContext::default());
    let handler: Arc<dyn PresenceEventHandler> = Arc::new(LogEventHandler);
    let session = Session::spawn_with_handler(
        config.session_config(),
        Arc::new(LocalConnector::new(endpoint)),
        Arc::new(context_rx),
        Some(handler),
    );
    session.enable(args.client_id(&config));

    tokio::select! {
        result = read_contexts(context_tx) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    session.disable();
    session.shutdown().await;
    info!("Presence session closed");
    Ok(())
}

/// Feed stdin snapshots into the session until stdin closes
async fn read_contexts(context_tx: watch::Sender<PresenceContext>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<PresenceContext>(line) {
            Ok(context) => {
                component_debug!(
                    "stdin",
                    "Context update: {} line {}",
                    context.display_name,
                    context.line_number
                );
                context_tx.send_replace(context);
            }
            Err(e) => component_warn!("stdin", "Ignoring malformed context line: {}", e),
        }
    }

    component_info!("stdin", "Input closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse(flags: &[&str]) -> Args {
        let argv = std::iter::once("presence-ipc").chain(flags.iter().copied());
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&["--app-name", "Notes", "--reconnect-interval", "30s"]);
        let mut config = PresenceConfig::default();
        args.apply_to(&mut config).unwrap();

        assert_eq!(config.application_name, "Notes");
        assert_eq!(config.reconnect_interval, Duration::from_secs(30));
        assert_eq!(config.update_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_zero_interval_flag_rejected() {
        for flag in ["--reconnect-interval", "--update-interval"] {
            let args = parse(&[flag, "0s"]);
            let mut config = PresenceConfig::default();
            assert!(args.apply_to(&mut config).is_err(), "{} 0s accepted", flag);
        }
    }

    #[test]
    fn test_client_id_flag_is_static() {
        let args = parse(&["--client-id", "42"]);
        let config = PresenceConfig::default();
        assert_eq!(args.client_id(&config).resolve().as_deref(), Some("42"));
    }
}
