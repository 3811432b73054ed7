use stackgate::admin::{AdminServer, PKG_NAME, VERSION};
use stackgate::config::Config;
use stackgate::manager::ServiceManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Command line: `stackgate [config.toml] [--dns <host>]`
struct Args {
    config_path: Option<PathBuf>,
    dns: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config_path: None,
        dns: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dns" | "-dns" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--dns requires a value"))?;
                args.dns = Some(value);
            }
            _ if arg.starts_with("--dns=") => {
                args.dns = Some(arg["--dns=".len()..].to_string());
            }
            _ if args.config_path.is_none() => args.config_path = Some(PathBuf::from(arg)),
            _ => anyhow::bail!("Unexpected argument: {}", arg),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stackgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = parse_args()?;

    let mut config = match &args.config_path {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };

    if let Some(dns) = args.dns {
        config.dns.server = dns;
        config.validate()?;
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = ServiceManager::from_config(&config).await?;

    for service in &config.services {
        match manager.create_service(service.clone()).await {
            Ok(info) => info!(identifier = %info.identifier, port = info.listen_port, "Static service started"),
            Err(e) => {
                error!(identifier = %service.identifier(), error = %e, "Failed to start static service");
                manager.shutdown_all().await;
                return Err(e.into());
            }
        }
    }

    let admin_addr = config.server.admin_addr()?;
    let mut admin_server = AdminServer::new(Arc::clone(&manager), shutdown_rx.clone());
    if let Some(token) = config.server.admin_token.clone() {
        admin_server = admin_server.with_auth_token(token);
    }

    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await.map_err(|e| {
        error!(addr = %admin_addr, error = %e, "Failed to bind management API");
        e
    })?;

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.serve(admin_listener).await {
            error!(error = %e, "Management API error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Management API first, then every service
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(config.defaults.shutdown_grace_period(), admin_handle)
        .await
        .is_err()
    {
        warn!("Management API did not stop in time");
    }

    manager.shutdown_all().await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy manager");
    info!(
        bind = %config.server.bind,
        admin_bind = %config.server.admin_bind,
        admin_port = config.server.admin_port,
        admin_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        dns_server = %config.dns.server,
        dns_port = config.dns.port,
        domain = %config.dns.domain,
        attempts = config.dns.attempts,
        attempt_timeout_ms = config.dns.attempt_timeout_ms,
        "DNS settings"
    );
    info!(
        request_timeout_secs = config.defaults.request_timeout_secs,
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        max_body_bytes = config.defaults.max_body_bytes,
        "Service defaults"
    );
    info!(
        static_services = config.services.len(),
        services = ?config.services.iter().map(|s| s.identifier()).collect::<Vec<_>>(),
        "Configured services"
    );
}
