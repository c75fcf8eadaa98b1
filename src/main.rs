use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use torigoya_factory::app::{FactoryConfig, FactoryContext};
use torigoya_factory::builder::BuilderConfig;
use torigoya_factory::config::UserConfig;
use torigoya_factory::recipes::RecipeSourceConfig;
use torigoya_factory::store::Crontab;
use torigoya_factory::web::{self, AppState, AuthConfig};

#[derive(Parser)]
#[command(about = "Continuous package-building service for language toolchains")]
struct Args {
    /// Path to the service configuration.
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Directory build logs are written to.
    #[arg(long, default_value = "/tmp")]
    log_dir: PathBuf,

    /// Enable debug logging.
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;

    let user_config = UserConfig::load(&cwd.join(&args.config))?;
    let builder_section = user_config.builder()?.clone();

    info!("port: {}", user_config.server.port);
    info!("notification URL: {}", user_config.notification.url);
    info!(
        "cron timing: {:02}:{:02}",
        user_config.cron.hour, user_config.cron.minute
    );
    info!("config sets remote: {}", user_config.config_sets.remote);
    info!("config sets path: {}", user_config.config_sets.path);
    info!("package prefix: {}", builder_section.package_prefix);
    info!("install base prefix: {}", builder_section.install_base_prefix);
    if user_config.config_sets.remote {
        info!("config sets repository: {}", user_config.config_sets.repository);
    }

    let storage_dir = cwd.join("_storage");
    if !storage_dir.exists() {
        std::fs::create_dir_all(&storage_dir)?;
    }

    let factory_config = FactoryConfig {
        recipe_source: RecipeSourceConfig {
            remote: user_config.config_sets.remote,
            base_dir: user_config.config_sets_path(&cwd),
            repository: user_config.config_sets.repository.clone(),
        },
        available_packages_path: storage_dir.join("available_packages.json"),
        apt_repository_dir: storage_dir.join("apt_repository"),
        builder: BuilderConfig {
            virtual_usr_dir: storage_dir.join("torigoya_usr"),
            tmp_base_dir: storage_dir.join("temp"),
            packages_dir: storage_dir.join("packages"),
            package_prefix: builder_section.package_prefix.clone(),
            install_base_prefix: builder_section.install_base_prefix.clone(),
        },
        running_tasks_path: storage_dir.join("running_tasks.json"),
        profiles_path: storage_dir.join("proc_profiles.json"),
        database_path: storage_dir.join("db.sqlite"),
        notification_url: user_config.notification.url.clone(),
        notification_secret: user_config.notification.secret.clone(),
        cron: Crontab {
            hour: user_config.cron.hour,
            minute: user_config.cron.minute,
        },
        log_dir: args.log_dir.clone(),
    };

    let ctx = FactoryContext::new(factory_config).await?;
    ctx.ensure_configs_webhook(&user_config.config_sets.webhook_secret)
        .await?;

    let state = AppState {
        ctx: ctx.clone(),
        auth: Arc::new(AuthConfig {
            user: user_config.auth.user.clone(),
            password: user_config.auth.password.clone(),
        }),
    };
    let app = web::router(state);

    let listener = TcpListener::bind(("0.0.0.0", user_config.server.port)).await?;
    info!("listening on port {}", user_config.server.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, saving state");
    ctx.save_all().await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(err) = run(args).await {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
