//! Service wiring and build orchestration.
//!
//! [`FactoryContext`] owns every subsystem and is shared into the HTTP
//! handlers, the queue worker, and the daily scheduler. Builds, whether
//! started directly or drained from the queue, are serialized on one lock:
//! exactly one container build is active at any instant and a recipe-tree
//! refresh can never overlap a running build.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::apt::{AptError, AptRepository};
use crate::builder::{Builder, BuilderConfig, BuilderError};
use crate::config::ConfigError;
use crate::notify::{Notifier, NotifyError};
use crate::profiles::{ProfileError, ProfilesHolder};
use crate::recipes::{BuildConfig, RecipeError, RecipeSourceConfig, RecipeTree};
use crate::registry::{AvailablePackage, AvailablePackages, RegistryError};
use crate::store::{self, Crontab, DailyTaskStore, MiniLogger, WebhookStore};
use crate::tasks::RunningTasks;

/// The webhook target that refreshes the recipe tree instead of queueing a
/// build.
pub const CONFIGS_HOOK_TARGET: &str = "__configs";

const QUEUE_CAPACITY: usize = 100;

/// Errors raised while assembling the service at startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Recipes(#[from] RecipeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Apt(#[from] AptError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Profiles(#[from] ProfileError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the service needs on disk and over the wire.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub recipe_source: RecipeSourceConfig,
    pub available_packages_path: PathBuf,
    pub apt_repository_dir: PathBuf,
    pub builder: BuilderConfig,
    pub running_tasks_path: PathBuf,
    pub profiles_path: PathBuf,
    pub database_path: PathBuf,
    pub notification_url: String,
    pub notification_secret: String,
    pub cron: Crontab,
    pub log_dir: PathBuf,
}

/// One entry waiting for the build worker.
#[derive(Debug, Clone)]
pub struct QueueTask {
    pub config: BuildConfig,
}

/// The assembled service.
pub struct FactoryContext {
    pub apt: AptRepository,
    pub builder: Builder,
    pub recipes: RecipeTree,
    pub packages: AvailablePackages,
    pub tasks: RunningTasks,
    pub profiles: ProfilesHolder,
    pub webhooks: WebhookStore,
    pub daily_tasks: DailyTaskStore,
    pub minilog: MiniLogger,
    pub notifier: Option<Notifier>,
    pub cron: Crontab,
    pub log_dir: PathBuf,

    queue_tx: mpsc::Sender<QueueTask>,
    queue_mirror: std::sync::Mutex<Vec<QueueTask>>,
    queue_guard: tokio::sync::Mutex<()>,

    // Serializes container builds against each other and against
    // recipe-tree refreshes.
    build_lock: tokio::sync::Mutex<()>,
    // Serializes profile regeneration.
    regen_lock: tokio::sync::Mutex<()>,
}

impl FactoryContext {
    /// Assemble the service, spawn the queue worker and the daily
    /// scheduler.
    pub async fn new(config: FactoryConfig) -> Result<Arc<Self>, StartupError> {
        let pool = store::connect(&config.database_path).await?;
        let minilog = MiniLogger::new(pool.clone());
        let webhooks = WebhookStore::new(pool.clone());
        let daily_tasks = DailyTaskStore::new(pool);

        let apt = AptRepository::new(&config.apt_repository_dir)?;
        let builder = Builder::new(config.builder.clone())?;
        let recipes = RecipeTree::open(&config.recipe_source).await?;
        let packages = AvailablePackages::load(&config.available_packages_path)?;
        let tasks = RunningTasks::load(&config.running_tasks_path)?;
        let profiles = ProfilesHolder::load(&config.profiles_path)?;

        let notifier = if config.notification_url.is_empty() {
            None
        } else {
            Some(Notifier::new(
                &config.notification_url,
                &config.notification_secret,
            )?)
        };

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);

        let ctx = Arc::new(Self {
            apt,
            builder,
            recipes,
            packages,
            tasks,
            profiles,
            webhooks,
            daily_tasks,
            minilog,
            notifier,
            cron: config.cron,
            log_dir: config.log_dir,
            queue_tx,
            queue_mirror: std::sync::Mutex::new(Vec::new()),
            queue_guard: tokio::sync::Mutex::new(()),
            build_lock: tokio::sync::Mutex::new(()),
            regen_lock: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(Self::worker_loop(ctx.clone(), queue_rx));
        tokio::spawn(Self::cron_loop(ctx.clone()));

        Ok(ctx)
    }

    /// Make sure the sentinel refresh webhook exists and carries the
    /// configured secret.
    pub async fn ensure_configs_webhook(&self, secret: &str) -> Result<(), sqlx::Error> {
        let hook = self
            .webhooks
            .get_by_target_or_create(CONFIGS_HOOK_TARGET, "", "*For config update*", "")
            .await?;

        self.webhooks
            .update(hook.id, &hook.target, secret, &hook.proc_name, &hook.version)
            .await
    }

    /// Append a build to the FIFO queue.
    pub async fn queue(&self, config: BuildConfig) {
        let _guard = self.queue_guard.lock().await;

        let task = QueueTask {
            config: config.clone(),
        };
        self.queue_mirror.lock().unwrap().push(task.clone());
        if self.queue_tx.send(task).await.is_err() {
            error!("queue worker is gone; dropping build request");
            return;
        }

        self.minilog
            .succeeded(&format!(
                "Queue the task: {} / {}",
                config.name(),
                config.version()
            ))
            .await;
    }

    /// Queue a recipe together with its declared fan-out: every available
    /// dependency pin, and every version of each `queue_with` sibling.
    pub async fn queue_with_fanout(&self, name: &str, version: &str) -> Result<(), RecipeError> {
        let config = BuildConfig::Bare(self.recipes.find(name, version)?);
        let siblings = config.queue_with().to_vec();
        self.queue(config).await;

        // One additional build per declared, already-built dependency pin.
        let dep_pins: Vec<(String, String)> = self
            .recipes
            .map()
            .get(name)
            .map(|set| {
                set.dep_pkgs
                    .iter()
                    .flat_map(|(dep_name, dep_versions)| {
                        dep_versions
                            .iter()
                            .map(|dep_version| (dep_name.clone(), dep_version.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (dep_name, dep_version) in dep_pins {
            match self
                .recipes
                .find_with_dep(name, version, &dep_name, &dep_version, &self.packages)
            {
                Ok(config) => self.queue(config).await,
                Err(err) => {
                    info!(
                        "skipping dep pin ({}, {}) for {}: {}",
                        dep_name, dep_version, name, err
                    );
                }
            }
        }

        for sibling in siblings {
            let Some(set) = self.recipes.map().get(&sibling).cloned() else {
                self.minilog
                    .failed(
                        "queue_with",
                        &format!("unknown sibling package {}", sibling),
                    )
                    .await;
                continue;
            };
            for recipe in set.recipes.values() {
                self.queue(BuildConfig::Bare(recipe.clone())).await;
            }
        }

        Ok(())
    }

    /// Builds currently waiting in the queue, oldest first.
    pub fn queued_tasks(&self) -> Vec<QueueTask> {
        self.queue_mirror.lock().unwrap().clone()
    }

    /// Start a build immediately, returning its task id. The build still
    /// waits its turn on the single build lock.
    pub fn build_async(ctx: &Arc<Self>, config: BuildConfig) -> usize {
        let task_id = ctx.tasks.create_task().id;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            ctx.run_build(config, task_id).await;
        });

        task_id
    }

    async fn worker_loop(ctx: Arc<Self>, mut queue_rx: mpsc::Receiver<QueueTask>) {
        while let Some(task) = queue_rx.recv().await {
            {
                let mut mirror = ctx.queue_mirror.lock().unwrap();
                if !mirror.is_empty() {
                    mirror.remove(0);
                }
            }

            let task_id = ctx.tasks.create_task().id;
            ctx.run_build(task.config, task_id).await;
        }
    }

    async fn cron_loop(ctx: Arc<Self>) {
        loop {
            let next = ctx.cron.next_occurrence(Local::now());
            let wait = (next - Local::now())
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));
            info!("next daily task run at {}", next);
            tokio::time::sleep(wait).await;

            ctx.queue_daily_tasks().await;
        }
    }

    /// Enqueue every configured daily task as a bare recipe.
    pub async fn queue_daily_tasks(&self) {
        info!("daily task queueing starts");
        self.minilog.succeeded("QueueDailyTask starts").await;

        let tasks = match self.daily_tasks.list().await {
            Ok(tasks) => tasks,
            Err(err) => {
                self.minilog.failed("DailyTask", &err.to_string()).await;
                return;
            }
        };

        for task in tasks {
            match self.recipes.find(&task.proc_name, &task.version) {
                Ok(recipe) => {
                    info!("daily task queue: {} / {}", task.proc_name, task.version);
                    self.queue(BuildConfig::Bare(recipe)).await;
                }
                Err(err) => {
                    let msg = format!(
                        "Failed to find the task :: name: {} / version: {} ({})",
                        task.proc_name, task.version, err
                    );
                    warn!("{}", msg);
                    self.minilog.failed("DailyTask", &msg).await;
                }
            }
        }

        self.minilog.succeeded("QueueDailyTask finished").await;
    }

    /// Run one build to completion, updating the task record and the
    /// downstream state in order: registry, profiles, repository, source
    /// unlink, notification. An error at any step short-circuits the rest.
    pub async fn run_build(&self, config: BuildConfig, task_id: usize) {
        let log_name = format!(
            "{}-{}-{}",
            config.name(),
            config.version(),
            Local::now().format("%Y-%m-%d %H:%M:%S %z")
        );
        let log_file_path = self.log_dir.join(format!("log-{}.log", log_name));

        if let Err(err) = std::fs::File::create(&log_file_path) {
            error!("failed to open {}: {}", log_file_path.display(), err);
            self.tasks
                .mark_failed(task_id, "failed to open log receiver");
            return;
        }
        self.tasks.set_log(task_id, &log_name, &log_file_path);

        // One build at a time, follow-ups included; refreshes queue behind
        // the same lock.
        let _guard = self.build_lock.lock().await;

        let (info_tx, info_rx) = tokio::sync::oneshot::channel();
        let result = {
            let build_future = self.builder.build(
                &config,
                self.recipes.base_dir(),
                &log_file_path,
                info_tx,
            );
            tokio::pin!(build_future);

            // Claim the container handle as soon as the builder publishes
            // it, then keep driving the build.
            let mut info_rx = Some(info_rx);
            loop {
                tokio::select! {
                    result = &mut build_future => break result,
                    info = async {
                        match info_rx.as_mut() {
                            Some(rx) => rx.await.ok(),
                            None => std::future::pending().await,
                        }
                    } => {
                        if let Some(handle) = info {
                            info!("got container information: {}", handle.container_id);
                            self.tasks.set_container(task_id, handle);
                        }
                        info_rx = None;
                    }
                }
            }
        };

        let build_result = match result {
            Ok(build_result) => build_result,
            Err(err) => {
                warn!("failed to build: {}", err);
                self.tasks.mark_failed(task_id, &err.to_string());
                self.append_log_line(&log_file_path, &format!("Error occured => {}\n", err))
                    .await;
                self.minilog
                    .failed(
                        &format!(
                            "Failed to build: {} / {}",
                            config.name(),
                            config.version()
                        ),
                        &err.to_string(),
                    )
                    .await;
                return;
            }
        };

        // Registry update.
        self.packages.update(AvailablePackage {
            name: config.name().to_owned(),
            version: config.version().to_owned(),
            dep_name: config.dep_name().to_owned(),
            dep_version: config.dep_version().to_owned(),
            display_version: build_result.display_version.clone(),
            generated_package_file_name: build_result.pkg_file_name.clone(),
            generated_package_name: build_result.pkg_name.clone(),
            generated_package_version: build_result.pkg_version.clone(),
            install_base: build_result.host_install_base.clone(),
            install_prefix: build_result.host_install_prefix.clone(),
        });

        // Profile regeneration.
        if let Err(err) = self.update_profiles().await {
            self.tasks.mark_failed(task_id, &err.to_string());
            self.minilog
                .failed(
                    &format!(
                        "Failed to update profiles: {} / {}",
                        config.name(),
                        config.version()
                    ),
                    &err.to_string(),
                )
                .await;
            return;
        }

        // Repository add, then drop the source deb; the artifact lives in
        // the repository pool from here on.
        let deb_path = self.builder.packages_dir().join(&build_result.pkg_file_name);
        if let Err(err) = self.apt.add_package(&deb_path).await {
            self.tasks.mark_failed(task_id, &err.to_string());
            self.minilog
                .failed(
                    &format!(
                        "Failed to update repo: {} / {}",
                        config.name(),
                        config.version()
                    ),
                    &err.to_string(),
                )
                .await;
            return;
        }

        // Notifications: a rejected endpoint downgrades the build, nothing
        // is rolled back.
        if let Some(notifier) = &self.notifier {
            let message = serde_json::json!({
                "type": "package_update",
                "name": config.name(),
                "version": config.version(),
                "display_version": build_result.display_version,
                "unix_time": format!("{}", Local::now().timestamp()),
            });
            if let Err(err) = notifier.post_update(&message).await {
                self.tasks.mark_warning(task_id, &err.to_string());
                self.minilog
                    .failed(
                        &format!(
                            "Failed to notification: {} / {}",
                            config.name(),
                            config.version()
                        ),
                        &err.to_string(),
                    )
                    .await;
                return;
            }
            if let Err(err) = self.notify_profile_update().await {
                self.tasks.mark_warning(task_id, &err.to_string());
                return;
            }
        }

        self.tasks.mark_succeeded(task_id);
        self.minilog
            .succeeded(&format!(
                "Build: {} / {} [{:?}]",
                config.name(),
                config.version(),
                build_result.duration
            ))
            .await;
    }

    async fn append_log_line(&self, path: &std::path::Path, line: &str) {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        if let Ok(mut file) = file {
            let _ = file.write_all(line.as_bytes()).await;
        }
    }

    /// Regenerate the profile list from the registry and the recipe graph.
    pub async fn update_profiles(&self) -> Result<(), ProfileError> {
        let _guard = self.regen_lock.lock().await;

        if let Err(err) = self.profiles.regenerate(&self.packages, &self.recipes.map()) {
            self.minilog.failed("UpdateProfiles", &err.to_string()).await;
            return Err(err);
        }

        self.minilog.succeeded("UpdateProfiles").await;
        Ok(())
    }

    async fn notify_profile_update(&self) -> Result<(), NotifyError> {
        if let Some(notifier) = &self.notifier {
            let message = serde_json::json!({ "type": "profile_update" });
            if let Err(err) = notifier.post_update(&message).await {
                self.minilog
                    .failed("UpdateProfilesWithNotification", &err.to_string())
                    .await;
                return Err(err);
            }
        }

        Ok(())
    }

    /// Regenerate profiles and announce the change.
    pub async fn update_profiles_with_notification(&self) -> Result<(), StartupError> {
        self.update_profiles().await?;
        self.notify_profile_update().await?;
        self.minilog.succeeded("UpdateProfilesWithNotification").await;
        Ok(())
    }

    /// Sync the recipe tree from its source and regenerate profiles.
    /// Serialized against in-flight builds.
    pub async fn refresh_recipe_tree(&self) -> Result<(), StartupError> {
        {
            let _guard = self.build_lock.lock().await;
            if let Err(err) = self.recipes.refresh().await {
                self.minilog
                    .failed("RefreshProfileConfigs", &err.to_string())
                    .await;
                return Err(err.into());
            }
        }

        self.update_profiles_with_notification().await?;
        self.minilog.succeeded("RefreshProfileConfigs").await;
        Ok(())
    }

    /// Remove a no-dep artifact and its repository entry, then regenerate.
    pub async fn remove_package(&self, name: &str, version: &str) -> Result<(), StartupError> {
        self.remove_package_dep(name, version, "", "").await
    }

    /// Remove an artifact at its full key.
    pub async fn remove_package_dep(
        &self,
        name: &str,
        version: &str,
        dep_name: &str,
        dep_version: &str,
    ) -> Result<(), StartupError> {
        // Drop the package from the repository index when we still know its
        // generated name.
        if let Ok(ap) = self.packages.find_dep(name, version, dep_name, dep_version) {
            if let Err(err) = self.apt.remove_package(&ap.generated_package_name).await {
                warn!("failed to remove {} from repository: {}", name, err);
            }
        }

        if let Err(err) = self.packages.remove(name, version, dep_name, dep_version) {
            self.minilog.failed("RemovePackage", &err.to_string()).await;
            return Err(err.into());
        }

        self.minilog
            .succeeded(&format!("RemovePackage: {} / {}", name, version))
            .await;

        self.update_profiles_with_notification().await
    }

    /// Flush all JSON-backed state to disk.
    pub async fn save_all(&self) -> Result<(), StartupError> {
        self.packages.save()?;
        self.tasks.save().await?;
        self.profiles.save()?;
        Ok(())
    }
}
