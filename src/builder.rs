//! Container-isolated package builds.
//!
//! Each build runs `install.sh` from the package's recipe directory inside
//! a fresh container of the builder image, with the recipe tree and the
//! shared artifact directories bind-mounted in. Stdout and stderr are
//! streamed into the task's log file; the result manifest the script leaves
//! in the packages directory becomes the [`BuildResult`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::recipes::BuildConfig;

const BUILDER_IMAGE: &str = "torigoya_builder/base";
const CONTAINER_PKG_CONFIGS_DIR: &str = "/etc/pkgconfigs";
const CONTAINER_CURRENT_PKG_CONFIG_DIR: &str = "/etc/current_pkgconfig";
const CONTAINER_WORK_DIR: &str = "/root";
const CONTAINER_BUILT_PKGS_DIR: &str = "/etc/torigoya_pkgs";
const CPU_CORES: &str = "2";

/// Errors raised by the container builder.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    /// The container daemon rejected an operation.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    /// IO error on the host side.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The install script exited non-zero.
    #[error("container exited with status {0}")]
    ContainerNonZero(i64),
    /// The container finished but the daemon reported no exit status.
    #[error("container wait ended without a status")]
    MissingWaitStatus,
    /// The result manifest the install script should leave was unreadable.
    #[error("failed to read build result {0}: {1}")]
    ManifestRead(String, std::io::Error),
    /// The result manifest did not parse.
    #[error("failed to parse build result {0}: {1}")]
    ManifestParse(String, serde_json::Error),
}

/// Builder settings, all rooted under the service storage directory.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Shared directory mounted at the install base; compilers produced by
    /// earlier builds are reused from here.
    pub virtual_usr_dir: PathBuf,
    /// Parent of the per-build host work directories.
    pub tmp_base_dir: PathBuf,
    /// Shared directory the container drops built packages and manifests
    /// into.
    pub packages_dir: PathBuf,
    /// Debian package name prefix handed to the install script.
    pub package_prefix: String,
    /// In-container base path packages are installed under.
    pub install_base_prefix: String,
}

/// Abort capability for one running container.
#[derive(Clone)]
pub struct ContainerHandle {
    pub container_id: String,
    docker: Docker,
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("container_id", &self.container_id)
            .finish()
    }
}

impl ContainerHandle {
    /// Kill the container. The builder's wait then returns and the build
    /// fails with the kill exit status.
    pub async fn kill(&self) -> Result<(), BuilderError> {
        info!("killing container {}", self.container_id);
        self.docker
            .kill_container(&self.container_id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }
}

/// The manifest the install script writes on success, plus host-side facts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub pkg_file_name: String,
    pub pkg_name: String,
    pub pkg_version: String,
    pub display_version: String,

    #[serde(skip)]
    pub host_install_base: String,
    #[serde(skip)]
    pub host_install_prefix: String,
    #[serde(skip)]
    pub duration: Duration,
}

/// Drives container builds against the local container daemon.
#[derive(Clone)]
pub struct Builder {
    docker: Docker,
    virtual_usr_dir: PathBuf,
    tmp_base_dir: PathBuf,
    packages_dir: PathBuf,
    package_prefix: String,
    install_base_prefix: String,
}

impl Builder {
    /// Connect to the container daemon and make sure the shared host
    /// directories exist.
    pub fn new(config: BuilderConfig) -> Result<Self, BuilderError> {
        let docker = Docker::connect_with_local_defaults()?;

        for dir in [
            &config.virtual_usr_dir,
            &config.tmp_base_dir,
            &config.packages_dir,
        ] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        Ok(Self {
            docker,
            virtual_usr_dir: config.virtual_usr_dir,
            tmp_base_dir: config.tmp_base_dir,
            packages_dir: config.packages_dir,
            package_prefix: config.package_prefix,
            install_base_prefix: config.install_base_prefix,
        })
    }

    /// Host directory the built `.deb` files land in.
    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    /// Run one build to completion.
    ///
    /// As soon as the container exists, its id and kill capability are
    /// published on `info_tx` so the owning task becomes abortable. The
    /// container is force-removed on every exit path.
    pub async fn build(
        &self,
        config: &BuildConfig,
        recipe_tree_dir: &Path,
        log_path: &Path,
        info_tx: oneshot::Sender<ContainerHandle>,
    ) -> Result<BuildResult, BuilderError> {
        let work_dir = self.tmp_base_dir.join(config.work_dir_name());
        if !work_dir.exists() {
            info!("creating work dir {}", work_dir.display());
            std::fs::create_dir_all(&work_dir)?;
        }

        let install_path = format!(
            "{}/{}",
            self.install_base_prefix,
            config.package_path_name()
        );

        let container_config = Config {
            image: Some(BUILDER_IMAGE.to_owned()),
            working_dir: Some(CONTAINER_WORK_DIR.to_owned()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            env: Some(build_env(
                config,
                &install_path,
                &self.install_base_prefix,
                &self.package_prefix,
            )),
            cmd: Some(vec![
                "bash".to_owned(),
                format!("{}/install.sh", CONTAINER_CURRENT_PKG_CONFIG_DIR),
            ]),
            host_config: Some(HostConfig {
                binds: Some(build_binds(
                    config,
                    recipe_tree_dir,
                    &work_dir,
                    &self.virtual_usr_dir,
                    &self.install_base_prefix,
                    &self.packages_dir,
                )),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(
            "build ({}, {}) dep ({}, {})",
            config.name(),
            config.version(),
            config.dep_name(),
            config.dep_version()
        );

        let container = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .map_err(|err| {
                error!("failed to create container: {}", err);
                err
            })?;

        let result = self
            .run_created(&container.id, config, log_path, info_tx)
            .await;

        if let Err(err) = self
            .docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            error!("failed to remove container {}: {}", container.id, err);
        }

        let (status_code, started_at) = result?;

        let manifest_name = format!(
            "result-{}-{}.json",
            config.gen_pkg_name(),
            config.version()
        );
        let buffer = std::fs::read_to_string(self.packages_dir.join(&manifest_name))
            .map_err(|err| BuilderError::ManifestRead(manifest_name.clone(), err))?;
        let mut build_result: BuildResult = serde_json::from_str(&buffer)
            .map_err(|err| BuilderError::ManifestParse(manifest_name, err))?;

        build_result.host_install_base = self.install_base_prefix.clone();
        build_result.host_install_prefix = install_path;
        build_result.duration = started_at.elapsed();

        info!("build result: {:?} (exit {})", build_result, status_code);

        Ok(build_result)
    }

    async fn run_created(
        &self,
        container_id: &str,
        config: &BuildConfig,
        log_path: &Path,
        info_tx: oneshot::Sender<ContainerHandle>,
    ) -> Result<(i64, Instant), BuilderError> {
        // Publish the abort capability before anything can block.
        let _ = info_tx.send(ContainerHandle {
            container_id: container_id.to_owned(),
            docker: self.docker.clone(),
        });

        info!("attach container {}", container_id);
        let attach = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;

        let mut output = attach.output;
        let drain = tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        if log_file.write_all(&message).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("attach stream error: {}", err);
                        break;
                    }
                }
            }
            let _ = log_file.flush().await;
        });

        info!("start container {}", container_id);
        let started_at = Instant::now();
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;

        let status_code = {
            let mut wait = std::pin::pin!(self
                .docker
                .wait_container(container_id, None::<WaitContainerOptions<String>>));
            match wait.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(BuilderError::MissingWaitStatus),
            }
        };

        // Keep log ordering: container output first, then the exit line.
        let _ = drain.await;
        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        log_file
            .write_all(format!("Exit Status => {}\n", status_code).as_bytes())
            .await?;
        log_file.flush().await?;

        info!("container {} exited with {}", container_id, status_code);
        if status_code != 0 {
            return Err(BuilderError::ContainerNonZero(status_code));
        }

        Ok((status_code, started_at))
    }
}

/// Environment handed to the install script.
fn build_env(
    config: &BuildConfig,
    install_path: &str,
    install_base_prefix: &str,
    package_prefix: &str,
) -> Vec<String> {
    let mut env = vec![
        "PATH=/bin:/usr/bin:/usr/local/bin/".to_owned(),
        "TR_REUSE_FLAG=0".to_owned(),
        format!("TR_VERSION={}", config.version()),
        format!("TR_INSTALL_PREFIX={}", install_path),
        format!("TR_PACKAGE_NAME={}", config.gen_pkg_name()),
        format!("TR_TARGET_SYSTEM={}", config.target_system()),
        format!("TR_TARGET_ARCH={}", config.target_arch()),
        format!("TR_INSTALL_PATH={}", install_base_prefix),
        format!("TR_PKGS_PATH={}", CONTAINER_BUILT_PKGS_DIR),
        format!("TR_CPU_CORE={}", CPU_CORES),
        format!("TR_PACKAGE_PREFIX={}", package_prefix),
    ];

    if let Some(dep) = config.dep_package() {
        env.extend([
            format!("TR_DEP_PKG_NAME={}", dep.name),
            format!("TR_DEP_PKG_VERSION={}", dep.version),
            format!("TR_DEP_PKG_GEN_NAME={}", dep.generated_package_name),
            format!("TR_DEP_PKG_GEN_VERSION={}", dep.generated_package_version),
            format!("TR_DEP_PKG_DISP_VERSION={}", dep.display_version),
            format!("TR_DEP_PKG_PATH={}", dep.install_prefix),
        ]);
    }

    env
}

/// Bind mounts for one build container.
fn build_binds(
    config: &BuildConfig,
    recipe_tree_dir: &Path,
    work_dir: &Path,
    virtual_usr_dir: &Path,
    install_base_prefix: &str,
    packages_dir: &Path,
) -> Vec<String> {
    vec![
        format!(
            "{}:{}:ro",
            recipe_tree_dir.display(),
            CONTAINER_PKG_CONFIGS_DIR
        ),
        format!(
            "{}:{}:ro",
            config.base_path().display(),
            CONTAINER_CURRENT_PKG_CONFIG_DIR
        ),
        format!("{}:{}", work_dir.display(), CONTAINER_WORK_DIR),
        format!("{}:{}", virtual_usr_dir.display(), install_base_prefix),
        format!("{}:{}", packages_dir.display(), CONTAINER_BUILT_PKGS_DIR),
    ]
}
