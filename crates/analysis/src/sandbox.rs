use std::{
    path::{Path, PathBuf},
    process::Output,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bug_agent_core::config::SandboxConfig;
use serde::Serialize;
use tokio::process::Command;

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ReproScripts {
    pub repro_script: String,
    pub dockerfile: String,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct SandboxOutput {
    pub stdout: String,
    /// Combined stdout and stderr.
    pub logs: String,
    pub exit_code: Option<i32>,
}

/// Builds and runs reproduction scripts in isolation.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, scripts: &ReproScripts) -> Result<SandboxOutput>;
}

/// Runs scripts through the `docker` CLI. Each run gets its own build context and image tag,
/// both removed afterwards.
pub struct DockerSandbox {
    docker: String,
    image_prefix: String,
    work_dir: PathBuf,
}

impl DockerSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            docker: config.docker.clone(),
            image_prefix: config.image_prefix.clone(),
            work_dir: config.work_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.docker);
        command.kill_on_drop(true);
        command
    }

    async fn ping(&self) -> Result<()> {
        let output = self
            .command()
            .arg("version")
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.docker))?;
        if !output.status.success() {
            bail!(
                "Docker is not running or not accessible: {}",
                tail(&String::from_utf8_lossy(&output.stderr))
            );
        }
        Ok(())
    }

    async fn build_and_run(
        &self,
        dir: &Path,
        tag: &str,
        scripts: &ReproScripts,
    ) -> Result<SandboxOutput> {
        let script_path = dir.join("repro.sh");
        tokio::fs::write(&script_path, &scripts.repro_script)
            .await
            .context("Failed to write repro.sh")?;
        tokio::fs::write(dir.join("Dockerfile"), &scripts.dockerfile)
            .await
            .context("Failed to write Dockerfile")?;
        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};
            tokio::fs::set_permissions(&script_path, Permissions::from_mode(0o755))
                .await
                .context("Failed to make repro.sh executable")?;
        }

        tracing::info!("Building sandbox image {}", tag);
        let build = self
            .command()
            .arg("build")
            .arg("-t")
            .arg(tag)
            .arg(dir)
            .output()
            .await
            .context("Failed to run docker build")?;
        if !build.status.success() {
            bail!(
                "docker build failed ({}): {}",
                build.status,
                tail(&String::from_utf8_lossy(&build.stderr))
            );
        }

        tracing::info!("Running sandbox image {}", tag);
        let run = self
            .command()
            .args(["run", "--rm", "--name", tag, tag, "./repro.sh"])
            .output()
            .await;
        self.remove_image(tag).await;
        let run = run.context("Failed to run docker run")?;
        tracing::info!("Sandbox image {} finished with {}", tag, run.status);
        Ok(sandbox_output(run))
    }

    async fn remove_image(&self, tag: &str) {
        match self.command().args(["image", "rm", "-f", tag]).output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::warn!(
                "Failed to remove sandbox image {}: {}",
                tag,
                tail(&String::from_utf8_lossy(&output.stderr))
            ),
            Err(e) => tracing::warn!("Failed to remove sandbox image {}: {:?}", tag, e),
        }
    }
}

#[async_trait]
impl SandboxRunner for DockerSandbox {
    async fn run(&self, scripts: &ReproScripts) -> Result<SandboxOutput> {
        self.ping().await?;
        let tag = format!("{}-{:016x}", self.image_prefix, rand::random::<u64>());
        let dir = self.work_dir.join(&tag);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut guard = AbandonGuard {
            docker: self.docker.clone(),
            tag: tag.clone(),
            dir: dir.clone(),
            armed: true,
        };
        let result = self.build_and_run(&dir, &tag, scripts).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!("Failed to clean up {}: {:?}", dir.display(), e);
        }
        guard.armed = false;
        result
    }
}

/// Cleans up after a run whose future was dropped before finishing, e.g. by a job timeout.
/// Killing the CLI client leaves the container running in the daemon, so it is removed by name.
struct AbandonGuard {
    docker: String,
    tag: String,
    dir: PathBuf,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("Sandbox run {} abandoned, cleaning up", self.tag);
        let docker = std::mem::take(&mut self.docker);
        let tag = std::mem::take(&mut self.tag);
        let dir = std::mem::take(&mut self.dir);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(remove_abandoned(docker, tag, dir));
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!("Failed to clean up {}: {:?}", dir.display(), e);
                }
            }
        }
    }
}

async fn remove_abandoned(docker: String, tag: String, dir: PathBuf) {
    let tag = tag.as_str();
    let commands: [&[&str]; 2] = [&["rm", "-f", tag], &["image", "rm", "-f", tag]];
    for args in commands {
        match Command::new(&docker).args(args).output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::debug!(
                "docker {} failed: {}",
                args.join(" "),
                tail(&String::from_utf8_lossy(&output.stderr))
            ),
            Err(e) => tracing::warn!("Failed to run {}: {:?}", docker, e),
        }
    }
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        tracing::warn!("Failed to clean up {}: {:?}", dir.display(), e);
    }
}

fn sandbox_output(output: Output) -> SandboxOutput {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut logs = stdout.clone();
    if !stderr.is_empty() {
        if !logs.is_empty() && !logs.ends_with('\n') {
            logs.push('\n');
        }
        logs.push_str(&stderr);
    }
    SandboxOutput { stdout, logs, exit_code: output.status.code() }
}

/// Last few lines of command output, for error messages.
fn tail(text: &str) -> String {
    let lines = text.trim_end().lines().collect::<Vec<_>>();
    lines[lines.len().saturating_sub(20)..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use std::{fs::Permissions, os::unix::fs::PermissionsExt, time::Duration};

    use super::*;

    const REPRODUCE: &str = "echo reproduced; echo 'Traceback: boom' >&2; exit 3";

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sandbox-test-{:016x}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// A stand-in for the docker CLI that handles the subcommands the sandbox uses and records
    /// each invocation in `calls.log` next to itself.
    fn fake_docker(dir: &Path, build_exit: i32, run: &str) -> String {
        let path = dir.join("docker");
        let log = dir.join("calls.log");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {log}\ncase \"$1\" in\n  version) exit 0 ;;\n  \
             build) echo 'no space left' >&2; exit {build_exit} ;;\n  run) {run} ;;\n  \
             rm|image) exit 0 ;;\nesac\nexit 64\n",
            log = log.display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn scripts() -> ReproScripts {
        ReproScripts {
            repro_script: "#!/bin/sh\npython app.py\n".into(),
            dockerfile: "FROM python:3\nCOPY repro.sh .\n".into(),
        }
    }

    #[tokio::test]
    async fn captures_output_and_cleans_up() {
        let bin = scratch_dir();
        let work = scratch_dir();
        let sandbox = DockerSandbox::new(&SandboxConfig {
            docker: fake_docker(&bin, 0, REPRODUCE),
            image_prefix: "bug-repro".into(),
            work_dir: Some(work.clone()),
        });
        let output = sandbox.run(&scripts()).await.unwrap();
        assert_eq!(output.stdout, "reproduced\n");
        assert_eq!(output.logs, "reproduced\nTraceback: boom\n");
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
        std::fs::remove_dir_all(bin).unwrap();
        std::fs::remove_dir_all(work).unwrap();
    }

    #[tokio::test]
    async fn build_failure_is_an_error() {
        let bin = scratch_dir();
        let work = scratch_dir();
        let sandbox = DockerSandbox::new(&SandboxConfig {
            docker: fake_docker(&bin, 1, REPRODUCE),
            image_prefix: "bug-repro".into(),
            work_dir: Some(work.clone()),
        });
        let err = sandbox.run(&scripts()).await.unwrap_err();
        assert!(err.to_string().contains("docker build failed"), "{err:?}");
        assert!(err.to_string().contains("no space left"), "{err:?}");
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
        std::fs::remove_dir_all(bin).unwrap();
        std::fs::remove_dir_all(work).unwrap();
    }

    #[tokio::test]
    async fn abandoned_runs_are_cleaned_up() {
        let bin = scratch_dir();
        let work = scratch_dir();
        let sandbox = DockerSandbox::new(&SandboxConfig {
            docker: fake_docker(&bin, 0, "sleep 5"),
            image_prefix: "bug-repro".into(),
            work_dir: Some(work.clone()),
        });
        let run = tokio::time::timeout(Duration::from_millis(500), sandbox.run(&scripts())).await;
        assert!(run.is_err());
        for _ in 0..50 {
            if std::fs::read_dir(&work).unwrap().count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);

        let calls = std::fs::read_to_string(bin.join("calls.log")).unwrap();
        let tag = calls
            .lines()
            .find_map(|line| line.strip_prefix("build -t "))
            .and_then(|rest| rest.split(' ').next())
            .unwrap()
            .to_string();
        assert!(calls.contains(&format!("run --rm --name {tag} {tag} ./repro.sh")), "{calls}");
        assert!(calls.lines().any(|l| l == format!("rm -f {tag}")), "{calls}");
        assert!(calls.lines().any(|l| l == format!("image rm -f {tag}")), "{calls}");
        std::fs::remove_dir_all(bin).unwrap();
        std::fs::remove_dir_all(work).unwrap();
    }

    #[tokio::test]
    async fn missing_docker_is_an_error() {
        let sandbox = DockerSandbox::new(&SandboxConfig {
            docker: "/nonexistent/docker".into(),
            image_prefix: "bug-repro".into(),
            work_dir: None,
        });
        assert!(sandbox.run(&scripts()).await.is_err());
    }

    #[test]
    fn test_tail() {
        let text = (1..=25).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(tail(&text).lines().next(), Some("6"));
        assert_eq!(tail("one\n"), "one");
    }
}
