//! Local process-backed container runtime.
//!
//! Each "container" is a directory under the configured base dir holding
//! a `workspace/` tree and a label marker; commands run via `sh -c` with
//! the workspace as cwd. Pause state is enforced in-process (exec on a
//! paused container fails). The marker file survives restarts so
//! [`ContainerRuntime::list_labeled`] can reconcile leftovers from a
//! previous run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use ed_domain::error::{Error, Result};

use crate::runtime::{ContainerRuntime, ContainerSummary, CreateOpts, ExecOutput};

const LABEL_MARKER: &str = ".edward-container";
const WORKSPACE_DIR: &str = "workspace";

struct ContainerEntry {
    dir: PathBuf,
    paused: bool,
    network: bool,
}

pub struct ProcessRuntime {
    base_dir: PathBuf,
    containers: Mutex<HashMap<String, ContainerEntry>>,
}

impl ProcessRuntime {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Workspace dir plus the current network flag; errors on paused or
    /// unknown containers.
    fn workspace_dir(&self, container_id: &str) -> Result<(PathBuf, bool)> {
        let containers = self.containers.lock();
        let entry = containers
            .get(container_id)
            .ok_or_else(|| Error::Sandbox(format!("unknown container {container_id}")))?;
        if entry.paused {
            return Err(Error::Sandbox(format!("container {container_id} is paused")));
        }
        Ok((entry.dir.join(WORKSPACE_DIR), entry.network))
    }

    fn container_dir(&self, container_id: &str) -> PathBuf {
        self.base_dir.join(container_id)
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn create(&self, opts: &CreateOpts) -> Result<String> {
        let container_id = Uuid::new_v4().to_string();
        let dir = self.container_dir(&container_id);
        tokio::fs::create_dir_all(dir.join(WORKSPACE_DIR)).await?;
        tokio::fs::write(dir.join(LABEL_MARKER), &opts.label).await?;

        self.containers.lock().insert(
            container_id.clone(),
            ContainerEntry {
                dir,
                paused: true,
                network: opts.network,
            },
        );
        tracing::debug!(container_id = %container_id, "container created");
        Ok(container_id)
    }

    async fn unpause(&self, container_id: &str) -> Result<()> {
        let mut containers = self.containers.lock();
        let entry = containers
            .get_mut(container_id)
            .ok_or_else(|| Error::Sandbox(format!("unknown container {container_id}")))?;
        entry.paused = false;
        Ok(())
    }

    async fn pause(&self, container_id: &str) -> Result<()> {
        let mut containers = self.containers.lock();
        let entry = containers
            .get_mut(container_id)
            .ok_or_else(|| Error::Sandbox(format!("unknown container {container_id}")))?;
        entry.paused = true;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.containers.lock().remove(container_id);
        let dir = self.container_dir(container_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_network(&self, container_id: &str, enabled: bool) -> Result<()> {
        let mut containers = self.containers.lock();
        let entry = containers
            .get_mut(container_id)
            .ok_or_else(|| Error::Sandbox(format!("unknown container {container_id}")))?;
        entry.network = enabled;
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        script: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let (workspace, network) = self.workspace_dir(container_id)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .current_dir(&workspace)
            // Advisory for tooling; a real container runtime detaches the
            // network interface instead.
            .env("EDWARD_NETWORK", if network { "1" } else { "0" })
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("spawn failed: {e}")))?;

        if let Some(bytes) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle
                    .write_all(&bytes)
                    .await
                    .map_err(|e| Error::Sandbox(format!("stdin write failed: {e}")))?;
                drop(handle);
            }
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| Error::Sandbox(format!("exec failed: {e}")))?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "command exceeded {}s: {script}",
                    timeout.as_secs()
                )));
            }
        };

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn read_archive(&self, container_id: &str, excludes: &[String]) -> Result<Vec<u8>> {
        let (workspace, _) = self.workspace_dir(container_id)?;
        let excludes = excludes.to_vec();
        tokio::task::spawn_blocking(move || build_tar(&workspace, &excludes))
            .await
            .map_err(|e| Error::Sandbox(format!("archive task panicked: {e}")))?
    }

    async fn write_archive(&self, container_id: &str, tar_bytes: Vec<u8>) -> Result<()> {
        let (workspace, _) = self.workspace_dir(container_id)?;
        tokio::task::spawn_blocking(move || {
            let mut archive = tar::Archive::new(std::io::Cursor::new(tar_bytes));
            archive
                .unpack(&workspace)
                .map_err(|e| Error::Sandbox(format!("unpack failed: {e}")))
        })
        .await
        .map_err(|e| Error::Sandbox(format!("unpack task panicked: {e}")))?
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        // Scan the base dir rather than the in-memory map so containers
        // left over from a previous process are found too.
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.path().is_dir() {
                continue;
            }
            let marker = entry.path().join(LABEL_MARKER);
            match tokio::fs::read_to_string(&marker).await {
                Ok(contents) if contents == label => {}
                _ => continue,
            }
            let container_id = entry.file_name().to_string_lossy().into_owned();
            let running = self
                .containers
                .lock()
                .get(&container_id)
                .map(|c| !c.paused)
                .unwrap_or(false);
            // Re-adopt directories from a previous process.
            self.containers
                .lock()
                .entry(container_id.clone())
                .or_insert(ContainerEntry {
                    dir: entry.path(),
                    paused: true,
                    network: false,
                });
            out.push(ContainerSummary {
                container_id,
                running,
            });
        }
        Ok(out)
    }
}

/// Build a tar of `workspace`, skipping any path with an excluded
/// component.
fn build_tar(workspace: &Path, excludes: &[String]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    append_dir(&mut builder, workspace, Path::new(""), excludes)?;
    builder
        .into_inner()
        .map_err(|e| Error::Sandbox(format!("tar build failed: {e}")))
}

fn append_dir(
    builder: &mut tar::Builder<Vec<u8>>,
    root: &Path,
    rel: &Path,
    excludes: &[String],
) -> Result<()> {
    let dir = root.join(rel);
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if excludes.iter().any(|e| *e == name) {
            continue;
        }
        let rel_path = rel.join(&name);
        let path = entry.path();
        if path.is_dir() {
            append_dir(builder, root, &rel_path, excludes)?;
        } else if path.is_file() {
            builder
                .append_path_with_name(&path, &rel_path)
                .map_err(|e| Error::Sandbox(format!("tar append failed: {e}")))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> CreateOpts {
        CreateOpts {
            label: "works.pragnya.edward".into(),
            workspace_root: "/home/node/edward".into(),
            memory_bytes: 1024 * 1024 * 1024,
            cpus: 1,
            pids_limit: 100,
            network: false,
        }
    }

    #[tokio::test]
    async fn create_exec_remove() {
        let dir = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(dir.path());
        let id = rt.create(&opts()).await.unwrap();

        // Paused containers refuse exec.
        assert!(rt.exec(&id, "true", None, Duration::from_secs(5)).await.is_err());
        rt.unpause(&id).await.unwrap();

        let out = rt
            .exec(&id, "echo hello", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");

        rt.remove(&id).await.unwrap();
        assert!(rt.exec(&id, "true", None, Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn exec_stdin_piping() {
        let dir = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(dir.path());
        let id = rt.create(&opts()).await.unwrap();
        rt.unpause(&id).await.unwrap();

        rt.exec(
            &id,
            "cat >> out.txt",
            Some(b"line one\n".to_vec()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        rt.exec(
            &id,
            "cat >> out.txt",
            Some(b"line two\n".to_vec()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let out = rt
            .exec(&id, "cat out.txt", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "line one\nline two\n");
    }

    #[tokio::test]
    async fn exec_timeout_kills() {
        let dir = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(dir.path());
        let id = rt.create(&opts()).await.unwrap();
        rt.unpause(&id).await.unwrap();

        let err = rt
            .exec(&id, "sleep 5", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn archive_roundtrip_with_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let rt = ProcessRuntime::new(dir.path());
        let id = rt.create(&opts()).await.unwrap();
        rt.unpause(&id).await.unwrap();

        rt.exec(
            &id,
            "mkdir -p src node_modules && echo 'export {}' > src/a.ts && echo junk > node_modules/x.js",
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let tar_bytes = rt
            .read_archive(&id, &["node_modules".to_string()])
            .await
            .unwrap();

        let id2 = rt.create(&opts()).await.unwrap();
        rt.unpause(&id2).await.unwrap();
        rt.write_archive(&id2, tar_bytes).await.unwrap();

        let out = rt
            .exec(&id2, "cat src/a.ts", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "export {}");
        let out = rt
            .exec(&id2, "ls node_modules 2>/dev/null || echo absent", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "absent");
    }

    #[tokio::test]
    async fn list_labeled_sees_prior_process_containers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let rt = ProcessRuntime::new(dir.path());
            rt.create(&opts()).await.unwrap();
        }
        // A fresh runtime over the same base dir finds the leftover.
        let rt2 = ProcessRuntime::new(dir.path());
        let found = rt2.list_labeled("works.pragnya.edward").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].running);
        // And adopted containers can be driven again.
        rt2.unpause(&found[0].container_id).await.unwrap();
        let out = rt2
            .exec(&found[0].container_id, "pwd", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
    }
}
