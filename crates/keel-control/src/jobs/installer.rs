use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use super::weights::{
    canonical_target, dir_stats, is_reserved, weight_info, write_metadata, WeightInfo,
    WeightInventory, WeightMetadata,
};

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub model_id: String,
    pub revision: Option<String>,
    pub target: Option<String>,
    pub files: Vec<String>,
    pub token: Option<String>,
    pub overwrite: bool,
}

/// Download progress. `total_files` is 0 when the file set is not known up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    pub completed_files: usize,
    pub total_files: usize,
    pub current: Option<String>,
}

/// Per-install handles: a cancellation signal the installer must honor and
/// a lossy progress channel.
#[derive(Debug, Clone)]
pub struct InstallContext {
    pub cancel: CancellationToken,
    progress: Option<mpsc::Sender<InstallProgress>>,
}

impl InstallContext {
    pub fn new(cancel: CancellationToken, progress: mpsc::Sender<InstallProgress>) -> Self {
        Self {
            cancel,
            progress: Some(progress),
        }
    }

    pub fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Drops the update if the consumer is behind.
    pub fn report(&self, progress: InstallProgress) {
        if let Some(tx) = &self.progress {
            let _ = tx.try_send(progress);
        }
    }
}

#[async_trait]
pub trait WeightInstaller: Send + Sync {
    async fn install(&self, ctx: InstallContext, opts: InstallOptions) -> anyhow::Result<WeightInfo>;
}

/// Fetches repository files into an empty directory.
#[async_trait]
pub trait WeightFetcher: Send + Sync {
    async fn fetch(
        &self,
        ctx: &InstallContext,
        opts: &InstallOptions,
        dest: &Path,
        revision: &str,
    ) -> anyhow::Result<()>;
}

/// Installs into a local directory (the weights volume mount): download into
/// `{dest}.tmp`, verify, rename into place, write metadata.
pub struct LocalWeightInstaller {
    inventory: WeightInventory,
    fetcher: Arc<dyn WeightFetcher>,
}

impl LocalWeightInstaller {
    pub fn new(inventory: WeightInventory, fetcher: Arc<dyn WeightFetcher>) -> Self {
        Self { inventory, fetcher }
    }

    pub fn with_hf_cli(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();
        Self::new(
            WeightInventory::new(storage_path.clone()),
            Arc::new(HfCliFetcher::new(storage_path.join(".hf-cache"))),
        )
    }
}

fn tmp_path_for(dest: &Path) -> PathBuf {
    let mut os: OsString = dest.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Removes the download directory unless disarmed. Covers installs whose
/// future is dropped mid-download (timeout, cancellation).
struct TempDirGuard {
    path: Option<PathBuf>,
}

impl TempDirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    async fn remove(mut self) {
        if let Some(path) = self.path.take() {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else { return };
        debug!(path = %path.display(), "removing abandoned download directory");
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn_blocking(move || {
                    let _ = std::fs::remove_dir_all(&path);
                });
            }
            Err(_) => {
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }
}

/// Polls the download directory and reports file counts until dropped.
fn spawn_progress_monitor(ctx: InstallContext, dir: PathBuf, total_files: usize) -> AbortOnDropHandle<()> {
    AbortOnDropHandle::new(tokio::spawn(async move {
        loop {
            tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;
            let scan_dir = dir.clone();
            let (_, count, _) = tokio::task::spawn_blocking(move || dir_stats(&scan_dir))
                .await
                .unwrap_or((0, 0, None));
            let completed = count as usize;
            ctx.report(InstallProgress {
                completed_files: if total_files > 0 { completed.min(total_files) } else { completed },
                total_files,
                current: None,
            });
        }
    }))
}

#[async_trait]
impl WeightInstaller for LocalWeightInstaller {
    async fn install(&self, ctx: InstallContext, opts: InstallOptions) -> anyhow::Result<WeightInfo> {
        if opts.model_id.trim().is_empty() {
            bail!("model ID is required");
        }
        let target = canonical_target(&opts.model_id, opts.target.as_deref())?;
        if is_reserved(&target) {
            bail!("cannot install weights into reserved path: {target}");
        }
        let revision = opts.revision.clone().unwrap_or_else(|| "main".to_string());
        let (_, dest) = self.inventory.resolve(&target)?;

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            if !opts.overwrite {
                bail!("weights already exist for {target}");
            }
            tokio::fs::remove_dir_all(&dest)
                .await
                .context("failed to remove existing weights")?;
        }

        let tmp = tmp_path_for(&dest);
        let _ = tokio::fs::remove_dir_all(&tmp).await;
        tokio::fs::create_dir_all(&tmp)
            .await
            .context("failed to create temp directory")?;
        let guard = TempDirGuard::new(tmp.clone());

        info!(model_id = %opts.model_id, %target, %revision, "downloading weights");
        let fetched = {
            let _monitor = spawn_progress_monitor(ctx.clone(), tmp.clone(), opts.files.len());
            tokio::select! {
                res = self.fetcher.fetch(&ctx, &opts, &tmp, &revision) => res,
                _ = ctx.cancel.cancelled() => Err(anyhow!("download cancelled")),
            }
        };

        if let Err(e) = fetched {
            guard.remove().await;
            return Err(e);
        }

        let scan_dir = tmp.clone();
        let (_, file_count, _) = tokio::task::spawn_blocking(move || dir_stats(&scan_dir)).await?;
        if file_count == 0 {
            guard.remove().await;
            bail!("download succeeded but no files were written to {}", tmp.display());
        }
        ctx.report(InstallProgress {
            completed_files: opts.files.len().max(file_count as usize),
            total_files: opts.files.len(),
            current: None,
        });

        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            guard.remove().await;
            return Err(anyhow!(e).context("failed to finalize weights"));
        }
        guard.disarm();

        let meta = WeightMetadata {
            model_id: opts.model_id.clone(),
            revision: Some(revision),
            installed_at: Utc::now(),
        };
        let final_dir = dest.clone();
        let info = tokio::task::spawn_blocking(move || {
            if let Err(e) = write_metadata(&final_dir, &meta) {
                warn!(path = %final_dir.display(), error = %e, "failed to write weight metadata");
            }
            weight_info(&final_dir, &target)
        })
        .await??;

        info!(name = %info.name, size_bytes = info.size_bytes, "weights installed");
        Ok(info)
    }
}

/// Build a PATH that also covers `pip install --user` locations.
fn augmented_path() -> String {
    let current = std::env::var("PATH").unwrap_or_default();
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    format!("{home}/.local/bin:{current}")
}

fn find_on_path(path: &str, names: &[&str]) -> Option<PathBuf> {
    names.iter().find_map(|name| {
        std::env::split_paths(path)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Shells out to `hf` (or the older `huggingface-cli`).
#[derive(Debug, Clone)]
pub struct HfCliFetcher {
    hf_home: PathBuf,
}

impl HfCliFetcher {
    pub fn new(hf_home: impl Into<PathBuf>) -> Self {
        Self {
            hf_home: hf_home.into(),
        }
    }

    fn build_args(opts: &InstallOptions, dest: &Path, revision: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "download".into(),
            opts.model_id.clone().into(),
            "--local-dir".into(),
            dest.as_os_str().to_owned(),
            "--revision".into(),
            revision.into(),
            "--resume-download".into(),
        ];
        args.extend(opts.files.iter().map(OsString::from));
        args
    }
}

#[async_trait]
impl WeightFetcher for HfCliFetcher {
    async fn fetch(
        &self,
        ctx: &InstallContext,
        opts: &InstallOptions,
        dest: &Path,
        revision: &str,
    ) -> anyhow::Result<()> {
        let path = augmented_path();
        let bin = find_on_path(&path, &["hf", "huggingface-cli"]).ok_or_else(|| {
            anyhow!("hugging face CLI is not installed in PATH (expected hf or huggingface-cli)")
        })?;

        let mut cmd = Command::new(&bin);
        cmd.args(Self::build_args(opts, dest, revision))
            .env("PATH", &path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if std::env::var_os("HF_HOME").is_none() {
            cmd.env("HF_HOME", &self.hf_home);
        }
        if let Some(token) = opts.token.as_deref().filter(|t| !t.is_empty()) {
            cmd.env("HF_TOKEN", token).env("HUGGING_FACE_HUB_TOKEN", token);
        }

        let output = tokio::select! {
            out = cmd.output() => out.with_context(|| format!("failed to run {}", bin.display()))?,
            // dropping the output future kills the child
            _ = ctx.cancel.cancelled() => bail!("download cancelled"),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            bail!(
                "{} download failed: {}\n{}{}",
                bin.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                output.status,
                stdout,
                stderr
            );
        }
        Ok(())
    }
}
