//! Executing builders and installing their outputs.
//!
//! This is the only module that spawns processes. Builds run one at a
//! time, dependencies first; an output already present in the store is
//! never rebuilt.

use std::collections::HashSet;
use std::process::Stdio;

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::derivation::DrvFile;
use crate::error::{Error, Result};
use crate::modulo::CycleError;
use crate::store::{self, Store};
use crate::store_path::StorePath;

const DEFAULT_CONTAINER_IMAGE: &str = "debian:bookworm-slim";
const CONTAINER_WORKDIR: &str = "/build";
const STDERR_TAIL: usize = 4096;

/// Which isolation backend runs the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum Sandbox {
    #[default]
    #[display("container")]
    Container,
    #[display("none")]
    None,
}

#[derive(Debug, Clone)]
pub struct RealizeConfig {
    pub sandbox: Sandbox,
    /// Base image used by the container backend.
    pub container_image: String,
    /// Permit network access for regular derivations. Fixed-output
    /// derivations always get network.
    pub network: bool,
    /// Inherit builder stdio instead of discarding stdout and capturing
    /// stderr.
    pub verbose: bool,
}

impl Default for RealizeConfig {
    fn default() -> Self {
        RealizeConfig {
            sandbox: Sandbox::Container,
            container_image: DEFAULT_CONTAINER_IMAGE.to_owned(),
            network: false,
            verbose: false,
        }
    }
}

/// Builds the derivation at `drv_path` and everything it depends on,
/// returning the output path.
pub async fn realize(
    store: &Store,
    drv_path: &StorePath,
    config: &RealizeConfig,
) -> Result<StorePath> {
    let order = realize_order(store, drv_path).await?;
    let mut root_out = None;
    for path in &order {
        root_out = Some(realize_one(store, path, config).await?);
    }
    Ok(root_out.expect("order contains at least the root"))
}

/// Dependency-first ordering of the on-disk derivation graph. The graph
/// under a well-formed store is acyclic by construction, but the walk
/// still refuses cycles rather than looping on a corrupted store.
async fn realize_order(store: &Store, root: &StorePath) -> Result<Vec<StorePath>> {
    enum Frame {
        Enter(StorePath),
        Exit(StorePath),
    }
    let mut visited = HashSet::new();
    let mut on_path: Vec<StorePath> = Vec::new();
    let mut order = Vec::new();
    let mut stack = vec![Frame::Enter(root.clone())];
    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(path) => {
                if visited.contains(&path) {
                    continue;
                }
                if let Some(pos) = on_path.iter().position(|p| p == &path) {
                    let mut names: Vec<String> = on_path[pos..]
                        .iter()
                        .map(|p| p.name().to_owned())
                        .collect();
                    names.push(path.name().to_owned());
                    return Err(CycleError { path: names }.into());
                }
                let drv = store.read_drv(&path).await?;
                on_path.push(path.clone());
                stack.push(Frame::Exit(path));
                for input in drv.input_drvs.keys() {
                    stack.push(Frame::Enter(store.dir().parse(input)?));
                }
            }
            Frame::Exit(path) => {
                on_path.pop();
                visited.insert(path.clone());
                order.push(path);
            }
        }
    }
    Ok(order)
}

async fn realize_one(
    store: &Store,
    drv_path: &StorePath,
    config: &RealizeConfig,
) -> Result<StorePath> {
    let drv = store.read_drv(drv_path).await?;
    let out_path = store.dir().parse(&drv.out_path()?.path)?;
    if store.has(&out_path).await {
        debug!(out = %out_path, "output already present");
        return Ok(out_path);
    }
    info!(drv = %drv_path, out = %out_path, "building");
    match config.sandbox {
        Sandbox::Container => build_in_container(store, &drv, &out_path, config).await?,
        Sandbox::None => build_direct(store, &drv, &out_path, config).await?,
    }
    if !store.has(&out_path).await {
        return Err(Error::MissingOutput {
            drv: drv_path.to_string(),
            out_path: out_path.to_string(),
        });
    }
    info!(out = %out_path, "built");
    Ok(out_path)
}

async fn build_in_container(
    store: &Store,
    drv: &DrvFile,
    out_path: &StorePath,
    config: &RealizeConfig,
) -> Result<()> {
    let out_mount = tempfile::Builder::new()
        .prefix("cask-out-")
        .tempdir()
        .map_err(|e| Error::io(std::env::temp_dir(), e))?;

    let mut cmd = Command::new("docker");
    cmd.arg("run").arg("--rm");
    if !(drv.is_fixed_output() || config.network) {
        cmd.args(["--network", "none"]);
    }
    cmd.arg("-v")
        .arg(format!("{dir}:{dir}:ro", dir = store.dir()))
        .arg("-v")
        .arg(format!("{}:{}", out_mount.path().display(), out_path))
        .args(["-w", CONTAINER_WORKDIR]);
    for (key, value) in &drv.env {
        cmd.arg("--env").arg(format!("{}={}", key, value));
    }
    cmd.arg(&config.container_image).arg(&drv.builder);
    cmd.args(&drv.args);

    let status = run_builder(&mut cmd, config, Error::Sandbox).await?;
    match status {
        BuilderExit::Success => {
            let out_mount = out_mount.keep();
            store.register_output(&out_mount, out_path).await
        }
        BuilderExit::Failed { code, stderr } => Err(Error::BuildFailed {
            drv: drv.env.get("name").cloned().unwrap_or_default(),
            code,
            stderr,
        }),
    }
}

async fn build_direct(
    store: &Store,
    drv: &DrvFile,
    out_path: &StorePath,
    config: &RealizeConfig,
) -> Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix("cask-build-")
        .tempdir()
        .map_err(|e| Error::io(std::env::temp_dir(), e))?;
    fs::create_dir(out_path)
        .await
        .map_err(|e| Error::io(out_path.as_path(), e))?;

    let mut cmd = Command::new(&drv.builder);
    cmd.args(&drv.args)
        .current_dir(scratch.path())
        .env_clear()
        .envs(&drv.env);
    for key in ["TMPDIR", "TEMPDIR", "TMP", "TEMP"] {
        cmd.env(key, scratch.path());
    }

    let builder = drv.builder.clone();
    let result = run_builder(&mut cmd, config, move |e| Error::io(builder.as_str(), e)).await;
    match result {
        Ok(BuilderExit::Success) => {
            if fs::symlink_metadata(out_path).await.is_err() {
                // The builder removed its own output directory; the
                // caller reports the missing output.
                return Ok(());
            }
            store.register_output(out_path.as_path(), out_path).await
        }
        Ok(BuilderExit::Failed { code, stderr }) => {
            let _ = store::discard_tree(out_path.as_path()).await;
            Err(Error::BuildFailed {
                drv: drv.env.get("name").cloned().unwrap_or_default(),
                code,
                stderr,
            })
        }
        Err(err) => {
            let _ = store::discard_tree(out_path.as_path()).await;
            Err(err)
        }
    }
}

enum BuilderExit {
    Success,
    Failed { code: i32, stderr: String },
}

async fn run_builder<F>(cmd: &mut Command, config: &RealizeConfig, spawn_err: F) -> Result<BuilderExit>
where
    F: Fn(std::io::Error) -> Error,
{
    cmd.stdin(Stdio::null());
    if config.verbose {
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    }
    let child = cmd.spawn().map_err(&spawn_err)?;
    let output = child.wait_with_output().await.map_err(spawn_err)?;
    if output.status.success() {
        Ok(BuilderExit::Success)
    } else {
        // A killed builder has no exit code; report it like a failure.
        let code = output.status.code().unwrap_or(-1);
        let stderr = stderr_tail(&output.stderr);
        warn!(code, "builder failed");
        Ok(BuilderExit::Failed { code, stderr })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).into_owned()
}
