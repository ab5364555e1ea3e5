use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use kiln_castore::blobservice::BlobService;
use kiln_castore::directoryservice::DirectoryService;
use kiln_castore::import::fs::ingest_path;
use kiln_castore::materialize::materialize;
use kiln_castore::{Digest, Directory, DirectoryDigest, Node, PathComponent};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tonic::async_trait;
use tracing::{debug, field, info, instrument, warn, Span};
use uuid::Uuid;

use super::{ExecutionError, ExecutionService, ProcessDescriptor, ProcessResult, ResourceLimits};

/// Runs processes on this host, each in a fresh directory below `sandbox_root`
/// holding a copy of its input tree.
///
/// The process runs with exactly the declared environment, no stdin, and is
/// killed if the run is dropped or times out. Only the declared output paths
/// are read back into the castore.
pub struct LocalExecutionService<BS, DS> {
    sandbox_root: PathBuf,

    blob_service: BS,
    directory_service: DS,

    // bounds the number of concurrently running processes.
    concurrent_runs: Semaphore,
    keep_sandboxes: bool,
}

impl<BS, DS> LocalExecutionService<BS, DS> {
    pub fn new(sandbox_root: PathBuf, blob_service: BS, directory_service: DS) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            sandbox_root,
            blob_service,
            directory_service,
            concurrent_runs: Semaphore::new(parallelism),
            keep_sandboxes: false,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.concurrent_runs = Semaphore::new(max_concurrent.max(1));
        self
    }

    /// Leaves sandboxes on disk after the run, for debugging.
    pub fn keep_sandboxes(mut self, keep: bool) -> Self {
        self.keep_sandboxes = keep;
        self
    }
}

/// A sandbox directory. Removed by [Sandbox::remove], or in the background
/// if the run is aborted.
struct Sandbox {
    path: PathBuf,
    keep: bool,
    removed: bool,
}

impl Sandbox {
    async fn create(root: &Path, keep: bool) -> io::Result<Self> {
        let path = root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            keep,
            removed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        self.removed = true;
        if self.keep {
            info!(sandbox.path=?self.path, "keeping sandbox");
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(sandbox.path=?self.path, err=%e, "failed to remove sandbox");
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if self.keep {
            info!(sandbox.path=?self.path, "keeping sandbox");
            return;
        }

        let path = std::mem::take(&mut self.path);
        let remove = move || {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(sandbox.path=?path, err=%e, "failed to remove sandbox");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

/// Finds the program to run. Paths containing a slash are relative to the
/// working directory, bare names are looked up in the declared `PATH` only.
fn resolve_program(
    argv0: &str,
    env: &BTreeMap<String, String>,
    cwd: &Path,
) -> Result<PathBuf, ExecutionError> {
    if argv0.contains('/') {
        return Ok(cwd.join(argv0));
    }

    env.get("PATH")
        .into_iter()
        .flat_map(|path| path.split(':'))
        .filter(|dir| !dir.is_empty())
        .map(|dir| cwd.join(dir).join(argv0))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ExecutionError::MissingExecutable(argv0.to_string()))
}

fn apply_limits(command: &mut Command, limits: ResourceLimits) {
    if limits == ResourceLimits::default() {
        return;
    }

    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if let Some(bytes) = limits.memory_bytes {
                let rlim = libc::rlimit {
                    rlim_cur: bytes as libc::rlim_t,
                    rlim_max: bytes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &rlim) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(seconds) = limits.cpu_seconds {
                let rlim = libc::rlimit {
                    rlim_cur: seconds as libc::rlim_t,
                    rlim_max: seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlim) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

/// Streams a pipe of the child into a new blob.
async fn capture_stream<BS, R>(blob_service: &BS, mut reader: R) -> io::Result<Digest>
where
    BS: BlobService,
    R: AsyncRead + Unpin,
{
    let mut writer = blob_service.open_write().await;
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.close().await
}

/// Output tree under construction.
enum Pending {
    Node(Node),
    Dir(BTreeMap<PathComponent, Pending>),
}

fn upload_pending<'a, DS>(
    directory_service: &'a DS,
    entries: BTreeMap<PathComponent, Pending>,
) -> BoxFuture<'a, Result<Node, ExecutionError>>
where
    DS: DirectoryService,
{
    async move {
        let mut directory = Directory::new();
        for (name, pending) in entries {
            let node = match pending {
                Pending::Node(node) => node,
                Pending::Dir(children) => upload_pending(directory_service, children).await?,
            };
            directory
                .add(name, node)
                .map_err(|e| ExecutionError::Capture(e.to_string()))?;
        }
        let node = directory.as_node();
        directory_service
            .put(directory)
            .await
            .map_err(|e| ExecutionError::Capture(e.to_string()))?;
        Ok(node)
    }
    .boxed()
}

/// Ingests the declared outputs below `cwd` and assembles them into a single
/// tree, keeping their relative paths. Missing outputs are left out.
async fn capture_outputs<BS, DS>(
    blob_service: &BS,
    directory_service: &DS,
    cwd: &Path,
    output_paths: &[PathBuf],
) -> Result<DirectoryDigest, ExecutionError>
where
    BS: BlobService + Clone,
    DS: DirectoryService + Clone,
{
    let mut root: BTreeMap<PathComponent, Pending> = BTreeMap::new();
    let mut captured: Vec<&Path> = vec![];

    for output_path in output_paths {
        // already contained in a captured parent.
        if captured.iter().any(|c| output_path.starts_with(c)) {
            continue;
        }

        let host_path = cwd.join(output_path);
        match tokio::fs::symlink_metadata(&host_path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(output.path=?output_path, "output not produced");
                continue;
            }
            Err(e) => return Err(ExecutionError::Capture(format!("{:?}: {}", output_path, e))),
            Ok(_) => {}
        }

        let node = ingest_path(blob_service.clone(), directory_service.clone(), &host_path)
            .await
            .map_err(|e| ExecutionError::Capture(e.to_string()))?;

        let mut components: Vec<PathComponent> = output_path
            .iter()
            .map(PathComponent::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| ExecutionError::Capture(e.to_string()))?;
        let Some(name) = components.pop() else {
            continue;
        };

        let mut entries = &mut root;
        for component in components {
            let slot = entries
                .entry(component)
                .or_insert_with(|| Pending::Dir(BTreeMap::new()));
            entries = match slot {
                Pending::Dir(children) => children,
                Pending::Node(_) => {
                    return Err(ExecutionError::Capture(format!(
                        "{:?} is below another output",
                        output_path
                    )))
                }
            };
        }
        entries.insert(name, Pending::Node(node));
        captured.push(output_path);
    }

    if root.is_empty() {
        return Ok(DirectoryDigest::empty());
    }

    match upload_pending(directory_service, root).await? {
        Node::Directory { digest, size } => Ok(DirectoryDigest::from_node(digest, size)),
        _ => Err(ExecutionError::Capture("output root is not a directory".into())),
    }
}

#[async_trait]
impl<BS, DS> ExecutionService for LocalExecutionService<BS, DS>
where
    BS: BlobService + Clone + 'static,
    DS: DirectoryService + Clone + 'static,
{
    #[instrument(skip_all, fields(process.description=%descriptor.description, sandbox.path), err)]
    async fn execute(&self, descriptor: ProcessDescriptor) -> Result<ProcessResult, ExecutionError> {
        descriptor.validate()?;

        let _permit = self
            .concurrent_runs
            .acquire()
            .await
            .map_err(|e| ExecutionError::Io(io::Error::other(e)))?;

        let sandbox = Sandbox::create(&self.sandbox_root, self.keep_sandboxes).await?;
        Span::current().record("sandbox.path", field::display(sandbox.path().display()));

        materialize(
            &self.blob_service,
            &self.directory_service,
            &descriptor.input_root,
            sandbox.path(),
        )
        .await
        .map_err(|e| ExecutionError::Materialization(e.to_string()))?;

        let cwd = sandbox.path().join(&descriptor.working_dir);
        tokio::fs::create_dir_all(&cwd).await?;
        for output_path in &descriptor.output_paths {
            if let Some(parent) = cwd.join(output_path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // validate() ensures argv is not empty.
        let argv0 = &descriptor.argv[0];
        let program = resolve_program(argv0, &descriptor.env, &cwd)?;

        let mut command = Command::new(&program);
        command
            .args(&descriptor.argv[1..])
            .current_dir(&cwd)
            .env_clear()
            .envs(&descriptor.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(&mut command, descriptor.limits);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ExecutionError::MissingExecutable(argv0.to_string()),
            _ => ExecutionError::Io(e),
        })?;
        debug!(pid=?child.id(), program=?program, "spawned process");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExecutionError::Io(io::Error::other("child pipes missing")));
        };
        let finished = async {
            futures::try_join!(
                child.wait(),
                capture_stream(&self.blob_service, stdout),
                capture_stream(&self.blob_service, stderr),
            )
        };

        // on timeout, the child is dropped on return, which kills it.
        let (status, stdout, stderr) = match descriptor.timeout {
            Some(timeout) => tokio::time::timeout(timeout, finished)
                .await
                .map_err(|_| {
                    warn!(timeout=?timeout, "process timed out");
                    ExecutionError::Timeout(timeout)
                })??,
            None => finished.await?,
        };

        let exit_code = status
            .code()
            .or_else(|| status.signal().map(|signal| -signal))
            .unwrap_or(-1);

        let output_root = capture_outputs(
            &self.blob_service,
            &self.directory_service,
            &cwd,
            &descriptor.output_paths,
        )
        .await?;

        debug!(exit_code, output_root=%output_root, "process finished");
        sandbox.remove().await;

        Ok(ProcessResult {
            exit_code,
            stdout,
            stderr,
            output_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use kiln_castore::blobservice::MemoryBlobService;
    use kiln_castore::directoryservice::MemoryDirectoryService;
    use kiln_castore::import::IngestionEntry;
    use kiln_castore::{ContentStore, Digest, DirectoryDigest, Node, PathComponent};
    use tempfile::TempDir;

    use super::LocalExecutionService;
    use crate::executionservice::{ExecutionError, ExecutionService, ProcessDescriptor};

    fn gen_service(sandbox_root: PathBuf) -> (ContentStore, LocalExecutionService<ContentStore, ContentStore>) {
        let store = ContentStore::new(
            MemoryBlobService::default(),
            MemoryDirectoryService::default(),
        );
        let service = LocalExecutionService::new(sandbox_root, store.clone(), store.clone());
        (store, service)
    }

    fn sh(script: &str, input_root: DirectoryDigest) -> ProcessDescriptor {
        ProcessDescriptor::new(["/bin/sh", "-c", script], input_root)
    }

    #[tokio::test]
    async fn captures_stdout_and_declared_outputs() {
        let tmpdir = TempDir::new().unwrap();
        let (store, service) = gen_service(tmpdir.path().to_path_buf());

        let data = store.put("hello".into()).await.unwrap();
        let input_root = store
            .put_tree(vec![IngestionEntry::Regular {
                path: "in/data".into(),
                size: data.size,
                executable: false,
                digest: data.hash.clone(),
            }])
            .await
            .unwrap();

        let result = service
            .execute(
                sh(
                    "cat in/data; cat in/data > out/copy; echo junk > undeclared",
                    input_root,
                )
                .output("out/copy"),
            )
            .await
            .expect("must succeed");

        assert_eq!(0, result.exit_code);
        assert_eq!(
            bytes::Bytes::from("hello"),
            store.get(&result.stdout).await.unwrap()
        );

        // only out/copy ends up in the output tree.
        let root = store.get_directory(&result.output_root).await.unwrap();
        let names: Vec<_> = root.nodes().map(|(n, _)| n.as_str().to_owned()).collect();
        assert_eq!(vec!["out"], names);
        let out = match root.get(&PathComponent::try_from("out").unwrap()) {
            Some(Node::Directory { digest, size }) => store
                .get_directory(&DirectoryDigest::from_node(digest.clone(), *size))
                .await
                .unwrap(),
            other => panic!("expected out dir, got {:?}", other),
        };
        assert_eq!(
            Some(&Node::File {
                digest: data.hash.clone(),
                size: data.size,
                executable: false
            }),
            out.get(&PathComponent::try_from("copy").unwrap())
        );

        // the sandbox is gone.
        assert_eq!(0, std::fs::read_dir(tmpdir.path()).unwrap().count());
    }

    #[tokio::test]
    async fn environment_is_exactly_declared() {
        let tmpdir = TempDir::new().unwrap();
        let (store, service) = gen_service(tmpdir.path().to_path_buf());

        let result = service
            .execute(
                ProcessDescriptor::new(["env"], DirectoryDigest::empty())
                    .env("PATH", "/usr/bin:/bin")
                    .env("FOO", "bar"),
            )
            .await
            .expect("must succeed");

        let stdout = store.get(&result.stdout).await.unwrap();
        let mut lines: Vec<&str> = std::str::from_utf8(&stdout).unwrap().lines().collect();
        lines.sort();
        assert_eq!(vec!["FOO=bar", "PATH=/usr/bin:/bin"], lines);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_result() {
        let tmpdir = TempDir::new().unwrap();
        let (store, service) = gen_service(tmpdir.path().to_path_buf());

        let result = service
            .execute(sh("echo oops >&2; exit 3", DirectoryDigest::empty()))
            .await
            .expect("must not be an error");
        assert_eq!(3, result.exit_code);
        assert!(!result.success());
        assert_eq!(
            bytes::Bytes::from("oops\n"),
            store.get(&result.stderr).await.unwrap()
        );
        assert_eq!(DirectoryDigest::empty(), result.output_root);
    }

    #[tokio::test]
    async fn missing_executable() {
        let tmpdir = TempDir::new().unwrap();
        let (_store, service) = gen_service(tmpdir.path().to_path_buf());

        let err = service
            .execute(ProcessDescriptor::new(
                ["./does-not-exist"],
                DirectoryDigest::empty(),
            ))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ExecutionError::MissingExecutable(_)), "{err}");

        // bare names aren't looked up in the host's PATH.
        let err = service
            .execute(ProcessDescriptor::new(["sh"], DirectoryDigest::empty()))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ExecutionError::MissingExecutable(_)), "{err}");
    }

    #[tokio::test]
    async fn timeout() {
        let tmpdir = TempDir::new().unwrap();
        let (_store, service) = gen_service(tmpdir.path().to_path_buf());

        let err = service
            .execute(sh("sleep 10", DirectoryDigest::empty()).timeout(Duration::from_millis(100)))
            .await
            .expect_err("must time out");
        assert!(matches!(err, ExecutionError::Timeout(_)), "{err}");

        // the sandbox of an aborted run is removed in the background.
        for _ in 0..100 {
            if std::fs::read_dir(tmpdir.path()).unwrap().count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("sandbox was not removed");
    }

    #[tokio::test]
    async fn large_output_is_captured() {
        let tmpdir = TempDir::new().unwrap();
        let (store, service) = gen_service(tmpdir.path().to_path_buf());

        // more than any pipe buffer, on both streams at once.
        let result = service
            .execute(
                sh(
                    "head -c 3000000 /dev/zero; head -c 2000000 /dev/zero >&2",
                    DirectoryDigest::empty(),
                )
                .env("PATH", "/usr/bin:/bin"),
            )
            .await
            .expect("must succeed");

        assert_eq!(0, result.exit_code);
        assert_eq!(Digest::of_bytes(&vec![0u8; 3_000_000]), result.stdout);
        assert_eq!(Digest::of_bytes(&vec![0u8; 2_000_000]), result.stderr);
        assert_eq!(3_000_000, store.get(&result.stdout).await.unwrap().len());
    }

    #[tokio::test]
    async fn missing_input_tree() {
        let tmpdir = TempDir::new().unwrap();
        let (_store, service) = gen_service(tmpdir.path().to_path_buf());

        let err = service
            .execute(sh(
                "true",
                kiln_castore::fixtures::DIRECTORY_WITH_KEEP.digest(),
            ))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ExecutionError::Materialization(_)), "{err}");
    }

    #[tokio::test]
    async fn cannot_write_into_inputs_of_other_runs() {
        let tmpdir = TempDir::new().unwrap();
        let (store, service) = gen_service(tmpdir.path().to_path_buf());

        let data = store.put("original".into()).await.unwrap();
        let input_root = store
            .put_tree(vec![IngestionEntry::Regular {
                path: "data".into(),
                size: data.size,
                executable: false,
                digest: data.hash.clone(),
            }])
            .await
            .unwrap();

        // a process scribbling over its input copy doesn't touch the store.
        service
            .execute(sh("chmod u+w data; echo changed > data", input_root.clone()))
            .await
            .unwrap();

        let result = service
            .execute(sh("cat data", input_root))
            .await
            .unwrap();
        assert_eq!(
            bytes::Bytes::from("original"),
            store.get(&result.stdout).await.unwrap()
        );
    }
}
