use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_castore::fingerprint::{Fingerprint, FingerprintHasher};
use kiln_castore::{Digest, DirectoryDigest};

/// A ProcessDescriptor describes a single command to run against an input
/// tree from the castore.
///
/// Two equal descriptors describe the same work, so they're used as
/// memoization keys. The input tree is referenced by digest only, so the
/// descriptor can be sent to a remote executor sharing the same store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessDescriptor {
    /// The command and its arguments. `argv[0]` is resolved relative to the
    /// working directory if it contains a slash, else looked up in the
    /// `PATH` passed in `env`.
    pub argv: Vec<String>,
    /// The complete environment of the process. Nothing from the host leaks in.
    pub env: BTreeMap<String, String>,
    /// The tree materialized as the sandbox root.
    pub input_root: DirectoryDigest,
    /// Working directory, relative to the sandbox root.
    /// This MUST be a clean relative path, without any ".", "..", or superfluous
    /// slashes. The empty path is the sandbox root.
    pub working_dir: PathBuf,
    /// Paths, relative to the working directory, captured after the run.
    /// Everything else the process writes is discarded.
    /// These MUST be clean relative paths, and sorted.
    pub output_paths: Vec<PathBuf>,
    pub timeout: Option<Duration>,
    pub limits: ResourceLimits,
    /// Human readable description, used in logs and errors.
    pub description: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLimits {
    /// Maximum size of the process' virtual memory, in bytes.
    pub memory_bytes: Option<u64>,
    /// Maximum CPU time, in seconds.
    pub cpu_seconds: Option<u64>,
}

/// The outcome of running a [ProcessDescriptor].
/// A non-zero exit code is a regular result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// The exit code, or the negated signal number if the process was killed.
    pub exit_code: i32,
    pub stdout: Digest,
    pub stderr: Digest,
    /// The tree containing the declared output paths that were produced.
    pub output_root: DirectoryDigest,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that occur during the validation of [ProcessDescriptor]s.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidateDescriptorError {
    #[error("argv must not be empty")]
    EmptyArgv,

    #[error("invalid environment variable {0:?}")]
    InvalidEnvVar(String),

    #[error("invalid working_dir")]
    InvalidWorkingDir,

    #[error("invalid output path at position {0}")]
    InvalidOutputPath(usize),

    #[error("output paths not sorted or not unique")]
    OutputPathsNotSorted,

    #[error("timeout must not be zero")]
    ZeroTimeout,
}

/// Checks a path to be relative, UTF-8, without any `.` or `..` components,
/// and without superfluous slashes.
pub(crate) fn is_clean_relative_path(p: &Path) -> bool {
    // Path::components() already normalizes some of these away, so look at
    // the raw segments.
    match p.to_str() {
        None => false,
        Some(s) => s
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != ".."),
    }
}

impl ProcessDescriptor {
    /// Constructs a descriptor running `argv` in the root of `input_root`
    /// with an empty environment and no outputs.
    pub fn new<I, S>(argv: I, input_root: DirectoryDigest) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        Self {
            description: argv.join(" "),
            argv,
            env: BTreeMap::new(),
            input_root,
            working_dir: PathBuf::new(),
            output_paths: vec![],
            timeout: None,
            limits: ResourceLimits::default(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds a path to capture, keeping the list sorted.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Err(pos) = self.output_paths.binary_search(&path) {
            self.output_paths.insert(pos, path);
        }
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Ensures the descriptor can be executed.
    pub fn validate(&self) -> Result<(), ValidateDescriptorError> {
        match self.argv.first() {
            None => Err(ValidateDescriptorError::EmptyArgv)?,
            Some(arg0) if arg0.is_empty() => Err(ValidateDescriptorError::EmptyArgv)?,
            _ => {}
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                Err(ValidateDescriptorError::InvalidEnvVar(key.to_owned()))?
            }
        }

        if !self.working_dir.as_os_str().is_empty() && !is_clean_relative_path(&self.working_dir) {
            Err(ValidateDescriptorError::InvalidWorkingDir)?;
        }

        for (i, p) in self.output_paths.iter().enumerate() {
            if p.as_os_str().is_empty() || !is_clean_relative_path(p) {
                Err(ValidateDescriptorError::InvalidOutputPath(i))?
            }
        }
        if !self.output_paths.windows(2).all(|w| w[0] < w[1]) {
            Err(ValidateDescriptorError::OutputPathsNotSorted)?;
        }

        if self.timeout == Some(Duration::ZERO) {
            Err(ValidateDescriptorError::ZeroTimeout)?;
        }

        Ok(())
    }
}

impl Fingerprint for ResourceLimits {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        (self.memory_bytes, self.cpu_seconds).fingerprint_into(hasher)
    }
}

impl Fingerprint for ProcessDescriptor {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.record("ProcessDescriptor");
        self.argv.fingerprint_into(hasher);
        self.env.fingerprint_into(hasher);
        self.input_root.fingerprint_into(hasher);
        self.working_dir.fingerprint_into(hasher);
        self.output_paths.fingerprint_into(hasher);
        self.timeout
            .map(|t| t.as_millis() as u64)
            .fingerprint_into(hasher);
        self.limits.fingerprint_into(hasher);
        self.description.fingerprint_into(hasher);
    }
}

impl Fingerprint for ProcessResult {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.record("ProcessResult");
        hasher.i64(self.exit_code as i64);
        self.stdout.fingerprint_into(hasher);
        self.stderr.fingerprint_into(hasher);
        self.output_root.fingerprint_into(hasher);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use kiln_castore::fingerprint::Fingerprint;
    use kiln_castore::DirectoryDigest;
    use rstest::rstest;

    use super::{is_clean_relative_path, ProcessDescriptor, ValidateDescriptorError};

    #[rstest]
    #[case::fail_trailing_slash("foo/bar/", false)]
    #[case::fail_dotdot("foo/../bar", false)]
    #[case::fail_singledot("foo/./bar", false)]
    #[case::fail_unnecessary_slashes("foo//bar", false)]
    #[case::fail_absolute("/foo/bar", false)]
    #[case::ok_relative("foo/bar", true)]
    #[case::ok_single("foo", true)]
    fn test_is_clean_relative_path(#[case] s: &str, #[case] expected: bool) {
        assert_eq!(expected, is_clean_relative_path(Path::new(s)));
    }

    fn descriptor() -> ProcessDescriptor {
        ProcessDescriptor::new(["/bin/sh", "-c", "true"], DirectoryDigest::empty())
    }

    #[test]
    fn valid() {
        descriptor()
            .env("PATH", "/bin")
            .output("out/b")
            .output("out/a")
            .working_dir("src")
            .timeout(Duration::from_secs(1))
            .validate()
            .expect("must be valid");
    }

    #[rstest]
    #[case::empty_argv(ProcessDescriptor::new(Vec::<String>::new(), DirectoryDigest::empty()), ValidateDescriptorError::EmptyArgv)]
    #[case::env_with_equals(descriptor().env("A=B", "c"), ValidateDescriptorError::InvalidEnvVar("A=B".into()))]
    #[case::working_dir_escapes(descriptor().working_dir("../x"), ValidateDescriptorError::InvalidWorkingDir)]
    #[case::absolute_output(descriptor().output("/etc/passwd"), ValidateDescriptorError::InvalidOutputPath(0))]
    #[case::zero_timeout(descriptor().timeout(Duration::ZERO), ValidateDescriptorError::ZeroTimeout)]
    fn invalid(#[case] descriptor: ProcessDescriptor, #[case] expected: ValidateDescriptorError) {
        assert_eq!(Err(expected), descriptor.validate());
    }

    #[test]
    fn unsorted_outputs() {
        let mut d = descriptor();
        d.output_paths = vec!["b".into(), "a".into()];
        assert_eq!(
            Err(ValidateDescriptorError::OutputPathsNotSorted),
            d.validate()
        );
    }

    #[test]
    fn fingerprint_covers_fields() {
        let a = descriptor().env("X", "1");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), descriptor().env("X", "2").fingerprint());
        assert_ne!(a.fingerprint(), a.clone().output("o").fingerprint());
    }
}
