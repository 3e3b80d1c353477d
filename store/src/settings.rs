//! Engine configuration.
//!
//! A [Settings] value is constructed once at startup (defaults,
//! environment, then command-line overrides) and passed explicitly to
//! every component; nothing reads the environment after that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nixwire::store_path::StoreDir;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Prefix under which artifacts live (`NIX_STORE_DIR`).
    pub store_dir: StoreDir,
    /// Mutable engine state: database, roots, locks (`NIX_STATE_DIR`).
    pub state_dir: PathBuf,
    /// Per-derivation build logs (`NIX_LOG_DIR`).
    pub log_dir: PathBuf,
    /// User cache directory holding the narinfo disk cache
    /// (`XDG_CACHE_HOME`).
    pub cache_dir: PathBuf,

    /// Upper bound on concurrently running slotted children
    /// (`max-jobs`).
    pub max_build_jobs: u32,
    /// Upper bound on concurrent substitution goals.
    pub max_substitution_jobs: u32,
    /// Kill a builder if it writes no log output for this long.
    pub max_silent_time: Option<Duration>,
    /// Kill a builder when its total wall-clock time exceeds this.
    pub build_timeout: Option<Duration>,
    /// Continue with sibling goals after a failure.
    pub keep_going: bool,
    /// Fall back to a local build when substitution fails.
    pub try_fallback: bool,
    /// Keep the build temp dir of failed builds around for debugging.
    pub keep_failed: bool,

    /// GC: outputs of live derivations are live.
    pub keep_outputs: bool,
    /// GC: derivers of live paths are live.
    pub keep_derivations: bool,

    /// Whether unsigned, non-content-addressed path infos are
    /// rejected.
    pub require_sigs: bool,
    /// Files holding secret signing keys.
    pub secret_key_files: Vec<PathBuf>,
    /// `name:base64-pubkey` entries of the trust set.
    pub trusted_public_keys: Vec<String>,

    /// Positive narinfo disk-cache TTL, seconds.
    pub ttl_positive_nar_info: u64,
    /// Negative narinfo disk-cache TTL, seconds.
    pub ttl_negative_nar_info: u64,

    /// Connection-pool bound of the file transfer.
    pub http_connections: usize,
    /// Download retry attempts before giving up.
    pub download_attempts: usize,
    /// Base delay of the retry backoff.
    pub base_retry_delay: Duration,
    /// Worker bound of parallel closure computation.
    pub closure_workers: usize,

    /// Rename case-colliding entries while restoring archives.
    pub use_case_hack: bool,
    /// External build hook (`NIX_BUILD_HOOK`).
    pub build_hook: Option<PathBuf>,
    /// Platform tag of this host.
    pub system: String,
    /// CA bundle override (`NIX_SSL_CERT_FILE` / `SSL_CERT_FILE`).
    pub ssl_cert_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            store_dir: StoreDir::default(),
            state_dir: PathBuf::from("/nix/var/nix"),
            log_dir: PathBuf::from("/nix/var/log/nix"),
            cache_dir: dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp")),
            max_build_jobs: 1,
            max_substitution_jobs: 16,
            max_silent_time: None,
            build_timeout: None,
            keep_going: false,
            try_fallback: false,
            keep_failed: false,
            keep_outputs: false,
            keep_derivations: true,
            require_sigs: true,
            secret_key_files: vec![],
            trusted_public_keys: vec![],
            ttl_positive_nar_info: 30 * 24 * 3600,
            ttl_negative_nar_info: 3600,
            http_connections: 25,
            download_attempts: 5,
            base_retry_delay: Duration::from_millis(250),
            closure_workers: 8,
            use_case_hack: cfg!(target_os = "macos"),
            build_hook: None,
            system: this_system(),
            ssl_cert_file: None,
        }
    }
}

impl Settings {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();

        if let Some(dir) = env_path("NIX_STORE_DIR") {
            settings.store_dir = StoreDir::new(dir.to_string_lossy().into_owned());
        }
        if let Some(dir) = env_path("NIX_STATE_DIR") {
            settings.state_dir = dir;
        }
        if let Some(dir) = env_path("NIX_LOG_DIR") {
            settings.log_dir = dir;
        }
        if let Some(dir) = env_path("XDG_CACHE_HOME") {
            settings.cache_dir = dir;
        }
        if let Some(hook) = env_path("NIX_BUILD_HOOK") {
            settings.build_hook = Some(hook);
        }
        settings.ssl_cert_file = env_path("NIX_SSL_CERT_FILE").or_else(|| env_path("SSL_CERT_FILE"));

        settings
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("db/db.sqlite")
    }

    pub fn gc_roots_dir(&self) -> PathBuf {
        self.state_dir.join("gcroots")
    }

    pub fn temp_roots_dir(&self) -> PathBuf {
        self.state_dir.join("temproots")
    }

    pub fn disk_cache_path(&self) -> PathBuf {
        self.cache_dir.join("nix/binary-cache-v6.sqlite")
    }

    /// Directory for build temp dirs, honoring `TMPDIR`.
    pub fn build_tmp_dir(&self) -> PathBuf {
        std::env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Point all state at one root; used by tests and `--store`.
    pub fn with_root(root: &Path) -> Self {
        Settings {
            store_dir: StoreDir::new(root.join("store").to_string_lossy().into_owned()),
            state_dir: root.join("var"),
            log_dir: root.join("log"),
            cache_dir: root.join("cache"),
            ..Settings::default()
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    let value = std::env::var_os(name)?;
    if value.is_empty() {
        return None;
    }
    Some(PathBuf::from(value))
}

fn this_system() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn derived_paths() {
        let root = std::path::Path::new("/work/test-root");
        let settings = Settings::with_root(root);
        assert_eq!(settings.store_dir.as_str(), "/work/test-root/store");
        assert_eq!(
            settings.db_path(),
            root.join("var/db/db.sqlite")
        );
        assert_eq!(settings.gc_roots_dir(), root.join("var/gcroots"));
        assert_eq!(settings.temp_roots_dir(), root.join("var/temproots"));
    }

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_build_jobs, 1);
        assert!(settings.require_sigs);
        assert!(settings.keep_derivations);
        assert!(!settings.keep_outputs);
        assert_eq!(settings.ttl_negative_nar_info, 3600);
    }
}
