//! Build context threaded through every builder
//!
//! Carries the build mode and the build directory (artifacts are cache and
//! survive across invocations), plus the SGX service-provider state: the SP
//! keypair and IAS root certificate, materialized only when absent, and the
//! background attestation service terminated by cleanup.

use std::path::{Path, PathBuf};
use tokio::process::Child;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::tools;

/// IAS attestation root certificate
const IAS_ROOT_CA_URL: &str =
    "https://certificates.trustedservices.intel.com/Intel_SGX_Attestation_RootCA.pem";

/// Background IAS service provider
const RA_SP: &str = "ra_sp";

/// Build mode for module toolchains
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildMode {
    #[default]
    Debug,
    Release,
}

impl BuildMode {
    pub fn from_str_tag(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "release" => Ok(Self::Release),
            _ => Err(Error::descriptor(format!("bad build mode: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

/// Service-provider credentials for SGX remote attestation
#[derive(Clone, Debug)]
pub struct SpCredentials {
    pub pubkey: PathBuf,
    pub privkey: PathBuf,
    pub ias_cert: PathBuf,
}

/// Per-run context handed to every builder
pub struct BuildContext {
    pub mode: BuildMode,
    pub build_dir: PathBuf,
    sp_credentials: OnceCell<SpCredentials>,
    attestation_service: Mutex<Option<Child>>,
}

impl BuildContext {
    pub fn new(mode: BuildMode, build_dir: impl Into<PathBuf>) -> Result<Self> {
        let build_dir = build_dir.into();
        std::fs::create_dir_all(&build_dir)?;

        Ok(Self {
            mode,
            build_dir,
            sp_credentials: OnceCell::new(),
            attestation_service: Mutex::new(None),
        })
    }

    /// Scratch/artifact directory for one module, created lazily.
    pub fn module_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.build_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// SP keypair and IAS root certificate, generated only when absent.
    pub async fn sp_credentials(&self) -> Result<&SpCredentials> {
        self.sp_credentials
            .get_or_try_init(|| async {
                let dir = self.module_dir("sp")?;
                let creds = SpCredentials {
                    privkey: dir.join("private_key.pem"),
                    pubkey: dir.join("public_key.pem"),
                    ias_cert: dir.join("ias_root_ca.pem"),
                };

                if !creds.privkey.exists() {
                    info!("Generating SP keypair");
                    tools::run(&tools::argv([
                        "openssl",
                        "genrsa",
                        "-out",
                        path_str(&creds.privkey).as_str(),
                        "2048",
                    ]))
                    .await?;
                    tools::run(&tools::argv([
                        "openssl",
                        "rsa",
                        "-in",
                        path_str(&creds.privkey).as_str(),
                        "-pubout",
                        "-out",
                        path_str(&creds.pubkey).as_str(),
                    ]))
                    .await?;
                }

                if !creds.ias_cert.exists() {
                    info!("Fetching IAS root certificate");
                    tools::run(&tools::argv([
                        "curl",
                        "-s",
                        "-o",
                        path_str(&creds.ias_cert).as_str(),
                        IAS_ROOT_CA_URL,
                    ]))
                    .await?;
                }

                Ok(creds)
            })
            .await
    }

    /// Start the background attestation service if not yet running.
    pub async fn ensure_attestation_service(&self) -> Result<()> {
        let mut service = self.attestation_service.lock().await;
        if service.is_some() {
            return Ok(());
        }

        // A stale instance from an earlier run would hold the port.
        let _ = tools::run(&tools::argv(["pkill", "-f", RA_SP])).await;

        let creds = self.sp_credentials().await?;
        let child =
            tools::run_background(&tools::argv([RA_SP, path_str(&creds.privkey).as_str()])).await?;
        debug!("Started {}", RA_SP);

        *service = Some(child);
        Ok(())
    }

    /// Variant-specific teardown: terminate the attestation service.
    pub async fn shutdown(&self) {
        let mut service = self.attestation_service.lock().await;
        if let Some(mut child) = service.take() {
            let _ = child.kill().await;
            debug!("Stopped {}", RA_SP);
        }
    }
}

/// Lossy display form for argv building.
pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_build_mode_parsing() {
        assert_eq!(BuildMode::from_str_tag("Release").unwrap(), BuildMode::Release);
        assert_eq!(BuildMode::from_str_tag("debug").unwrap(), BuildMode::Debug);
        assert!(BuildMode::from_str_tag("profile").is_err());
    }

    #[test]
    fn test_context_creates_build_dir() {
        let dir = tempdir().unwrap();
        let build_dir = dir.path().join("build");
        let ctx = BuildContext::new(BuildMode::Debug, &build_dir).unwrap();

        assert!(build_dir.is_dir());
        let module_dir = ctx.module_dir("sensor").unwrap();
        assert!(module_dir.is_dir());
        assert!(module_dir.ends_with("sensor"));
    }
}
