//! Local filesystem and port probing.

use async_net::TcpStream;
use async_trait::async_trait;
use futures::AsyncWriteExt;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{CollabResult, Filesystem, PortProbe};

/// Filesystem of the machine running the tool
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFs;

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    async_fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Write `content` to `path`, creating the file with `mode`
///
/// An existing file gets `mode` before the new content lands in it.
pub(crate) async fn write_with_mode(path: &Path, content: &str, mode: u32) -> std::io::Result<()> {
    if async_fs::metadata(path).await.is_ok() {
        set_mode(path, mode).await?;
    }

    let mut options = async_fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use async_fs::unix::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    set_mode(path, mode).await
}

#[async_trait]
impl Filesystem for HostFs {
    async fn exists(&self, path: &Path) -> bool {
        async_fs::metadata(path).await.is_ok()
    }

    async fn read_to_string(&self, path: &Path) -> CollabResult<Option<String>> {
        match async_fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_dir(&self, path: &Path, mode: u32) -> CollabResult<()> {
        let mut missing = Vec::new();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() || async_fs::metadata(ancestor).await.is_ok() {
                break;
            }
            missing.push(ancestor);
        }

        // Outermost first, so every directory created here gets `mode`
        for dir in missing.into_iter().rev() {
            match async_fs::create_dir(dir).await {
                Ok(()) => set_mode(dir, mode).await?,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        set_mode(path, mode).await?;
        Ok(())
    }

    async fn write_file(&self, path: &Path, content: &str, mode: u32) -> CollabResult<()> {
        write_with_mode(path, content, mode).await?;
        Ok(())
    }
}

/// Connects to `127.0.0.1:<port>` to see whether something is listening
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    connect_timeout: Duration,
}

impl TcpPortProbe {
    /// Probe with a custom connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_bound(&self, port: u16) -> bool {
        let connect = async { TcpStream::connect(("127.0.0.1", port)).await.is_ok() };
        let timeout = async {
            smol::Timer::after(self.connect_timeout).await;
            false
        };
        let bound = smol::future::or(connect, timeout).await;
        debug!("Port {} bound: {}", port, bound);
        bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dir_and_write_file() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let nested = dir.path().join("confluence/data");
            let fs = HostFs;

            fs.ensure_dir(&nested, 0o755).await.unwrap();
            assert!(fs.exists(&nested).await);
            // Idempotent
            fs.ensure_dir(&nested, 0o755).await.unwrap();

            let file = dir.path().join("confluence/.env");
            assert_eq!(fs.read_to_string(&file).await.unwrap(), None);
            fs.write_file(&file, "APP_PORT=8090\n", 0o640).await.unwrap();
            assert_eq!(
                fs.read_to_string(&file).await.unwrap().as_deref(),
                Some("APP_PORT=8090\n")
            );

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(&file).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o640);
            }
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_created_parents_get_the_mode() {
        use std::os::unix::fs::PermissionsExt;

        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let leaf = dir.path().join("confluence/mysql/data");

            HostFs.ensure_dir(&leaf, 0o750).await.unwrap();

            for created in [
                dir.path().join("confluence"),
                dir.path().join("confluence/mysql"),
                leaf.clone(),
            ] {
                let mode = std::fs::metadata(&created).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o750, "{}", created.display());
            }
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let file = dir.path().join(".env");
            std::fs::write(&file, "DB_PASSWORD=old\n").unwrap();
            std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

            HostFs
                .write_file(&file, "DB_PASSWORD=new\n", 0o600)
                .await
                .unwrap();

            let mode = std::fs::metadata(&file).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            assert_eq!(std::fs::read_to_string(&file).unwrap(), "DB_PASSWORD=new\n");
        });
    }

    #[test]
    fn test_port_probe_detects_listener() {
        smol::block_on(async {
            let listener = async_net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let probe = TcpPortProbe::default();

            assert!(probe.is_bound(port).await);
            drop(listener);
            assert!(!probe.is_bound(port).await);
        });
    }
}
