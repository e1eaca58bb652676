//! Repository mirroring via the git CLI
//!
//! Clones a source repository and pushes it into a controlled one.
//! Authentication uses an askpass helper scoped to a temporary directory so
//! no credential ever lands on the command line; the directory is released
//! on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use sqaaas_common::error::{Error, Result};

const REMOTE_NAME: &str = "sqaaas";
const ASKPASS_HELPER: &str = "git-askpass-helper.sh";

/// Result of a mirroring run
#[derive(Debug, Clone)]
pub struct MirrorOutcome {
    pub target_url: String,
    /// Branch the mirrored content landed on
    pub active_branch: String,
}

/// Clone-and-push mirroring of an external repository
pub struct GitMirror {
    access_token: String,
    timeout: Duration,
}

impl GitMirror {
    pub fn new(access_token: &str, timeout: Duration) -> Self {
        Self {
            access_token: access_token.to_string(),
            timeout,
        }
    }

    /// Mirror `source_url` into `target_url`.
    ///
    /// A fetch/pull failure before the first push is non-fatal (the target
    /// may be empty); only the push failure is.
    pub async fn mirror(
        &self,
        source_url: &str,
        target_url: &str,
        source_branch: Option<&str>,
    ) -> Result<MirrorOutcome> {
        let work = async {
            let dir = tempfile::tempdir()?;
            let askpass = write_askpass_helper(dir.path())?;
            let workdir = dir.path().join("clone");

            let mut clone_args: Vec<&str> = vec!["clone"];
            if let Some(branch) = source_branch {
                clone_args.extend(["--branch", branch, "--single-branch"]);
            }
            clone_args.push(source_url);
            let workdir_str = workdir.display().to_string();
            clone_args.push(&workdir_str);
            self.run_git(dir.path(), &askpass, &clone_args).await?;

            let active_branch = self
                .run_git(&workdir, &askpass, &["rev-parse", "--abbrev-ref", "HEAD"])
                .await?
                .trim()
                .to_string();

            self.run_git(&workdir, &askpass, &["remote", "add", REMOTE_NAME, target_url])
                .await?;

            // Target may be empty or diverged; reconciliation is best-effort
            let fetched = self.run_git(&workdir, &askpass, &["fetch", REMOTE_NAME]).await;
            match fetched {
                Ok(_) => {
                    if let Err(e) = self
                        .run_git(&workdir, &askpass, &["pull", REMOTE_NAME, &active_branch])
                        .await
                    {
                        warn!("Error pulling from target repository <{}>: {}", target_url, e);
                    } else {
                        debug!("Repository updated from target: {}", target_url);
                    }
                }
                Err(e) => warn!("Error fetching from target repository <{}>: {}", target_url, e),
            }

            let refspec = format!("HEAD:refs/heads/{}", active_branch);
            self.run_git(&workdir, &askpass, &["push", REMOTE_NAME, &refspec])
                .await?;
            debug!("Repository pushed to remote: {}", target_url);

            Ok(MirrorOutcome {
                target_url: target_url.to_string(),
                active_branch,
            })
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::upstream(format!(
                "mirroring exceeded the {}s ceiling",
                self.timeout.as_secs()
            ))),
        }
    }

    async fn run_git(&self, cwd: &Path, askpass: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_ASKPASS", askpass)
            .env("GIT_PASSWORD", &self.access_token)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| Error::upstream(format!("cannot spawn git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::upstream(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Write the askpass helper into the scoped directory and mark it executable.
fn write_askpass_helper(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(ASKPASS_HELPER);
    std::fs::write(&path, "#!/bin/sh\nexec echo \"$GIT_PASSWORD\"\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    debug!("Askpass helper written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_askpass_helper_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_askpass_helper(dir.path()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#!/bin/sh"));
        assert!(content.contains("$GIT_PASSWORD"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
