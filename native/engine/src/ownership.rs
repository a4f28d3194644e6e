use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::{
    error::{OwnershipError, ShellError},
    shell::{Privilege, PrivilegedExecutor, quote},
};

/// Numeric owner of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Parses `stat -c '%u %g'` output: exactly two non-empty numeric tokens
    pub fn parse(output: &str) -> Option<Self> {
        let mut tokens = output.split_whitespace();
        let uid = tokens.next()?.parse().ok()?;
        let gid = tokens.next()?.parse().ok()?;
        tokens.next().is_none().then_some(Self { uid, gid })
    }
}

/// Reads the owner of freshly restored package directories
#[derive(Debug, Clone)]
pub struct OwnershipResolver {
    executor: PrivilegedExecutor,
    settle_delay: Duration,
}

impl OwnershipResolver {
    pub fn new(executor: PrivilegedExecutor, settle_delay: Duration) -> Self {
        Self { executor, settle_delay }
    }

    /// Returns the uid/gid of `path`.
    ///
    /// Waits `settle_delay` first: a package directory created by a fresh install can
    /// report uid/gid 0 for a short while.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn resolve(&self, path: &str) -> Result<Ownership> {
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }
        self.query(path).await.map_err(|e| {
            OwnershipError::Unresolved { path: PathBuf::from(path), source: e.into() }.into()
        })
    }

    async fn query(&self, path: &str) -> Result<Ownership> {
        let command = self.executor.toolbox_cmd(format_args!("stat -c '%u %g' {}", quote(path)));
        let result = self
            .executor
            .run_checked(Privilege::Root, &[&command])
            .await
            .with_context(|| format!("Failed to stat {path}"))?;
        let output = result.stdout.join(" ");
        let ownership = Ownership::parse(&output).ok_or_else(|| ShellError::UnexpectedResult {
            command,
            reason: "expected '<uid> <gid>'".to_string(),
            stdout: result.stdout.clone(),
        })?;
        debug!(path, uid = ownership.uid, gid = ownership.gid, "Resolved ownership");
        Ok(ownership)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use super::*;
    use crate::test_support::{TestEnv, path_str};

    #[test]
    fn parses_two_tokens() {
        assert_eq!(Ownership::parse("10123 10123"), Some(Ownership { uid: 10123, gid: 10123 }));
        assert_eq!(Ownership::parse(" 0 1015 \n"), Some(Ownership { uid: 0, gid: 1015 }));
    }

    #[test]
    fn rejects_other_shapes() {
        assert_eq!(Ownership::parse(""), None);
        assert_eq!(Ownership::parse("10123"), None);
        assert_eq!(Ownership::parse("1 2 3"), None);
        assert_eq!(Ownership::parse("stat: permission denied"), None);
        assert_eq!(Ownership::parse("-1 5"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolves_owner_of_real_path() {
        let env = TestEnv::new();
        let dir = env.mkdir("app");
        let meta = fs_err::metadata(&dir).unwrap();

        let resolver = OwnershipResolver::new(env.executor().await, Duration::ZERO);
        let ownership = resolver.resolve(&path_str(&dir)).await.unwrap();
        assert_eq!(ownership, Ownership { uid: meta.uid(), gid: meta.gid() });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unparseable_output_is_unexpected_result() {
        let env = TestEnv::new();
        // A toolbox whose `stat` prints a single token
        let fake = env.write("fake-toolbox", b"#!/bin/sh\necho 'denied'\n");
        fs_err::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = env.config();
        config.toolbox_path = path_str(&fake);
        let executor = PrivilegedExecutor::new(&config).await.unwrap();

        let resolver = OwnershipResolver::new(executor, Duration::ZERO);
        let err = resolver.resolve("/data/data/com.example.app").await.unwrap_err();
        let ownership = err.downcast_ref::<OwnershipError>().unwrap();
        assert!(matches!(ownership, OwnershipError::Unresolved { .. }));
        let mut source = std::error::Error::source(ownership);
        let mut found = false;
        while let Some(e) = source {
            if matches!(e.downcast_ref::<ShellError>(), Some(ShellError::UnexpectedResult { .. })) {
                found = true;
            }
            source = e.source();
        }
        assert!(found);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_path_fails() {
        let env = TestEnv::new();
        let resolver = OwnershipResolver::new(env.executor().await, Duration::ZERO);
        let missing = path_str(&env.root().join("missing"));
        assert!(resolver.resolve(&missing).await.is_err());
    }
}
