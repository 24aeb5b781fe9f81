//! Object storage used for term files, reference tables, and job results.

use std::path::{Path, PathBuf};

use super::s3::{self, ObjectLocation};

/// Backend for reading and writing objects.
///
/// `Local` mirrors the `bucket/key` layout below a directory and is used for
/// offline runs and in tests.
#[derive(Debug, Clone)]
pub enum ObjectStore {
    S3(aws_sdk_s3::Client),
    Local(PathBuf),
}

impl ObjectStore {
    /// Construct the store, using the local directory if given and S3 otherwise.
    pub async fn from_env(local_root: Option<&Path>) -> Result<Self, anyhow::Error> {
        if let Some(root) = local_root {
            tracing::info!("using local object store at {:?}", root);
            Ok(ObjectStore::Local(root.to_path_buf()))
        } else {
            if !s3::s3_mode() {
                tracing::warn!("AWS_ACCESS_KEY_ID not set, relying on default credential chain");
            }
            let config = s3::config_from_env().await?;
            Ok(ObjectStore::S3(aws_sdk_s3::Client::from_conf(config)))
        }
    }

    fn local_path(root: &Path, loc: &ObjectLocation) -> PathBuf {
        root.join(&loc.bucket).join(&loc.key)
    }

    /// Read the object at `loc` into memory.
    pub async fn get_bytes(&self, loc: &ObjectLocation) -> Result<Vec<u8>, anyhow::Error> {
        tracing::debug!("fetching {}", loc);
        match self {
            ObjectStore::S3(client) => {
                let resp = client
                    .get_object()
                    .bucket(&loc.bucket)
                    .key(&loc.key)
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("could not get object {}: {}", loc, e))?;
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| anyhow::anyhow!("could not read object {}: {}", loc, e))?;
                Ok(data.into_bytes().to_vec())
            }
            ObjectStore::Local(root) => {
                let path = Self::local_path(root, loc);
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("could not read object {:?}: {}", path, e))
            }
        }
    }

    /// Read the object at `loc` as UTF-8 text.
    pub async fn get_string(&self, loc: &ObjectLocation) -> Result<String, anyhow::Error> {
        let bytes = self.get_bytes(loc).await?;
        String::from_utf8(bytes)
            .map_err(|e| anyhow::anyhow!("object {} is not valid UTF-8: {}", loc, e))
    }

    /// Download the object at `loc` to the local file `dst`.
    pub async fn download(&self, loc: &ObjectLocation, dst: &Path) -> Result<(), anyhow::Error> {
        let bytes = self.get_bytes(loc).await?;
        tokio::fs::write(dst, bytes)
            .await
            .map_err(|e| anyhow::anyhow!("could not write {:?}: {}", dst, e))
    }

    /// Upload the local file `src` to `loc`.
    pub async fn upload(&self, src: &Path, loc: &ObjectLocation) -> Result<(), anyhow::Error> {
        tracing::debug!("will upload {:?} to {}", src, loc);
        match self {
            ObjectStore::S3(client) => {
                let body = aws_sdk_s3::primitives::ByteStream::from_path(src)
                    .await
                    .map_err(|e| anyhow::anyhow!("could not open file {:?}: {}", src, e))?;
                client
                    .put_object()
                    .bucket(&loc.bucket)
                    .key(&loc.key)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("could not upload file {:?}: {}", src, e))?;
            }
            ObjectStore::Local(root) => {
                let dst = Self::local_path(root, loc);
                if let Some(parent) = dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(src, &dst)
                    .await
                    .map_err(|e| anyhow::anyhow!("could not copy {:?} to {:?}: {}", src, dst, e))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{ObjectLocation, ObjectStore};

    #[tokio::test]
    async fn local_upload_then_download() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let root = tmp_dir.join("store");
        let store = ObjectStore::from_env(Some(root.as_path())).await?;

        let src = tmp_dir.join("src.txt");
        std::fs::write(&src, "MAN_0001-01\n")?;
        let loc = ObjectLocation::new("mybucket", "nested/dir/terms.txt");
        store.upload(&src, &loc).await?;

        assert!(tmp_dir.join("store/mybucket/nested/dir/terms.txt").exists());
        assert_eq!(store.get_string(&loc).await?, "MAN_0001-01\n");

        let dst = tmp_dir.join("dst.txt");
        store.download(&loc, &dst).await?;
        assert_eq!(std::fs::read_to_string(&dst)?, "MAN_0001-01\n");

        Ok(())
    }

    #[tokio::test]
    async fn local_missing_object() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let store = ObjectStore::Local(tmp_dir.to_path_buf());

        let res = store
            .get_string(&ObjectLocation::new("mybucket", "missing.txt"))
            .await;
        assert!(res.is_err());

        Ok(())
    }
}
