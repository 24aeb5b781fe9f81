//! Helper code for working with S3.

/// Helper that returns whether S3 mode has been enabled via `AWS_ACCESS_KEY_ID`.
pub fn s3_mode() -> bool {
    std::env::var("AWS_ACCESS_KEY_ID").is_ok()
}

/// Return the S3 configuration from environment variables.
///
/// A custom endpoint (e.g., MinIO) is used with path-style addressing when
/// `AWS_ENDPOINT_URL` is set.
pub async fn config_from_env() -> Result<aws_sdk_s3::config::Config, anyhow::Error> {
    let config = aws_config::from_env().load().await;
    match std::env::var("AWS_ENDPOINT_URL") {
        Ok(endpoint_url) => {
            tracing::trace!("will use endpoint url {:?}", &endpoint_url);
            Ok(aws_sdk_s3::config::Builder::from(&config)
                .endpoint_url(endpoint_url)
                .force_path_style(true)
                .build())
        }
        Err(_) => {
            tracing::trace!("no AWS_ENDPOINT_URL, using default endpoint");
            Ok(aws_sdk_s3::config::Builder::from(&config).build())
        }
    }
}

/// Location of an object, addressed by bucket and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ObjectLocation {
    /// Name of the bucket.
    pub bucket: String,
    /// Key within the bucket.
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// The last path component of the key.
    pub fn basename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// The basename without its final extension.
    pub fn file_stem(&self) -> &str {
        let basename = self.basename();
        match basename.rfind('.') {
            Some(0) | None => basename,
            Some(pos) => &basename[..pos],
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl std::str::FromStr for ObjectLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("s3://")
            .ok_or_else(|| anyhow::anyhow!("invalid S3 path (no s3:// prefix): {}", s))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(ObjectLocation::new(bucket, key))
            }
            _ => anyhow::bail!("invalid S3 path: {}", s),
        }
    }
}
