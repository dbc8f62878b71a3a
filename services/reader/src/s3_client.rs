use crate::config::AwsConfig;
use crate::error::SourceFault;
use crate::s3::{ListPage, ListRequest, ObjectStore};
use async_trait::async_trait;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// [`ObjectStore`] backed by the AWS SDK S3 client
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    /// Create a new S3 object store from the shared AWS settings
    pub async fn from_config(config: &AwsConfig) -> Self {
        let sdk_config = config.load_sdk_config().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&sdk_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = ?sdk_config.region(), "S3 client initialized");

        Self::new(client)
    }

    /// Get the S3 client
    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

fn source_fault<E>(err: E) -> SourceFault
where
    E: std::error::Error,
{
    SourceFault::new(DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, request), fields(bucket = %request.bucket, prefix = %request.prefix))]
    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, SourceFault> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_continuation_token(request.continuation_token.clone())
            .send()
            .await
            .map_err(source_fault)?;

        let page = ListPage {
            keys: response
                .contents()
                .iter()
                .filter_map(|obj| obj.key().map(String::from))
                .collect(),
            common_prefixes: response
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(String::from))
                .collect(),
            next_continuation_token: response.next_continuation_token().map(String::from),
        };

        debug!(
            keys = page.keys.len(),
            common_prefixes = page.common_prefixes.len(),
            truncated = page.next_continuation_token.is_some(),
            "Listed objects"
        );

        Ok(page)
    }

    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, SourceFault> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(source_fault)?;

        let body = response.body.collect().await.map_err(source_fault)?;

        Ok(body.into_bytes())
    }
}
