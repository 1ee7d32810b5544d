use crate::{inventory, CloudProvider, ProviderResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::config::http::HttpResponse;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::primitives::DateTimeFormat;
use aws_sdk_ec2::types::{Filter, Instance, InstanceType};
use aws_sdk_ec2::Client as Ec2Client;
use fleet_common::{InstanceTemplate, ProviderError};

/// Service error codes EC2 uses for conditions worth retrying.
const RETRYABLE_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "ServiceUnavailable",
    "Unavailable",
    "InternalError",
    "InternalFailure",
];

/// EC2 binding on the AWS SDK.
pub struct AwsProvider {
    ec2_client: Ec2Client,
}

impl AwsProvider {
    /// Load credentials and region from the environment (`AWS_*`, profile, IMDS).
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let config = loader.load().await;
        Self {
            ec2_client: Ec2Client::new(&config),
        }
    }

    pub fn with_client(ec2_client: Ec2Client) -> Self {
        Self { ec2_client }
    }
}

fn classify_code(code: Option<&str>, detail: String) -> ProviderError {
    match code {
        Some(code) if RETRYABLE_CODES.contains(&code) => ProviderError::Transient(detail),
        _ => ProviderError::Rejected(detail),
    }
}

/// Timeouts and transport failures are retryable, as are throttling codes.
/// Anything the service answered with another code is a refusal.
fn classify<E>(op: &str, err: SdkError<E, HttpResponse>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{}: {}", op, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ProviderError::Transient(detail)
        }
        SdkError::ServiceError(_) => classify_code(err.code(), detail),
        _ => ProviderError::Rejected(detail),
    }
}

fn discovered(inst: &Instance) -> Option<inventory::DiscoveredInstance> {
    let provider_id = inst.instance_id()?;
    let status = inst.state().and_then(|s| s.name())?;
    Some(inventory::DiscoveredInstance {
        provider_id: provider_id.to_string(),
        status: status.as_str().to_string(),
        ip_address: inst.public_ip_address().map(str::to_string),
        launched_at: inst
            .launch_time()
            .and_then(|t| t.fmt(DateTimeFormat::DateTime).ok()),
    })
}

#[async_trait]
impl CloudProvider for AwsProvider {
    async fn launch(
        &self,
        template: &InstanceTemplate,
        count: usize,
        client_token: &str,
    ) -> ProviderResult<Vec<String>> {
        if count == 0 {
            return Ok(vec![]);
        }
        let count = i32::try_from(count)
            .map_err(|_| ProviderError::Rejected(format!("cannot launch {} instances at once", count)))?;
        // Same token on a retry: EC2 returns the original reservation instead of launching again.
        let out = self
            .ec2_client
            .run_instances()
            .image_id(&template.image_id)
            .instance_type(InstanceType::from(template.instance_type.as_str()))
            .key_name(&template.key_name)
            .security_groups(&template.security_group)
            .min_count(count)
            .max_count(count)
            .client_token(client_token)
            .send()
            .await
            .map_err(|e| classify("run-instances", e))?;

        let ids: Vec<String> = out
            .instances()
            .iter()
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect();
        tracing::info!(count = ids.len(), image_id = %template.image_id, client_token, "aws run-instances accepted");
        Ok(ids)
    }

    async fn describe(&self, ids: &[String]) -> ProviderResult<Vec<inventory::DiscoveredInstance>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            // A filter (unlike InstanceIds) tolerates ids the provider has already forgotten.
            let page = self
                .ec2_client
                .describe_instances()
                .filters(
                    Filter::builder()
                        .name("instance-id")
                        .set_values(Some(ids.to_vec()))
                        .build(),
                )
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify("describe-instances", e))?;

            for reservation in page.reservations() {
                out.extend(reservation.instances().iter().filter_map(discovered));
            }
            match page.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(out)
    }

    async fn stop_instances(&self, ids: &[String]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.ec2_client
            .stop_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify("stop-instances", e))?;
        tracing::info!(count = ids.len(), "aws stop accepted");
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.ec2_client
            .start_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify("start-instances", e))?;
        tracing::info!(count = ids.len(), "aws start accepted");
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.ec2_client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify("terminate-instances", e))?;
        tracing::info!(count = ids.len(), "aws terminate accepted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "aws"
    }
}
