//! Defines the queue client: the trait the poll loops depend on, and
//! its SQS implementation.

use crate::conf::Settings;
use crate::error::{AckError, QueueError};
use crate::event::{MessageAttribute, RawMessage};
use async_trait::async_trait;
use aws_config::from_env;
use aws_sdk_sqs::config::{Credentials, Region};
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{Message, MessageAttributeValue, QueueAttributeName};
use aws_sdk_sqs::Client;
use std::env;
use std::fmt::Debug;
use tracing::debug;

/// Error codes reported for a queue that doesn't exist, depending on
/// the wire protocol spoken by the endpoint.
const NON_EXISTENT_QUEUE_CODES: [&str; 2] =
    ["AWS.SimpleQueueService.NonExistentQueue", "QueueDoesNotExist"];

/// Error code reported when deleting with a stale receipt handle.
const INVALID_RECEIPT_HANDLE_CODE: &str = "ReceiptHandleIsInvalid";

/// A resolved queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRef {
    pub name: String,
    pub url: String,
}

/// The queue operations needed by the poll loops. Implementations
/// carry no per-call state, so a single instance is shared by every
/// loop.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Check that the queue service answers at all.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Find the queue with the given name.
    async fn resolve_queue_ref(&self, queue_name: &str) -> Result<QueueRef, QueueError>;

    /// Receive up to `max_messages` messages, waiting at most
    /// `wait_seconds` for any to arrive. Returns an empty vector when
    /// the wait elapses.
    async fn receive(
        &self,
        queue: &QueueRef,
        max_messages: i32,
        wait_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<RawMessage>, QueueError>;

    /// Delete a single message. Deleting an expired or already deleted
    /// receipt handle counts as success.
    async fn acknowledge(&self, queue: &QueueRef, receipt_handle: &str) -> Result<(), AckError>;
}

/// The queue client backed by the AWS SDK.
pub struct SqsQueueClient {
    client: Client,
}

impl SqsQueueClient {
    pub fn new(client: Client) -> Self {
        SqsQueueClient { client }
    }

    /// Build a client for the configured endpoint and region. Static
    /// local credentials are used when the environment doesn't
    /// provide any.
    pub async fn from_settings(settings: &Settings) -> Self {
        let mut loader = from_env()
            .endpoint_url(endpoint_url(&settings.sqs_endpoint))
            .region(Region::new(settings.aws_region.clone()));
        if env::var("AWS_ACCESS_KEY_ID").is_err() {
            loader = loader.credentials_provider(Credentials::new(
                "local", "local", None, None, "static",
            ));
        }
        let config = loader.load().await;
        SqsQueueClient::new(Client::new(&config))
    }
}

/// Add a scheme to bare `host:port` endpoints.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        String::from(endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}

/// Get the service error code, if the error came from the service.
fn error_code<E, R>(err: &SdkError<E, R>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(context) => context.err().code(),
        _ => None,
    }
}

/// Map an SDK error to the queue error taxonomy.
fn classify<E, R>(queue_name: &str, err: SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata + Debug,
    R: Debug,
{
    match error_code(&err) {
        Some(code) if NON_EXISTENT_QUEUE_CODES.contains(&code) => {
            QueueError::NotFound(String::from(queue_name))
        }
        _ => QueueError::Transient(format!("{:?}", err)),
    }
}

/// Settle a failed delete: stale receipt handles mean the message is
/// already gone.
fn delete_failed<E, R>(receipt_handle: &str, err: SdkError<E, R>) -> Result<(), AckError>
where
    E: ProvideErrorMetadata + Debug,
    R: Debug,
{
    if error_code(&err) == Some(INVALID_RECEIPT_HANDLE_CODE) {
        debug!(
            "Receipt handle {:?} is no longer valid; treating as deleted",
            receipt_handle
        );
        return Ok(());
    }
    Err(AckError {
        receipt_handle: String::from(receipt_handle),
        reason: format!("{:?}", err),
    })
}

/// Convert an SDK message attribute.
fn convert_attribute(value: &MessageAttributeValue) -> MessageAttribute {
    MessageAttribute {
        data_type: value.data_type().unwrap_or_default().to_string(),
        string_value: value.string_value().map(String::from),
        binary_value: value.binary_value().map(|blob| blob.as_ref().to_vec()),
        string_list_values: value.string_list_values().unwrap_or_default().to_vec(),
        binary_list_values: value
            .binary_list_values()
            .unwrap_or_default()
            .iter()
            .map(|blob| blob.as_ref().to_vec())
            .collect(),
    }
}

/// Convert an SDK message.
fn convert_message(message: &Message) -> RawMessage {
    RawMessage {
        id: message.message_id().unwrap_or_default().to_string(),
        receipt_handle: message.receipt_handle().unwrap_or_default().to_string(),
        body: message.body().unwrap_or_default().to_string(),
        md5_of_body: message.md5_of_body().unwrap_or_default().to_string(),
        attributes: message
            .attributes()
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                    .collect()
            })
            .unwrap_or_default(),
        message_attributes: message
            .message_attributes()
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), convert_attribute(v)))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn ping(&self) -> Result<(), QueueError> {
        self.client
            .list_queues()
            .send()
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Transient(format!("{:?}", e)))
    }

    async fn resolve_queue_ref(&self, queue_name: &str) -> Result<QueueRef, QueueError> {
        let response = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| classify(queue_name, e))?;
        let url = response
            .queue_url()
            .ok_or_else(|| QueueError::NotFound(String::from(queue_name)))?;
        Ok(QueueRef {
            name: String::from(queue_name),
            url: String::from(url),
        })
    }

    async fn receive(
        &self,
        queue: &QueueRef,
        max_messages: i32,
        wait_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&queue.url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .visibility_timeout(visibility_timeout)
            .attribute_names(QueueAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| classify(&queue.name, e))?;
        Ok(response
            .messages()
            .unwrap_or_default()
            .iter()
            .map(convert_message)
            .collect())
    }

    async fn acknowledge(&self, queue: &QueueRef, receipt_handle: &str) -> Result<(), AckError> {
        match self
            .client
            .delete_message()
            .queue_url(&queue.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => delete_failed(receipt_handle, e),
        }
    }
}
