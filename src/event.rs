//! Defines the messages received from a queue and the batch event
//! handed to the function. The event follows the shape of a native
//! SQS-triggered Lambda event, so handlers written for the real
//! service run unchanged.

use crate::client::QueueRef;
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The account used in source ARNs when the queue URL doesn't carry
/// one. Matches LocalStack's default account.
const DEFAULT_ACCOUNT: &str = "000000000000";

/// A structured message attribute, as delivered by the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageAttribute {
    pub data_type: String,
    pub string_value: Option<String>,
    pub binary_value: Option<Vec<u8>>,
    pub string_list_values: Vec<String>,
    pub binary_list_values: Vec<Vec<u8>>,
}

/// A single message as received from the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub receipt_handle: String,
    pub body: String,
    pub md5_of_body: String,
    pub attributes: BTreeMap<String, String>,
    pub message_attributes: BTreeMap<String, MessageAttribute>,
}

/// A message attribute as rendered into the event. Binary values are
/// base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordAttribute {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_value: Option<String>,
    #[serde(default)]
    pub string_list_values: Vec<String>,
    #[serde(default)]
    pub binary_list_values: Vec<String>,
    pub data_type: String,
}

impl From<MessageAttribute> for RecordAttribute {
    fn from(attribute: MessageAttribute) -> Self {
        RecordAttribute {
            string_value: attribute.string_value,
            binary_value: attribute
                .binary_value
                .map(|bytes| Base64::encode_string(&bytes)),
            string_list_values: attribute.string_list_values,
            binary_list_values: attribute
                .binary_list_values
                .iter()
                .map(|bytes| Base64::encode_string(bytes))
                .collect(),
            data_type: attribute.data_type,
        }
    }
}

/// One record of the invocation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
    pub message_attributes: BTreeMap<String, RecordAttribute>,
    pub md5_of_body: String,
    pub event_source: String,
    #[serde(rename = "eventSourceARN")]
    pub event_source_arn: String,
    pub aws_region: String,
}

/// The batch event given to the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEvent {
    #[serde(rename = "Records")]
    pub records: Vec<Record>,
}

impl InvocationEvent {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The fields shared by every record coming from the same queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub event_source: String,
    pub event_source_arn: String,
    pub aws_region: String,
}

impl EventContext {
    /// Build the context for records coming from `queue`.
    pub fn for_queue(queue: &QueueRef, region: &str, event_source: &str) -> Self {
        EventContext {
            event_source: String::from(event_source),
            event_source_arn: format!(
                "arn:aws:sqs:{}:{}:{}",
                region,
                account_from_url(&queue.url).unwrap_or(DEFAULT_ACCOUNT),
                queue.name
            ),
            aws_region: String::from(region),
        }
    }
}

/// Extract the account id from a queue URL of the form
/// `scheme://host/account/name`.
fn account_from_url(url: &str) -> Option<&str> {
    let path = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let mut segments = path.split('/').skip(1).filter(|s| !s.is_empty());
    let account = segments.next()?;
    segments.next()?;
    Some(account)
}

/// Build the invocation event from a batch of received messages,
/// keeping their order. Takes ownership of the messages: the records
/// carry everything needed afterwards to acknowledge them.
pub fn translate(messages: Vec<RawMessage>, context: &EventContext) -> InvocationEvent {
    InvocationEvent {
        records: messages
            .into_iter()
            .map(|message| Record {
                message_id: message.id,
                receipt_handle: message.receipt_handle,
                body: message.body,
                attributes: message.attributes,
                message_attributes: message
                    .message_attributes
                    .into_iter()
                    .map(|(key, value)| (key, RecordAttribute::from(value)))
                    .collect(),
                md5_of_body: message.md5_of_body,
                event_source: context.event_source.clone(),
                event_source_arn: context.event_source_arn.clone(),
                aws_region: context.aws_region.clone(),
            })
            .collect(),
    }
}
