//! [`SnsApi`], [`SqsApi`] and [`StsApi`] over the AWS SDK.

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{MessageSystemAttributeName, QueueAttributeName},
};
use futures_util::future::BoxFuture;
use secrecy::ExposeSecret;

use super::{
    client::{SnsPublish, SqsSend},
    AwsClients, AwsEndpoint, SnsApi, SqsApi, StsApi,
};
use crate::{
    codec::{
        sqs::{AttributeValue, SqsEnvelope, SqsReceived},
        ID,
    },
    error::{Error, Result},
    pool::{CloseSignal, Connector},
    topology::Existence,
};

const MISSING_QUEUE: &[&str] = &["AWS.SimpleQueueService.NonExistentQueue", "QueueDoesNotExist"];
const MISSING_TOPIC: &[&str] = &["NotFound"];

/// Service error codes worth another attempt.
const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "RequestTimeout",
    "RequestTimeoutException",
    "RequestThrottled",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "AWS.SimpleQueueService.RequestThrottled",
];

/// Service error codes meaning the caller's credentials are wrong.
const CREDENTIAL_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthorizationError",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "IncompleteSignature",
    "MissingAuthenticationToken",
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidSecurity",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Transient,
    Credentials,
    Permanent,
}

fn refusal(code: Option<&str>) -> Refusal {
    match code {
        None => Refusal::Transient,
        Some(code) if CREDENTIAL_CODES.contains(&code) => Refusal::Credentials,
        Some(code) if TRANSIENT_CODES.contains(&code) || code.contains("Throttl") => {
            Refusal::Transient
        }
        Some(_) => Refusal::Permanent,
    }
}

/// Socket and timeout faults mean the service is unreachable. Service
/// errors split into throttling or server faults (retryable), credential
/// failures (configuration) and permanent refusals, which `refused` maps.
fn classify_with<E, R>(target: &str, e: SdkError<E, R>, refused: impl FnOnce(String) -> Error) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    let reason = DisplayErrorContext(&e).to_string();
    match &e {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            Error::unreachable(target, reason)
        }
        SdkError::ServiceError(_) => match refusal(e.code()) {
            Refusal::Transient => Error::channel_failure(target, reason),
            Refusal::Credentials => {
                Error::config(format!("credentials rejected by {target}: {reason}"))
            }
            Refusal::Permanent => refused(reason),
        },
        _ => Error::channel_failure(target, reason),
    }
}

fn classify<E, R>(target: &str, e: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    classify_with(target, e, |reason| {
        Error::internal(eyre::eyre!("{target} refused the request: {reason}"))
    })
}

/// As [`classify`], with permanent refusals reported against the message.
fn classify_publish<E, R>(target: &str, envelope: &SqsEnvelope, e: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    let message_id = envelope
        .attributes
        .get(ID)
        .map(AttributeValue::as_text)
        .unwrap_or_default();
    classify_with(target, e, |reason| Error::rejected(message_id, target, reason))
}

fn has_code<E: ProvideErrorMetadata, R>(e: &SdkError<E, R>, codes: &[&str]) -> bool {
    e.code().is_some_and(|code| codes.contains(&code))
}

fn seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

/// Opens SDK clients. Nothing is dialled until the first call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdkConnector;

impl Connector<AwsEndpoint, AwsClients> for SdkConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a AwsEndpoint,
        _on_close: CloseSignal,
    ) -> BoxFuture<'a, Result<Arc<AwsClients>>> {
        Box::pin(async move {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(endpoint.region().to_owned()));
            if let Some(url) = endpoint.endpoint_url() {
                loader = loader.endpoint_url(url.as_str().trim_end_matches('/'));
            }
            if let Some(profile) = endpoint.profile() {
                loader = loader.profile_name(profile);
            }
            if let Some((access_key_id, secret)) = endpoint.credentials() {
                loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
                    access_key_id,
                    secret.expose_secret(),
                    None,
                    None,
                    "switchyard",
                ));
            }
            let config = loader.load().await;

            tracing::debug!(region = endpoint.region(), "Created AWS clients");
            Ok(Arc::new(AwsClients::new(
                endpoint.region(),
                Arc::new(SdkSns {
                    client: aws_sdk_sns::Client::new(&config),
                }),
                Arc::new(SdkSqs {
                    client: aws_sdk_sqs::Client::new(&config),
                }),
                Arc::new(SdkSts {
                    client: aws_sdk_sts::Client::new(&config),
                }),
            )))
        })
    }
}

pub struct SdkSns {
    client: aws_sdk_sns::Client,
}

fn sns_attributes(
    envelope: &SqsEnvelope,
) -> Result<HashMap<String, aws_sdk_sns::types::MessageAttributeValue>> {
    envelope
        .attributes
        .iter()
        .map(|(name, value)| {
            let builder =
                aws_sdk_sns::types::MessageAttributeValue::builder().data_type(value.data_type());
            let builder = match value {
                AttributeValue::Binary { binary_value } => builder
                    .binary_value(aws_sdk_sns::primitives::Blob::new(binary_value.clone())),
                other => builder.string_value(other.as_text()),
            };
            builder
                .build()
                .map(|attribute| (name.clone(), attribute))
                .map_err(Error::internal)
        })
        .collect()
}

impl SnsApi for SdkSns {
    fn create_topic<'a>(
        &'a self,
        name: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.client
                .create_topic()
                .name(name)
                .set_attributes(Some(attributes))
                .send()
                .await
                .map_err(|e| classify(name, e))?
                .topic_arn
                .ok_or_else(|| Error::channel_failure(name, "CreateTopic returned no ARN"))
        })
    }

    fn topic_exists<'a>(&'a self, arn: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            match self.client.get_topic_attributes().topic_arn(arn).send().await {
                Ok(_) => Ok(Existence::Found(arn.to_owned())),
                Err(e) if has_code(&e, MISSING_TOPIC) => Ok(Existence::NotFound),
                Err(e) => Err(classify(arn, e)),
            }
        })
    }

    fn find_topic<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            let mut next_token = None;
            loop {
                let page = self
                    .client
                    .list_topics()
                    .set_next_token(next_token)
                    .send()
                    .await
                    .map_err(|e| classify(name, e))?;

                let found = page
                    .topics()
                    .iter()
                    .filter_map(|topic| topic.topic_arn())
                    .find(|arn| crate::codec::sqs::topic_from_arn(arn) == Some(name));
                if let Some(arn) = found {
                    return Ok(Existence::Found(arn.to_owned()));
                }

                match page.next_token() {
                    Some(token) => next_token = Some(token.to_owned()),
                    None => return Ok(Existence::NotFound),
                }
            }
        })
    }

    fn publish(&self, request: SnsPublish) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let attributes = sns_attributes(&request.envelope)?;
            let published = self
                .client
                .publish()
                .topic_arn(&request.topic_arn)
                .message(request.envelope.body.clone())
                .set_message_attributes(Some(attributes))
                .set_subject(request.subject)
                .set_message_group_id(request.group_id)
                .set_message_deduplication_id(request.deduplication_id)
                .send()
                .await;

            match published {
                Ok(output) => output.message_id.ok_or_else(|| {
                    Error::channel_failure(&request.topic_arn, "Publish returned no id")
                }),
                Err(e) if has_code(&e, MISSING_TOPIC) => Err(Error::unreachable(
                    &request.topic_arn,
                    "topic does not exist",
                )),
                Err(e) => Err(classify_publish(&request.topic_arn, &request.envelope, e)),
            }
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic_arn: &'a str,
        queue_arn: &'a str,
        raw_delivery: bool,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.client
                .subscribe()
                .topic_arn(topic_arn)
                .protocol("sqs")
                .endpoint(queue_arn)
                .attributes("RawMessageDelivery", raw_delivery.to_string())
                .return_subscription_arn(true)
                .send()
                .await
                .map_err(|e| classify(topic_arn, e))?
                .subscription_arn
                .ok_or_else(|| Error::channel_failure(topic_arn, "Subscribe returned no ARN"))
        })
    }

    fn subscription_exists<'a>(
        &'a self,
        topic_arn: &'a str,
        queue_arn: &'a str,
    ) -> BoxFuture<'a, Result<Existence<()>>> {
        Box::pin(async move {
            let mut next_token = None;
            loop {
                let page = match self
                    .client
                    .list_subscriptions_by_topic()
                    .topic_arn(topic_arn)
                    .set_next_token(next_token)
                    .send()
                    .await
                {
                    Ok(page) => page,
                    Err(e) if has_code(&e, MISSING_TOPIC) => return Ok(Existence::NotFound),
                    Err(e) => return Err(classify(topic_arn, e)),
                };

                if page
                    .subscriptions()
                    .iter()
                    .any(|subscription| subscription.endpoint() == Some(queue_arn))
                {
                    return Ok(Existence::Found(()));
                }

                match page.next_token() {
                    Some(token) => next_token = Some(token.to_owned()),
                    None => return Ok(Existence::NotFound),
                }
            }
        })
    }
}

pub struct SdkSqs {
    client: aws_sdk_sqs::Client,
}

fn sqs_attributes(
    envelope: &SqsEnvelope,
) -> Result<HashMap<String, aws_sdk_sqs::types::MessageAttributeValue>> {
    envelope
        .attributes
        .iter()
        .map(|(name, value)| {
            let builder =
                aws_sdk_sqs::types::MessageAttributeValue::builder().data_type(value.data_type());
            let builder = match value {
                AttributeValue::Binary { binary_value } => builder
                    .binary_value(aws_sdk_sqs::primitives::Blob::new(binary_value.clone())),
                other => builder.string_value(other.as_text()),
            };
            builder
                .build()
                .map(|attribute| (name.clone(), attribute))
                .map_err(Error::internal)
        })
        .collect()
}

fn from_sqs_attribute(value: &aws_sdk_sqs::types::MessageAttributeValue) -> AttributeValue {
    let text = || value.string_value().unwrap_or_default().to_owned();
    if value.data_type().starts_with("Binary") {
        AttributeValue::Binary {
            binary_value: value
                .binary_value()
                .map(|blob| blob.as_ref().to_vec())
                .unwrap_or_default(),
        }
    } else if value.data_type().starts_with("Number") {
        AttributeValue::Number {
            string_value: text(),
        }
    } else {
        AttributeValue::String {
            string_value: text(),
        }
    }
}

impl SqsApi for SdkSqs {
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let attributes = attributes
                .into_iter()
                .map(|(key, value)| (QueueAttributeName::from(key.as_str()), value))
                .collect();
            self.client
                .create_queue()
                .queue_name(name)
                .set_attributes(Some(attributes))
                .send()
                .await
                .map_err(|e| classify(name, e))?
                .queue_url
                .ok_or_else(|| Error::channel_failure(name, "CreateQueue returned no URL"))
        })
    }

    fn queue_url<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            match self.client.get_queue_url().queue_name(name).send().await {
                Ok(output) => Ok(output.queue_url.into()),
                Err(e) if has_code(&e, MISSING_QUEUE) => Ok(Existence::NotFound),
                Err(e) => Err(classify(name, e)),
            }
        })
    }

    fn queue_arn<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            match self
                .client
                .get_queue_attributes()
                .queue_url(url)
                .attribute_names(QueueAttributeName::QueueArn)
                .send()
                .await
            {
                Ok(output) => Ok(output
                    .attributes()
                    .and_then(|attributes| attributes.get(&QueueAttributeName::QueueArn))
                    .cloned()
                    .into()),
                Err(e) if has_code(&e, MISSING_QUEUE) => Ok(Existence::NotFound),
                Err(e) => Err(classify(url, e)),
            }
        })
    }

    fn set_queue_attributes<'a>(
        &'a self,
        url: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let attributes = attributes
                .into_iter()
                .map(|(key, value)| (QueueAttributeName::from(key.as_str()), value))
                .collect();
            self.client
                .set_queue_attributes()
                .queue_url(url)
                .set_attributes(Some(attributes))
                .send()
                .await
                .map_err(|e| classify(url, e))?;
            Ok(())
        })
    }

    fn send(&self, request: SqsSend) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let attributes = sqs_attributes(&request.envelope)?;
            let mut send = self
                .client
                .send_message()
                .queue_url(&request.queue_url)
                .message_body(request.envelope.body.clone())
                .set_message_attributes(Some(attributes))
                .set_message_group_id(request.group_id)
                .set_message_deduplication_id(request.deduplication_id);
            if !request.delay.is_zero() {
                send = send.delay_seconds(seconds(request.delay));
            }

            match send.send().await {
                Ok(output) => output.message_id.ok_or_else(|| {
                    Error::channel_failure(&request.queue_url, "SendMessage returned no id")
                }),
                Err(e) if has_code(&e, MISSING_QUEUE) => Err(Error::unreachable(
                    &request.queue_url,
                    "queue does not exist",
                )),
                Err(e) => Err(classify_publish(&request.queue_url, &request.envelope, e)),
            }
        })
    }

    fn receive<'a>(
        &'a self,
        url: &'a str,
        max_messages: i32,
        wait: Duration,
    ) -> BoxFuture<'a, Result<Existence<Vec<SqsReceived>>>> {
        Box::pin(async move {
            let output = match self
                .client
                .receive_message()
                .queue_url(url)
                .max_number_of_messages(max_messages)
                .wait_time_seconds(seconds(wait))
                .message_attribute_names("All")
                .message_system_attribute_names(MessageSystemAttributeName::All)
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) if has_code(&e, MISSING_QUEUE) => return Ok(Existence::NotFound),
                Err(e) => return Err(classify(url, e)),
            };

            let received = output
                .messages()
                .iter()
                .map(|message| SqsReceived {
                    message_id: message.message_id().unwrap_or_default().to_owned(),
                    receipt_handle: message.receipt_handle().unwrap_or_default().to_owned(),
                    body: message.body().unwrap_or_default().to_owned(),
                    md5_of_body: message.md5_of_body().map(str::to_owned),
                    attributes: message
                        .message_attributes()
                        .map(|attributes| {
                            attributes
                                .iter()
                                .map(|(name, value)| (name.clone(), from_sqs_attribute(value)))
                                .collect()
                        })
                        .unwrap_or_default(),
                    system_attributes: message
                        .attributes()
                        .map(|attributes| {
                            attributes
                                .iter()
                                .map(|(name, value)| (name.as_str().to_owned(), value.clone()))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect();

            Ok(Existence::Found(received))
        })
    }

    fn delete<'a>(&'a self, url: &'a str, receipt_handle: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.client
                .delete_message()
                .queue_url(url)
                .receipt_handle(receipt_handle)
                .send()
                .await
                .map_err(|e| classify(url, e))?;
            Ok(())
        })
    }

    fn change_visibility<'a>(
        &'a self,
        url: &'a str,
        receipt_handle: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.client
                .change_message_visibility()
                .queue_url(url)
                .receipt_handle(receipt_handle)
                .visibility_timeout(seconds(timeout))
                .send()
                .await
                .map_err(|e| classify(url, e))?;
            Ok(())
        })
    }

    fn purge<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Existence<()>>> {
        Box::pin(async move {
            match self.client.purge_queue().queue_url(url).send().await {
                Ok(_) => Ok(Existence::Found(())),
                Err(e) if has_code(&e, MISSING_QUEUE) => Ok(Existence::NotFound),
                Err(e) => Err(classify(url, e)),
            }
        })
    }
}

pub struct SdkSts {
    client: aws_sdk_sts::Client,
}

impl StsApi for SdkSts {
    fn account_id(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.client
                .get_caller_identity()
                .send()
                .await
                .map_err(|e| classify("sts", e))?
                .account
                .ok_or_else(|| Error::channel_failure("sts", "GetCallerIdentity returned no account"))
        })
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_sqs::{error::ErrorMetadata, operation::send_message::SendMessageError};

    use super::*;
    use crate::codec::sqs::SqsEnvelope;

    fn service_error(code: &str) -> SdkError<SendMessageError, ()> {
        SdkError::service_error(
            SendMessageError::generic(ErrorMetadata::builder().code(code).message("no").build()),
            (),
        )
    }

    fn envelope() -> SqsEnvelope {
        SqsEnvelope {
            body: "{}".to_owned(),
            attributes: [(ID.to_owned(), AttributeValue::string("m-1"))].into(),
        }
    }

    #[test]
    fn test_throttling_and_server_faults_are_retryable() {
        for code in ["ThrottlingException", "KMS.ThrottlingException", "InternalError"] {
            let err = classify("orders", service_error(code));
            assert!(matches!(err, Error::ChannelFailure { .. }), "{code}: {err}");
            assert!(err.is_transient());
        }
    }

    #[test]
    fn test_credential_failures_are_configuration() {
        for code in ["AccessDenied", "InvalidClientTokenId", "ExpiredToken"] {
            let err = classify("orders", service_error(code));
            assert!(matches!(err, Error::Configuration { .. }), "{code}: {err}");
        }
    }

    #[test]
    fn test_refused_send_is_rejected_not_retried() {
        let err = classify_publish("orders", &envelope(), service_error("InvalidParameterValue"));
        match &err {
            Error::PublishRejected { message_id, target, .. } => {
                assert_eq!(message_id, "m-1");
                assert_eq!(target, "orders");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_transient());
    }

    #[test]
    fn test_refused_request_is_not_retried() {
        let err = classify("orders", service_error("KMS.DisabledException"));
        assert!(matches!(err, Error::Whatever { .. }), "{err}");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_is_unreachable() {
        let err = classify(
            "orders",
            SdkError::<SendMessageError, ()>::timeout_error("timed out"),
        );
        assert!(err.is_unreachable());
    }
}
