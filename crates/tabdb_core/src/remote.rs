//! Forwarding of storage operations to the leading context.
//!
//! A context that is not the leader for a database cannot touch the
//! backend. Its instances post a [`RemoteRequest`] on the database channel
//! and wait for the [`RemoteResponse`] of the leader's instance of the same
//! collection:
//!
//! ```text
//! follower                      channel                       leader
//!    │ ── {response:false, requestId:r1, ...} ──▶ │ ──▶ execute locally
//!    │ ◀── {response:true, requestId:r1, ...} ─── │ ◀── post result
//! ```
//!
//! If the leader dies before answering, the follower retries the whole
//! operation, which may now run locally if it won the next election.

use crate::error::{CoreError, CoreResult, RemoteErrorPayload};
use crate::types::WriteResult;
use crate::util::random_token;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tabdb_channel::{
    ChannelError, ChannelReceiver, ElectionState, Envelope, InternalMessage, LeaderElector,
    MessageKind,
};
use tabdb_storage::{Document, WriteRow};

/// A request posted by a follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    /// Always false.
    pub response: bool,
    /// Message type tag of the instance kind.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Operation name.
    pub operation: String,
    /// Positional operation arguments.
    pub params: Value,
    /// Correlation id.
    pub request_id: String,
    /// Target database.
    pub database_name: String,
    /// Target collection.
    pub collection_name: String,
}

/// The leader's answer to a [`RemoteRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResponse {
    /// Always true.
    pub response: bool,
    /// Message type tag copied from the request.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Correlation id copied from the request.
    pub request_id: String,
    /// Operation output, or a [`RemoteErrorPayload`] if `is_error`.
    pub result: Value,
    /// Whether the operation failed.
    pub is_error: bool,
    /// Database of the answering instance.
    pub database_name: String,
    /// Collection of the answering instance.
    pub collection_name: String,
}

/// Where a request is addressed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub(crate) message_type: &'a str,
    pub(crate) database_name: &'a str,
    pub(crate) collection_name: &'a str,
}

impl RemoteRequest {
    /// Returns true if this request is addressed to `target`.
    pub(crate) fn is_for(&self, target: &Target<'_>) -> bool {
        !self.response
            && self.message_type == target.message_type
            && self.database_name == target.database_name
            && self.collection_name == target.collection_name
    }

    /// Builds the response carrying `outcome`.
    pub(crate) fn answer(&self, outcome: CoreResult<CallOutput>) -> CoreResult<RemoteResponse> {
        let (result, is_error) = match outcome.and_then(|output| output.to_value()) {
            Ok(value) => (value, false),
            Err(e) => (serde_json::to_value(e.to_payload())?, true),
        };
        Ok(RemoteResponse {
            response: true,
            message_type: self.message_type.clone(),
            request_id: self.request_id.clone(),
            result,
            is_error,
            database_name: self.database_name.clone(),
            collection_name: self.collection_name.clone(),
        })
    }
}

/// A decoded channel message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RemoteMessage {
    Request(RemoteRequest),
    Response(RemoteResponse),
}

impl RemoteMessage {
    /// Decodes an application message. Foreign or malformed payloads yield
    /// `None`.
    pub(crate) fn decode(envelope: &Envelope) -> Option<Self> {
        if envelope.kind() != MessageKind::Message {
            return None;
        }
        let value: Value = envelope.decode().ok()?;
        let decoded = match value.get("response")?.as_bool()? {
            false => serde_json::from_value(value).map(Self::Request),
            true => serde_json::from_value(value).map(Self::Response),
        };
        match decoded {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed remote message");
                None
            }
        }
    }
}

/// Returns the token of a leader death signal.
pub(crate) fn leader_death_token(envelope: &Envelope) -> Option<String> {
    if envelope.kind() != MessageKind::Internal {
        return None;
    }
    envelope
        .decode::<InternalMessage>()
        .ok()
        .filter(InternalMessage::is_leader_death)
        .map(|message| message.token)
}

/// An operation that can run on the leader on behalf of a follower.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    /// `bulkWrite(rows)`.
    BulkWrite(Vec<WriteRow>),
    /// `findLocalDocumentsById(ids)`.
    FindLocalDocumentsById(Vec<String>),
    /// `remove()`: destroy the collection's stored data.
    Remove,
}

impl RemoteCall {
    /// Returns the wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCall::BulkWrite(_) => "bulkWrite",
            RemoteCall::FindLocalDocumentsById(_) => "findLocalDocumentsById",
            RemoteCall::Remove => "remove",
        }
    }

    /// Encodes the arguments as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if a document cannot be encoded.
    pub fn params(&self) -> CoreResult<Value> {
        Ok(match self {
            RemoteCall::BulkWrite(rows) => Value::Array(vec![serde_json::to_value(rows)?]),
            RemoteCall::FindLocalDocumentsById(ids) => {
                Value::Array(vec![serde_json::to_value(ids)?])
            }
            RemoteCall::Remove => Value::Array(Vec::new()),
        })
    }

    /// Decodes an operation received from the channel.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownOperation`] for an unknown name, or a
    /// serialization error for malformed arguments.
    pub fn from_wire(operation: &str, params: Value) -> CoreResult<Self> {
        let mut args = match params {
            Value::Array(args) => args.into_iter(),
            other => vec![other].into_iter(),
        };
        let mut first = || args.next().unwrap_or(Value::Null);
        match operation {
            "bulkWrite" => Ok(RemoteCall::BulkWrite(serde_json::from_value(first())?)),
            "findLocalDocumentsById" => Ok(RemoteCall::FindLocalDocumentsById(
                serde_json::from_value(first())?,
            )),
            "remove" => Ok(RemoteCall::Remove),
            other => Err(CoreError::unknown_operation(other)),
        }
    }
}

/// Output of a [`RemoteCall`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    /// Result of a bulk write.
    Written(WriteResult),
    /// Documents found by id.
    Found(BTreeMap<String, Document>),
    /// The collection's data was destroyed.
    Removed,
}

impl CallOutput {
    /// Encodes the output for a response.
    ///
    /// # Errors
    ///
    /// Returns an error if a document cannot be encoded.
    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(match self {
            CallOutput::Written(result) => serde_json::to_value(result)?,
            CallOutput::Found(docs) => serde_json::to_value(docs)?,
            CallOutput::Removed => Value::Null,
        })
    }

    /// Decodes the output of `call` from a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not have the shape `call`
    /// produces.
    pub fn from_value(call: &RemoteCall, value: Value) -> CoreResult<Self> {
        Ok(match call {
            RemoteCall::BulkWrite(_) => CallOutput::Written(serde_json::from_value(value)?),
            RemoteCall::FindLocalDocumentsById(_) => {
                CallOutput::Found(serde_json::from_value(value)?)
            }
            RemoteCall::Remove => CallOutput::Removed,
        })
    }
}

/// How a forwarded call ended.
#[derive(Debug)]
pub(crate) enum Forwarded {
    /// The leader answered.
    Answered(CallOutput),
    /// The leader went away, or this context now leads. The call must be
    /// retried from the top.
    LeaderGone,
}

/// Posts `call` to the leader and waits for its answer.
///
/// `inbox` must have been subscribed before the caller decided to forward,
/// so no death signal between that decision and the post is missed. Only a
/// death sequenced after the request ends the wait: a leader that died
/// earlier never saw the request, and the one elected after it will answer.
/// A lagging inbox may have lost the answer or a death, so the call is
/// retried.
pub(crate) async fn forward(
    elector: &LeaderElector,
    mut inbox: ChannelReceiver,
    target: Target<'_>,
    call: &RemoteCall,
    request_id_length: usize,
) -> CoreResult<Forwarded> {
    let mut state = elector.watch();
    if leads_or_closed(*state.borrow_and_update()) {
        return Ok(Forwarded::LeaderGone);
    }

    let request = RemoteRequest {
        response: false,
        message_type: target.message_type.to_string(),
        operation: call.name().to_string(),
        params: call.params()?,
        request_id: random_token(request_id_length),
        database_name: target.database_name.to_string(),
        collection_name: target.collection_name.to_string(),
    };
    let posted = elector.channel().post_message(&request)?;
    tracing::debug!(
        database = target.database_name,
        collection = target.collection_name,
        request_id = %request.request_id,
        sequence = posted,
        operation = call.name(),
        "forwarded request to leader"
    );

    loop {
        tokio::select! {
            envelope = inbox.recv() => {
                let envelope = match envelope {
                    Ok(envelope) => envelope,
                    Err(ChannelError::Lagged { .. }) => return Ok(Forwarded::LeaderGone),
                    Err(e) => return Err(e.into()),
                };
                if let Some(token) = leader_death_token(&envelope) {
                    if envelope.sequence() > posted {
                        tracing::debug!(request_id = %request.request_id, %token, "leader died during request");
                        return Ok(Forwarded::LeaderGone);
                    }
                    continue;
                }
                if let Some(RemoteMessage::Response(response)) = RemoteMessage::decode(&envelope) {
                    if response.request_id == request.request_id
                        && response.message_type == request.message_type
                    {
                        return decode_response(call, response).map(Forwarded::Answered);
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() || leads_or_closed(*state.borrow_and_update()) {
                    return Ok(Forwarded::LeaderGone);
                }
            }
        }
    }
}

fn leads_or_closed(state: ElectionState) -> bool {
    matches!(state, ElectionState::Leader | ElectionState::Closed)
}

fn decode_response(call: &RemoteCall, response: RemoteResponse) -> CoreResult<CallOutput> {
    if response.is_error {
        let payload: RemoteErrorPayload = serde_json::from_value(response.result)?;
        return Err(payload.into());
    }
    CallOutput::from_value(call, response.result)
}
