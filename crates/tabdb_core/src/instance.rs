//! Storage instances.

use crate::change_feed::{ChangeFeed, ChangeStream};
use crate::config::{InstanceKind, InstanceParams};
use crate::crypter::Crypter;
use crate::error::{CoreError, CoreResult};
use crate::registry::{ElectorRegistry, OpenInstances};
use crate::remote::{self, CallOutput, Forwarded, RemoteCall, RemoteMessage, RemoteRequest, Target};
use crate::types::{event_key, ChangeEvent, EventBulk, StorageChangeEvent, WriteResult};
use crate::util::{now_millis, random_token};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tabdb_channel::{ChannelReceiver, LeaderElector};
use tabdb_storage::{BackendFactory, BackendParams, Document, StorageBackend, WriteRow};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Where an operation has to run.
#[derive(Clone)]
pub enum Route {
    /// This context leads: use the local backend connection.
    Local(Arc<dyn StorageBackend>),
    /// Another context leads: forward the operation.
    Remote,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Local(_) => f.write_str("Local"),
            Route::Remote => f.write_str("Remote"),
        }
    }
}

impl Route {
    /// Returns true for [`Route::Local`].
    pub fn is_local(&self) -> bool {
        matches!(self, Route::Local(_))
    }
}

/// Everything an instance needs from the [`Storage`](crate::Storage) that
/// created it.
pub(crate) struct InstanceContext {
    pub(crate) factory: Arc<dyn BackendFactory>,
    pub(crate) electors: Arc<ElectorRegistry>,
    pub(crate) open_instances: Arc<OpenInstances>,
    pub(crate) crypter: Crypter,
    pub(crate) multi_instance: bool,
    pub(crate) request_id_length: usize,
    pub(crate) event_bulk_id_length: usize,
    pub(crate) change_buffer: usize,
}

struct InstanceInner {
    params: InstanceParams,
    backend_params: BackendParams,
    factory: Arc<dyn BackendFactory>,
    electors: Arc<ElectorRegistry>,
    open_instances: Arc<OpenInstances>,
    crypter: Crypter,
    request_id_length: usize,
    event_bulk_id_length: usize,
    instance_id: u64,
    elector: Option<Arc<LeaderElector>>,
    local: Mutex<Option<Arc<dyn StorageBackend>>>,
    closed: AtomicBool,
    feed: ChangeFeed,
    handler: Mutex<Option<JoinHandle<()>>>,
    handler_shutdown: watch::Sender<bool>,
}

/// One open collection (or key/value namespace) of a database.
///
/// All instances of one database name in one context share a leader
/// elector. Operations run against the local backend when this context
/// leads, and are forwarded to the leader otherwise. Cloning is cheap;
/// clones are the same instance.
///
/// # Lifecycle
///
/// ```text
/// create ──▶ open ──(close | remove)──▶ closed
/// ```
///
/// After [`close`](Self::close) every operation fails with
/// [`CoreError::InstanceClosed`]. Closing never destroys stored data;
/// [`remove`](Self::remove) does.
#[derive(Clone)]
pub struct StorageInstance {
    inner: Arc<InstanceInner>,
}

impl fmt::Debug for StorageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageInstance")
            .field("database", &self.inner.params.database_name)
            .field("collection", &self.inner.params.collection_name)
            .field("kind", &self.inner.params.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StorageInstance {
    /// Creates an instance and starts its request handler.
    pub(crate) fn create(params: InstanceParams, context: InstanceContext) -> CoreResult<Self> {
        let elector = context
            .multi_instance
            .then(|| context.electors.acquire(&params.database_name));
        let (handler_shutdown, shutdown_rx) = watch::channel(false);
        let backend_params = BackendParams::new(
            params.database_name.clone(),
            params.collection_name.clone(),
            params.primary_path.clone(),
        );

        let inner = Arc::new(InstanceInner {
            backend_params,
            factory: context.factory,
            electors: context.electors,
            instance_id: context.open_instances.insert(),
            open_instances: context.open_instances,
            crypter: context.crypter,
            request_id_length: context.request_id_length,
            event_bulk_id_length: context.event_bulk_id_length,
            elector,
            local: Mutex::new(None),
            closed: AtomicBool::new(false),
            feed: ChangeFeed::new(context.change_buffer),
            handler: Mutex::new(None),
            handler_shutdown,
            params,
        });

        match &inner.elector {
            Some(elector) => {
                let inbox = elector.channel().subscribe();
                let task = tokio::spawn(serve_instance(
                    Arc::downgrade(&inner),
                    inbox,
                    elector.watch(),
                    shutdown_rx,
                ));
                *inner.handler.lock() = Some(task);
            }
            None => {
                // single-instance mode owns its backend from the start
                if let Err(e) = inner.open_local() {
                    inner.closed.store(true, Ordering::Release);
                    inner.open_instances.remove(inner.instance_id);
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            database = %inner.params.database_name,
            collection = %inner.params.collection_name,
            kind = ?inner.params.kind,
            "created storage instance"
        );
        Ok(Self { inner })
    }

    /// Returns the instance parameters.
    pub fn params(&self) -> &InstanceParams {
        &self.inner.params
    }

    /// Returns the database name.
    pub fn database_name(&self) -> &str {
        &self.inner.params.database_name
    }

    /// Returns the collection name.
    pub fn collection_name(&self) -> &str {
        &self.inner.params.collection_name
    }

    /// Returns what this instance stores.
    pub fn kind(&self) -> InstanceKind {
        self.inner.params.kind
    }

    /// Returns the shared elector, `None` in single-instance mode.
    pub fn elector(&self) -> Option<&LeaderElector> {
        self.inner.elector.as_deref()
    }

    /// Returns true if this context leads the database. Always true in
    /// single-instance mode.
    pub fn is_leader(&self) -> bool {
        self.inner.elector.as_ref().map_or(true, |e| e.is_leader())
    }

    /// Returns true once [`close`](Self::close) or [`remove`](Self::remove)
    /// was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Returns true if this instance currently holds a backend connection.
    pub fn has_local_state(&self) -> bool {
        self.inner.local.lock().is_some()
    }

    /// Decides where operations have to run, opening the local backend if
    /// this context leads.
    ///
    /// Returns `None` for a closed instance; a closed instance never opens
    /// a connection. Otherwise waits until some context leads.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend connection cannot be opened.
    pub async fn must_use_local_state(&self) -> CoreResult<Option<Route>> {
        self.inner.must_use_local_state().await
    }

    /// Writes `rows` and publishes the resulting change events.
    ///
    /// Revision conflicts are reported per row in [`WriteResult::error`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Structural`] for an empty batch, a row without
    /// primary key or a primary key used twice, [`CoreError::InstanceClosed`]
    /// after close, [`CoreError::RemoteDispatch`] if the leader failed, or a
    /// storage error.
    pub async fn bulk_write(&self, rows: Vec<WriteRow>) -> CoreResult<WriteResult> {
        self.inner.ensure_open()?;
        validate_rows(&rows, &self.inner.params.primary_path)?;

        let crypter = &self.inner.crypter;
        let rows = rows
            .into_iter()
            .map(|row| {
                Ok(WriteRow {
                    document: crypter.encrypt(row.document)?,
                    previous: row.previous.map(|p| crypter.encrypt(p)).transpose()?,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let result = match self.inner.execute(RemoteCall::BulkWrite(rows)).await? {
            CallOutput::Written(result) => result,
            other => return Err(unexpected_output("bulkWrite", &other)),
        };
        self.inner.decrypt_result(result)
    }

    /// Reads documents by primary key. Missing and deleted documents are
    /// absent from the result.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InstanceClosed`] after close,
    /// [`CoreError::RemoteDispatch`] if the leader failed, or a storage
    /// error.
    pub async fn find_local_documents_by_id(
        &self,
        ids: &[String],
    ) -> CoreResult<BTreeMap<String, Document>> {
        self.inner.ensure_open()?;
        let call = RemoteCall::FindLocalDocumentsById(ids.to_vec());
        let found = match self.inner.execute(call).await? {
            CallOutput::Found(found) => found,
            other => return Err(unexpected_output("findLocalDocumentsById", &other)),
        };
        found
            .into_iter()
            .map(|(id, doc)| Ok((id, self.inner.crypter.decrypt(doc)?)))
            .collect()
    }

    /// Subscribes to the change events of writes executed by this
    /// instance.
    ///
    /// Bulks are published by the instance that runs the write, which is
    /// the leader's instance for forwarded writes.
    pub fn change_stream(&self) -> ChangeStream {
        self.inner.feed.subscribe()
    }

    /// Closes the instance. Stored data is kept. Closing twice is a no-op.
    ///
    /// An in-flight remote request handled by this instance is answered
    /// before the elector reference is released.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend connection fails to close; the
    /// instance is closed anyway.
    pub async fn close(&self) -> CoreResult<()> {
        self.inner.close().await
    }

    /// Destroys the collection's stored data and closes the instance.
    ///
    /// A follower asks the leader to destroy the data.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InstanceClosed`] if already closed, or the
    /// error of the destroy.
    pub async fn remove(&self) -> CoreResult<()> {
        self.inner.ensure_open()?;
        let outcome = self.inner.execute(RemoteCall::Remove).await;
        let closed = self.inner.close().await;
        outcome?;
        closed?;
        tracing::info!(
            database = %self.inner.params.database_name,
            collection = %self.inner.params.collection_name,
            "removed storage instance"
        );
        Ok(())
    }
}

impl InstanceInner {
    fn target(&self) -> Target<'_> {
        Target {
            message_type: self.params.kind.message_type(),
            database_name: &self.params.database_name,
            collection_name: &self.params.collection_name,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::instance_closed(
                &self.params.database_name,
                &self.params.collection_name,
            ));
        }
        Ok(())
    }

    async fn must_use_local_state(&self) -> CoreResult<Option<Route>> {
        if self.is_closed() {
            return Ok(None);
        }
        if let Some(backend) = self.local.lock().clone() {
            return Ok(Some(Route::Local(backend)));
        }
        let Some(elector) = &self.elector else {
            return self.open_local();
        };

        if elector.wait_for_leader().await.is_err() {
            return Ok(None);
        }
        if self.is_closed() {
            return Ok(None);
        }
        if let Some(backend) = self.local.lock().clone() {
            return Ok(Some(Route::Local(backend)));
        }
        if elector.is_leader() {
            self.open_local()
        } else {
            Ok(Some(Route::Remote))
        }
    }

    /// Opens the backend connection unless one is open already.
    fn open_local(&self) -> CoreResult<Option<Route>> {
        let mut local = self.local.lock();
        if self.is_closed() {
            return Ok(None);
        }
        if let Some(backend) = local.as_ref() {
            return Ok(Some(Route::Local(Arc::clone(backend))));
        }
        let backend = self.factory.open(&self.backend_params)?;
        tracing::info!(
            database = %self.params.database_name,
            collection = %self.params.collection_name,
            "opened local backend"
        );
        *local = Some(Arc::clone(&backend));
        Ok(Some(Route::Local(backend)))
    }

    /// Runs `call` where it has to run, retrying from the top whenever the
    /// leader goes away before answering.
    async fn execute(&self, call: RemoteCall) -> CoreResult<CallOutput> {
        loop {
            let inbox = self.elector.as_ref().map(|e| e.channel().subscribe());
            match self.must_use_local_state().await? {
                None => {
                    return Err(CoreError::instance_closed(
                        &self.params.database_name,
                        &self.params.collection_name,
                    ))
                }
                Some(Route::Local(backend)) => return self.run_local(backend.as_ref(), call),
                Some(Route::Remote) => {
                    let (Some(elector), Some(inbox)) = (&self.elector, inbox) else {
                        return Err(CoreError::impossible_state(
                            "remote route without an elector",
                        ));
                    };
                    let target = self.target();
                    match remote::forward(elector, inbox, target, &call, self.request_id_length)
                        .await?
                    {
                        Forwarded::Answered(output) => return Ok(output),
                        Forwarded::LeaderGone => {
                            tracing::debug!(
                                database = %self.params.database_name,
                                collection = %self.params.collection_name,
                                operation = call.name(),
                                "leader changed, retrying"
                            );
                        }
                    }
                }
            }
        }
    }

    fn run_local(&self, backend: &dyn StorageBackend, call: RemoteCall) -> CoreResult<CallOutput> {
        match call {
            RemoteCall::BulkWrite(rows) => self.write_local(backend, rows).map(CallOutput::Written),
            RemoteCall::FindLocalDocumentsById(ids) => Ok(CallOutput::Found(
                backend
                    .find_by_ids(&ids, false)?
                    .into_iter()
                    .filter_map(|doc| {
                        let id = doc.primary(&self.params.primary_path)?.to_string();
                        Some((id, doc))
                    })
                    .collect(),
            )),
            RemoteCall::Remove => {
                self.factory
                    .destroy(&self.params.database_name, &self.params.collection_name)?;
                Ok(CallOutput::Removed)
            }
        }
    }

    fn write_local(&self, backend: &dyn StorageBackend, rows: Vec<WriteRow>) -> CoreResult<WriteResult> {
        let primary_path = &self.params.primary_path;
        validate_rows(&rows, primary_path)?;

        let start_time = now_millis();
        let outcomes = backend.bulk_write(&rows)?;
        let end_time = now_millis();
        if outcomes.len() != rows.len() {
            return Err(CoreError::impossible_state(format!(
                "backend answered {} rows for a batch of {}",
                outcomes.len(),
                rows.len()
            )));
        }

        let mut result = WriteResult::default();
        let mut events = Vec::new();
        for (row, outcome) in rows.iter().zip(outcomes) {
            let id = row.document.primary(primary_path).unwrap_or_default().to_string();
            match outcome {
                Ok(written) => {
                    if let Some(change) = ChangeEvent::from_write(&id, row, &written) {
                        let revision = change
                            .subject()
                            .and_then(Document::revision)
                            .unwrap_or_default();
                        events.push(StorageChangeEvent {
                            event_id: event_key(self.params.kind, &id, revision),
                            document_id: id.clone(),
                            change,
                            start_time,
                            end_time,
                        });
                    }
                    result.success.insert(id, written);
                }
                Err(conflict) => {
                    result.error.insert(id, conflict);
                }
            }
        }

        let bulk = EventBulk {
            id: random_token(self.event_bulk_id_length),
            events: events
                .into_iter()
                .map(|event| self.decrypt_event(event))
                .collect(),
        };
        tracing::debug!(
            database = %self.params.database_name,
            collection = %self.params.collection_name,
            written = result.success.len(),
            conflicts = result.error.len(),
            events = bulk.events.len(),
            "bulk write applied"
        );
        self.feed.publish(bulk);
        Ok(result)
    }

    fn decrypt_event(&self, mut event: StorageChangeEvent) -> StorageChangeEvent {
        if !self.crypter.is_active() {
            return event;
        }
        let decrypt = |doc: Option<Document>| doc.map(|d| self.crypter.decrypt(d)).transpose();
        match (decrypt(event.change.doc.clone()), decrypt(event.change.previous.clone())) {
            (Ok(doc), Ok(previous)) => {
                event.change.doc = doc;
                event.change.previous = previous;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(event_id = %event.event_id, error = %e, "publishing event without decryption");
            }
        }
        event
    }

    fn decrypt_result(&self, result: WriteResult) -> CoreResult<WriteResult> {
        if !self.crypter.is_active() {
            return Ok(result);
        }
        let success = result
            .success
            .into_iter()
            .map(|(id, doc)| Ok((id, self.crypter.decrypt(doc)?)))
            .collect::<CoreResult<_>>()?;
        let error = result
            .error
            .into_iter()
            .map(|(id, mut conflict)| {
                conflict.write_row.document = self.crypter.decrypt(conflict.write_row.document)?;
                conflict.write_row.previous = conflict
                    .write_row
                    .previous
                    .map(|p| self.crypter.decrypt(p))
                    .transpose()?;
                Ok((id, conflict))
            })
            .collect::<CoreResult<_>>()?;
        Ok(WriteResult { success, error })
    }

    /// Answers a request of a follower if this instance leads.
    ///
    /// Requests sequenced before the leadership fence were addressed to a
    /// leader that has since died. Their senders retry, so they are dropped.
    async fn handle_remote_request(&self, request: RemoteRequest, sequence: u64) {
        let backend = match self.must_use_local_state().await {
            Ok(Some(Route::Local(backend))) => backend,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(request_id = %request.request_id, error = %e, "cannot serve remote request");
                return;
            }
        };
        if let Some(elector) = &self.elector {
            let fence = elector.leadership_fence();
            if sequence <= fence {
                tracing::debug!(
                    request_id = %request.request_id,
                    sequence,
                    fence,
                    "dropping request addressed to a previous leader"
                );
                return;
            }
        }

        let outcome = RemoteCall::from_wire(&request.operation, request.params.clone())
            .and_then(|call| self.run_local(backend.as_ref(), call));
        let posted = request.answer(outcome).and_then(|response| {
            self.channel_post(&response)?;
            Ok(response.is_error)
        });
        match posted {
            Ok(is_error) => tracing::debug!(
                database = %self.params.database_name,
                collection = %self.params.collection_name,
                request_id = %request.request_id,
                operation = %request.operation,
                is_error,
                "answered remote request"
            ),
            Err(e) => tracing::warn!(request_id = %request.request_id, error = %e, "failed to answer remote request"),
        }
    }

    fn channel_post(&self, message: &impl serde::Serialize) -> CoreResult<()> {
        match &self.elector {
            Some(elector) => {
                elector.channel().post_message(message)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.handler_shutdown.send_replace(true);
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            if let Err(e) = handler.await {
                tracing::warn!(error = %e, "request handler failed");
            }
        }

        let local = self.local.lock().take();
        let closed = match local {
            Some(backend) => backend.close(),
            None => Ok(()),
        };
        self.feed.close();
        self.open_instances.remove(self.instance_id);
        if self.elector.is_some() {
            self.electors.release(&self.params.database_name).await;
        }

        tracing::debug!(
            database = %self.params.database_name,
            collection = %self.params.collection_name,
            "closed storage instance"
        );
        Ok(closed?)
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        tracing::warn!(
            database = %self.params.database_name,
            collection = %self.params.collection_name,
            "storage instance dropped without close"
        );
        self.handler_shutdown.send_replace(true);
        if let Some(backend) = self.local.get_mut().take() {
            let _ = backend.close();
        }
        self.open_instances.remove(self.instance_id);
        if self.elector.is_some() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let electors = Arc::clone(&self.electors);
                let database_name = self.params.database_name.clone();
                runtime.spawn(async move { electors.release(&database_name).await });
            }
        }
    }
}

/// Leader-side loop of one instance: answers forwarded requests and opens
/// the backend as soon as this context wins the election.
async fn serve_instance(
    instance: Weak<InstanceInner>,
    mut inbox: ChannelReceiver,
    mut election: watch::Receiver<tabdb_channel::ElectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut election_open = true;
    loop {
        tokio::select! {
            () = shutdown_requested(&mut shutdown) => break,
            changed = election.changed(), if election_open => {
                if changed.is_err() {
                    election_open = false;
                    continue;
                }
                let leads = election.borrow_and_update().is_leader();
                let Some(inner) = instance.upgrade() else { break };
                if leads {
                    if let Err(e) = inner.must_use_local_state().await {
                        tracing::warn!(error = %e, "cannot open backend after election");
                    }
                }
            }
            envelope = inbox.recv() => {
                let envelope = match envelope {
                    Ok(envelope) => envelope,
                    // lost requests wait for the next leader death
                    Err(e) if e.is_lagged() => continue,
                    Err(_) => break,
                };
                let Some(inner) = instance.upgrade() else { break };

                if remote::leader_death_token(&envelope).is_some() {
                    // requests posted after a death are answered by the
                    // winner of the next election only
                    if let Some(elector) = &inner.elector {
                        tokio::select! {
                            () = shutdown_requested(&mut shutdown) => break,
                            () = elector.settle_death(envelope.sequence()) => {}
                        }
                    }
                    continue;
                }

                if let Some(RemoteMessage::Request(request)) = RemoteMessage::decode(&envelope) {
                    if request.is_for(&inner.target()) {
                        inner.handle_remote_request(request, envelope.sequence()).await;
                    }
                }
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn validate_rows(rows: &[WriteRow], primary_path: &str) -> CoreResult<()> {
    if rows.is_empty() {
        return Err(CoreError::structural("bulk write called with no rows"));
    }
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        let Some(id) = row.document.primary(primary_path) else {
            return Err(CoreError::structural(format!(
                "document has no primary key at '{primary_path}'"
            )));
        };
        if !seen.insert(id) {
            return Err(CoreError::structural(format!(
                "primary key '{id}' appears twice in one bulk write"
            )));
        }
    }
    Ok(())
}

fn unexpected_output(operation: &str, output: &CallOutput) -> CoreError {
    CoreError::impossible_state(format!("{operation} produced {output:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str) -> WriteRow {
        WriteRow::insert(Document::new().with("id", id))
    }

    #[test]
    fn empty_batch_is_structural() {
        assert!(matches!(
            validate_rows(&[], "id"),
            Err(CoreError::Structural { .. })
        ));
    }

    #[test]
    fn duplicate_keys_are_structural() {
        let result = validate_rows(&[row("a"), row("b"), row("a")], "id");
        assert!(matches!(result, Err(CoreError::Structural { .. })));
        assert!(validate_rows(&[row("a"), row("b")], "id").is_ok());
    }

    #[test]
    fn missing_key_is_structural() {
        let rows = [WriteRow::insert(Document::new().with("name", "x"))];
        assert!(matches!(
            validate_rows(&rows, "id"),
            Err(CoreError::Structural { .. })
        ));
    }
}
