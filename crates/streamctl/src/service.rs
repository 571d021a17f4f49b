//! ControlPlaneService: transport-agnostic state behind the HTTP surface.
//!
//! This service owns the stream registry and holds the collaborators the
//! routes forward to (presenter, operational log, comparator, whois cache).
//! Handlers borrow it through an `Arc`; nothing here knows about HTTP.

use std::sync::Arc;

use crate::client::WorkerClient;
use crate::compare::{CompareOptions, StreamComparator, TableComparator};
use crate::oplog::{MemoryLog, OperationalLog};
use crate::presenter::{LogPresenter, Presenter};
use crate::registry::{Registry, RegistryError, StreamDescriptor, StreamQuery};
use crate::whois::{CachedWhois, WhoisCache};

pub struct ControlPlaneService {
    registry: Registry,
    presenter: Arc<dyn Presenter>,
    oplog: Arc<dyn OperationalLog>,
    comparator: Arc<dyn StreamComparator>,
    whois: Arc<dyn WhoisCache>,
}

impl ControlPlaneService {
    pub fn new(
        presenter: Arc<dyn Presenter>,
        oplog: Arc<dyn OperationalLog>,
        comparator: Arc<dyn StreamComparator>,
        whois: Arc<dyn WhoisCache>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            presenter,
            oplog,
            comparator,
            whois,
        }
    }

    /// Log-backed presenter, in-memory log, table comparator, no-op whois.
    pub fn headless() -> Self {
        Self::new(
            Arc::new(LogPresenter::new()),
            Arc::new(MemoryLog::default()),
            Arc::new(TableComparator::new(WorkerClient::default())),
            CachedWhois::noop(),
        )
    }

    pub fn with_presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn with_whois(mut self, whois: Arc<dyn WhoisCache>) -> Self {
        self.whois = whois;
        self
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn StreamComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn presenter(&self) -> Arc<dyn Presenter> {
        self.presenter.clone()
    }

    pub fn whois(&self) -> Arc<dyn WhoisCache> {
        self.whois.clone()
    }

    pub fn register(&self, descriptor: StreamDescriptor) -> Result<(), RegistryError> {
        self.registry.register(descriptor)?;
        tracing::debug!(streams = self.registry.len(), "Registry size");
        Ok(())
    }

    pub fn deregister(&self, descriptor: &StreamDescriptor) -> Result<(), RegistryError> {
        self.registry.deregister(descriptor)?;
        tracing::debug!(streams = self.registry.len(), "Registry size");
        Ok(())
    }

    pub fn query(&self, query: &StreamQuery) -> Vec<StreamDescriptor> {
        self.registry.query(query)
    }

    pub fn append_log(&self, message: &str) {
        self.oplog.append(message);
    }

    pub fn render_log(&self) -> String {
        self.oplog.render()
    }

    pub async fn alert(&self, title: &str, body: &str) {
        self.presenter.alert(title, body).await;
    }

    pub async fn compare(&self, options: &CompareOptions) -> String {
        let streams = self.registry.query(&StreamQuery::all());
        self.comparator.compare(&streams, options).await
    }

    pub async fn whois_lookup(&self, address: &str) -> String {
        self.whois.lookup(address).await
    }
}
