use std::net::SocketAddr;

use hickory_resolver::{
    error::ResolveErrorKind,
    lookup::{SrvLookup, TxtLookup},
    TokioAsyncResolver,
};

use crate::{error::Error, error::Result, options::ServerAddress};

/// The system-configured DNS resolver, used for the SRV and TXT lookups of `mongodb+srv://`
/// expansion. Plain host resolution for TCP connects goes through the runtime instead.
pub(crate) struct AsyncResolver {
    inner: TokioAsyncResolver,
}

impl AsyncResolver {
    pub(crate) async fn new() -> Result<Self> {
        TokioAsyncResolver::tokio_from_system_conf()
            .map(|inner| Self { inner })
            .map_err(Error::from_resolve_error)
    }

    /// The socket addresses a server address resolves to.
    pub(crate) async fn resolve_address(address: &ServerAddress) -> Result<Vec<SocketAddr>> {
        let port = address
            .port()
            .unwrap_or(crate::client::options::DEFAULT_PORT);
        let addresses = tokio::net::lookup_host((address.host(), port)).await?;
        Ok(addresses.collect())
    }

    pub(crate) async fn srv_lookup(&self, query: &str) -> Result<SrvLookup> {
        self.inner
            .srv_lookup(query)
            .await
            .map_err(Error::from_resolve_error)
    }

    /// A TXT lookup, with "no records" reported as `None` rather than as an error.
    pub(crate) async fn txt_lookup(&self, query: &str) -> Result<Option<TxtLookup>> {
        match self.inner.txt_lookup(query).await {
            Ok(lookup) => Ok(Some(lookup)),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(None),
            Err(e) => Err(Error::from_resolve_error(e)),
        }
    }
}
