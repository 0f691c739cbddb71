//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::gatekeeper::v1::authorizer_server::AuthorizerServer;
use super::service::AuthorizerServiceImpl;
use crate::authorizer::Authorizer;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::DecisionBackend;

/// gRPC server for the authorizer service.
pub struct GrpcServer<R: DecisionBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The authorizer instance
    authorizer: Arc<Authorizer<R>>,
}

impl<R: DecisionBackend + 'static> GrpcServer<R> {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, authorizer: Arc<Authorizer<R>>) -> Self {
        Self { addr, authorizer }
    }

    /// The address the server binds to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AuthorizerServiceImpl::new(self.authorizer);

        info!(
            addr = %self.addr,
            "Starting gRPC server for Authorizer with graceful shutdown"
        );

        Server::builder()
            .add_service(AuthorizerServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GatekeeperError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FileCredentialStore;
    use crate::ratelimit::{RateLimitEngine, RateLimitPolicy};
    use crate::store::InMemoryCounterStore;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let engine = Arc::new(RateLimitEngine::new(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitPolicy::default(),
        ));
        let credentials = Arc::new(FileCredentialStore::from_yaml("api_keys: []").unwrap());
        let server = GrpcServer::new(addr, Arc::new(Authorizer::new(credentials, engine)));
        assert_eq!(server.addr(), addr);
    }
}
