//! Authorizer service implementation.

use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::proto::gatekeeper::v1::{
    authorizer_server::Authorizer as AuthorizerRpc, AuthorizeRequest, AuthorizeResponse,
    CheckRateLimitRequest, CheckRateLimitResponse, Effect as ProtoEffect, HealthRequest,
    HealthResponse,
};

use crate::authorizer::{AuthorizationRequest, AuthorizationResponse, Authorizer, Effect};
use crate::ratelimit::DecisionBackend;

/// Implementation of the Authorizer gRPC interface.
pub struct AuthorizerServiceImpl<R: DecisionBackend> {
    /// The authorizer instance
    authorizer: Arc<Authorizer<R>>,
}

impl<R: DecisionBackend> AuthorizerServiceImpl<R> {
    /// Create a new AuthorizerServiceImpl with the given authorizer.
    pub fn new(authorizer: Arc<Authorizer<R>>) -> Self {
        Self { authorizer }
    }
}

fn origin_or_peer<T>(origin: &str, request: &Request<T>) -> String {
    if !origin.is_empty() {
        return origin.to_string();
    }
    request
        .remote_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

fn context_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn to_proto(response: AuthorizationResponse) -> AuthorizeResponse {
    let effect = match response.effect {
        Effect::Allow => ProtoEffect::Allow,
        Effect::Deny => ProtoEffect::Deny,
    };
    let policy_document = response
        .policy_document
        .as_ref()
        .and_then(|doc| serde_json::to_string(doc).ok())
        .unwrap_or_default();

    AuthorizeResponse {
        principal_id: response.principal_id,
        effect: effect.into(),
        reason: response.reason,
        message: response.message.unwrap_or_default(),
        context: response
            .context
            .into_iter()
            .map(|(k, v)| (k, context_value(v)))
            .collect::<HashMap<_, _>>(),
        response_headers: response.response_headers,
        policy_document,
    }
}

#[tonic::async_trait]
impl<R: DecisionBackend + 'static> AuthorizerRpc for AuthorizerServiceImpl<R> {
    /// Validate the API key and apply the client's rate limit.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %Uuid::new_v4(),
            resource = %request.get_ref().resource,
        )
    )]
    async fn authorize(
        &self,
        request: Request<AuthorizeRequest>,
    ) -> Result<Response<AuthorizeResponse>, Status> {
        let origin_address = origin_or_peer(&request.get_ref().origin_address, &request);
        let req = request.into_inner();

        debug!(origin = %origin_address, "Processing authorization request");

        let auth_request = AuthorizationRequest {
            api_key: req.api_key,
            origin_address,
            resource: req.resource,
            content_length: req.content_length,
        };

        let response = self.authorizer.authorize(&auth_request).await;

        info!(
            principal_id = %response.principal_id,
            effect = %response.effect,
            reason = %response.reason,
            "Authorization decision made"
        );

        Ok(Response::new(to_proto(response)))
    }

    /// Run the rate limit decision for an already-resolved client.
    #[instrument(
        skip(self, request),
        fields(
            client_id = %request.get_ref().client_id,
            limit = request.get_ref().max_requests_per_second,
        )
    )]
    async fn check_rate_limit(
        &self,
        request: Request<CheckRateLimitRequest>,
    ) -> Result<Response<CheckRateLimitResponse>, Status> {
        let origin_address = origin_or_peer(&request.get_ref().origin_address, &request);
        let req = request.into_inner();

        let decision = self
            .authorizer
            .rate_limiter()
            .decide(&req.client_id, &origin_address, req.max_requests_per_second)
            .await;

        Ok(Response::new(CheckRateLimitResponse {
            allowed: decision.allowed,
            reason: decision.reason.as_str().to_string(),
            error: decision
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            retry_after_seconds: decision.retry_after.map(|d| d.as_secs().max(1)).unwrap_or(0),
        }))
    }

    /// Ping the counter store.
    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let response = match self.authorizer.rate_limiter().health().await {
            Ok(()) => HealthResponse {
                store_reachable: true,
                detail: String::new(),
            },
            Err(e) => {
                warn!(error = %e, "Counter store health check failed");
                HealthResponse {
                    store_reachable: false,
                    detail: e.to_string(),
                }
            }
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::credentials::FileCredentialStore;
    use crate::ratelimit::{RateLimitEngine, RateLimitPolicy};
    use crate::store::{InMemoryCounterStore, RedisCounterStore};

    const KEYS: &str = r#"
api_keys:
  - api_key: good
    client_id: acme
    active: true
    expires_at: "2999-01-01T00:00:00Z"
    usage_limits:
      requests_per_second: 100
    platform_data:
      tier: gold
      seats: 12
"#;

    fn service() -> AuthorizerServiceImpl<RateLimitEngine> {
        let engine = Arc::new(RateLimitEngine::new(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitPolicy::default(),
        ));
        let credentials = Arc::new(FileCredentialStore::from_yaml(KEYS).unwrap());
        AuthorizerServiceImpl::new(Arc::new(Authorizer::new(credentials, engine)))
    }

    #[tokio::test]
    async fn test_authorize_allows_valid_key() {
        let request = Request::new(AuthorizeRequest {
            api_key: "good".to_string(),
            origin_address: "10.0.0.1".to_string(),
            resource: "arn:test".to_string(),
            content_length: None,
        });

        let response = service().authorize(request).await.unwrap().into_inner();
        assert_eq!(response.effect, i32::from(ProtoEffect::Allow));
        assert_eq!(response.principal_id, "acme");
        assert_eq!(response.reason, "OK");
        assert_eq!(response.context["tier"], "gold");
        assert_eq!(response.context["seats"], "12");

        let doc: serde_json::Value = serde_json::from_str(&response.policy_document).unwrap();
        assert_eq!(doc["Statement"][0]["Effect"], "Allow");
    }

    #[tokio::test]
    async fn test_authorize_denies_missing_key() {
        let request = Request::new(AuthorizeRequest {
            api_key: String::new(),
            origin_address: String::new(),
            resource: "arn:test".to_string(),
            content_length: Some(10),
        });

        let response = service().authorize(request).await.unwrap().into_inner();
        assert_eq!(response.effect, i32::from(ProtoEffect::Deny));
        assert_eq!(response.reason, "MISSING_API_KEY");
        assert_eq!(response.message, "Missing API key");
    }

    #[tokio::test]
    async fn test_check_rate_limit() {
        let svc = service();

        let check = |client: &str, limit: i64| {
            Request::new(CheckRateLimitRequest {
                client_id: client.to_string(),
                origin_address: "10.0.0.1".to_string(),
                max_requests_per_second: limit,
            })
        };

        let response = svc.check_rate_limit(check("acme", 0)).await.unwrap().into_inner();
        assert!(response.allowed);
        assert_eq!(response.reason, "NO_LIMIT");
        assert!(response.error.is_empty());

        let response = svc.check_rate_limit(check("", 5)).await.unwrap().into_inner();
        assert!(!response.allowed);
        assert_eq!(response.reason, "INVALID_CLIENT_ID");
        assert!(!response.error.is_empty());

        let response = svc.check_rate_limit(check("acme", 5)).await.unwrap().into_inner();
        assert!(response.allowed);
        assert_eq!(response.reason, "OK");
    }

    #[tokio::test]
    async fn test_health_reports_store_state() {
        let response = service()
            .health(Request::new(HealthRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(response.store_reachable);

        let config = StoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            ..StoreConfig::default()
        };
        let engine = Arc::new(RateLimitEngine::new(
            Arc::new(RedisCounterStore::new(&config).unwrap()),
            RateLimitPolicy::default(),
        ));
        let credentials = Arc::new(FileCredentialStore::from_yaml(KEYS).unwrap());
        let svc = AuthorizerServiceImpl::new(Arc::new(Authorizer::new(credentials, engine)));

        let response = svc.health(Request::new(HealthRequest {})).await.unwrap().into_inner();
        assert!(!response.store_reachable);
        assert!(!response.detail.is_empty());
    }

    #[test]
    fn test_context_value() {
        assert_eq!(context_value(serde_json::json!("x")), "x");
        assert_eq!(context_value(serde_json::json!({"a": 1})), "{\"a\":1}");
        assert_eq!(context_value(serde_json::json!(true)), "true");
    }
}
