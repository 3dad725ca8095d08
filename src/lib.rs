pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod routes;
pub mod services;
pub mod store;
pub mod utils;

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{Config, ProctoringSettings};
use crate::providers::ProviderRegistry;
use crate::services::{
    allowance_service::AllowanceService,
    attempt_service::AttemptService,
    credit::StoreCreditRequirements,
    notification_service::{BroadcastPublisher, EventPublisher, NotificationService, WebhookPublisher},
    review_policy_service::ReviewPolicyService,
    review_service::ReviewService,
};
use crate::store::EntityStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub settings: Arc<ProctoringSettings>,
    pub providers: Arc<ProviderRegistry>,
    pub webhook_secret: String,
    pub attempt_service: AttemptService,
    pub allowance_service: AllowanceService,
    pub review_policy_service: ReviewPolicyService,
    pub review_service: ReviewService,
    pub notification_service: NotificationService,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EntityStore>,
        settings: ProctoringSettings,
        notification_service: NotificationService,
        webhook_secret: String,
    ) -> Self {
        let settings = Arc::new(settings);
        let providers = Arc::new(ProviderRegistry::new(&settings));

        let attempt_service = AttemptService::new(
            store.clone(),
            Arc::new(StoreCreditRequirements::new(store.clone())),
            notification_service.clone(),
        );
        let allowance_service = AllowanceService::new(store.clone());
        let review_policy_service =
            ReviewPolicyService::new(store.clone(), settings.default_review_policy.clone());
        let review_service = ReviewService::new(
            store.clone(),
            attempt_service.clone(),
            providers.clone(),
            settings.clone(),
        );

        Self {
            store,
            settings,
            providers,
            webhook_secret,
            attempt_service,
            allowance_service,
            review_policy_service,
            review_service,
            notification_service,
        }
    }

    /// Wires the notification transport named by the config: a signed webhook
    /// when a URL is set, otherwise the in-process broadcast channel.
    pub fn from_config(store: Arc<dyn EntityStore>, config: &Config) -> Self {
        let publisher: Arc<dyn EventPublisher> = match &config.notification_webhook_url {
            Some(url) => Arc::new(WebhookPublisher::new(
                url.clone(),
                config.webhook_secret.clone(),
            )),
            None => Arc::new(BroadcastPublisher::new(256)),
        };
        let notifications =
            NotificationService::new(publisher, config.notification_subscribers.clone());
        Self::new(
            store,
            config.proctoring.clone(),
            notifications,
            config.webhook_secret.clone(),
        )
    }

    /// In-process state used by the integration tests and local runs.
    pub fn with_broadcast(
        store: Arc<dyn EntityStore>,
        settings: ProctoringSettings,
        subscribers: HashSet<String>,
        webhook_secret: &str,
    ) -> (Self, BroadcastPublisher) {
        let publisher = BroadcastPublisher::new(256);
        let notifications = NotificationService::new(Arc::new(publisher.clone()), subscribers);
        let state = Self::new(store, settings, notifications, webhook_secret.to_string());
        (state, publisher)
    }
}
