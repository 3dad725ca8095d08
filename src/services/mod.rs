pub mod allowance_service;
pub mod attempt_service;
pub mod credit;
pub mod notification_service;
pub mod review_policy_service;
pub mod review_service;
