use serde::{Deserialize, Serialize};

use crate::models::attempt::AttemptStatus;

/// The only attempt field exposed to unauthenticated callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewReceivedResponse {
    pub received: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectionResponse {
    pub reason: String,
}
