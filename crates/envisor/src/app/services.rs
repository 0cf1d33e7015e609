use std::sync::Arc;

use crate::api::ApiState;
use crate::domain::enforcement::EnforcementEngine;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub engine: Arc<EnforcementEngine>,
    pub api_state: Arc<ApiState>,
}
