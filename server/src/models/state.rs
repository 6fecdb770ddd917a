// Shared handler state
//
// Cheap to clone; everything behind `Arc`.

use std::sync::Arc;

use crate::settings::Settings;
use crate::setup::SetupWorkflow;

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<SetupWorkflow>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(workflow: SetupWorkflow, settings: Settings) -> Self {
        Self {
            workflow: Arc::new(workflow),
            settings: Arc::new(settings),
        }
    }
}
