pub mod api;

use crate::cli::Args;
use crate::orchestrator::ChatOrchestrator;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    orchestrator: Arc<ChatOrchestrator>,
    args: Args,
}

impl Server {
    pub fn new(orchestrator: Arc<ChatOrchestrator>, args: Args) -> Self {
        Self { orchestrator, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let state = api::AppState::new(self.orchestrator.clone(), self.args.rate_limit_per_second);
        api::start_http_server(state, &self.args).await
    }
}
