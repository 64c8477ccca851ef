use std::sync::Arc;

use crate::pool::WorkerPool;

#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) pool: Arc<WorkerPool>,
}
