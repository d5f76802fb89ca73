//! Shared handler state.
//!
//! Everything request handlers need is injected here at construction;
//! there are no ambient singletons, so tests swap in fakes freely.

use crate::proxy::RequestProxy;
use appforge_common::StatusBroadcaster;
use appforge_sandbox::{CodeBundler, RuntimeManager};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
    pub bundler: Arc<CodeBundler>,
    pub proxy: Arc<RequestProxy>,
    pub events: Arc<StatusBroadcaster>,
}

impl AppState {
    pub fn new(
        runtime: Arc<RuntimeManager>,
        bundler: Arc<CodeBundler>,
        proxy: Arc<RequestProxy>,
        events: Arc<StatusBroadcaster>,
    ) -> Self {
        Self {
            runtime,
            bundler,
            proxy,
            events,
        }
    }
}
