use std::sync::Arc;

use amora_pipeline::Pipeline;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub pipeline: Arc<Pipeline>,
    pub jwt_secret: String,
}
