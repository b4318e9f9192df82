use crate::model::{ComposeContext, ComposeResult};
use async_trait::async_trait;

/// Implemented by both the prompt composer and the grid composer. The
/// coordinator holds one boxed `Composer` per strategy and never matches on
/// which kind it is.
#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&mut self, context: &ComposeContext) -> ComposeResult;
}
