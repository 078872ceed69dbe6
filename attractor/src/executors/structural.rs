//! Structural handlers: start, exit, and unrecognised shapes run for
//! routing only and always succeed.

use async_trait::async_trait;

use super::{Execution, NodeHandler};
use crate::error::EngineError;
use crate::outcome::Outcome;

pub struct IdentityHandler;

#[async_trait]
impl NodeHandler for IdentityHandler {
    async fn execute(&self, _exec: &Execution) -> Result<Outcome, EngineError> {
        Ok(Outcome::success())
    }
}
