//! Call metrics reporting.

use driftwave_backend_api::paths;

use crate::error::{FlowError, Result};
use crate::handlers::Method;
use crate::state::{State, SOFTWARE};

impl State {
    /// POST per-flow statistics for one conversation. A call without
    /// flows reports nothing; the request is fire-and-forget.
    pub fn send_metrics(&mut self, convid: &str, sub: Option<&str>) -> Result<()> {
        let Some(call) = self.calls.get(convid) else {
            return Err(FlowError::NotFound("call"));
        };
        if call.flows.is_empty() {
            return Ok(());
        }

        let body = call.stats_body(SOFTWARE);
        let path = paths::metrics(convid, sub);
        self.ctx
            .send_request(Some(convid), None, Method::Post, path, Some(body))?;
        Ok(())
    }
}
