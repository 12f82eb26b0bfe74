use crate::LOG;

/// Logs one line per request through the slog drains instead of
/// tide's built-in femme logger.
pub struct LogMiddleware;

impl LogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(
        &self,
        req: tide::Request<State>,
        next: tide::Next<'_, State>,
    ) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = std::time::Instant::now();
        let res = next.run(req).await;
        let status = res.status();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if status.is_server_error() {
            slog::error!(
                LOG, "request error";
                "method" => &method,
                "path" => &path,
                "status" => u16::from(status),
                "elapsed_ms" => elapsed_ms,
            );
        } else {
            slog::info!(
                LOG, "request";
                "method" => &method,
                "path" => &path,
                "status" => u16::from(status),
                "elapsed_ms" => elapsed_ms,
            );
        }
        Ok(res)
    }
}

/// Response hook that turns any error a handler bubbled up into a
/// json body, keeping the status the error carried.
pub async fn json_error(mut res: tide::Response) -> tide::Result {
    if let Some(err) = res.take_error() {
        slog::error!(
            LOG, "request failed: {}", err;
            "status" => u16::from(res.status()),
        );
        res.set_body(tide::Body::from_json(&serde_json::json!({
            "error": err.to_string()
        }))?);
    }
    Ok(res)
}
