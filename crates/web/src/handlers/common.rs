/// Liveness check.
pub async fn hello() -> &'static str { "hello" }
