//! 最小可运行示例：一个应用、一个明文 HTTP 端点、内存访问日志。
//!
//! ```text
//! cargo run -p hearth-hosting --example hello_webapp
//! curl http://127.0.0.1:8080/
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use hearth_core::component::Component;
use hearth_core::error::BoxError;
use hearth_core::lifecycle;
use hearth_hosting::application::{Application, DispatchInfo};
use hearth_hosting::root::{WebappAssembly, WebappRoot, WebappRootOptions};
use hearth_net::http::{IncomingRequest, OutgoingResponse, text_response};

struct HelloApp;

#[async_trait]
impl Application for HelloApp {
    async fn handle_request(
        &self,
        request: IncomingRequest,
        dispatch: DispatchInfo,
    ) -> Result<Option<OutgoingResponse>, BoxError> {
        match dispatch.path.as_deref() {
            Some("/") => Ok(Some(text_response(
                http::StatusCode::OK,
                &format!("hello from hearth (request {})\n", request.id),
            ))),
            _ => Ok(None),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let assembly = WebappAssembly {
        hosts: Vec::new(),
        services: vec![serde_json::from_value(serde_json::json!({
            "class": "MemoryAccessLog",
            "name": "log",
        }))?],
        applications: vec![(
            "hello".to_string(),
            Arc::new(HelloApp) as Arc<dyn Application>,
        )],
        endpoints: vec![serde_json::from_value(serde_json::json!({
            "name": "main",
            "application": "hello",
            "interface": { "address": "127.0.0.1", "port": 8080 },
            "protocol": "http",
            "services": { "accessLog": "log" },
        }))?],
    };

    let root = WebappRoot::assemble(assembly, WebappRootOptions::default()).await?;
    let root_dyn: Arc<dyn Component> = Arc::clone(&root) as Arc<dyn Component>;
    lifecycle::init_root(&root_dyn).await?;
    lifecycle::start(&root_dyn).await?;
    tracing::info!(
        addr = %root.endpoint("main").and_then(|e| e.local_addr()).expect("bound"),
        "serving; press ctrl-c to stop",
    );

    tokio::signal::ctrl_c().await?;
    lifecycle::stop(&root_dyn, false).await?;
    Ok(())
}
