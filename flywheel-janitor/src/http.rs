use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;

pub async fn listen(app: Router, bind: String) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

// For axum's state stuff
#[derive(Clone)]
struct JanitorId(String);

pub fn app(janitor_id: String) -> Router {
    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");

    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route(
            "/metrics",
            get(move || std::future::ready(recorder.render())),
        )
        .with_state(JanitorId(janitor_id))
}

async fn index(State(janitor_id): State<JanitorId>) -> String {
    format!("flywheel janitor {}", janitor_id.0)
}
